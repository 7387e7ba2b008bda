//! Guidance with a step-dependent scale.

use core::f64::consts::PI;
use core::fmt;
use core::str::FromStr;

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use tracing::debug;

use super::transform::GuidanceTransform;
use crate::error::{DiffusionError, Result};

/// Guidance scale as a function of the step index.
pub trait ScaleCurve: fmt::Debug {
    /// Scale for `step` in a schedule of `total` steps, with `step < total`.
    fn scale(&self, step: usize, total: usize) -> f64;
}

fn progress(step: usize, total: usize) -> f64 {
    if total <= 1 {
        0.0
    } else {
        step as f64 / (total - 1) as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstantScale(pub f64);

impl ScaleCurve for ConstantScale {
    fn scale(&self, _step: usize, _total: usize) -> f64 {
        self.0
    }
}

/// Moves linearly from `start` at the first step to `end` at the last one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearScale {
    pub start: f64,
    pub end: f64,
}

impl ScaleCurve for LinearScale {
    fn scale(&self, step: usize, total: usize) -> f64 {
        self.start + (self.end - self.start) * progress(step, total)
    }
}

/// Half-cosine decay from `start` at the first step to `end` at the last one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CosineScale {
    pub start: f64,
    pub end: f64,
}

impl ScaleCurve for CosineScale {
    fn scale(&self, step: usize, total: usize) -> f64 {
        let weight = 0.5 * (1.0 + (PI * progress(step, total)).cos());
        self.end + (self.start - self.end) * weight
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleCurveKind {
    Constant,
    Linear,
    Cosine,
}

impl ScaleCurveKind {
    pub fn name(&self) -> &'static str {
        match self {
            ScaleCurveKind::Constant => "constant",
            ScaleCurveKind::Linear => "linear",
            ScaleCurveKind::Cosine => "cosine",
        }
    }

    /// `end` is ignored by the constant curve.
    pub fn build(&self, start: f64, end: f64) -> Box<dyn ScaleCurve> {
        match self {
            ScaleCurveKind::Constant => Box::new(ConstantScale(start)),
            ScaleCurveKind::Linear => Box::new(LinearScale { start, end }),
            ScaleCurveKind::Cosine => Box::new(CosineScale { start, end }),
        }
    }
}

impl FromStr for ScaleCurveKind {
    type Err = DiffusionError;

    fn from_str(name: &str) -> Result<Self> {
        match name {
            "constant" => Ok(ScaleCurveKind::Constant),
            "linear" => Ok(ScaleCurveKind::Linear),
            "cosine" => Ok(ScaleCurveKind::Cosine),
            _ => Err(DiffusionError::UnknownScaleCurve(name.to_string())),
        }
    }
}

/// A guidance transform driven by a scale curve.
///
/// The total number of guidance evaluations must be announced with
/// [set_timesteps](DynamicGuidance::set_timesteps) before the first
/// [guide](DynamicGuidance::guide) call. Steps are then consumed strictly in
/// order, and [finish](DynamicGuidance::finish) checks that every announced
/// step ran.
#[derive(Debug)]
pub struct DynamicGuidance {
    transform: GuidanceTransform,
    curve: Box<dyn ScaleCurve>,
    total: Option<usize>,
    next: usize,
}

impl DynamicGuidance {
    pub fn new(transform: GuidanceTransform, curve: Box<dyn ScaleCurve>) -> Self {
        Self {
            transform,
            curve,
            total: None,
            next: 0,
        }
    }

    pub fn constant(transform: GuidanceTransform, scale: f64) -> Self {
        Self::new(transform, Box::new(ConstantScale(scale)))
    }

    pub fn transform(&self) -> &GuidanceTransform {
        &self.transform
    }

    /// Announces the number of guidance evaluations and rewinds to step 0.
    pub fn set_timesteps(&mut self, total: usize) {
        debug!(total, strategy = %self.transform.kind(), "Guidance timesteps set");
        self.total = Some(total);
        self.next = 0;
    }

    pub fn timesteps(&self) -> Option<usize> {
        self.total
    }

    /// Number of guidance evaluations run since the last `set_timesteps`.
    pub fn executed(&self) -> usize {
        self.next
    }

    pub fn scale_at(&self, step: usize) -> Result<f64> {
        let total = self
            .total
            .ok_or(DiffusionError::GuidanceNotInitialized { step })?;
        if step >= total {
            return Err(DiffusionError::ScheduleOutOfRange { step, total });
        }
        Ok(self.curve.scale(step, total))
    }

    /// Blends `u` and `t` with the scale of `step`.
    pub fn guide<B: Backend, const D: usize>(
        &mut self,
        u: Tensor<B, D>,
        t: Tensor<B, D>,
        step: usize,
    ) -> Result<Tensor<B, D>> {
        let scale = self.scale_at(step)?;
        if step != self.next {
            return Err(DiffusionError::StepOutOfOrder {
                expected: self.next,
                got: step,
            });
        }
        let pred = self.transform.guide(step, u, t, scale)?;
        self.next += 1;
        Ok(pred)
    }

    /// Fails unless every announced step has been consumed.
    pub fn finish(&self) -> Result<()> {
        let total = self
            .total
            .ok_or(DiffusionError::GuidanceNotInitialized { step: self.next })?;
        if self.next != total {
            return Err(DiffusionError::ScheduleNotExhausted {
                executed: self.next,
                total,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guidance::GuidanceKind;
    use crate::TestBackend;

    fn estimates() -> (Tensor<TestBackend, 1>, Tensor<TestBackend, 1>) {
        let device = <TestBackend as Backend>::Device::default();
        (
            Tensor::from_floats([1.0, 1.0], &device),
            Tensor::from_floats([2.0, 2.0], &device),
        )
    }

    #[test]
    fn test_curves() {
        let linear = LinearScale {
            start: 7.5,
            end: 1.5,
        };
        let cosine = CosineScale {
            start: 7.5,
            end: 1.5,
        };

        assert_eq!(ConstantScale(7.5).scale(3, 10), 7.5);
        assert!((linear.scale(0, 5) - 7.5).abs() < 1e-12);
        assert!((linear.scale(2, 5) - 4.5).abs() < 1e-12);
        assert!((linear.scale(4, 5) - 1.5).abs() < 1e-12);
        assert!((cosine.scale(0, 5) - 7.5).abs() < 1e-12);
        assert!((cosine.scale(2, 5) - 4.5).abs() < 1e-12);
        assert!((cosine.scale(4, 5) - 1.5).abs() < 1e-12);
        assert_eq!(linear.scale(0, 1), 7.5);
    }

    #[test]
    fn test_curve_names() {
        for kind in [
            ScaleCurveKind::Constant,
            ScaleCurveKind::Linear,
            ScaleCurveKind::Cosine,
        ] {
            assert_eq!(kind.name().parse::<ScaleCurveKind>().unwrap(), kind);
        }
        assert!(matches!(
            "exponential".parse::<ScaleCurveKind>(),
            Err(DiffusionError::UnknownScaleCurve(_))
        ));
    }

    #[test]
    fn test_scale_before_set_timesteps() {
        let guidance = DynamicGuidance::constant(GuidanceKind::Baseline.transform(), 7.5);

        assert!(matches!(
            guidance.scale_at(0),
            Err(DiffusionError::GuidanceNotInitialized { step: 0 })
        ));
    }

    #[test]
    fn test_out_of_range_step() {
        let mut guidance = DynamicGuidance::constant(GuidanceKind::Baseline.transform(), 7.5);
        guidance.set_timesteps(2);
        let (u, t) = estimates();

        guidance.guide(u.clone(), t.clone(), 0).unwrap();
        guidance.guide(u.clone(), t.clone(), 1).unwrap();
        let err = guidance.guide(u, t, 2).unwrap_err();

        assert!(matches!(
            err,
            DiffusionError::ScheduleOutOfRange { step: 2, total: 2 }
        ));
    }

    #[test]
    fn test_out_of_order_step() {
        let mut guidance = DynamicGuidance::constant(GuidanceKind::Baseline.transform(), 7.5);
        guidance.set_timesteps(4);
        let (u, t) = estimates();

        let err = guidance.guide(u, t, 1).unwrap_err();

        assert!(matches!(
            err,
            DiffusionError::StepOutOfOrder {
                expected: 0,
                got: 1
            }
        ));
    }

    #[test]
    fn test_finish_detects_unexhausted_schedule() {
        let mut guidance = DynamicGuidance::constant(GuidanceKind::Baseline.transform(), 7.5);
        guidance.set_timesteps(3);
        let (u, t) = estimates();

        guidance.guide(u, t, 0).unwrap();

        assert!(matches!(
            guidance.finish(),
            Err(DiffusionError::ScheduleNotExhausted {
                executed: 1,
                total: 3
            })
        ));
    }

    #[test]
    fn test_set_timesteps_rewinds() {
        let mut guidance = DynamicGuidance::new(
            GuidanceKind::Baseline.transform(),
            ScaleCurveKind::Linear.build(3.0, 1.0),
        );
        let (u, t) = estimates();

        guidance.set_timesteps(1);
        guidance.guide(u.clone(), t.clone(), 0).unwrap();
        guidance.finish().unwrap();
        guidance.set_timesteps(3);

        assert_eq!(guidance.executed(), 0);
        assert_eq!(guidance.scale_at(1).unwrap(), 2.0);
        guidance.guide(u, t, 0).unwrap();
        assert_eq!(guidance.executed(), 1);
    }
}
