use core::fmt;
use core::str::FromStr;

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use super::step::{Estimates, NormHook};
use crate::error::{DiffusionError, Result};

/// Named guidance strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuidanceKind {
    /// Plain classifier-free guidance.
    Baseline,
    /// Rescales the guided prediction to the norm of the unconditional estimate.
    PredNorm,
    /// Rescales `t - u` to the norm of the unconditional estimate.
    ///
    /// Roughly equivalent to the GuidedTTS norm, <https://arxiv.org/pdf/2205.15370.pdf>
    TNorm,
    /// Both `TNorm` and `PredNorm`.
    FullNorm,
}

impl GuidanceKind {
    pub const ALL: [GuidanceKind; 4] = [
        GuidanceKind::Baseline,
        GuidanceKind::PredNorm,
        GuidanceKind::TNorm,
        GuidanceKind::FullNorm,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            GuidanceKind::Baseline => "baseline",
            GuidanceKind::PredNorm => "pred-norm",
            GuidanceKind::TNorm => "t-norm",
            GuidanceKind::FullNorm => "full-norm",
        }
    }

    pub fn transform(&self) -> GuidanceTransform {
        let (pre, post) = match self {
            GuidanceKind::Baseline => (None, None),
            GuidanceKind::PredNorm => (None, Some(NormHook::MatchUncond)),
            GuidanceKind::TNorm => (Some(NormHook::MatchUncond), None),
            GuidanceKind::FullNorm => (Some(NormHook::MatchUncond), Some(NormHook::MatchUncond)),
        };
        GuidanceTransform {
            kind: *self,
            pre,
            post,
        }
    }
}

impl fmt::Display for GuidanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for GuidanceKind {
    type Err = DiffusionError;

    fn from_str(name: &str) -> Result<Self> {
        match name {
            "baseline" | "no-norm" | "no_norm" => Ok(GuidanceKind::Baseline),
            "pred-norm" | "pred_norm" => Ok(GuidanceKind::PredNorm),
            "t-norm" | "t_norm" => Ok(GuidanceKind::TNorm),
            "full-norm" | "full_norm" => Ok(GuidanceKind::FullNorm),
            _ => Err(DiffusionError::UnknownGuidance(name.to_string())),
        }
    }
}

/// A guidance strategy: classifier-free guidance with an optional hook on the
/// raw difference and an optional hook on the blended prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuidanceTransform {
    kind: GuidanceKind,
    pre: Option<NormHook>,
    post: Option<NormHook>,
}

impl GuidanceTransform {
    pub fn from_name(name: &str) -> Result<Self> {
        Ok(name.parse::<GuidanceKind>()?.transform())
    }

    pub fn kind(&self) -> GuidanceKind {
        self.kind
    }

    pub fn pre(&self) -> Option<NormHook> {
        self.pre
    }

    pub fn post(&self) -> Option<NormHook> {
        self.post
    }

    /// Runs the full guidance sequence for one step and returns the prediction.
    pub fn guide<B: Backend, const D: usize>(
        &self,
        step: usize,
        u: Tensor<B, D>,
        t: Tensor<B, D>,
        scale: f64,
    ) -> Result<Tensor<B, D>> {
        let guided = Estimates::set_latents(step, u, t)?
            .compute_update()
            .pre_proc(self.pre)?
            .apply_cfg(scale)
            .post_proc(self.post)?;
        Ok(guided.into_pred())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Hook;
    use crate::utils::{l2_norm, to_f64_vec};
    use crate::TestBackend;
    use burn::tensor::Data;

    fn estimates() -> (Tensor<TestBackend, 2>, Tensor<TestBackend, 2>) {
        let device = <TestBackend as Backend>::Device::default();
        (
            Tensor::from_floats([[0.5, -1.0], [2.0, 0.25]], &device),
            Tensor::from_floats([[1.5, 0.5], [-1.0, 3.0]], &device),
        )
    }

    fn cosine(a: &[f64], b: &[f64]) -> f64 {
        let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let na: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
        let nb: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
        dot / (na * nb)
    }

    #[test]
    fn test_registry_names() {
        for kind in GuidanceKind::ALL {
            assert_eq!(kind.name().parse::<GuidanceKind>().unwrap(), kind);
            assert_eq!(GuidanceTransform::from_name(kind.name()).unwrap().kind(), kind);
        }
        assert_eq!("no_norm".parse::<GuidanceKind>().unwrap(), GuidanceKind::Baseline);
        assert_eq!("full_norm".parse::<GuidanceKind>().unwrap(), GuidanceKind::FullNorm);
    }

    #[test]
    fn test_unknown_strategy_is_rejected() {
        let err = GuidanceTransform::from_name("max-norm").unwrap_err();

        assert!(matches!(err, DiffusionError::UnknownGuidance(name) if name == "max-norm"));
    }

    #[test]
    fn test_hooks_per_variant() {
        let hooks = |kind: GuidanceKind| {
            let transform = kind.transform();
            (transform.pre().is_some(), transform.post().is_some())
        };

        assert_eq!(hooks(GuidanceKind::Baseline), (false, false));
        assert_eq!(hooks(GuidanceKind::PredNorm), (false, true));
        assert_eq!(hooks(GuidanceKind::TNorm), (true, false));
        assert_eq!(hooks(GuidanceKind::FullNorm), (true, true));
    }

    #[test]
    fn test_zero_scale_returns_uncond() {
        for kind in GuidanceKind::ALL {
            let (u, t) = estimates();

            let pred = kind.transform().guide(0, u.clone(), t, 0.0).unwrap();

            pred.to_data().assert_approx_eq(&u.to_data(), 4);
        }
    }

    #[test]
    fn test_unit_scale_baseline_returns_cond() {
        let (u, t) = estimates();

        let pred = GuidanceKind::Baseline
            .transform()
            .guide(0, u, t.clone(), 1.0)
            .unwrap();

        pred.to_data().assert_approx_eq(&t.to_data(), 5);
    }

    #[test]
    fn test_post_proc_matches_uncond_norm() {
        for kind in [GuidanceKind::PredNorm, GuidanceKind::FullNorm] {
            let (u, t) = estimates();
            let target = l2_norm(&u);

            let pred = kind.transform().guide(0, u, t, 7.5).unwrap();

            assert!((l2_norm(&pred) - target).abs() < 1e-4, "{kind}");
        }
    }

    #[test]
    fn test_pre_proc_keeps_direction_and_borrows_magnitude() {
        for kind in [GuidanceKind::TNorm, GuidanceKind::FullNorm] {
            let (u, t) = estimates();
            let transform = kind.transform();
            let update = Estimates::set_latents(0, u.clone(), t).unwrap().compute_update();
            let raw = to_f64_vec(update.diff().clone());

            let normalized = update.pre_proc(transform.pre()).unwrap();
            let scaled = to_f64_vec(normalized.diff().clone());

            assert!((l2_norm(normalized.diff()) - l2_norm(&u)).abs() < 1e-4, "{kind}");
            assert!((cosine(&raw, &scaled) - 1.0).abs() < 1e-6, "{kind}");
        }
    }

    #[test]
    fn test_baseline_blend() {
        let device = <TestBackend as Backend>::Device::default();
        let u: Tensor<TestBackend, 1> = Tensor::from_floats([1.0, 1.0], &device);
        let t: Tensor<TestBackend, 1> = Tensor::from_floats([2.0, 2.0], &device);

        let pred = GuidanceKind::Baseline.transform().guide(0, u, t, 7.5).unwrap();

        pred.to_data().assert_approx_eq(&Data::from([8.5, 8.5]), 5);
    }

    #[test]
    fn test_zero_uncond_is_reported_for_pred_norm() {
        let device = <TestBackend as Backend>::Device::default();
        let u: Tensor<TestBackend, 1> = Tensor::from_floats([0.0, 0.0], &device);
        let t: Tensor<TestBackend, 1> = Tensor::from_floats([1.0, -1.0], &device);

        let err = GuidanceKind::PredNorm
            .transform()
            .guide(2, u, t, 7.5)
            .unwrap_err();

        match err {
            DiffusionError::DegenerateNorm {
                step,
                hook,
                operand,
                norm,
            } => {
                assert_eq!(step, 2);
                assert_eq!(hook, Hook::PostProc);
                assert_eq!(operand, "uncond");
                assert_eq!(norm, 0.0);
            }
            other => panic!("unexpected error {other}"),
        }
    }
}
