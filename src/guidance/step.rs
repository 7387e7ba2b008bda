//! Per-step guidance state.
//!
//! Every stage of one guidance evaluation is its own type, so the sequence
//! `set_latents → compute_update → pre_proc → apply_cfg → post_proc` cannot be
//! reordered or skipped. A stage consumes the previous one and the stored
//! tensors never outlive the step they were computed for.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::error::{DiffusionError, Hook, Result};
use crate::utils::{ensure_dims, l2_norm};

/// Norms below this value are treated as zero by the normalization hooks.
pub const MIN_NORM: f64 = 1e-6;

/// Unary transform applied by a guidance hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormHook {
    /// Keeps the direction of the operand and borrows the magnitude of the
    /// unconditional estimate.
    MatchUncond,
}

impl NormHook {
    fn apply<B: Backend, const D: usize>(
        &self,
        value: Tensor<B, D>,
        u: &Tensor<B, D>,
        step: usize,
        hook: Hook,
        operand: &'static str,
    ) -> Result<Tensor<B, D>> {
        match self {
            NormHook::MatchUncond => {
                let target = guarded_norm(u, step, hook, "uncond")?;
                let norm = guarded_norm(&value, step, hook, operand)?;
                Ok(value.mul_scalar(target / norm))
            }
        }
    }
}

fn guarded_norm<B: Backend, const D: usize>(
    tensor: &Tensor<B, D>,
    step: usize,
    hook: Hook,
    operand: &'static str,
) -> Result<f64> {
    let norm = l2_norm(tensor);
    // Also rejects NaN.
    if norm >= MIN_NORM && norm.is_finite() {
        Ok(norm)
    } else {
        Err(DiffusionError::DegenerateNorm {
            step,
            hook,
            operand,
            norm,
        })
    }
}

/// The unconditional and conditional estimates of one step.
#[derive(Debug)]
pub struct Estimates<B: Backend, const D: usize> {
    step: usize,
    u: Tensor<B, D>,
    t: Tensor<B, D>,
}

impl<B: Backend, const D: usize> Estimates<B, D> {
    /// Records the unconditional estimate `u` and the conditional estimate `t`.
    pub fn set_latents(step: usize, u: Tensor<B, D>, t: Tensor<B, D>) -> Result<Self> {
        ensure_dims("guidance estimates", u.dims(), t.dims())?;
        Ok(Self { step, u, t })
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// `diff = t - u`
    pub fn compute_update(self) -> Update<B, D> {
        let diff = self.t - self.u.clone();
        Update {
            step: self.step,
            u: self.u,
            diff,
        }
    }
}

/// Raw guidance direction, before the pre-processing hook.
#[derive(Debug)]
pub struct Update<B: Backend, const D: usize> {
    step: usize,
    u: Tensor<B, D>,
    diff: Tensor<B, D>,
}

impl<B: Backend, const D: usize> Update<B, D> {
    pub fn diff(&self) -> &Tensor<B, D> {
        &self.diff
    }

    pub fn pre_proc(self, hook: Option<NormHook>) -> Result<Normalized<B, D>> {
        let diff = match hook {
            Some(hook) => hook.apply(self.diff, &self.u, self.step, Hook::PreProc, "diff")?,
            None => self.diff,
        };
        Ok(Normalized {
            step: self.step,
            u: self.u,
            diff,
        })
    }
}

/// Guidance direction after the pre-processing hook.
#[derive(Debug)]
pub struct Normalized<B: Backend, const D: usize> {
    step: usize,
    u: Tensor<B, D>,
    diff: Tensor<B, D>,
}

impl<B: Backend, const D: usize> Normalized<B, D> {
    pub fn diff(&self) -> &Tensor<B, D> {
        &self.diff
    }

    /// `pred = u + scale * diff`
    pub fn apply_cfg(self, scale: f64) -> Blended<B, D> {
        let pred = self.u.clone() + self.diff.mul_scalar(scale);
        Blended {
            step: self.step,
            u: self.u,
            pred,
        }
    }
}

/// Blended prediction, before the post-processing hook.
#[derive(Debug)]
pub struct Blended<B: Backend, const D: usize> {
    step: usize,
    u: Tensor<B, D>,
    pred: Tensor<B, D>,
}

impl<B: Backend, const D: usize> Blended<B, D> {
    pub fn pred(&self) -> &Tensor<B, D> {
        &self.pred
    }

    pub fn post_proc(self, hook: Option<NormHook>) -> Result<Guided<B, D>> {
        let pred = match hook {
            Some(hook) => hook.apply(self.pred, &self.u, self.step, Hook::PostProc, "pred")?,
            None => self.pred,
        };
        Ok(Guided {
            step: self.step,
            pred,
        })
    }
}

/// Final guided prediction handed to the schedule.
#[derive(Debug)]
pub struct Guided<B: Backend, const D: usize> {
    step: usize,
    pred: Tensor<B, D>,
}

impl<B: Backend, const D: usize> Guided<B, D> {
    pub fn step(&self) -> usize {
        self.step
    }

    pub fn get_pred(&self) -> &Tensor<B, D> {
        &self.pred
    }

    pub fn set_pred(&mut self, pred: Tensor<B, D>) {
        self.pred = pred;
    }

    pub fn into_pred(self) -> Tensor<B, D> {
        self.pred
    }
}
