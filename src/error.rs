//! Errors raised while loading a pipeline or running the diffusion loop.

use core::fmt;

use thiserror::Error;

/// Normalization hook of a guidance transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    /// Applied to `t - u` before blending.
    PreProc,
    /// Applied to the blended prediction.
    PostProc,
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hook::PreProc => f.write_str("pre_proc"),
            Hook::PostProc => f.write_str("post_proc"),
        }
    }
}

#[derive(Error, Debug)]
pub enum DiffusionError {
    #[error("unknown scheduler `{0}`")]
    UnknownScheduler(String),

    #[error("unknown guidance strategy `{0}`")]
    UnknownGuidance(String),

    #[error("unknown guidance scale curve `{0}`")]
    UnknownScaleCurve(String),

    #[error("width and height must be non-zero multiples of 8, got {width}x{height}")]
    InvalidDimensions { width: usize, height: usize },

    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("device mismatch in {context}: expected {expected}, got {actual}")]
    DeviceMismatch {
        context: &'static str,
        expected: String,
        actual: String,
    },

    #[error("degenerate {operand} norm {norm:e} in {hook} at step {step}")]
    DegenerateNorm {
        step: usize,
        hook: Hook,
        operand: &'static str,
        norm: f64,
    },

    #[error("guidance scale requested for step {step} before set_timesteps")]
    GuidanceNotInitialized { step: usize },

    #[error("guidance step {step} is out of range for a schedule of {total} steps")]
    ScheduleOutOfRange { step: usize, total: usize },

    #[error("guidance step {got} requested out of order, expected step {expected}")]
    StepOutOfOrder { expected: usize, got: usize },

    #[error("guidance schedule expected {total} steps but only {executed} ran")]
    ScheduleNotExhausted { executed: usize, total: usize },

    #[error("the noise schedule needs at least one training timestep")]
    EmptyNoiseSchedule,

    #[error("the schedule resolved to zero steps")]
    EmptySchedule,

    #[error("decoded pixels do not fit a {width}x{height} RGB image")]
    ImageBuffer { width: usize, height: usize },
}

pub type Result<T> = core::result::Result<T, DiffusionError>;
