//! # Classifier-free guidance
//!
//! Blends an unconditional estimate `u` and a conditional estimate `t` into
//! `u + scale * (t - u)`, with optional normalization of the difference and of
//! the blended prediction.

pub mod dynamic;
pub mod step;
pub mod transform;

pub use dynamic::{
    ConstantScale, CosineScale, DynamicGuidance, LinearScale, ScaleCurve, ScaleCurveKind,
};
pub use step::{NormHook, MIN_NORM};
pub use transform::{GuidanceKind, GuidanceTransform};
