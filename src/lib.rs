//! # Guided diffusion pipelines
//!
//! The sampling loop of latent diffusion models with classifier-free guidance,
//! built on [Burn](https://github.com/burn-rs/burn). Guidance strategies
//! normalize the guidance signal, and the loop drives either a discrete
//! scheduler such as DDIM or a k-diffusion style continuous sampler.

pub mod error;
pub mod guidance;
pub mod models;
pub mod pipelines;
pub mod schedulers;
pub mod transformers;
pub mod utils;

#[cfg(test)]
mod testing;

pub use error::{DiffusionError, Result};

#[cfg(all(test, feature = "ndarray"))]
use burn::backend::ndarray;

#[cfg(all(test, feature = "ndarray"))]
pub type TestBackend = ndarray::NdArray<f32>;
