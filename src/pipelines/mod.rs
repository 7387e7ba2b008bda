//! # Pipelines
//!
//! The diffusion loop: [stepper] advances latents through one of the schedule
//! families and [stable_diffusion] wires prompts, latents and decoding around
//! it.

pub mod stable_diffusion;
pub mod stepper;

pub use stable_diffusion::{StableDiffusion, StableDiffusionConfig, StableDiffusionParts};
pub use stepper::{Conditioning, StepExecutor, StepPlan, Stepper};
