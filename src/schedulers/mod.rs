//! # Schedulers
//!
//! Two families drive the diffusion loop:
//!
//! - discrete schedules ([DiscreteSchedule]) expose a fixed list of timesteps
//!   and advance the latents once per timestep;
//! - continuous samplers ([ContinuousSampler]) own a sigma table and run the
//!   whole walk themselves, calling back into the guided model once per
//!   internal evaluation.

use core::fmt;
use core::str::FromStr;

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{DiffusionError, Result};
use crate::guidance::DynamicGuidance;
use crate::pipelines::stepper::StepExecutor;

pub mod ddim;
pub mod k_diffusion;

/// This represents how beta ranges from its minimum value to the maximum
/// during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BetaSchedule {
    /// Linear interpolation.
    Linear,
    /// Linear interpolation of the square root of beta.
    ScaledLinear,
    /// Glide cosine schedule
    SquaredcosCapV2,
}

impl BetaSchedule {
    /// The `num_steps` training betas of this schedule.
    pub fn betas(&self, start: f64, end: f64, num_steps: usize) -> Vec<f64> {
        match self {
            BetaSchedule::Linear => linspace(start, end, num_steps),
            BetaSchedule::ScaledLinear => linspace(start.sqrt(), end.sqrt(), num_steps)
                .into_iter()
                .map(|beta| beta * beta)
                .collect(),
            BetaSchedule::SquaredcosCapV2 => squared_cos_betas(num_steps, 0.999),
        }
    }
}

/// prediction type of the scheduler function, one of `epsilon` (predicting
/// the noise of the diffusion process), `sample` (directly predicting the noisy sample`)
/// or `v_prediction` (see section 2.4 https://imagen.research.google/video/paper.pdf)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredictionType {
    Epsilon,
    VPrediction,
    Sample,
}

/// `num` evenly spaced values from `start` to `end`, both included.
pub(crate) fn linspace(start: f64, end: f64, num: usize) -> Vec<f64> {
    match num {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (num - 1) as f64;
            (0..num).map(|i| start + step * i as f64).collect()
        }
    }
}

/// Create a beta schedule that discretizes the given alpha_t_bar function, which defines the cumulative product of
/// `(1-beta)` over time from `t = [0,1]`.
fn squared_cos_betas(num_diffusion_timesteps: usize, max_beta: f64) -> Vec<f64> {
    let alpha_bar =
        |t: f64| f64::cos((t + 0.008) / 1.008 * core::f64::consts::FRAC_PI_2).powi(2);
    (0..num_diffusion_timesteps)
        .map(|i| {
            let t1 = i as f64 / num_diffusion_timesteps as f64;
            let t2 = (i + 1) as f64 / num_diffusion_timesteps as f64;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta)
        })
        .collect()
}

/// Cumulative product of `1 - beta`.
pub(crate) fn alphas_cumprod(betas: &[f64]) -> Vec<f64> {
    let mut alphas_cumprod = Vec::with_capacity(betas.len());
    for beta in betas {
        let alpha = 1.0 - beta;
        alphas_cumprod.push(alpha * alphas_cumprod.last().copied().unwrap_or(1.0));
    }
    alphas_cumprod
}

/// A schedule with a fixed, ordered list of timesteps.
pub trait DiscreteSchedule<B: Backend> {
    /// Resolves the timesteps for a run of `inference_steps` steps. The
    /// resolved count may differ from the request.
    fn set_timesteps(&mut self, inference_steps: usize);

    fn timesteps(&self) -> Vec<f64>;

    /// Scale applied to the initial noise.
    fn init_noise_sigma(&self) -> f64;

    fn scale_model_input(&self, sample: Tensor<B, 4>, timestep: f64) -> Tensor<B, 4>;

    fn step(&self, model_output: Tensor<B, 4>, timestep: f64, sample: Tensor<B, 4>) -> Tensor<B, 4>;
}

/// An adaptive sampler that walks its own sigma table.
pub trait ContinuousSampler<B: Backend> {
    /// Moves the sigma tables to `device`.
    fn to_device(&mut self, device: &B::Device);

    /// The sigmas visited by a run of `steps` steps, ending with `0`.
    fn sigmas(&self, steps: usize) -> Vec<f64>;

    /// Number of guided model evaluations performed by a run of `steps` steps.
    fn model_evaluations(&self, steps: usize) -> usize;

    /// Runs the full sampling loop from `initial` (unit variance noise).
    ///
    /// Announces [model_evaluations](ContinuousSampler::model_evaluations) to
    /// `guidance` and indexes every guided evaluation from 0.
    fn sample(
        &self,
        steps: usize,
        initial: Tensor<B, 4>,
        executor: &StepExecutor<'_, B>,
        guidance: &mut DynamicGuidance,
    ) -> Result<Tensor<B, 4>>;
}

/// Scheduler names accepted in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduleKind {
    Ddim,
    KEuler,
    KHeun,
    KDpmpp2m,
}

impl ScheduleKind {
    pub const ALL: [ScheduleKind; 4] = [
        ScheduleKind::Ddim,
        ScheduleKind::KEuler,
        ScheduleKind::KHeun,
        ScheduleKind::KDpmpp2m,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ScheduleKind::Ddim => "ddim",
            ScheduleKind::KEuler => "k_euler",
            ScheduleKind::KHeun => "k_heun",
            ScheduleKind::KDpmpp2m => "k_dpmpp_2m",
        }
    }

    /// `k_` schedulers run through the continuous sampler.
    pub fn is_continuous(&self) -> bool {
        self.name().starts_with("k_")
    }
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ScheduleKind {
    type Err = DiffusionError;

    fn from_str(name: &str) -> Result<Self> {
        ScheduleKind::ALL
            .into_iter()
            .find(|kind| kind.name() == name)
            .ok_or_else(|| DiffusionError::UnknownScheduler(name.to_string()))
    }
}
