use core::fmt;

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use tracing::{debug, warn};

use crate::error::{DiffusionError, Result};
use crate::guidance::DynamicGuidance;
use crate::models::Denoiser;
use crate::schedulers::ddim::{DDIMScheduler, DDIMSchedulerConfig};
use crate::schedulers::k_diffusion::{KMethod, KSampler};
use crate::schedulers::{ContinuousSampler, DiscreteSchedule, ScheduleKind};
use crate::utils::{duplicate_batch, ensure_device, ensure_dims};

/// Text embeddings of the prompt and of the negative prompt.
#[derive(Debug, Clone)]
pub struct Conditioning<B: Backend> {
    cond: Tensor<B, 3>,
    uncond: Tensor<B, 3>,
}

impl<B: Backend> Conditioning<B> {
    pub fn new(cond: Tensor<B, 3>, uncond: Tensor<B, 3>) -> Result<Self> {
        ensure_dims("unconditional embedding", cond.dims(), uncond.dims())?;
        ensure_device::<B>("unconditional embedding", &cond.device(), &uncond.device())?;
        Ok(Self { cond, uncond })
    }

    pub fn cond(&self) -> &Tensor<B, 3> {
        &self.cond
    }

    pub fn uncond(&self) -> &Tensor<B, 3> {
        &self.uncond
    }

    pub fn device(&self) -> B::Device {
        self.cond.device()
    }

    /// `[uncond, cond]` stacked along the batch axis.
    pub fn batched(&self) -> Tensor<B, 3> {
        Tensor::cat(vec![self.uncond.clone(), self.cond.clone()], 0)
    }

    #[cfg(test)]
    pub(crate) fn zeros(seq_len: usize, embed_dim: usize, device: &B::Device) -> Self {
        let zeros = Tensor::zeros([1, seq_len, embed_dim], device);
        Self {
            cond: zeros.clone(),
            uncond: zeros,
        }
    }
}

/// Runs the denoiser on a doubled batch and blends both halves with the
/// guidance of the current step.
pub struct StepExecutor<'a, B: Backend> {
    denoiser: &'a dyn Denoiser<B>,
    conditioning: &'a Conditioning<B>,
}

impl<'a, B: Backend> StepExecutor<'a, B> {
    pub fn new(denoiser: &'a dyn Denoiser<B>, conditioning: &'a Conditioning<B>) -> Self {
        Self {
            denoiser,
            conditioning,
        }
    }

    /// Guided noise estimate for `model_input`, an `[uncond, cond]` batch.
    pub fn guided_noise(
        &self,
        model_input: Tensor<B, 4>,
        timestep: f64,
        guidance: &mut DynamicGuidance,
        step: usize,
    ) -> Result<Tensor<B, 4>> {
        let dims = model_input.dims();
        let noise_pred = self
            .denoiser
            .predict(model_input, timestep, self.conditioning.batched());
        ensure_dims("noise prediction", dims, noise_pred.dims())?;

        let [batch, channels, height, width] = dims;
        let half = batch / 2;
        let u = noise_pred
            .clone()
            .slice([0..half, 0..channels, 0..height, 0..width]);
        let t = noise_pred.slice([half..batch, 0..channels, 0..height, 0..width]);

        guidance.guide(u, t, step)
    }

    /// One step of a discrete schedule.
    pub fn diffuse_step(
        &self,
        schedule: &dyn DiscreteSchedule<B>,
        latents: Tensor<B, 4>,
        timestep: f64,
        step: usize,
        guidance: &mut DynamicGuidance,
    ) -> Result<Tensor<B, 4>> {
        let latent_model_input = schedule.scale_model_input(duplicate_batch(latents.clone()), timestep);
        let noise_pred = self.guided_noise(latent_model_input, timestep, guidance, step)?;
        Ok(schedule.step(noise_pred, timestep, latents))
    }
}

/// What a run of the active schedule will visit.
#[derive(Debug, Clone, PartialEq)]
pub enum StepPlan {
    Timesteps(Vec<f64>),
    Sigmas { sigmas: Vec<f64>, evaluations: usize },
}

impl StepPlan {
    /// Number of guidance evaluations of the run.
    pub fn guidance_steps(&self) -> usize {
        match self {
            StepPlan::Timesteps(timesteps) => timesteps.len(),
            StepPlan::Sigmas { evaluations, .. } => *evaluations,
        }
    }
}

/// The schedule backend of a pipeline, chosen once at load.
pub enum Stepper<B: Backend> {
    Discrete(Box<dyn DiscreteSchedule<B>>),
    Continuous(Box<dyn ContinuousSampler<B>>),
}

impl<B: Backend> fmt::Debug for Stepper<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stepper::Discrete(_) => f.write_str("Stepper::Discrete"),
            Stepper::Continuous(_) => f.write_str("Stepper::Continuous"),
        }
    }
}

impl<B: Backend> Stepper<B> {
    /// Bundled schedule for `kind`, built from the `config` training betas.
    pub fn load(
        kind: ScheduleKind,
        config: &DDIMSchedulerConfig,
        n_steps: usize,
        use_karras_sigmas: bool,
        device: &B::Device,
    ) -> Self {
        let method = match kind {
            ScheduleKind::Ddim => {
                return Stepper::Discrete(Box::new(DDIMScheduler::<B>::new(
                    n_steps,
                    config.clone(),
                )))
            }
            ScheduleKind::KEuler => KMethod::Euler,
            ScheduleKind::KHeun => KMethod::Heun,
            ScheduleKind::KDpmpp2m => KMethod::Dpmpp2m,
        };
        let sampler =
            KSampler::<B>::new(method, config, device).with_karras_sigmas(use_karras_sigmas);
        Stepper::Continuous(Box::new(sampler))
    }

    pub fn is_continuous(&self) -> bool {
        matches!(self, Stepper::Continuous(_))
    }

    /// Resolves the schedule of a `step_count` run without sampling.
    pub fn plan(&mut self, step_count: usize) -> StepPlan {
        match self {
            Stepper::Discrete(schedule) => {
                schedule.set_timesteps(step_count);
                StepPlan::Timesteps(schedule.timesteps())
            }
            Stepper::Continuous(sampler) => StepPlan::Sigmas {
                sigmas: sampler.sigmas(step_count),
                evaluations: sampler.model_evaluations(step_count),
            },
        }
    }

    /// Runs the whole diffusion loop from `initial_latents`, unit variance
    /// noise of shape `[1, channels, height / 8, width / 8]`.
    ///
    /// `guidance` is told how many evaluations the run performs before the
    /// first one, and must have consumed all of them at the end.
    pub fn run(
        &mut self,
        step_count: usize,
        initial_latents: Tensor<B, 4>,
        denoiser: &dyn Denoiser<B>,
        conditioning: &Conditioning<B>,
        guidance: &mut DynamicGuidance,
    ) -> Result<Tensor<B, 4>> {
        ensure_device::<B>("conditioning", &initial_latents.device(), &conditioning.device())?;
        let executor = StepExecutor::new(denoiser, conditioning);

        let latents = match self {
            Stepper::Discrete(schedule) => {
                schedule.set_timesteps(step_count);
                let timesteps = schedule.timesteps();
                if timesteps.is_empty() {
                    return Err(DiffusionError::EmptySchedule);
                }
                if timesteps.len() != step_count {
                    warn!(
                        requested = step_count,
                        resolved = timesteps.len(),
                        "Schedule resolved a different number of timesteps"
                    );
                }
                guidance.set_timesteps(timesteps.len());

                let mut latents = initial_latents.mul_scalar(schedule.init_noise_sigma());
                for (step, &timestep) in timesteps.iter().enumerate() {
                    debug!(step, timestep, "Diffusion step");
                    latents = executor.diffuse_step(
                        &**schedule,
                        latents,
                        timestep,
                        step,
                        guidance,
                    )?;
                }
                latents
            }
            Stepper::Continuous(sampler) => {
                sampler.to_device(&initial_latents.device());
                sampler.sample(step_count, initial_latents, &executor, guidance)?
            }
        };

        guidance.finish()?;
        Ok(latents)
    }
}
