use std::marker::PhantomData;

use burn::{
    config::Config,
    tensor::{backend::Backend, Distribution, Tensor},
};

use super::{alphas_cumprod, BetaSchedule, DiscreteSchedule, PredictionType};

/// The configuration for the DDIM scheduler.
#[derive(Config, Debug)]
pub struct DDIMSchedulerConfig {
    /// The value of beta at the beginning of training.
    #[config(default = 0.00085)]
    pub beta_start: f64,
    /// The value of beta at the end of training.
    #[config(default = 0.012)]
    pub beta_end: f64,
    /// How beta evolved during training.
    #[config(default = "BetaSchedule::ScaledLinear")]
    pub beta_schedule: BetaSchedule,
    /// The amount of noise to be added at each step.
    #[config(default = 0.0)]
    pub eta: f64,
    /// Adjust the indexes of the inference schedule by this value.
    #[config(default = 1)]
    pub steps_offset: usize,
    /// prediction type of the scheduler function
    #[config(default = "PredictionType::Epsilon")]
    pub prediction_type: PredictionType,
    /// number of diffusion steps used to train the model
    #[config(default = 1000)]
    pub train_timesteps: usize,
}

impl DDIMSchedulerConfig {
    /// Cumulative alpha products of the training schedule.
    pub fn alphas_cumprod(&self) -> Vec<f64> {
        let betas = self
            .beta_schedule
            .betas(self.beta_start, self.beta_end, self.train_timesteps);
        alphas_cumprod(&betas)
    }
}

#[derive(Debug)]
pub struct DDIMScheduler<B: Backend> {
    timesteps: Vec<usize>,
    alphas_cumprod: Vec<f64>,
    step_ratio: usize,
    init_noise_sigma: f64,
    config: DDIMSchedulerConfig,
    __phantom: PhantomData<B>,
}

impl<B: Backend> DDIMScheduler<B> {
    pub fn new(inference_steps: usize, config: DDIMSchedulerConfig) -> Self {
        let alphas_cumprod = config.alphas_cumprod();
        let mut scheduler = Self {
            timesteps: Vec::new(),
            alphas_cumprod,
            step_ratio: 1,
            init_noise_sigma: 1.0,
            config,
            __phantom: PhantomData,
        };
        scheduler.set_inference_steps(inference_steps);
        scheduler
    }

    // At most one inference step per training step, and at least one step.
    fn set_inference_steps(&mut self, inference_steps: usize) {
        let train_timesteps = self.config.train_timesteps.max(1);
        let inference_steps = inference_steps.clamp(1, train_timesteps);
        self.step_ratio = train_timesteps / inference_steps;
        self.timesteps = (0..inference_steps)
            .map(|s| s * self.step_ratio + self.config.steps_offset)
            .rev()
            .collect();
    }

    // Perform a backward step
    pub fn step<const D: usize>(
        &self,
        model_output: Tensor<B, D>,
        timestep: usize,
        sample: Tensor<B, D>,
    ) -> Tensor<B, D> {
        let timestep = timestep.min(self.alphas_cumprod.len() - 1);
        let prev_timestep = if timestep > self.step_ratio {
            timestep - self.step_ratio
        } else {
            0
        };
        let alpha_prod_t = self.alphas_cumprod[timestep];
        let alpha_prod_t_prev = self.alphas_cumprod[prev_timestep];
        let beta_prod_t = 1. - alpha_prod_t;
        let beta_prod_t_prev = 1. - alpha_prod_t_prev;

        let (pred_original_sample, pred_epsilon) = match self.config.prediction_type {
            PredictionType::Epsilon => {
                let pred_original_sample = sample
                    .sub(model_output.clone().mul_scalar(beta_prod_t.sqrt()))
                    .mul_scalar(1. / alpha_prod_t.sqrt());
                (pred_original_sample, model_output)
            }
            PredictionType::VPrediction => {
                let pred_original_sample = sample.clone().mul_scalar(alpha_prod_t.sqrt())
                    - model_output.clone().mul_scalar(beta_prod_t.sqrt());
                let pred_epsilon = model_output.mul_scalar(alpha_prod_t.sqrt())
                    + sample.mul_scalar(beta_prod_t.sqrt());
                (pred_original_sample, pred_epsilon)
            }
            PredictionType::Sample => {
                let pred_epsilon = sample
                    .sub(model_output.clone().mul_scalar(alpha_prod_t.sqrt()))
                    .mul_scalar(1. / beta_prod_t.sqrt());
                (model_output, pred_epsilon)
            }
        };

        let variance = (beta_prod_t_prev / beta_prod_t) * (1. - alpha_prod_t / alpha_prod_t_prev);
        let std_dev_t = self.config.eta * variance.sqrt();

        let pred_sample_direction =
            pred_epsilon.mul_scalar((1. - alpha_prod_t_prev - std_dev_t * std_dev_t).sqrt());
        let prev_sample =
            pred_original_sample.mul_scalar(alpha_prod_t_prev.sqrt()) + pred_sample_direction;

        if self.config.eta > 0. {
            let noise = Tensor::random(
                prev_sample.shape(),
                Distribution::Normal(0f64, std_dev_t),
                &prev_sample.device(),
            );
            prev_sample + noise
        } else {
            prev_sample
        }
    }

    pub fn timesteps(&self) -> &[usize] {
        self.timesteps.as_slice()
    }

    pub fn init_noise_sigma(&self) -> f64 {
        self.init_noise_sigma
    }
}

impl<B: Backend> DiscreteSchedule<B> for DDIMScheduler<B> {
    fn set_timesteps(&mut self, inference_steps: usize) {
        self.set_inference_steps(inference_steps);
    }

    fn timesteps(&self) -> Vec<f64> {
        self.timesteps.iter().map(|&t| t as f64).collect()
    }

    fn init_noise_sigma(&self) -> f64 {
        self.init_noise_sigma
    }

    fn scale_model_input(&self, sample: Tensor<B, 4>, _timestep: f64) -> Tensor<B, 4> {
        sample
    }

    fn step(&self, model_output: Tensor<B, 4>, timestep: f64, sample: Tensor<B, 4>) -> Tensor<B, 4> {
        DDIMScheduler::step(self, model_output, timestep.round() as usize, sample)
    }
}
