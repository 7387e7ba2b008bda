use burn::config::Config;
use burn::tensor::backend::Backend;
use burn::tensor::{Data, Distribution, Int, Shape, Tensor};
use image::RgbImage;
use tracing::{debug, info};

use super::stepper::{Conditioning, StepPlan, Stepper};
use crate::error::DiffusionError;
use crate::guidance::{DynamicGuidance, GuidanceKind, GuidanceTransform, ScaleCurveKind};
use crate::models::{attention_slice_size, Denoiser, LatentDecoder};
use crate::schedulers::ddim::DDIMSchedulerConfig;
use crate::schedulers::ScheduleKind;
use crate::transformers::{TextEncoder, Tokenizer};
use crate::utils::{ensure_device, ensure_dims, pad_tokens, to_f64_vec};

/// Scaling factor of the latent space of the Stable Diffusion autoencoder.
pub const VAE_SCALE: f64 = 0.18215;

pub const DEFAULT_SIZE: usize = 512;
pub const DEFAULT_N_STEPS: usize = 50;

#[derive(Config, Debug)]
pub struct StableDiffusionConfig {
    /// Scheduler name, `ddim` or one of the `k_` samplers.
    pub scheduler: String,
    /// Guidance strategy name.
    pub guidance: String,
    /// Image width in pixels, a multiple of 8. Used by
    /// [generate_default](StableDiffusion::generate_default).
    #[config(default = "DEFAULT_SIZE")]
    pub width: usize,
    /// Image height in pixels, a multiple of 8.
    #[config(default = "DEFAULT_SIZE")]
    pub height: usize,
    #[config(default = "DEFAULT_N_STEPS")]
    pub n_steps: usize,
    /// Guidance scale at the first step.
    #[config(default = 7.5)]
    pub guidance_scale: f64,
    /// How the guidance scale evolves over the run, constant when unset.
    pub scale_curve: Option<String>,
    /// Guidance scale at the last step, unused by the constant curve.
    #[config(default = 1.0)]
    pub guidance_scale_end: f64,
    #[config(default = true)]
    pub attention_slicing: bool,
    #[config(default = false)]
    pub use_karras_sigmas: bool,
    /// Seed of the initial latents.
    pub seed: Option<u64>,
    /// Training noise schedule shared by every bundled scheduler.
    #[config(default = "DDIMSchedulerConfig::new()")]
    pub noise_schedule: DDIMSchedulerConfig,
}

impl StableDiffusionConfig {
    pub fn schedule_kind(&self) -> crate::Result<ScheduleKind> {
        self.scheduler.parse()
    }

    pub fn guidance_kind(&self) -> crate::Result<GuidanceKind> {
        self.guidance.parse()
    }

    pub fn scale_curve_kind(&self) -> crate::Result<ScaleCurveKind> {
        match &self.scale_curve {
            Some(name) => name.parse(),
            None => Ok(ScaleCurveKind::Constant),
        }
    }

    pub fn dynamic_guidance(&self) -> crate::Result<DynamicGuidance> {
        let transform = GuidanceTransform::from_name(&self.guidance)?;
        let curve = self
            .scale_curve_kind()?
            .build(self.guidance_scale, self.guidance_scale_end);
        Ok(DynamicGuidance::new(transform, curve))
    }

    /// Checks every name, the noise schedule and the image size.
    pub fn validate(&self) -> crate::Result<()> {
        self.schedule_kind()?;
        self.guidance_kind()?;
        self.scale_curve_kind()?;
        if self.noise_schedule.train_timesteps == 0 {
            return Err(DiffusionError::EmptyNoiseSchedule);
        }
        check_dimensions(self.width, self.height)
    }
}

/// Width and height must be non-zero multiples of 8.
pub fn check_dimensions(width: usize, height: usize) -> crate::Result<()> {
    if width == 0 || height == 0 || width % 8 != 0 || height % 8 != 0 {
        return Err(DiffusionError::InvalidDimensions { width, height });
    }
    Ok(())
}

/// The pretrained networks of a pipeline.
pub struct StableDiffusionParts<B: Backend> {
    pub tokenizer: Box<dyn Tokenizer>,
    pub text_encoder: Box<dyn TextEncoder<B>>,
    pub unet: Box<dyn Denoiser<B>>,
    pub vae: Box<dyn LatentDecoder<B>>,
}

pub struct StableDiffusion<B: Backend> {
    tokenizer: Box<dyn Tokenizer>,
    text_encoder: Box<dyn TextEncoder<B>>,
    unet: Box<dyn Denoiser<B>>,
    vae: Box<dyn LatentDecoder<B>>,
    stepper: Stepper<B>,
    guidance: DynamicGuidance,
    init_latents: Option<Tensor<B, 4>>,
    seed: Option<u64>,
    n_steps: usize,
    width: usize,
    height: usize,
    device: B::Device,
}

impl<B: Backend> StableDiffusion<B> {
    /// Builds a pipeline with the bundled scheduler named in `config`.
    ///
    /// Unknown scheduler, guidance or scale curve names are rejected here,
    /// before any inference runs.
    pub fn load(
        parts: StableDiffusionParts<B>,
        config: &StableDiffusionConfig,
        device: &B::Device,
    ) -> crate::Result<Self> {
        config.validate()?;
        let kind = config.schedule_kind()?;
        let guidance = config.dynamic_guidance()?;
        info!(
            scheduler = %kind,
            continuous = kind.is_continuous(),
            guidance = %guidance.transform().kind(),
            "Loading pipeline"
        );

        let stepper = Stepper::load(
            kind,
            &config.noise_schedule,
            config.n_steps,
            config.use_karras_sigmas,
            device,
        );
        let mut pipeline = Self::with_stepper(parts, stepper, guidance, device);
        pipeline.seed = config.seed;
        pipeline.n_steps = config.n_steps;
        pipeline.width = config.width;
        pipeline.height = config.height;
        if config.attention_slicing {
            pipeline.enable_attention_slicing();
        }
        Ok(pipeline)
    }

    /// Builds a pipeline around any schedule implementation.
    pub fn with_stepper(
        parts: StableDiffusionParts<B>,
        stepper: Stepper<B>,
        guidance: DynamicGuidance,
        device: &B::Device,
    ) -> Self {
        Self {
            tokenizer: parts.tokenizer,
            text_encoder: parts.text_encoder,
            unet: parts.unet,
            vae: parts.vae,
            stepper,
            guidance,
            init_latents: None,
            seed: None,
            n_steps: DEFAULT_N_STEPS,
            width: DEFAULT_SIZE,
            height: DEFAULT_SIZE,
            device: device.clone(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn guidance(&self) -> &DynamicGuidance {
        &self.guidance
    }

    pub fn set_guidance(&mut self, guidance: DynamicGuidance) {
        self.guidance = guidance;
    }

    pub fn plan(&mut self, n_steps: usize) -> StepPlan {
        self.stepper.plan(n_steps)
    }

    fn enable_attention_slicing(&mut self) {
        match attention_slice_size(&self.unet.attention_head_dims()) {
            Some(slice_size) => {
                info!(slice_size, "Attention slicing enabled");
                self.unet.set_attention_slice(slice_size);
            }
            None => debug!("Denoiser reports no attention heads, slicing skipped"),
        }
    }

    /// Embeds `prompt`, padded or truncated to the tokenizer max length.
    pub fn encode_text(&self, prompt: &str) -> Tensor<B, 3> {
        let max_length = self.tokenizer.max_length();
        let tokens: Vec<i32> = pad_tokens(
            self.tokenizer.encode(prompt),
            max_length,
            self.tokenizer.pad_token(),
        )
        .into_iter()
        .map(|token| token as i32)
        .collect();

        let tokens: Tensor<B, 1, Int> =
            Tensor::from_ints(Data::new(tokens, Shape::new([max_length])), &self.device);
        self.text_encoder.forward(tokens.reshape([1, max_length]))
    }

    /// Embeds the prompt and the negative prompt, the empty prompt when
    /// none is given.
    pub fn embed_prompts(
        &self,
        prompt: &str,
        negative_prompt: Option<&str>,
    ) -> crate::Result<Conditioning<B>> {
        let negative_prompt = negative_prompt.unwrap_or_else(|| {
            debug!("No negative prompt, using the empty prompt");
            ""
        });
        let cond = self.encode_text(prompt);
        let uncond = self.encode_text(negative_prompt);
        Conditioning::new(cond, uncond)
    }

    /// Uses `latents` as the starting noise of every following run.
    pub fn set_initial_latents(&mut self, latents: Tensor<B, 4>) {
        self.init_latents = Some(latents);
    }

    /// Drops the stored starting noise, the next run draws a new one.
    pub fn reset_initial_latents(&mut self) {
        self.init_latents = None;
    }

    /// Starting noise for a `height` x `width` image.
    ///
    /// Drawn from a standard normal on first use, seeded when a seed is
    /// configured, then reused until [reset](Self::reset_initial_latents).
    pub fn initial_latents(&mut self, height: usize, width: usize) -> crate::Result<Tensor<B, 4>> {
        let shape = [1, self.unet.in_channels(), height / 8, width / 8];

        if let Some(latents) = &self.init_latents {
            ensure_dims("initial latents", shape, latents.dims())?;
            ensure_device::<B>("initial latents", &self.device, &latents.device())?;
            return Ok(latents.clone());
        }

        if let Some(seed) = self.seed {
            B::seed(seed);
        }
        let latents = Tensor::random(shape, Distribution::Normal(0.0, 1.0), &self.device);
        self.init_latents = Some(latents.clone());
        Ok(latents)
    }

    /// Runs the diffusion loop and returns the final latents.
    ///
    /// With a seed configured the backend RNG is reseeded before stepping, so
    /// stochastic schedulers repeat their noise from one call to the next.
    pub fn generate_latents(
        &mut self,
        prompt: &str,
        negative_prompt: Option<&str>,
        n_steps: usize,
        width: usize,
        height: usize,
    ) -> crate::Result<Tensor<B, 4>> {
        check_dimensions(width, height)?;
        let conditioning = self.embed_prompts(prompt, negative_prompt)?;
        let latents = self.initial_latents(height, width)?;
        if let Some(seed) = self.seed {
            B::seed(seed);
        }

        info!(
            n_steps,
            width,
            height,
            guidance = %self.guidance.transform().kind(),
            "Starting diffusion"
        );
        self.stepper.run(
            n_steps,
            latents,
            &*self.unet,
            &conditioning,
            &mut self.guidance,
        )
    }

    pub fn generate(
        &mut self,
        prompt: &str,
        negative_prompt: Option<&str>,
        n_steps: usize,
        width: usize,
        height: usize,
    ) -> crate::Result<RgbImage> {
        let latents = self.generate_latents(prompt, negative_prompt, n_steps, width, height)?;
        self.image_from_latents(latents)
    }

    /// [generate](Self::generate) with the step count and image size of the
    /// configuration the pipeline was loaded from.
    pub fn generate_default(
        &mut self,
        prompt: &str,
        negative_prompt: Option<&str>,
    ) -> crate::Result<RgbImage> {
        let (n_steps, width, height) = (self.n_steps, self.width, self.height);
        self.generate(prompt, negative_prompt, n_steps, width, height)
    }

    /// Decodes the first latent of the batch into an 8-bit RGB image.
    pub fn image_from_latents(&self, latents: Tensor<B, 4>) -> crate::Result<RgbImage> {
        debug!(dims = ?latents.dims(), "Decoding latents");
        let image = self.vae.decode(latents.div_scalar(VAE_SCALE));
        let image = image.div_scalar(2.0).add_scalar(0.5).clamp(0.0, 1.0);

        let [_, channels, height, width] = image.dims();
        ensure_dims("decoded image", [3, height, width], [channels, height, width])?;
        let pixels: Vec<u8> = to_f64_vec(
            image
                .slice([0..1, 0..3, 0..height, 0..width])
                .reshape([3, height, width])
                .swap_dims(0, 1)
                .swap_dims(1, 2),
        )
        .into_iter()
        .map(|value| (value * 255.0).round() as u8)
        .collect();

        RgbImage::from_raw(width as u32, height as u32, pixels)
            .ok_or(DiffusionError::ImageBuffer { width, height })
    }
}
