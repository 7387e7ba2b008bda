use anyhow::{Context, Result};
use burn::config::Config;
use clap::Args;
use guided_diffusers_burn::pipelines::{StableDiffusionConfig, StepPlan, Stepper};

use super::Backend;

#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Pipeline configuration file, flags below override its values.
    #[arg(long, value_name = "FILE")]
    config: Option<String>,

    /// Scheduler name: ddim, k_euler, k_heun or k_dpmpp_2m.
    #[arg(long)]
    scheduler: Option<String>,

    /// Guidance strategy: baseline, pred-norm, t-norm or full-norm.
    #[arg(long)]
    guidance: Option<String>,

    /// The number of steps to run the diffusion for.
    #[arg(long)]
    n_steps: Option<usize>,

    #[arg(long)]
    guidance_scale: Option<f64>,

    /// Scale curve: constant, linear or cosine.
    #[arg(long)]
    scale_curve: Option<String>,

    #[arg(long)]
    guidance_scale_end: Option<f64>,

    /// Use the Karras noise levels with k_ samplers.
    #[arg(long, action)]
    karras: bool,

    /// The width in pixels of the generated image.
    #[arg(long)]
    width: Option<usize>,

    /// The height in pixels of the generated image.
    #[arg(long)]
    height: Option<usize>,
}

impl PlanArgs {
    fn config(&self) -> Result<StableDiffusionConfig> {
        let mut config = match &self.config {
            Some(path) => StableDiffusionConfig::load(path.as_str())
                .with_context(|| format!("Failed to load configuration from {path}"))?,
            None => StableDiffusionConfig::new("ddim".to_string(), "baseline".to_string()),
        };

        if let Some(scheduler) = &self.scheduler {
            config.scheduler = scheduler.clone();
        }
        if let Some(guidance) = &self.guidance {
            config.guidance = guidance.clone();
        }
        if let Some(n_steps) = self.n_steps {
            config.n_steps = n_steps;
        }
        if let Some(scale) = self.guidance_scale {
            config.guidance_scale = scale;
        }
        if self.scale_curve.is_some() {
            config.scale_curve = self.scale_curve.clone();
        }
        if let Some(scale) = self.guidance_scale_end {
            config.guidance_scale_end = scale;
        }
        if let Some(width) = self.width {
            config.width = width;
        }
        if let Some(height) = self.height {
            config.height = height;
        }
        config.use_karras_sigmas |= self.karras;

        config.validate()?;
        Ok(config)
    }
}

pub fn handle_plan(args: &PlanArgs) -> Result<()> {
    let config = args.config()?;
    let device = <Backend as burn::tensor::backend::Backend>::Device::default();

    let mut stepper = Stepper::<Backend>::load(
        config.schedule_kind()?,
        &config.noise_schedule,
        config.n_steps,
        config.use_karras_sigmas,
        &device,
    );
    let plan = stepper.plan(config.n_steps);
    let mut guidance = config.dynamic_guidance()?;
    guidance.set_timesteps(plan.guidance_steps());

    println!(
        "scheduler {} | guidance {} | {}x{} image",
        config.scheduler, config.guidance, config.width, config.height,
    );

    match &plan {
        StepPlan::Timesteps(timesteps) => {
            println!("{} steps, {} guidance evaluations", timesteps.len(), timesteps.len());
            for (step, timestep) in timesteps.iter().enumerate() {
                println!(
                    "step {step:>4}  timestep {timestep:>8.2}  scale {:.4}",
                    guidance.scale_at(step)?
                );
            }
        }
        StepPlan::Sigmas { sigmas, evaluations } => {
            println!(
                "{} steps, {evaluations} guidance evaluations",
                sigmas.len().saturating_sub(1)
            );
            for (step, sigma) in sigmas.iter().enumerate() {
                println!("sigma {step:>4}  {sigma:.6}");
            }
            for evaluation in 0..*evaluations {
                println!(
                    "evaluation {evaluation:>4}  scale {:.4}",
                    guidance.scale_at(evaluation)?
                );
            }
        }
    }

    Ok(())
}
