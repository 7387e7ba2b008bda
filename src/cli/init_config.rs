use anyhow::{Context, Result};
use burn::config::Config;
use clap::Args;
use guided_diffusers_burn::pipelines::StableDiffusionConfig;
use tracing::info;

#[derive(Args, Debug)]
pub struct InitConfigArgs {
    /// Where to write the configuration
    #[arg(short, long, default_value = "diffusion.json")]
    output: String,

    #[arg(long, default_value = "ddim")]
    scheduler: String,

    #[arg(long, default_value = "baseline")]
    guidance: String,
}

pub fn handle_init_config(args: &InitConfigArgs) -> Result<()> {
    let config = StableDiffusionConfig::new(args.scheduler.clone(), args.guidance.clone());
    config.validate()?;
    config
        .save(args.output.as_str())
        .with_context(|| format!("Failed to write {}", args.output))?;
    info!(path = %args.output, "Configuration written");
    Ok(())
}
