use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

mod cli;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// More logging, repeat for more detail
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Resolve the schedule of a run and print the guidance scale of every step
    Plan {
        #[clap(flatten)]
        args: cli::plan::PlanArgs,
    },
    /// Write a pipeline configuration with default values
    InitConfig {
        #[clap(flatten)]
        args: cli::init_config::InitConfigArgs,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    match &cli.command {
        Commands::Plan { args } => {
            cli::plan::handle_plan(args)?;
        }
        Commands::InitConfig { args } => {
            cli::init_config::handle_init_config(args)?;
        }
    }

    Ok(())
}
