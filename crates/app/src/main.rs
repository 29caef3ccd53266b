use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tallyslip_core::PipelineConfig;
use tallyslip_pipeline::ReceiptPipeline;

#[derive(Parser)]
#[command(name = "tallyslip")]
#[command(about = "Turn receipt photos into structured JSON")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a receipt image and print the result with stage timings
    Parse {
        /// Receipt image (JPEG, PNG, WEBP, ...)
        image: PathBuf,
        /// TOML config file; environment variables override its values
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Log the per-stage timing report
        #[arg(short, long)]
        verbose: bool,
        /// Print single-line JSON
        #[arg(long)]
        compact: bool,
    },
    /// Print the format instructions sent to the model
    Schema,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<PipelineConfig> {
    let base = match path {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    base.with_env_overrides(|key| std::env::var(key).ok())
        .context("Failed to apply environment overrides")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Parse { image, config, verbose, compact } => {
            init_tracing(verbose);
            let config = load_config(config.as_ref())?;
            let pipeline = ReceiptPipeline::from_config(config)
                .context("Failed to set up the receipt pipeline")?
                .with_verbose(verbose);
            let parsed = pipeline
                .process_file(&image)
                .await
                .with_context(|| format!("Failed to parse {}", image.display()))?;

            let out = if compact {
                serde_json::to_string(&parsed)?
            } else {
                serde_json::to_string_pretty(&parsed)?
            };
            println!("{out}");
        }
        Commands::Schema => {
            println!("{}", tallyslip_extract::format_instructions());
        }
    }

    Ok(())
}
