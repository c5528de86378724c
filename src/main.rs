//! CLI entry point for crepe-model-rs.

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use candle_core::Device;
use crepe_model_rs::{
    checkpoint, CrepeConfig, CrepeNet, CrepeResult, ExportConfig, ExportPipeline, ModelCapacity,
};

#[derive(Parser)]
#[command(name = "crepe")]
#[command(about = "CREPE pitch-estimation model export toolkit")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Normalize a training checkpoint into a canonical weight file
    Convert {
        /// Path to the pickled training checkpoint
        checkpoint: String,
        /// Output path for the canonical safetensors file
        output: String,
        /// Capacity tier of the checkpoint (tiny, small, medium, large, full)
        #[arg(long, default_value = "tiny")]
        capacity: ModelCapacity,
    },
    /// Compile canonical weights into deployment artifacts
    Build {
        /// Path to a YAML export configuration
        #[arg(long)]
        config: Option<String>,
        /// Capacity tier override
        #[arg(long)]
        capacity: Option<ModelCapacity>,
        /// Target override (webgpu, vulkan, metal, cuda)
        #[arg(long)]
        target: Option<String>,
        /// Optimization level override (0-3)
        #[arg(long)]
        opt_level: Option<u8>,
        /// Output directory override
        #[arg(long)]
        output: Option<String>,
    },
    /// Generate a sample export configuration file
    Init {
        /// Output path for the config file
        #[arg(default_value = "export.yaml")]
        output: String,
    },
}

fn main() -> CrepeResult<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Convert {
            checkpoint: ckpt,
            output,
            capacity,
        } => {
            tracing::info!("Converting checkpoint: {}", ckpt);
            let config = CrepeConfig::new(capacity);
            checkpoint::convert_checkpoint(&ckpt, &output, &config)?;
            println!("✓ Canonical weights written to: {output}");
        }
        Commands::Build {
            config,
            capacity,
            target,
            opt_level,
            output,
        } => {
            let mut export = match config {
                Some(path) => {
                    tracing::info!("Loading export config: {}", path);
                    ExportConfig::from_file(&path)?
                }
                None => ExportConfig::default(),
            };
            if let Some(capacity) = capacity {
                export.capacity = capacity;
            }
            if let Some(target) = target {
                export.target = target;
            }
            if let Some(opt_level) = opt_level {
                export.opt_level = opt_level;
            }
            if let Some(output) = output {
                export.output_dir = output;
            }

            let device = Device::Cpu;
            let model_config = CrepeConfig::new(export.capacity);
            let weights = checkpoint::load_canonical(export.weights_path(), &device)?;
            let model = CrepeNet::from_weights(&model_config, &weights)?;

            let pipeline = ExportPipeline::new(export)?;
            let artifacts = pipeline.run(&model)?;
            println!("✓ Compiled graph: {}", artifacts.graph_path.display());
            println!("✓ Parameters:     {}", artifacts.params_path.display());
        }
        Commands::Init { output } => {
            tracing::info!("Generating export config: {}", output);
            ExportConfig::default().to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
    }

    Ok(())
}
