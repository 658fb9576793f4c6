//! CLI entry point for metaopt-rs.

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metaopt_rs::config::DeviceSelector;
use metaopt_rs::{MetaOptConfig, Result, Trainer};

#[derive(Parser)]
#[command(name = "metaopt")]
#[command(about = "Episodic meta-learning for few-shot classification")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },
    /// Start training
    Train {
        /// Path to configuration file
        config: String,
        /// Force CPU execution
        #[arg(long)]
        cpu: bool,
        /// Pretrained embedding weights (safetensors)
        #[arg(long)]
        pretrained: Option<String>,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: String,
        /// Dataset preset (mini_imagenet, tiered_imagenet, cifar_fs, fc100)
        #[arg(long, default_value = "mini_imagenet")]
        dataset: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config);
            let config = MetaOptConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!("  Network: {:?}", config.network);
            println!("  Head: {:?}", config.head);
            println!("  Dataset: {}", config.dataset.dir_name());
            println!(
                "  Train episodes: {}-way {}-shot, {} queries per class",
                config.episodes.train_way, config.episodes.train_shot, config.episodes.train_query
            );
        }
        Commands::Train {
            config,
            cpu,
            pretrained,
        } => {
            tracing::info!("Starting training with config: {}", config);
            let mut config = MetaOptConfig::from_file(&config)?;
            if cpu {
                config.device = DeviceSelector::Cpu;
            }
            if pretrained.is_some() {
                config.pretrained = pretrained;
            }

            let mut trainer = Trainer::new(config)?;
            let summary = trainer.train()?;
            println!(
                "✓ Training complete, best validation accuracy {:.2} %",
                summary.best_accuracy
            );
        }
        Commands::Init { output, dataset } => {
            tracing::info!("Generating config for dataset: {}", dataset);
            let config = MetaOptConfig::from_preset(&dataset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
    }

    Ok(())
}
