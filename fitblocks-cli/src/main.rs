//! fitblocks CLI: train, evaluate and measure a model on a synthetic problem.

mod commands;

use clap::{Parser, ValueEnum};
use fitblocks_core::config::{ConfigOverrides, TrainOverrides};
use fitblocks_core::training::Split;
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Training-loop orchestration with checkpoint tracking
#[derive(Parser, Debug)]
#[command(name = "fitblocks", version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./fitblocks.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding checkpoints, logs and run summaries
    #[arg(short, long, global = true)]
    model_dir: Option<PathBuf>,

    /// Synthetic problem the model is built for
    #[arg(short, long, global = true, value_enum, default_value_t = Problem::Regression)]
    problem: Problem,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only report errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum Problem {
    /// Linear regression with a single output
    Regression,
    /// Three Gaussian blobs, accuracy reported
    Classification,
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum Commands {
    /// Train until the stopping criterion, resuming from the latest checkpoint
    Train {
        /// Number of epochs to train for
        #[arg(long, conflicts_with = "steps")]
        epochs: Option<usize>,
        /// Total number of training steps
        #[arg(long)]
        steps: Option<u64>,
        /// Examples per batch
        #[arg(long)]
        batch_size: Option<usize>,
        /// Decay the learning rate by this factor every epoch
        #[arg(long)]
        lr_decay: Option<f64>,
    },
    /// Evaluate the latest checkpoint on a split
    Evaluate {
        #[arg(long, default_value = "validation")]
        split: Split,
    },
    /// Time training steps without changing the model
    Benchmark,
    /// Time the phases of a training step and write profile.json
    Profile,
    /// Measure how fast the data source yields batches
    RunDataset {
        #[arg(long, default_value = "train")]
        split: Split,
        #[arg(long, default_value_t = 100)]
        batches: usize,
    },
    /// List retained and time-preserved checkpoints
    Checkpoints,
    /// Print the effective configuration as TOML
    Config,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides {
            model_dir: self.model_dir.clone(),
            train: TrainOverrides::default(),
        };
        if let Commands::Train {
            epochs,
            steps,
            batch_size,
            ..
        } = &self.command
        {
            overrides.train = TrainOverrides {
                batch_size: *batch_size,
                epochs: *epochs,
                total_train_steps: *steps,
            };
        }
        overrides
    }

    fn filter(&self) -> &'static str {
        match self.verbose {
            0 if self.quiet => "error",
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

/// Human-readable stderr output plus JSON lines in `<model_dir>/fitblocks.log`.
fn init_tracing(filter: &str, model_dir: &Path) -> tracing_appender::non_blocking::WorkerGuard {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let _ = std::fs::create_dir_all(model_dir);
    let file_appender = tracing_appender::rolling::never(model_dir, "fitblocks.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();
    guard
}

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let workspace = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let overrides = cli.overrides();
    let config = fitblocks_core::load_config(Some(&workspace), cli.config.as_deref(), Some(&overrides))
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let _guard = match cli.command {
        Commands::Config | Commands::Checkpoints => None,
        _ => Some(init_tracing(cli.filter(), &config.model_dir)),
    };

    commands::handle_command(cli.command, config, cli.problem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_train_overrides() {
        let cli = Cli::try_parse_from([
            "fitblocks",
            "--model-dir",
            "/tmp/run",
            "train",
            "--epochs",
            "3",
            "--batch-size",
            "8",
        ])
        .unwrap();
        let overrides = cli.overrides();
        assert_eq!(overrides.model_dir, Some(PathBuf::from("/tmp/run")));
        assert_eq!(overrides.train.epochs, Some(3));
        assert_eq!(overrides.train.batch_size, Some(8));
        assert_eq!(overrides.train.total_train_steps, None);
    }

    #[test]
    fn test_epochs_and_steps_conflict() {
        let err = Cli::try_parse_from(["fitblocks", "train", "--epochs", "2", "--steps", "10"]);
        assert!(err.is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["fitblocks", "evaluate", "--split", "val", "-vv", "-p", "classification"])
            .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.filter(), "trace");
        assert_eq!(cli.problem, Problem::Classification);
        assert!(matches!(cli.command, Commands::Evaluate { split: Split::Validation }));
    }

    #[test]
    fn test_run_dataset_defaults() {
        let cli = Cli::try_parse_from(["fitblocks", "-q", "run-dataset"]).unwrap();
        assert_eq!(cli.filter(), "error");
        assert!(matches!(
            cli.command,
            Commands::RunDataset {
                split: Split::Train,
                batches: 100
            }
        ));
        assert!(cli.overrides().train.epochs.is_none());
    }
}
