//! CLI subcommand handlers.

use crate::{Commands, Problem};
use fitblocks_core::FitConfig;
use fitblocks_core::initializers::Initializer;
use fitblocks_core::layers::Dense;
use fitblocks_core::losses::{MeanSquaredError, SparseCategoricalCrossentropy};
use fitblocks_core::metrics::SparseCategoricalAccuracy;
use fitblocks_core::schedules::{ExponentialDecay, scheduled};
use fitblocks_core::training::{
    CheckpointManager, CheckpointRecord, CheckpointStore, InMemoryDataSource, LogUpdater, Logs,
    RetentionPolicy, Trainable, ValueUpdater, Variable,
};

const EXAMPLES: usize = 512;
const FEATURES: usize = 4;
const CLASSES: usize = 3;

/// Handle a CLI subcommand.
pub fn handle_command(command: Commands, config: FitConfig, problem: Problem) -> anyhow::Result<()> {
    match command {
        Commands::Train { lr_decay, .. } => handle_train(config, problem, lr_decay),
        Commands::Evaluate { split } => {
            let mut trainable = build_trainable(config, problem, None)?;
            let logs = trainable.evaluate(split)?;
            println!("{split}: {}", format_logs(&logs));
            Ok(())
        }
        Commands::Benchmark => {
            let mut trainable = build_trainable(config, problem, None)?;
            println!("{}", trainable.benchmark()?);
            Ok(())
        }
        Commands::Profile => {
            let mut trainable = build_trainable(config, problem, None)?;
            let report = trainable.profile()?;
            println!("{report}");
            if let Some(phase) = report.dominant_phase() {
                println!("Dominant phase: {phase}");
            }
            Ok(())
        }
        Commands::RunDataset { split, batches } => {
            let trainable = build_trainable(config, problem, None)?;
            println!("{}", trainable.run_dataset(split, batches)?);
            Ok(())
        }
        Commands::Checkpoints => handle_checkpoints(&config),
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn handle_train(config: FitConfig, problem: Problem, lr_decay: Option<f64>) -> anyhow::Result<()> {
    let mut trainable = build_trainable(config, problem, lr_decay)?;
    println!("{}", trainable.model().summary());

    let history = trainable.fit()?;
    if history.is_empty() {
        println!("Nothing to train: the latest checkpoint already meets the stopping criterion.");
        return Ok(());
    }
    if let Some(last) = history.last() {
        println!("Final: {}", format_logs(last));
    }
    if let (Some(epoch), Some(loss)) = (history.best_epoch, history.best_loss) {
        println!("Best epoch: {epoch} (loss {loss:.6})");
    }
    if let Some(handle) = trainable.tracker().checkpoint_for(None) {
        println!("Latest checkpoint: {handle}");
    }
    Ok(())
}

fn handle_checkpoints(config: &FitConfig) -> anyhow::Result<()> {
    let dir = config.checkpoint_dir();
    if !dir.exists() {
        println!("No checkpoints under {}", dir.display());
        return Ok(());
    }
    let manager = CheckpointManager::open(
        &dir,
        config.checkpoint.checkpoint_name.clone(),
        RetentionPolicy {
            max_to_keep: config.checkpoint.max_to_keep,
            keep_checkpoint_every_n_hours: config.checkpoint.keep_checkpoint_every_n_hours,
        },
    )?;

    print_records("Retained", manager.checkpoints());
    if !manager.preserved().is_empty() {
        print_records("Preserved", manager.preserved());
    }
    if let Some(latest) = manager.latest() {
        println!("Latest: {}", latest.handle);
    }
    Ok(())
}

fn print_records(title: &str, records: &[CheckpointRecord]) {
    println!("{title} ({}):", records.len());
    for r in records {
        println!(
            "  epoch {:>4}  {:<12} {:>9} bytes  {}  sha256:{}",
            r.epoch,
            r.handle,
            r.size_bytes,
            r.created_at.format("%Y-%m-%d %H:%M:%S"),
            r.hash.get(..12).unwrap_or(&r.hash)
        );
    }
}

fn format_logs(logs: &Logs) -> String {
    logs.iter()
        .map(|(k, v)| format!("{k}={v:.6}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Model, loss and data for `problem`, wired into a trainable with the
/// on-disk checkpoint manager under the configured model directory.
pub(crate) fn build_trainable(
    config: FitConfig,
    problem: Problem,
    lr_decay: Option<f64>,
) -> anyhow::Result<Trainable> {
    let seed = config.train.seed;
    let optimizer = config.optimizer.build();

    let mut values = ValueUpdater::new();
    let mut logs = LogUpdater::new();
    if let Some(rate) = lr_decay {
        let lr = optimizer.learning_rate().clone();
        let epochs = Variable::new("lr_decay_epochs", 0.0);
        let counter = epochs.clone();
        values.schedule_epoch_update(&epochs, move || counter.get() + 1.0)?;
        let schedule = ExponentialDecay {
            initial: lr.get(),
            decay_steps: 1.0,
            decay_rate: rate,
            staircase: true,
        };
        values.schedule_epoch_update(&lr, scheduled(schedule, epochs))?;
        logs.log_each_epoch("lr", &lr)?;
    }

    let builder = match problem {
        Problem::Regression => Trainable::builder(
            Box::new(Dense::new("dense", FEATURES, 1, Initializer::GlorotUniform, seed)),
            Box::new(MeanSquaredError),
            Box::new(InMemoryDataSource::regression(EXAMPLES, FEATURES, seed)?),
        ),
        Problem::Classification => Trainable::builder(
            Box::new(Dense::new("logits", FEATURES, CLASSES, Initializer::GlorotUniform, seed)),
            Box::new(SparseCategoricalCrossentropy { from_logits: true }),
            Box::new(InMemoryDataSource::classification(
                EXAMPLES, FEATURES, CLASSES, seed,
            )?),
        )
        .metric(Box::new(SparseCategoricalAccuracy::default())),
    };

    Ok(builder
        .optimizer(optimizer)
        .value_updater(values)
        .log_updater(logs)
        .config(config)
        .build()?)
}
