//! Configuration for training runs.
//!
//! Uses `figment` for layered configuration: defaults -> user config ->
//! workspace file -> environment -> explicit overrides.

use crate::error::FitError;
use crate::training::optimizer::OptimizerConfig;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the workspace-level configuration file.
pub const WORKSPACE_CONFIG: &str = "fitblocks.toml";

/// Top-level run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitConfig {
    /// Root for checkpoints (`<model_dir>/chkpts`), logs and run summaries.
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,
    #[serde(default)]
    pub train: TrainConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub benchmark: BenchmarkConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("models/default")
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            train: TrainConfig::default(),
            checkpoint: CheckpointConfig::default(),
            benchmark: BenchmarkConfig::default(),
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl FitConfig {
    /// Parse a TOML document on top of the defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, FitError> {
        Figment::from(Serialized::defaults(FitConfig::default()))
            .merge(Toml::string(text))
            .extract()
            .map_err(|e| FitError::config(e.to_string()))
    }

    /// Validate the whole configuration and return every problem found.
    ///
    /// Returns an empty Vec if the config can drive a training run.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for p in self.train.validate() {
            problems.push(format!("[train] {p}"));
        }
        for p in self.checkpoint.validate() {
            problems.push(format!("[checkpoint] {p}"));
        }
        for p in self.benchmark.validate() {
            problems.push(format!("[benchmark] {p}"));
        }
        for p in self.optimizer.validate() {
            problems.push(format!("[optimizer] {p}"));
        }
        problems
    }

    /// Directory handed to the checkpoint manager.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.model_dir.join("chkpts")
    }
}

/// How long a training run lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoppingCriterion {
    Epochs(usize),
    Steps(u64),
}

/// Training loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Mutually exclusive with `total_train_steps`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epochs: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_train_steps: Option<u64>,
    /// Validate every N completed epochs.
    #[serde(default = "default_validation_freq")]
    pub validation_freq: usize,
    /// Shuffle buffer for the training split; `None` shuffles the whole split.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shuffle_buffer: Option<usize>,
    #[serde(default)]
    pub seed: u64,
}

fn default_batch_size() -> usize {
    32
}

fn default_validation_freq() -> usize {
    1
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            epochs: None,
            total_train_steps: None,
            validation_freq: default_validation_freq(),
            shuffle_buffer: None,
            seed: 0,
        }
    }
}

impl TrainConfig {
    /// Resolve the stopping criterion. Exactly one of `epochs` and
    /// `total_train_steps` must be set.
    pub fn stopping_criterion(&self) -> Result<StoppingCriterion, FitError> {
        match (self.epochs, self.total_train_steps) {
            (Some(epochs), None) => Ok(StoppingCriterion::Epochs(epochs)),
            (None, Some(steps)) => Ok(StoppingCriterion::Steps(steps)),
            (Some(_), Some(_)) => Err(FitError::config(
                "exactly one of epochs and total_train_steps may be given, got both",
            )),
            (None, None) => Err(FitError::config(
                "exactly one of epochs and total_train_steps must be given, got neither",
            )),
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.batch_size == 0 {
            problems.push("batch_size must be at least 1".to_string());
        }
        if self.validation_freq == 0 {
            problems.push("validation_freq must be at least 1".to_string());
        }
        if self.shuffle_buffer == Some(0) {
            problems.push("shuffle_buffer must be at least 1 when set".to_string());
        }
        if let Err(e) = self.stopping_criterion() {
            problems.push(e.to_string());
        }
        problems
    }
}

/// Checkpoint saving, restoring and retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Save every N completed epochs.
    #[serde(default = "default_save_freq")]
    pub save_freq: usize,
    #[serde(default = "default_true")]
    pub restore_on_begin: bool,
    #[serde(default = "default_max_to_keep")]
    pub max_to_keep: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_checkpoint_every_n_hours: Option<u32>,
    #[serde(default = "default_checkpoint_name")]
    pub checkpoint_name: String,
}

fn default_save_freq() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_max_to_keep() -> usize {
    5
}

fn default_checkpoint_name() -> String {
    "ckpt".to_string()
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            save_freq: default_save_freq(),
            restore_on_begin: true,
            max_to_keep: default_max_to_keep(),
            keep_checkpoint_every_n_hours: None,
            checkpoint_name: default_checkpoint_name(),
        }
    }
}

impl CheckpointConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.save_freq == 0 {
            problems.push("save_freq must be at least 1".to_string());
        }
        if self.max_to_keep == 0 {
            problems.push("max_to_keep must be at least 1".to_string());
        }
        if self.checkpoint_name.is_empty() || self.checkpoint_name.contains(['/', '\\']) {
            problems.push(format!(
                "checkpoint_name {:?} must be a non-empty file name",
                self.checkpoint_name
            ));
        }
        problems
    }
}

/// Iteration counts for `benchmark` and `profile`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    /// Iterations run and discarded before measuring.
    #[serde(default = "default_burn_iters")]
    pub burn_iters: usize,
    #[serde(default = "default_min_iters")]
    pub min_iters: usize,
}

fn default_burn_iters() -> usize {
    10
}

fn default_min_iters() -> usize {
    50
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            burn_iters: default_burn_iters(),
            min_iters: default_min_iters(),
        }
    }
}

impl BenchmarkConfig {
    pub fn validate(&self) -> Vec<String> {
        if self.min_iters == 0 {
            vec!["min_iters must be at least 1".to_string()]
        } else {
            Vec::new()
        }
    }
}

/// Command-line style overrides, merged last. Unset fields leave the
/// layered value alone.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_dir: Option<PathBuf>,
    pub train: TrainOverrides,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TrainOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epochs: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_train_steps: Option<u64>,
}

/// Load configuration with layered merging.
///
/// Order (later wins): defaults, `<config dir>/fitblocks/config.toml`,
/// `<workspace>/fitblocks.toml` or the explicit `config_file`,
/// `FITBLOCKS_*` environment variables (`__` separates sections, e.g.
/// `FITBLOCKS_TRAIN__EPOCHS=5`), then `overrides`.
///
/// A stopping criterion given as an override replaces the other criterion
/// from lower layers rather than combining with it.
pub fn load_config(
    workspace: Option<&Path>,
    config_file: Option<&Path>,
    overrides: Option<&ConfigOverrides>,
) -> Result<FitConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(FitConfig::default()));

    if let Some(dirs) = directories::ProjectDirs::from("dev", "fitblocks", "fitblocks") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    match config_file {
        Some(path) => figment = figment.merge(Toml::file(path)),
        None => {
            if let Some(ws) = workspace {
                let ws_config = ws.join(WORKSPACE_CONFIG);
                if ws_config.exists() {
                    figment = figment.merge(Toml::file(&ws_config));
                }
            }
        }
    }

    figment = figment.merge(Env::prefixed("FITBLOCKS_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let mut config: FitConfig = figment.extract().map_err(Box::new)?;
    if let Some(overrides) = overrides {
        match (overrides.train.epochs, overrides.train.total_train_steps) {
            (Some(_), None) => config.train.total_train_steps = None,
            (None, Some(_)) => config.train.epochs = None,
            _ => {}
        }
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FitConfig::default();
        assert_eq!(config.train.batch_size, 32);
        assert_eq!(config.train.validation_freq, 1);
        assert_eq!(config.checkpoint.save_freq, 1);
        assert!(config.checkpoint.restore_on_begin);
        assert_eq!(config.checkpoint.max_to_keep, 5);
        assert_eq!(config.checkpoint.checkpoint_name, "ckpt");
        assert_eq!(config.benchmark.burn_iters, 10);
        assert_eq!(config.benchmark.min_iters, 50);
        assert_eq!(config.checkpoint_dir(), PathBuf::from("models/default/chkpts"));
    }

    #[test]
    fn test_stopping_criterion_exclusive() {
        let mut train = TrainConfig::default();
        assert!(matches!(train.stopping_criterion(), Err(FitError::Config(_))));

        train.epochs = Some(3);
        assert_eq!(train.stopping_criterion().unwrap(), StoppingCriterion::Epochs(3));

        train.total_train_steps = Some(100);
        assert!(matches!(train.stopping_criterion(), Err(FitError::Config(_))));

        train.epochs = None;
        assert_eq!(train.stopping_criterion().unwrap(), StoppingCriterion::Steps(100));
    }

    #[test]
    fn test_validate_collects_problems() {
        let mut config = FitConfig::default();
        config.train.batch_size = 0;
        config.checkpoint.save_freq = 0;
        config.checkpoint.max_to_keep = 0;
        let problems = config.validate();
        assert!(problems.iter().any(|p| p.contains("batch_size")));
        assert!(problems.iter().any(|p| p.contains("save_freq")));
        assert!(problems.iter().any(|p| p.contains("max_to_keep")));
        assert!(problems.iter().any(|p| p.contains("neither")));

        let mut ok = FitConfig::default();
        ok.train.epochs = Some(1);
        assert!(ok.validate().is_empty());
    }

    #[test]
    fn test_from_toml_str() {
        let config = FitConfig::from_toml_str(
            r#"
            model_dir = "/tmp/run"

            [train]
            epochs = 4
            batch_size = 8

            [checkpoint]
            max_to_keep = 2
            keep_checkpoint_every_n_hours = 6
            "#,
        )
        .unwrap();
        assert_eq!(config.model_dir, PathBuf::from("/tmp/run"));
        assert_eq!(config.train.epochs, Some(4));
        assert_eq!(config.train.batch_size, 8);
        assert_eq!(config.train.validation_freq, 1);
        assert_eq!(config.checkpoint.max_to_keep, 2);
        assert_eq!(config.checkpoint.keep_checkpoint_every_n_hours, Some(6));
        assert_eq!(config.checkpoint.checkpoint_name, "ckpt");
    }

    #[test]
    fn test_from_toml_str_rejects_bad_types() {
        assert!(FitConfig::from_toml_str("[train]\nepochs = \"many\"").is_err());
    }

    #[test]
    fn test_load_config_layers() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                WORKSPACE_CONFIG,
                "[train]\nepochs = 2\nbatch_size = 16\n",
            )?;
            jail.set_env("FITBLOCKS_TRAIN__BATCH_SIZE", "64");
            jail.set_env("FITBLOCKS_CHECKPOINT__SAVE_FREQ", "3");

            let config = load_config(Some(jail.directory()), None, None)
                .map_err(|e| e.to_string())?;
            assert_eq!(config.train.epochs, Some(2));
            assert_eq!(config.train.batch_size, 64);
            assert_eq!(config.checkpoint.save_freq, 3);
            Ok(())
        });
    }

    #[test]
    fn test_load_config_explicit_file_wins_over_workspace() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(WORKSPACE_CONFIG, "[train]\nepochs = 2\n")?;
            jail.create_file("other.toml", "[train]\ntotal_train_steps = 50\n")?;
            let other = jail.directory().join("other.toml");

            let config = load_config(Some(jail.directory()), Some(&other), None)
                .map_err(|e| e.to_string())?;
            assert_eq!(config.train.epochs, None);
            assert_eq!(config.train.total_train_steps, Some(50));
            Ok(())
        });
    }

    #[test]
    fn test_overrides_replace_stopping_criterion() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(WORKSPACE_CONFIG, "[train]\nepochs = 2\nbatch_size = 4\n")?;
            let overrides = ConfigOverrides {
                model_dir: Some(PathBuf::from("/tmp/elsewhere")),
                train: TrainOverrides {
                    total_train_steps: Some(30),
                    ..TrainOverrides::default()
                },
            };
            let config = load_config(Some(jail.directory()), None, Some(&overrides))
                .map_err(|e| e.to_string())?;
            assert_eq!(config.model_dir, PathBuf::from("/tmp/elsewhere"));
            assert_eq!(config.train.batch_size, 4);
            assert_eq!(config.train.epochs, None);
            assert_eq!(config.train.total_train_steps, Some(30));
            Ok(())
        });
    }
}
