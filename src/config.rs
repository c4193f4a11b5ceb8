//! Training run configuration.
//!
//! A [`TrainConfig`] is assembled once at startup from layered sources and then
//! passed by reference to everything that needs it. Precedence, lowest first:
//! built-in defaults, a config file, `AMIRA_TRAIN_*` environment variables,
//! command-line flags.

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AppError, Result};
use crate::telemetry::LogFormat;
use crate::train::LrSchedule;

/// Config files picked up from the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILES: [&str; 2] = ["amira-trainer.toml", "amira-trainer.yaml"];

/// Environment variable prefix; nested keys use `__`, e.g.
/// `AMIRA_TRAIN_LR_SCHEDULE__KIND=step`.
pub const ENV_PREFIX: &str = "AMIRA_TRAIN_";

// Default value functions for serde defaults
fn default_epochs() -> usize { 200 }
fn default_batch_size() -> usize { 64 }
fn default_learning_rate() -> f64 { 0.6 }
fn default_momentum() -> f64 { 0.8 }
fn default_max_grad_norm() -> f64 { 0.2 }
fn default_log_interval() -> usize { crate::constants::training::LOG_INTERVAL }
fn default_num_workers() -> usize { num_cpus::get() }
fn default_prefetch() -> usize { 2 }
fn default_kernel_size() -> usize { 11 }
fn default_dropout() -> f32 { 0.2 }
fn default_backend() -> String { "cpu".to_string() }
fn default_log_level() -> String { "info".to_string() }

/// Everything a training run needs to know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Training manifest, one `<wav path>,<transcript>` per line
    pub train_manifest_path: PathBuf,

    /// Dev manifest used for the per-epoch CER
    pub dev_manifest_path: PathBuf,

    /// JSON array of single-character tokens, blank first
    pub vocab_path: PathBuf,

    /// Directory for checkpoints, scalar log and metrics textfile
    pub save_model_path: PathBuf,

    /// Checkpoint to resume from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_model: Option<PathBuf>,

    // Optimization
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Base learning rate before the schedule is applied
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// Nesterov momentum factor
    #[serde(default = "default_momentum")]
    pub momentum: f64,

    /// Global L2 bound on the gradient
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: f64,

    #[serde(default)]
    pub weight_decay: f64,

    /// Steps between progress lines
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,

    // Data loading
    /// Feature-extraction threads
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Batches loaded ahead of the training step; 0 loads inline
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,

    /// Seeds parameter init, dropout and shuffling
    #[serde(default)]
    pub seed: u64,

    // Model
    /// Odd convolution width in frames
    #[serde(default = "default_kernel_size")]
    pub kernel_size: usize,

    #[serde(default = "default_dropout")]
    pub dropout: f32,

    /// Compute backend name
    #[serde(default = "default_backend")]
    pub backend: String,

    // Logging
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Per-epoch learning-rate policy
    #[serde(default)]
    pub lr_schedule: LrSchedule,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            train_manifest_path: PathBuf::from("dataset/manifest.train"),
            dev_manifest_path: PathBuf::from("dataset/manifest.dev"),
            vocab_path: PathBuf::from("dataset/zh_vocab.json"),
            save_model_path: PathBuf::from("save_model"),
            restore_model: None,
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            learning_rate: default_learning_rate(),
            momentum: default_momentum(),
            max_grad_norm: default_max_grad_norm(),
            weight_decay: 0.0,
            log_interval: default_log_interval(),
            num_workers: default_num_workers(),
            prefetch: default_prefetch(),
            seed: 0,
            kernel_size: default_kernel_size(),
            dropout: default_dropout(),
            backend: default_backend(),
            log_level: default_log_level(),
            log_format: LogFormat::Compact,
            lr_schedule: LrSchedule::Constant,
        }
    }
}

/// Command-line overrides. Unset flags leave lower layers untouched.
#[derive(Debug, Clone, Default, Serialize, clap::Args)]
pub struct ConfigOverrides {
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub train_manifest_path: Option<PathBuf>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dev_manifest_path: Option<PathBuf>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vocab_path: Option<PathBuf>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save_model_path: Option<PathBuf>,

    /// Checkpoint file to resume from
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restore_model: Option<PathBuf>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epochs: Option<usize>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_workers: Option<usize>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,

    #[arg(long, value_enum)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_format: Option<LogFormat>,
}

impl TrainConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Command-line flags (highest priority)
    /// 2. `AMIRA_TRAIN_*` environment variables
    /// 3. `config_file`, or `amira-trainer.toml` / `amira-trainer.yaml` if present
    /// 4. Built-in defaults (lowest priority)
    pub fn load(config_file: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(TrainConfig::default()));
        figment = match config_file {
            Some(path) => {
                if !path.is_file() {
                    return Err(AppError::Config(format!(
                        "config file {} does not exist",
                        path.display()
                    )));
                }
                debug!("Reading configuration from {}", path.display());
                Self::merge_file(figment, path)
            }
            None => DEFAULT_CONFIG_FILES
                .iter()
                .fold(figment, |f, name| Self::merge_file(f, Path::new(name))),
        };
        let figment = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .merge(Serialized::defaults(overrides));
        Self::from_figment(figment)
    }

    fn merge_file(figment: Figment, path: &Path) -> Figment {
        if is_yaml(path) {
            figment.merge(Yaml::file(path))
        } else {
            figment.merge(Toml::file(path))
        }
    }

    /// Extract and validate.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: TrainConfig = figment
            .extract()
            .map_err(|e| AppError::Config(format!("Failed to load configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(AppError::Config("epochs must be at least 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(AppError::Config("batch_size must be at least 1".to_string()));
        }
        if !(self.learning_rate > 0.0) {
            return Err(AppError::Config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(self.momentum > 0.0 && self.momentum < 1.0) {
            return Err(AppError::Config(format!(
                "momentum must be in (0, 1) for Nesterov SGD, got {}",
                self.momentum
            )));
        }
        if !(self.max_grad_norm > 0.0) {
            return Err(AppError::Config(format!(
                "max_grad_norm must be positive, got {}",
                self.max_grad_norm
            )));
        }
        if !(self.weight_decay >= 0.0) {
            return Err(AppError::Config(format!(
                "weight_decay must be non-negative, got {}",
                self.weight_decay
            )));
        }
        if let LrSchedule::Step { step_size, gamma } = self.lr_schedule {
            if step_size == 0 || !(gamma > 0.0) {
                return Err(AppError::Config(format!(
                    "step schedule needs step_size >= 1 and gamma > 0, got {} and {}",
                    step_size, gamma
                )));
            }
        }
        if self.log_interval == 0 {
            return Err(AppError::Config("log_interval must be at least 1".to_string()));
        }
        if self.num_workers == 0 {
            return Err(AppError::Config("num_workers must be at least 1".to_string()));
        }
        if self.kernel_size % 2 == 0 {
            return Err(AppError::Config(format!(
                "kernel_size must be odd, got {}",
                self.kernel_size
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(AppError::Config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        self.validate_path(&self.train_manifest_path, "train_manifest_path")?;
        self.validate_path(&self.dev_manifest_path, "dev_manifest_path")?;
        self.validate_path(&self.vocab_path, "vocab_path")?;
        self.validate_path(&self.save_model_path, "save_model_path")?;
        Ok(())
    }

    fn validate_path(&self, path: &Path, field_name: &str) -> Result<()> {
        let path_str = path.to_string_lossy();
        if path_str.is_empty() {
            return Err(AppError::Config(format!("{} cannot be empty", field_name)));
        }
        // Check for null bytes and control characters
        if path_str.chars().any(|c| c.is_control() && c != '\t') {
            return Err(AppError::Config(format!(
                "{} contains invalid control characters",
                field_name
            )));
        }
        Ok(())
    }

    /// Export configuration to TOML format
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| AppError::Config(format!("Failed to serialize to TOML: {}", e)))
    }

    /// Export configuration to YAML format
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| AppError::Config(format!("Failed to serialize to YAML: {}", e)))
    }

    /// Render in the format of the config file the run was started with,
    /// TOML when there was none.
    pub fn dump(&self, config_file: Option<&Path>) -> Result<String> {
        match config_file {
            Some(path) if is_yaml(path) => self.to_yaml(),
            _ => self.to_toml(),
        }
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Figment {
        Figment::from(Serialized::defaults(TrainConfig::default()))
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = TrainConfig::from_figment(base()).unwrap();
        assert_eq!(config.epochs, 200);
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.learning_rate, 0.6);
        assert_eq!(config.momentum, 0.8);
        assert_eq!(config.max_grad_norm, 0.2);
        assert_eq!(config.weight_decay, 0.0);
        assert_eq!(config.log_interval, 100);
        assert_eq!(config.restore_model, None);
    }

    #[test]
    fn test_file_layer_and_overrides() {
        let figment = base()
            .merge(Toml::string(
                r#"
                epochs = 5
                batch_size = 8

                [lr_schedule]
                kind = "step"
                step_size = 2
                gamma = 0.5
                "#,
            ))
            .merge(Serialized::defaults(ConfigOverrides {
                epochs: Some(7),
                ..Default::default()
            }));
        let config = TrainConfig::from_figment(figment).unwrap();
        assert_eq!(config.epochs, 7);
        assert_eq!(config.batch_size, 8);
        assert_eq!(
            config.lr_schedule,
            LrSchedule::Step {
                step_size: 2,
                gamma: 0.5
            }
        );
    }

    #[test]
    fn test_yaml_layer() {
        let figment = base().merge(Yaml::string("restore_model: save_model/model_3.json\nlog_format: json\n"));
        let config = TrainConfig::from_figment(figment).unwrap();
        assert_eq!(
            config.restore_model,
            Some(PathBuf::from("save_model/model_3.json"))
        );
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = TrainConfig::default();
        config.kernel_size = 4;
        assert!(config.validate().is_err());

        let mut config = TrainConfig::default();
        config.momentum = 0.0;
        assert!(config.validate().is_err());

        let mut config = TrainConfig::default();
        config.lr_schedule = LrSchedule::Step {
            step_size: 0,
            gamma: 0.8,
        };
        assert!(config.validate().is_err());

        let mut config = TrainConfig::default();
        config.dropout = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let err = TrainConfig::load(
            Some(Path::new("/nonexistent/amira-trainer.toml")),
            &ConfigOverrides::default(),
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn test_toml_dump_round_trips() {
        let config = TrainConfig::default();
        let dumped = config.to_toml().unwrap();
        let parsed: TrainConfig = toml::from_str(&dumped).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_dump_follows_config_file_format() {
        let config = TrainConfig::default();
        let yaml = config.dump(Some(Path::new("run.yml"))).unwrap();
        assert!(yaml.contains("epochs: 200"));
        let parsed: TrainConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, config);

        assert!(config.dump(Some(Path::new("run.toml"))).unwrap().contains("epochs = 200"));
        assert!(config.dump(None).unwrap().contains("epochs = 200"));
    }
}
