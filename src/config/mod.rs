// ============================================================
// Layer 0 — Configuration
// ============================================================
// One hierarchical config object drives training, serving and
// tracking. It is assembled from layers, lowest priority first:
//
//   1. built-in defaults (dataset / model presets)
//   2. TOML file        (configs/config.toml or --config <path>)
//   3. environment      (IMGCLS_HYPERPARAMETERS__LEARNING_RATE=0.01)
//   4. command line     (hyperparameters.learning_rate=0.01)
//
// Command-line overrides use dotted paths. Two bare keys act as
// group selectors and pick the preset the defaults layer is
// built from:
//
//   data=mnist          → 1x28x28 inputs, digit classes, MNIST stats
//   model=resnet        → ResNet instead of the simple CNN
//
// The whole struct is Serialize so it can be snapshotted into
// checkpoints and flattened into tracker params.

pub mod overrides;

use anyhow::{bail, Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use overrides::Override;

/// Config file picked up automatically when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "configs/config.toml";

/// Prefix for environment overrides; `__` separates nesting levels.
pub const ENV_PREFIX: &str = "IMGCLS_";

pub const CIFAR10_CLASSES: [&str; 10] = [
    "airplane", "automobile", "bird", "cat", "deer",
    "dog", "frog", "horse", "ship", "truck",
];

// ─── Enumerated choices ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetName {
    Cifar10,
    Mnist,
    ImageFolder,
}

impl DatasetName {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetName::Cifar10     => "cifar10",
            DatasetName::Mnist       => "mnist",
            DatasetName::ImageFolder => "image_folder",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelName {
    SimpleCnn,
    Resnet,
}

impl ModelName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelName::SimpleCnn => "simple_cnn",
            ModelName::Resnet    => "resnet",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Adam,
    Sgd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    Step,
    Cosine,
    Plateau,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Auto,
    Cpu,
    Gpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingChoice {
    Mlflow,
    Wandb,
    Both,
    None,
}

impl TrackingChoice {
    pub fn wants_mlflow(&self) -> bool {
        matches!(self, TrackingChoice::Mlflow | TrackingChoice::Both)
    }

    pub fn wants_wandb(&self) -> bool {
        matches!(self, TrackingChoice::Wandb | TrackingChoice::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WandbMode {
    Online,
    Offline,
    Disabled,
}

// ─── Sections ─────────────────────────────────────────────────────────────────

/// Training-only augmentation applied by the batcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentConfig {
    pub horizontal_flip:  bool,
    /// Maximum absolute rotation in degrees; 0 disables rotation
    pub rotation_degrees: f32,
    /// Brightness / contrast jitter strength; 0 disables jitter
    pub color_jitter:     f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    pub name:           DatasetName,
    pub data_dir:       String,
    pub num_classes:    usize,
    pub input_channels: usize,
    pub image_size:     usize,
    pub val_split:      f64,
    pub classes:        Vec<String>,
    pub mean:           Vec<f32>,
    pub std:            Vec<f32>,
    pub augment:        AugmentConfig,
}

impl DataConfig {
    pub fn preset(name: DatasetName) -> Self {
        match name {
            DatasetName::Cifar10 => Self {
                name,
                data_dir:       "./data/raw".to_string(),
                num_classes:    10,
                input_channels: 3,
                image_size:     32,
                val_split:      0.1,
                classes:        CIFAR10_CLASSES.iter().map(|c| c.to_string()).collect(),
                mean:           vec![0.5, 0.5, 0.5],
                std:            vec![0.5, 0.5, 0.5],
                augment: AugmentConfig {
                    horizontal_flip:  true,
                    rotation_degrees: 10.0,
                    color_jitter:     0.2,
                },
            },
            DatasetName::Mnist => Self {
                name,
                data_dir:       "./data/raw".to_string(),
                num_classes:    10,
                input_channels: 1,
                image_size:     28,
                val_split:      0.1,
                classes:        (0..10).map(|d| d.to_string()).collect(),
                mean:           vec![0.1307],
                std:            vec![0.3081],
                augment: AugmentConfig {
                    horizontal_flip:  false,
                    rotation_degrees: 10.0,
                    color_jitter:     0.0,
                },
            },
            // Classes are discovered from the directory layout at load time.
            DatasetName::ImageFolder => Self {
                name,
                data_dir:       "./data/images".to_string(),
                num_classes:    0,
                input_channels: 3,
                image_size:     32,
                val_split:      0.1,
                classes:        Vec::new(),
                mean:           vec![0.5, 0.5, 0.5],
                std:            vec![0.5, 0.5, 0.5],
                augment: AugmentConfig {
                    horizontal_flip:  true,
                    rotation_degrees: 10.0,
                    color_jitter:     0.2,
                },
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSection {
    pub name: ModelName,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub batch_size:      usize,
    pub num_epochs:      usize,
    pub learning_rate:   f64,
    pub weight_decay:    f64,
    pub optimizer:       OptimizerKind,
    pub momentum:        f64,
    pub use_scheduler:   bool,
    pub scheduler_type:  SchedulerKind,
    pub step_size:       usize,
    pub gamma:           f64,
    pub min_lr:          f64,
    pub clip_grad_norm:  Option<f32>,
    pub label_smoothing: f32,
    pub dropout:         f64,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            batch_size:      64,
            num_epochs:      20,
            learning_rate:   1e-3,
            weight_decay:    1e-4,
            optimizer:       OptimizerKind::Adam,
            momentum:        0.9,
            use_scheduler:   true,
            scheduler_type:  SchedulerKind::Cosine,
            step_size:       10,
            gamma:           0.1,
            min_lr:          1e-6,
            clip_grad_norm:  None,
            label_smoothing: 0.0,
            dropout:         0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingConfig {
    pub enabled:         bool,
    pub backend:         TrackingChoice,

    // MLflow
    /// http(s):// → REST server, anything else → local file store
    pub tracking_uri:    String,
    pub experiment_name: Option<String>,
    pub run_name:        Option<String>,

    // Weights & Biases
    pub project:         String,
    pub entity:          Option<String>,
    pub group:           Option<String>,
    pub job_type:        String,
    pub tags:            Vec<String>,
    pub notes:           Option<String>,
    pub mode:            WandbMode,
    /// Falls back to WANDB_API_KEY. Never serialized, so it stays out of
    /// tracked params and checkpoint metadata.
    #[serde(default, skip_serializing)]
    pub api_key:         Option<String>,
    pub base_url:        String,
    pub wandb_dir:       String,

    pub log_params:      bool,
    pub log_metrics:     bool,
    pub log_artifacts:   bool,
    pub log_models:      bool,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            enabled:         true,
            backend:         TrackingChoice::Mlflow,
            tracking_uri:    "./mlruns".to_string(),
            experiment_name: None,
            run_name:        None,
            project:         "image-classifier".to_string(),
            entity:          None,
            group:           None,
            job_type:        "train".to_string(),
            tags:            Vec::new(),
            notes:           None,
            mode:            WandbMode::Online,
            api_key:         None,
            base_url:        "https://api.wandb.ai".to_string(),
            wandb_dir:       "./wandb".to_string(),
            log_params:      true,
            log_metrics:     true,
            log_artifacts:   true,
            log_models:      true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServeConfig {
    pub host:             String,
    pub port:             u16,
    /// Checkpoint stem (without extension) loaded into the model cache
    pub model_path:       String,
    pub max_upload_bytes: usize,
    pub cors:             bool,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            host:             "0.0.0.0".to_string(),
            port:             8000,
            model_path:       "models/simple_cnn_best".to_string(),
            max_upload_bytes: 10 * 1024 * 1024,
            cors:             true,
        }
    }
}

// ─── AppConfig ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub seed:                    u64,
    pub device:                  DeviceKind,
    pub num_workers:             usize,
    pub experiment_name:         String,
    pub run_name:                Option<String>,
    pub model_save_dir:          String,
    pub report_dir:              String,
    pub save_best_only:          bool,
    pub early_stopping_patience: usize,
    pub data:                    DataConfig,
    pub model:                   ModelSection,
    pub hyperparameters:         Hyperparameters,
    pub tracking:                TrackingConfig,
    pub serve:                   ServeConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::with_presets(DatasetName::Cifar10, ModelName::SimpleCnn)
    }
}

impl AppConfig {
    /// Defaults built around a dataset and model preset.
    pub fn with_presets(dataset: DatasetName, model: ModelName) -> Self {
        Self {
            seed:                    42,
            device:                  DeviceKind::Auto,
            num_workers:             2,
            experiment_name:         "image-classifier".to_string(),
            run_name:                None,
            model_save_dir:          "models".to_string(),
            report_dir:              "reports".to_string(),
            save_best_only:          true,
            early_stopping_patience: 10,
            data:                    DataConfig::preset(dataset),
            model:                   ModelSection { name: model },
            hyperparameters:         Hyperparameters::default(),
            tracking:                TrackingConfig::default(),
            serve:                   ServeConfig::default(),
        }
    }

    /// Assemble the config from defaults, file, environment and overrides.
    pub fn load(config_file: Option<&Path>, raw_overrides: &[String]) -> Result<Self> {
        let overrides = raw_overrides
            .iter()
            .map(|raw| raw.parse::<Override>())
            .collect::<Result<Vec<_>>>()?;

        // ── Group selectors decide the defaults layer ─────────────────────────
        let mut dataset = DatasetName::Cifar10;
        let mut model   = ModelName::SimpleCnn;
        for o in &overrides {
            match o.key.as_str() {
                "data"  => dataset = o.parse_value()
                    .with_context(|| format!("Unknown dataset in '{}'", o))?,
                "model" => model = o.parse_value()
                    .with_context(|| format!("Unknown model in '{}'", o))?,
                _ => {}
            }
        }

        let mut figment = Figment::from(Serialized::defaults(Self::with_presets(dataset, model)));

        // ── File layer ────────────────────────────────────────────────────────
        match config_file {
            Some(path) => {
                if !path.exists() {
                    bail!("Config file '{}' does not exist", path.display());
                }
                figment = figment.merge(Toml::file(path));
            }
            None => {
                let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    tracing::debug!("Using config file '{}'", default_path.display());
                    figment = figment.merge(Toml::file(default_path));
                }
            }
        }

        // ── Environment layer ─────────────────────────────────────────────────
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        // ── Command-line layer ────────────────────────────────────────────────
        for o in overrides.iter().filter(|o| !o.is_group_selector()) {
            figment = figment.merge(Serialized::default(&o.key, o.value.clone()));
        }

        let cfg: AppConfig = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject combinations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let hp = &self.hyperparameters;
        if hp.batch_size == 0 {
            bail!("hyperparameters.batch_size must be positive");
        }
        if hp.num_epochs == 0 {
            bail!("hyperparameters.num_epochs must be positive");
        }
        if !(hp.learning_rate > 0.0) {
            bail!("hyperparameters.learning_rate must be positive");
        }
        if !(0.0..1.0).contains(&hp.dropout) {
            bail!("hyperparameters.dropout must be in [0, 1)");
        }
        if !(0.0..1.0).contains(&self.data.val_split) {
            bail!("data.val_split must be in [0, 1)");
        }
        if !matches!(self.data.input_channels, 1 | 3) {
            bail!("data.input_channels must be 1 or 3");
        }
        if self.data.image_size == 0 {
            bail!("data.image_size must be positive");
        }
        if self.data.mean.len() != self.data.input_channels
            || self.data.std.len() != self.data.input_channels
        {
            bail!(
                "data.mean / data.std need one entry per channel ({} channels)",
                self.data.input_channels
            );
        }
        if self.data.std.iter().any(|s| *s <= 0.0) {
            bail!("data.std entries must be positive");
        }
        if self.model.name == ModelName::SimpleCnn && self.data.image_size < 8 {
            bail!("simple_cnn needs data.image_size >= 8 (three 2x2 poolings)");
        }
        if self.data.name != DatasetName::ImageFolder
            && self.data.classes.len() != self.data.num_classes
        {
            bail!(
                "data.classes has {} names but data.num_classes is {}",
                self.data.classes.len(),
                self.data.num_classes
            );
        }
        Ok(())
    }

    /// Experiment name used by the trackers.
    pub fn tracking_experiment(&self) -> &str {
        self.tracking
            .experiment_name
            .as_deref()
            .unwrap_or(&self.experiment_name)
    }

    /// Run name used by the trackers, if any was configured.
    pub fn tracking_run_name(&self) -> Option<&str> {
        self.tracking.run_name.as_deref().or(self.run_name.as_deref())
    }

    /// The whole config as JSON, secrets left out.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}
