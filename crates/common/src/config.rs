//! Run configuration for staged (adversarial) classifier training.
//!
//! Serialised as JSON. Every field has a default, so a minimal `{}` file
//! describes a complete CIFAR-10 run with the classic 80/60/40/20 schedule.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Dataset / model selection ───────────────────────────────────────────────

/// Which image dataset to train on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    Cifar10,
    Stl10,
}

impl DatasetKind {
    /// `(channels, height, width)` of one image.
    pub fn image_shape(&self) -> (usize, usize, usize) {
        match self {
            Self::Cifar10 => (3, 32, 32),
            Self::Stl10 => (3, 96, 96),
        }
    }

    pub fn num_classes(&self) -> usize {
        10
    }
}

impl FromStr for DatasetKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "cifar10" => Ok(Self::Cifar10),
            "stl10" => Ok(Self::Stl10),
            other => anyhow::bail!("invalid dataset: {other} (expected cifar10 or stl10)"),
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cifar10 => write!(f, "cifar10"),
            Self::Stl10 => write!(f, "stl10"),
        }
    }
}

/// Classifier architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// Single affine map from flattened pixels to class scores.
    Linear,
    /// One hidden ReLU layer with dropout.
    Mlp,
    /// VGG-style conv/BN/ReLU/max-pool stack with a linear head.
    Cnn,
}

impl FromStr for ModelKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "linear" => Ok(Self::Linear),
            "mlp" => Ok(Self::Mlp),
            "cnn" => Ok(Self::Cnn),
            other => anyhow::bail!("invalid net: {other} (expected linear, mlp or cnn)"),
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linear => write!(f, "linear"),
            Self::Mlp => write!(f, "mlp"),
            Self::Cnn => write!(f, "cnn"),
        }
    }
}

// ── Model config ────────────────────────────────────────────────────────────

/// Architecture hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_kind")]
    pub kind: ModelKind,
    /// Hidden width of the MLP and of the CNN classifier head.
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    /// Dropout probability (active in training mode only).
    #[serde(default = "default_dropout")]
    pub dropout: f32,
    /// Output channels of each conv block; every block ends with a 2×2 max-pool.
    #[serde(default = "default_conv_channels")]
    pub conv_channels: Vec<usize>,
    /// Std of Gaussian noise added to the network input (0 = off).
    #[serde(default)]
    pub noise_init: f64,
    /// Std of Gaussian noise added before every inner conv block (0 = off).
    #[serde(default)]
    pub noise_inner: f64,
}

fn default_model_kind() -> ModelKind {
    ModelKind::Cnn
}
fn default_hidden_size() -> usize {
    256
}
fn default_dropout() -> f32 {
    0.5
}
fn default_conv_channels() -> Vec<usize> {
    vec![64, 128, 256]
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            kind: default_model_kind(),
            hidden_size: default_hidden_size(),
            dropout: default_dropout(),
            conv_channels: default_conv_channels(),
            noise_init: 0.0,
            noise_inner: 0.0,
        }
    }
}

// ── Schedule config ─────────────────────────────────────────────────────────

/// Fixed-length stage schedule: epochs per stage, a starting learning rate
/// divided by `lr_decay` at every stage boundary, plus SGD knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_stage_epochs")]
    pub stage_epochs: Vec<usize>,
    #[serde(default = "default_lr")]
    pub lr: f64,
    #[serde(default = "default_lr_decay")]
    pub lr_decay: f64,
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
}

fn default_stage_epochs() -> Vec<usize> {
    vec![80, 60, 40, 20]
}
fn default_lr() -> f64 {
    1.0
}
fn default_lr_decay() -> f64 {
    10.0
}
fn default_momentum() -> f64 {
    0.9
}
fn default_weight_decay() -> f64 {
    5e-4
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            stage_epochs: default_stage_epochs(),
            lr: default_lr(),
            lr_decay: default_lr_decay(),
            momentum: default_momentum(),
            weight_decay: default_weight_decay(),
        }
    }
}

impl ScheduleConfig {
    /// Total number of epochs over all stages.
    pub fn total_epochs(&self) -> usize {
        self.stage_epochs.iter().sum()
    }
}

// ── Run config ──────────────────────────────────────────────────────────────

/// Everything one training run consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_dataset")]
    pub dataset: DatasetKind,
    /// Directory holding the dataset's binary files.
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Batches buffered ahead of the training loop by the loader thread.
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    /// Train a defended copy of the model on mixed clean/FGSM batches.
    #[serde(default)]
    pub adversarial: bool,
    /// FGSM perturbation budget.
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    /// Optional initial weights (safetensors).
    #[serde(default)]
    pub model_in: Option<PathBuf>,
    /// Best-checkpoint destination (safetensors).
    #[serde(default = "default_model_out")]
    pub model_out: PathBuf,
    /// Seed for shuffling, augmentation and clean/adversarial coin flips.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Also write `metrics.csv` next to `model_out`.
    #[serde(default)]
    pub metrics_csv: bool,
}

fn default_dataset() -> DatasetKind {
    DatasetKind::Cifar10
}
fn default_root() -> PathBuf {
    PathBuf::from("./data/cifar10-bin")
}
fn default_batch_size() -> usize {
    128
}
fn default_prefetch() -> usize {
    8
}
fn default_epsilon() -> f64 {
    0.03
}
fn default_model_out() -> PathBuf {
    PathBuf::from("checkpoints/best.safetensors")
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            dataset: default_dataset(),
            root: default_root(),
            batch_size: default_batch_size(),
            prefetch: default_prefetch(),
            model: ModelConfig::default(),
            schedule: ScheduleConfig::default(),
            adversarial: false,
            epsilon: default_epsilon(),
            model_in: None,
            model_out: default_model_out(),
            seed: None,
            metrics_csv: false,
        }
    }
}

impl RunConfig {
    /// Save config to a JSON file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }

    /// Reject configurations that cannot produce a run. Called before any
    /// model or dataset is constructed.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be positive");
        }
        if self.prefetch == 0 {
            anyhow::bail!("prefetch must be positive");
        }
        let s = &self.schedule;
        if s.stage_epochs.is_empty() {
            anyhow::bail!("schedule.stage_epochs must name at least one stage");
        }
        if let Some(i) = s.stage_epochs.iter().position(|&e| e == 0) {
            anyhow::bail!("stage {} has zero epochs", i + 1);
        }
        if !(s.lr > 0.0 && s.lr.is_finite()) {
            anyhow::bail!("lr must be positive, got {}", s.lr);
        }
        if !(s.lr_decay > 0.0 && s.lr_decay.is_finite()) {
            anyhow::bail!("lr_decay must be positive, got {}", s.lr_decay);
        }
        if !(0.0..1.0).contains(&s.momentum) {
            anyhow::bail!("momentum must be in [0, 1), got {}", s.momentum);
        }
        if s.weight_decay < 0.0 {
            anyhow::bail!("weight_decay must be non-negative");
        }
        if !(self.epsilon >= 0.0 && self.epsilon.is_finite()) {
            anyhow::bail!("epsilon must be a non-negative number, got {}", self.epsilon);
        }
        let m = &self.model;
        if !(0.0..1.0).contains(&m.dropout) {
            anyhow::bail!("dropout must be in [0, 1), got {}", m.dropout);
        }
        if m.noise_init < 0.0 || m.noise_inner < 0.0 {
            anyhow::bail!("noise std must be non-negative");
        }
        if m.kind == ModelKind::Cnn {
            if m.conv_channels.is_empty() {
                anyhow::bail!("cnn needs at least one conv block");
            }
            let (_, h, w) = self.dataset.image_shape();
            let shrink = 1usize << m.conv_channels.len();
            if h < shrink || w < shrink {
                anyhow::bail!(
                    "{} conv blocks pool a {h}x{w} image below 1x1",
                    m.conv_channels.len()
                );
            }
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_uses_defaults() {
        let config: RunConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, RunConfig::default());
        assert_eq!(config.schedule.stage_epochs, vec![80, 60, 40, 20]);
        assert_eq!(config.schedule.total_epochs(), 200);
        assert_eq!(config.schedule.lr, 1.0);
        assert_eq!(config.epsilon, 0.03);
        assert!(!config.adversarial);
        config.validate().unwrap();
    }

    #[test]
    fn config_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        let config = RunConfig {
            dataset: DatasetKind::Stl10,
            adversarial: true,
            seed: Some(7),
            model: ModelConfig {
                kind: ModelKind::Mlp,
                ..Default::default()
            },
            ..Default::default()
        };
        config.save(&path).unwrap();
        let loaded = RunConfig::load(&path).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn kinds_parse_from_cli_names() {
        assert_eq!("cifar10".parse::<DatasetKind>().unwrap(), DatasetKind::Cifar10);
        assert_eq!("stl10".parse::<DatasetKind>().unwrap(), DatasetKind::Stl10);
        assert_eq!("cnn".parse::<ModelKind>().unwrap(), ModelKind::Cnn);
        assert!("mnist".parse::<DatasetKind>().is_err());
        let err = "resnext".parse::<ModelKind>().unwrap_err();
        assert!(err.to_string().contains("invalid net"));
    }

    #[test]
    fn validate_rejects_bad_schedules() {
        let mut c = RunConfig::default();
        c.schedule.stage_epochs.clear();
        assert!(c.validate().is_err());

        let mut c = RunConfig::default();
        c.schedule.stage_epochs = vec![3, 0, 2];
        let err = c.validate().unwrap_err();
        assert!(err.to_string().contains("stage 2"));

        let mut c = RunConfig::default();
        c.schedule.lr_decay = 0.0;
        assert!(c.validate().is_err());

        let mut c = RunConfig::default();
        c.epsilon = -0.1;
        assert!(c.validate().is_err());

        let mut c = RunConfig::default();
        c.batch_size = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn validate_rejects_too_many_pools() {
        let mut c = RunConfig::default();
        c.model.conv_channels = vec![8; 6];
        assert!(c.validate().is_err());
        c.dataset = DatasetKind::Stl10;
        c.validate().unwrap();
    }
}
