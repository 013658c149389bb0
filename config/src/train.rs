//! Run configuration sections.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Accelerator, CheckpointMode, ComputePrecision, ConfigError, WeightPrecision};

/// Launcher-level settings (`trainer.*`).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TrainerSection {
    pub seed: u64,
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    #[serde(default)]
    pub precision: WeightPrecision,
    #[serde(default)]
    pub use_hivemind: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub lr_warmup_steps: usize,
}

fn default_batch_size() -> usize {
    1
}

/// Trainer construction arguments (`lightning.*`).
///
/// Unknown keys are rejected so that a typo fails loudly instead of being
/// silently dropped.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LightningSection {
    #[serde(default)]
    pub accelerator: Accelerator,
    #[serde(default = "default_devices")]
    pub devices: usize,
    #[serde(default)]
    pub precision: ComputePrecision,
    #[serde(default)]
    pub max_epochs: Option<usize>,
    #[serde(default)]
    pub max_steps: Option<usize>,
    #[serde(default = "default_accumulate")]
    pub accumulate_grad_batches: usize,
    #[serde(default)]
    pub gradient_clip_val: Option<f32>,
    #[serde(default = "default_log_every_n_steps")]
    pub log_every_n_steps: usize,
    #[serde(default)]
    pub auto_scale_batch_size: bool,
    #[serde(default)]
    pub auto_lr_find: bool,
    #[serde(default = "default_true")]
    pub replace_sampler_ddp: bool,
    #[serde(default = "default_root_dir")]
    pub default_root_dir: PathBuf,
    #[serde(default)]
    pub limit_train_batches: Option<usize>,
}

fn default_devices() -> usize {
    1
}
fn default_accumulate() -> usize {
    1
}
fn default_log_every_n_steps() -> usize {
    50
}
fn default_true() -> bool {
    true
}
fn default_root_dir() -> PathBuf {
    PathBuf::from(".")
}

/// Epoch limit applied when neither `max_epochs` nor `max_steps` is set.
pub const DEFAULT_MAX_EPOCHS: usize = 1000;

impl Default for LightningSection {
    fn default() -> Self {
        Self {
            accelerator: Accelerator::default(),
            devices: default_devices(),
            precision: ComputePrecision::default(),
            max_epochs: None,
            max_steps: None,
            accumulate_grad_batches: default_accumulate(),
            gradient_clip_val: None,
            log_every_n_steps: default_log_every_n_steps(),
            auto_scale_batch_size: false,
            auto_lr_find: false,
            replace_sampler_ddp: true,
            default_root_dir: default_root_dir(),
            limit_train_batches: None,
        }
    }
}

impl LightningSection {
    /// Epoch limit after applying the trainer default.
    #[must_use]
    pub fn epoch_limit(&self) -> usize {
        match (self.max_epochs, self.max_steps) {
            (Some(epochs), _) => epochs,
            (None, Some(_)) => usize::MAX,
            (None, None) => DEFAULT_MAX_EPOCHS,
        }
    }
}

/// Monitoring integrations (`monitor.*`).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MonitorSection {
    #[serde(default)]
    pub huggingface_repo: String,
    #[serde(default)]
    pub hf_auth_token: String,
    #[serde(default)]
    pub wandb_id: String,
    /// Upload every saved checkpoint, not only the final model.
    #[serde(default = "default_true")]
    pub store_checkpoints: bool,
    #[serde(default = "default_hub_every_n_epochs")]
    pub hub_every_n_epochs: usize,
}

fn default_hub_every_n_epochs() -> usize {
    1
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            huggingface_repo: String::new(),
            hf_auth_token: String::new(),
            wandb_id: String::new(),
            store_checkpoints: true,
            hub_every_n_epochs: default_hub_every_n_epochs(),
        }
    }
}

impl MonitorSection {
    /// Hub token from the config, falling back to `HF_TOKEN`.
    #[must_use]
    pub fn auth_token(&self) -> Option<String> {
        if self.hf_auth_token.is_empty() {
            std::env::var("HF_TOKEN").ok().filter(|t| !t.is_empty())
        } else {
            Some(self.hf_auth_token.clone())
        }
    }
}

/// Checkpoint callback arguments (`checkpoint.*`).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CheckpointSection {
    #[serde(default)]
    pub dirpath: Option<PathBuf>,
    #[serde(default)]
    pub monitor: Option<String>,
    #[serde(default)]
    pub mode: CheckpointMode,
    #[serde(default = "default_save_top_k")]
    pub save_top_k: i64,
    #[serde(default)]
    pub save_last: bool,
    #[serde(default)]
    pub every_n_train_steps: Option<usize>,
    #[serde(default)]
    pub every_n_epochs: Option<usize>,
}

fn default_save_top_k() -> i64 {
    1
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            dirpath: None,
            monitor: None,
            mode: CheckpointMode::default(),
            save_top_k: default_save_top_k(),
            save_last: false,
            every_n_train_steps: None,
            every_n_epochs: None,
        }
    }
}

/// Learned conditioning tokens (`custom_embeddings.*`).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CustomEmbeddingsSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub tokens: Vec<String>,
    /// Existing token whose vector seeds the new rows.
    #[serde(default)]
    pub init_from: Option<String>,
    #[serde(default = "default_true")]
    pub freeze_model: bool,
    #[serde(default)]
    pub save_every_n_steps: Option<usize>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

/// Periodic sample generation (`sampling.*`).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SamplingSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub every_n_steps: Option<usize>,
    #[serde(default)]
    pub every_n_epochs: Option<usize>,
    #[serde(default)]
    pub prompts: Vec<String>,
    #[serde(default = "default_samples_per_prompt")]
    pub num_samples_per_prompt: usize,
    /// Sampler steps; defaults to the full training schedule.
    #[serde(default)]
    pub steps: Option<usize>,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub save_dir: Option<PathBuf>,
}

fn default_samples_per_prompt() -> usize {
    1
}

/// Training images (`dataset.*`).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DatasetSection {
    pub img_path: PathBuf,
    #[serde(default = "default_resolution")]
    pub resolution: usize,
    #[serde(default = "default_true")]
    pub center_crop: bool,
    #[serde(default = "default_true")]
    pub shuffle: bool,
    #[serde(default = "default_workers")]
    pub num_workers: usize,
}

fn default_resolution() -> usize {
    32
}
fn default_workers() -> usize {
    1
}

/// AdamW hyperparameters (`optimizer.*`).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct OptimizerSection {
    #[serde(default = "default_lr")]
    pub lr: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f32,
    #[serde(default = "default_beta2")]
    pub beta2: f32,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f32,
    #[serde(default = "default_epsilon")]
    pub epsilon: f32,
}

fn default_lr() -> f64 {
    1e-4
}
fn default_beta1() -> f32 {
    0.9
}
fn default_beta2() -> f32 {
    0.999
}
fn default_weight_decay() -> f32 {
    0.01
}
fn default_epsilon() -> f32 {
    1e-8
}

impl Default for OptimizerSection {
    fn default() -> Self {
        Self {
            lr: default_lr(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            weight_decay: default_weight_decay(),
            epsilon: default_epsilon(),
        }
    }
}

/// Collaborative training settings (`hivemind.*`).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HivemindSection {
    #[serde(default = "default_target_batch_size")]
    pub target_batch_size: usize,
    #[serde(default)]
    pub run_id: String,
}

fn default_target_batch_size() -> usize {
    4096
}

impl Default for HivemindSection {
    fn default() -> Self {
        Self {
            target_batch_size: default_target_batch_size(),
            run_id: String::new(),
        }
    }
}

/// Denoiser architecture used when the model path carries none.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ModelArch {
    #[serde(default = "default_base_channels")]
    pub base_channels: usize,
    #[serde(default = "default_time_embed_dim")]
    pub time_embed_dim: usize,
    #[serde(default = "default_num_blocks")]
    pub num_blocks: usize,
    #[serde(default = "default_norm_groups")]
    pub norm_groups: usize,
    #[serde(default = "default_train_timesteps")]
    pub train_timesteps: usize,
}

fn default_base_channels() -> usize {
    64
}
fn default_time_embed_dim() -> usize {
    128
}
fn default_num_blocks() -> usize {
    4
}
fn default_norm_groups() -> usize {
    8
}
fn default_train_timesteps() -> usize {
    1000
}

impl Default for ModelArch {
    fn default() -> Self {
        Self {
            base_channels: default_base_channels(),
            time_embed_dim: default_time_embed_dim(),
            num_blocks: default_num_blocks(),
            norm_groups: default_norm_groups(),
            train_timesteps: default_train_timesteps(),
        }
    }
}

/// Full run configuration, one YAML document.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    pub trainer: TrainerSection,
    #[serde(default)]
    pub lightning: LightningSection,
    #[serde(default)]
    pub monitor: MonitorSection,
    #[serde(default)]
    pub checkpoint: CheckpointSection,
    #[serde(default)]
    pub custom_embeddings: Option<CustomEmbeddingsSection>,
    #[serde(default)]
    pub sampling: Option<SamplingSection>,
    pub dataset: DatasetSection,
    #[serde(default)]
    pub optimizer: OptimizerSection,
    #[serde(default)]
    pub hivemind: Option<HivemindSection>,
    #[serde(default)]
    pub model: ModelArch,
}

/// Message for the unsupported pure half-precision combination.
pub const PURE_FP16_MESSAGE: &str = "Pure fp16 mode is not fully supported at this time. \
     Please consider other configurations (trainer.precision and lightning.precision).";

impl RunConfig {
    /// Load and parse a YAML run configuration.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Write the resolved configuration as YAML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::Io(parent.display().to_string(), e))?;
        }
        let yaml = serde_yaml::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        std::fs::write(path, yaml).map_err(|e| ConfigError::Io(path.display().to_string(), e))
    }

    /// Reject configurations the trainer cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trainer.precision == WeightPrecision::Fp16
            && self.lightning.precision == ComputePrecision::Half
        {
            return Err(ConfigError::PureHalfPrecision);
        }

        if self.trainer.batch_size == 0 {
            return Err(ConfigError::Invalid("trainer.batch_size must be at least 1".into()));
        }
        if self.lightning.devices == 0 {
            return Err(ConfigError::Invalid("lightning.devices must be at least 1".into()));
        }
        if self.lightning.accumulate_grad_batches == 0 {
            return Err(ConfigError::Invalid(
                "lightning.accumulate_grad_batches must be at least 1".into(),
            ));
        }
        if self.lightning.log_every_n_steps == 0 {
            return Err(ConfigError::Invalid(
                "lightning.log_every_n_steps must be at least 1".into(),
            ));
        }
        if self.dataset.resolution == 0 {
            return Err(ConfigError::Invalid("dataset.resolution must be at least 1".into()));
        }
        if self.checkpoint.save_top_k < -1 {
            return Err(ConfigError::Invalid(format!(
                "checkpoint.save_top_k must be -1 or greater, got {}",
                self.checkpoint.save_top_k
            )));
        }
        for (key, value) in [
            ("model.base_channels", self.model.base_channels),
            ("model.time_embed_dim", self.model.time_embed_dim),
            ("model.norm_groups", self.model.norm_groups),
            ("model.train_timesteps", self.model.train_timesteps),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{key} must be at least 1")));
            }
        }
        if self.model.base_channels % self.model.norm_groups != 0 {
            return Err(ConfigError::Invalid(format!(
                "model.base_channels ({}) must be divisible by model.norm_groups ({})",
                self.model.base_channels, self.model.norm_groups
            )));
        }
        if let Some(ce) = self.custom_embeddings.as_ref().filter(|c| c.enabled)
            && ce.tokens.is_empty()
        {
            return Err(ConfigError::Invalid(
                "custom_embeddings.enabled requires at least one entry in custom_embeddings.tokens"
                    .into(),
            ));
        }
        if let Some(hm) = self.hivemind.as_ref()
            && self.trainer.use_hivemind
            && hm.target_batch_size == 0
        {
            return Err(ConfigError::Invalid(
                "hivemind.target_batch_size must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// CLI value wins over `trainer.model_path`.
    pub fn resolve_model_path(&self, cli_override: Option<&Path>) -> Result<PathBuf, ConfigError> {
        cli_override
            .map(Path::to_path_buf)
            .or_else(|| self.trainer.model_path.clone())
            .ok_or(ConfigError::MissingModelPath)
    }

    #[must_use]
    pub fn tune_requested(&self) -> bool {
        self.lightning.auto_scale_batch_size || self.lightning.auto_lr_find
    }

    #[must_use]
    pub fn root_dir(&self) -> &Path {
        &self.lightning.default_root_dir
    }

    #[must_use]
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.checkpoint
            .dirpath
            .clone()
            .unwrap_or_else(|| self.root_dir().join("checkpoint"))
    }

    /// Enabled custom embeddings section, if any.
    #[must_use]
    pub fn custom_embeddings_enabled(&self) -> Option<&CustomEmbeddingsSection> {
        self.custom_embeddings.as_ref().filter(|c| c.enabled)
    }

    /// Enabled sampling section, if any.
    #[must_use]
    pub fn sampling_enabled(&self) -> Option<&SamplingSection> {
        self.sampling.as_ref().filter(|s| s.enabled)
    }

    /// Collaborative settings, defaulted when `use_hivemind` is set without a section.
    #[must_use]
    pub fn hivemind_settings(&self) -> HivemindSection {
        self.hivemind.clone().unwrap_or_default()
    }
}
