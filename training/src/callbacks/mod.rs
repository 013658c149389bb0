//! Training callbacks and the launcher's callback assembly.

mod checkpoint;
mod embeddings;
mod hub;
mod lr_monitor;
mod sampling;

use std::{collections::BTreeMap, path::Path, sync::Arc};

use burn::tensor::backend::AutodiffBackend;
use kiln_config::RunConfig;
use kiln_core::{Denoiser, DenoiserConfig, TokenVocab};
use tracing::info;

pub use checkpoint::ModelCheckpoint;
pub use embeddings::CustomEmbeddings;
pub use hub::{HfHubClient, HubCallback, HubClient, HubError};
pub use lr_monitor::LearningRateMonitor;
pub use sampling::SamplingCallback;

use crate::{CsvLogger, ProjectLogger, SavedCheckpoint, SharedLogger, TrainError};

/// Action a callback can request after a step or epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Checkpoint,
    Stop,
}

impl CallbackAction {
    /// Combine two requests; `Stop` wins over `Checkpoint` wins over `Continue`.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::Stop, _) | (_, Self::Stop) => Self::Stop,
            (Self::Checkpoint, _) | (_, Self::Checkpoint) => Self::Checkpoint,
            _ => Self::Continue,
        }
    }
}

/// Loop state visible to callbacks.
pub struct TrainContext<'a> {
    /// Zero-based epoch currently running (or just finished).
    pub epoch: usize,
    /// Optimizer steps taken so far.
    pub global_step: usize,
    pub lr: f64,
    pub metrics: &'a BTreeMap<String, f64>,
    pub vocab: &'a TokenVocab,
    pub root_dir: &'a Path,
}

/// Hooks invoked by the trainer. Every hook has a no-op default.
pub trait Callback<B: AutodiffBackend>: Send {
    fn name(&self) -> &'static str;

    /// Adjust the model before the optimizer is created.
    fn setup(
        &mut self,
        model: Denoiser<B>,
        _vocab: &mut TokenVocab,
    ) -> Result<Denoiser<B>, TrainError> {
        Ok(model)
    }

    fn on_train_start(&mut self, _ctx: &TrainContext<'_>) -> Result<(), TrainError> {
        Ok(())
    }

    fn on_after_optimizer_step(&mut self, model: Denoiser<B>, _ctx: &TrainContext<'_>) -> Denoiser<B> {
        model
    }

    /// Called once per optimizer step, after the metrics are updated.
    fn on_train_batch_end(
        &mut self,
        _model: &Denoiser<B>,
        _ctx: &TrainContext<'_>,
    ) -> Result<CallbackAction, TrainError> {
        Ok(CallbackAction::Continue)
    }

    fn on_train_epoch_end(
        &mut self,
        _model: &Denoiser<B>,
        _ctx: &TrainContext<'_>,
    ) -> Result<CallbackAction, TrainError> {
        Ok(CallbackAction::Continue)
    }

    fn on_checkpoint_saved(
        &mut self,
        _saved: &SavedCheckpoint,
        _ctx: &TrainContext<'_>,
    ) -> Result<(), TrainError> {
        Ok(())
    }

    /// `final_dir` holds the exported model.
    fn on_train_end(
        &mut self,
        _model: &Denoiser<B>,
        _final_dir: &Path,
        _ctx: &TrainContext<'_>,
    ) -> Result<(), TrainError> {
        Ok(())
    }
}

/// Callbacks in invocation order plus the trainer's logger.
pub struct CallbackSet<B: AutodiffBackend> {
    pub callbacks: Vec<Box<dyn Callback<B>>>,
    pub logger: SharedLogger,
}

impl<B: AutodiffBackend> CallbackSet<B> {
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.callbacks.iter().map(|c| c.name()).collect()
    }
}

/// Assemble the callback list for a run.
///
/// Order: hub upload, learning-rate monitor (with the project logger),
/// custom embeddings, sampling, then the checkpoint callback last.
pub fn build_callbacks<B: AutodiffBackend>(
    config: &RunConfig,
    model_config: &DenoiserConfig,
) -> Result<CallbackSet<B>, TrainError> {
    let root = config.root_dir();
    let monitor = &config.monitor;
    let mut callbacks: Vec<Box<dyn Callback<B>>> = Vec::new();

    if !monitor.huggingface_repo.is_empty() {
        let client = HfHubClient::new(monitor.auth_token())
            .map_err(|e| TrainError::Callback(e.to_string()))?;
        callbacks.push(Box::new(HubCallback::new(
            &monitor.huggingface_repo,
            Arc::new(client),
            monitor,
        )));
    }

    let mut project_logger: Option<SharedLogger> = None;
    if !monitor.wandb_id.is_empty() {
        let logger: SharedLogger = Arc::new(ProjectLogger::new(root, &monitor.wandb_id, None)?);
        logger.log_hyperparams(config);
        callbacks.push(Box::new(LearningRateMonitor::new(logger.clone())));
        project_logger = Some(logger);
    }

    if let Some(section) = config.custom_embeddings_enabled() {
        callbacks.push(Box::new(CustomEmbeddings::<B>::new(section, root)));
    }

    if let Some(section) = config.sampling_enabled() {
        callbacks.push(Box::new(SamplingCallback::new(
            section,
            project_logger.clone(),
            model_config,
            config.dataset.resolution,
            root,
        )));
    }

    callbacks.push(Box::new(ModelCheckpoint::new(
        &config.checkpoint,
        config.checkpoint_dir(),
        config.trainer.precision,
    )));

    let logger = match project_logger {
        Some(logger) => logger,
        None => Arc::new(CsvLogger::new(root)?),
    };
    info!(
        "Callbacks: {}",
        callbacks.iter().map(|c| c.name()).collect::<Vec<_>>().join(", ")
    );

    Ok(CallbackSet { callbacks, logger })
}
