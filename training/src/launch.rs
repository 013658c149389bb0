//! End-to-end run: configuration in, trained model out.

use std::{path::PathBuf, sync::Arc};

use burn::{module::Module, tensor::backend::AutodiffBackend};
use kiln_config::RunConfig;
use kiln_core::load_model;
use kiln_data::ImageFolderDataset;
use tracing::info;

use crate::{
    FitSummary, Strategy, TrainError, Trainer, build_callbacks, resolve_resume, trainer::describe,
};

/// Command-line overrides for a run.
#[derive(Clone, Debug, Default)]
pub struct LaunchOptions {
    /// Takes precedence over `trainer.model_path`.
    pub model_path: Option<PathBuf>,
    /// Checkpoint directory or `model-<tag>.mpk` file.
    pub resume: Option<PathBuf>,
    /// Stop after building the trainer.
    pub dry_run: bool,
}

#[derive(Debug)]
pub enum LaunchOutcome {
    DryRun,
    Finished(FitSummary),
}

/// Seed, resolve and validate, select a strategy, load the model, assemble
/// callbacks, then tune (when requested) and fit.
pub fn launch<B: AutodiffBackend>(
    mut config: RunConfig,
    devices: Vec<B::Device>,
    options: &LaunchOptions,
) -> Result<LaunchOutcome, TrainError> {
    let primary = devices.first().cloned().ok_or(TrainError::NoDevice)?;
    for device in &devices {
        B::seed(device, config.trainer.seed);
    }
    info!("Seed: {}", config.trainer.seed);

    let model_path = config.resolve_model_path(options.model_path.as_deref())?;
    config.validate()?;

    let strategy = Strategy::select(&mut config);
    info!("Strategy: {strategy}");

    let data = &config.dataset;
    let dataset = Arc::new(ImageFolderDataset::new(
        &data.img_path,
        data.resolution,
        data.center_crop,
    )?);
    let loaded = load_model::<B>(
        &model_path,
        &config.model,
        config.trainer.precision,
        || dataset.class_names(),
        &primary,
    )?;
    info!("{}", describe(&loaded.config, loaded.model.num_params()));

    let callbacks = build_callbacks::<B>(&config, &loaded.config)?;
    let mut trainer = Trainer::new(config, strategy, devices, callbacks)?;

    if options.dry_run {
        info!(
            "Dry run: {} callbacks ({}), stopping before training",
            trainer.callback_names().len(),
            trainer.callback_names().join(", ")
        );
        return Ok(LaunchOutcome::DryRun);
    }

    if trainer.config().tune_requested() {
        trainer.tune(&loaded, &dataset)?;
    }

    let resume = options.resume.as_deref().map(resolve_resume).transpose()?;
    let summary = trainer.fit(loaded, dataset, resume)?;
    info!(
        "Finished after {} steps; model in {}",
        summary.global_step,
        summary.final_dir.display()
    );
    Ok(LaunchOutcome::Finished(summary))
}
