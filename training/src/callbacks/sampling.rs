use std::path::{Path, PathBuf};

use burn::{
    module::AutodiffModule,
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use kiln_config::SamplingSection;
use kiln_core::{Denoiser, DenoiserConfig, NoiseSchedule, TokenVocab, seeded_noise};
use kiln_data::{DataError, tensor_to_images};
use tracing::{info, warn};

use super::{Callback, CallbackAction, TrainContext};
use crate::{SharedLogger, TrainError};

/// Generates images from fixed prompts and noise during training.
pub struct SamplingCallback {
    every_n_steps: Option<usize>,
    every_n_epochs: Option<usize>,
    prompts: Vec<String>,
    samples_per_prompt: usize,
    steps: usize,
    seed: u64,
    save_dir: PathBuf,
    channels: usize,
    resolution: usize,
    schedule: NoiseSchedule,
    logger: Option<SharedLogger>,
    last_step: Option<usize>,
}

impl SamplingCallback {
    #[must_use]
    pub fn new(
        section: &SamplingSection,
        logger: Option<SharedLogger>,
        model_config: &DenoiserConfig,
        resolution: usize,
        root_dir: &Path,
    ) -> Self {
        let schedule = model_config.schedule();
        let prompts = if section.prompts.is_empty() {
            vec![String::new()]
        } else {
            section.prompts.clone()
        };
        Self {
            every_n_steps: section.every_n_steps.filter(|n| *n > 0),
            every_n_epochs: section.every_n_epochs.filter(|n| *n > 0),
            prompts,
            samples_per_prompt: section.num_samples_per_prompt.max(1),
            steps: section.steps.unwrap_or(schedule.len()).clamp(1, schedule.len().max(1)),
            seed: section.seed,
            save_dir: section
                .save_dir
                .clone()
                .unwrap_or_else(|| root_dir.join("samples")),
            channels: model_config.channels,
            resolution,
            schedule,
            logger,
            last_step: None,
        }
    }

    fn epoch_due(&self, epoch: usize) -> bool {
        match (self.every_n_epochs, self.every_n_steps) {
            (Some(n), _) => (epoch + 1) % n == 0,
            (None, Some(_)) => false,
            (None, None) => true,
        }
    }

    /// Sample every prompt and write `step-<N>/<prompt>-<k>.png`.
    pub fn generate<B: Backend>(
        &self,
        model: &Denoiser<B>,
        vocab: &TokenVocab,
        global_step: usize,
    ) -> Result<Vec<PathBuf>, TrainError> {
        let Some(device) = model.devices().into_iter().next() else {
            return Ok(Vec::new());
        };
        let dir = self.save_dir.join(format!("step-{global_step}"));
        std::fs::create_dir_all(&dir).map_err(|e| TrainError::io(&dir, e))?;

        let n = self.samples_per_prompt;
        let mut paths = Vec::with_capacity(self.prompts.len() * n);
        for (i, prompt) in self.prompts.iter().enumerate() {
            if !prompt.trim().is_empty() && vocab.id(prompt.trim()).is_none() {
                warn!("Sampling prompt '{prompt}' is not in the vocabulary, using unconditional");
            }
            let token = vocab.encode(prompt) as i64;
            let tokens = Tensor::<B, 1, Int>::full([n], token, &device);
            let noise = seeded_noise::<B>(
                [n, self.channels, self.resolution, self.resolution],
                self.seed.wrapping_add(i as u64),
                &device,
            );
            let images = model.sample(&self.schedule, tokens, noise, self.steps);
            for (k, image) in tensor_to_images(images).into_iter().enumerate() {
                let path = dir.join(format!("{i:02}-{k}.png"));
                image
                    .save(&path)
                    .map_err(|source| DataError::Write {
                        path: path.clone(),
                        source,
                    })?;
                paths.push(path);
            }
        }
        Ok(paths)
    }

    fn run<B: AutodiffBackend>(
        &mut self,
        model: &Denoiser<B>,
        ctx: &TrainContext<'_>,
    ) -> Result<(), TrainError> {
        if self.last_step == Some(ctx.global_step) {
            return Ok(());
        }
        self.last_step = Some(ctx.global_step);

        let paths = self.generate(&model.valid(), ctx.vocab, ctx.global_step)?;
        info!("Saved {} samples at step {}", paths.len(), ctx.global_step);
        if let Some(logger) = &self.logger {
            logger.log_images(ctx.global_step, "samples", &paths);
        }
        Ok(())
    }
}

impl<B: AutodiffBackend> Callback<B> for SamplingCallback {
    fn name(&self) -> &'static str {
        "sampling"
    }

    fn on_train_batch_end(
        &mut self,
        model: &Denoiser<B>,
        ctx: &TrainContext<'_>,
    ) -> Result<CallbackAction, TrainError> {
        if self
            .every_n_steps
            .is_some_and(|n| ctx.global_step % n == 0)
        {
            self.run(model, ctx)?;
        }
        Ok(CallbackAction::Continue)
    }

    fn on_train_epoch_end(
        &mut self,
        model: &Denoiser<B>,
        ctx: &TrainContext<'_>,
    ) -> Result<CallbackAction, TrainError> {
        if self.epoch_due(ctx.epoch) {
            self.run(model, ctx)?;
        }
        Ok(CallbackAction::Continue)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Arc};

    use burn::backend::{Autodiff, NdArray};

    use super::*;
    use crate::ProjectLogger;

    type B = Autodiff<NdArray<f32>>;

    fn model_config() -> DenoiserConfig {
        DenoiserConfig::new(2)
            .with_base_channels(4)
            .with_time_embed_dim(4)
            .with_num_blocks(1)
            .with_norm_groups(2)
            .with_train_timesteps(20)
    }

    fn section(yaml: &str) -> SamplingSection {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_epoch_default_and_step_cadence() {
        let root = Path::new(".");
        let cb = SamplingCallback::new(&section("enabled: true"), None, &model_config(), 4, root);
        assert!(cb.epoch_due(0));
        let cb = SamplingCallback::new(
            &section("every_n_steps: 3"),
            None,
            &model_config(),
            4,
            root,
        );
        assert!(!cb.epoch_due(0));
        let cb = SamplingCallback::new(
            &section("every_n_epochs: 2"),
            None,
            &model_config(),
            4,
            root,
        );
        assert!(!cb.epoch_due(0));
        assert!(cb.epoch_due(1));
    }

    #[test]
    fn test_samples_are_written_logged_and_reproducible() {
        let dir = tempfile::tempdir().unwrap();
        let logger: SharedLogger =
            Arc::new(ProjectLogger::new(dir.path(), "demo", Some("run")).unwrap());
        let mut cb = SamplingCallback::new(
            &section("prompts: [cat, '']\nnum_samples_per_prompt: 2\nsteps: 2\nseed: 7"),
            Some(logger.clone()),
            &model_config(),
            4,
            dir.path(),
        );
        let model = model_config().init::<B>(&Default::default());
        let vocab = TokenVocab::from_names(["cat"]);
        let metrics = BTreeMap::new();
        let ctx = TrainContext {
            epoch: 0,
            global_step: 5,
            lr: 0.0,
            metrics: &metrics,
            vocab: &vocab,
            root_dir: dir.path(),
        };

        Callback::<B>::on_train_epoch_end(&mut cb, &model, &ctx).unwrap();
        let step_dir = dir.path().join("samples/step-5");
        for name in ["00-0.png", "00-1.png", "01-0.png", "01-1.png"] {
            assert!(step_dir.join(name).is_file(), "missing {name}");
        }
        logger.flush();
        let media = std::fs::read_to_string(dir.path().join("runs/demo/run/media.jsonl")).unwrap();
        assert_eq!(media.lines().count(), 1);

        let first = std::fs::read(step_dir.join("00-0.png")).unwrap();
        let again = cb.generate(&model.valid(), &vocab, 6).unwrap();
        assert_eq!(std::fs::read(&again[0]).unwrap(), first);
    }
}
