//! Learning-rate range test and batch-size search.
//!
//! Both run on a copy of the model; only the chosen values are written back
//! into the trainer's configuration.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use burn::{
    optim::{GradientsAccumulator, Optimizer},
    tensor::backend::AutodiffBackend,
};
use kiln_core::{Denoiser, LoadedModel, NoiseSchedule, TokenVocab};
use kiln_data::ImageFolderDataset;
use tracing::{info, warn};

use crate::{BatchLoader, TrainError, Trainer};

pub const LR_MIN: f64 = 1e-8;
pub const LR_MAX: f64 = 1.0;
pub const LR_TRIALS: usize = 100;
const EARLY_STOP_FACTOR: f64 = 4.0;
const SMOOTHING: f64 = 0.98;
const SKIP_BEGIN: usize = 10;
const SKIP_END: usize = 1;

pub const STEPS_PER_TRIAL: usize = 5;
const MAX_TRIALS: usize = 25;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TuneResult {
    pub batch_size: Option<usize>,
    pub lr: Option<f64>,
}

/// Learning rate at the steepest descent of a (smoothed) loss curve.
///
/// The first `SKIP_BEGIN` and last `SKIP_END` points are ignored.
#[must_use]
pub fn suggest_lr(lrs: &[f64], losses: &[f64]) -> Option<f64> {
    let n = lrs.len().min(losses.len());
    if n <= SKIP_BEGIN + SKIP_END {
        return None;
    }
    let window: Vec<(usize, f64)> = (SKIP_BEGIN..n - SKIP_END)
        .filter(|&i| losses[i].is_finite())
        .map(|i| (i, losses[i]))
        .collect();
    let m = window.len();
    if m < 2 {
        return None;
    }

    let value = |j: usize| window[j].1;
    let gradient = |j: usize| match j {
        0 => value(1) - value(0),
        j if j == m - 1 => value(m - 1) - value(m - 2),
        j => (value(j + 1) - value(j - 1)) / 2.0,
    };
    let steepest = (0..m).min_by(|&a, &b| gradient(a).total_cmp(&gradient(b)))?;
    Some(lrs[window[steepest].0])
}

impl<B: AutodiffBackend> Trainer<B> {
    /// Search batch size and/or learning rate as configured and apply them.
    pub fn tune(
        &mut self,
        loaded: &LoadedModel<B>,
        dataset: &Arc<ImageFolderDataset>,
    ) -> Result<TuneResult, TrainError> {
        let vocab = Arc::new(loaded.vocab.clone());
        let schedule = loaded.config.schedule();
        let mut result = TuneResult::default();

        if self.config().lightning.auto_scale_batch_size {
            let size = self.scale_batch_size(&loaded.model, dataset, &vocab, &schedule);
            info!("Batch size search chose {size}");
            self.config_mut().trainer.batch_size = size;
            result.batch_size = Some(size);
        }

        if self.config().lightning.auto_lr_find {
            match self.find_lr(&loaded.model, dataset, &vocab, &schedule) {
                Some(lr) => {
                    info!("Learning rate finder suggests {lr:.3e}");
                    self.config_mut().optimizer.lr = lr;
                    result.lr = Some(lr);
                }
                None => warn!(
                    "Learning rate finder could not suggest a value, keeping {}",
                    self.config().optimizer.lr
                ),
            }
        }
        Ok(result)
    }

    fn single_loader(
        &self,
        dataset: &Arc<ImageFolderDataset>,
        vocab: &Arc<TokenVocab>,
        batch_size: usize,
    ) -> Option<BatchLoader<B>> {
        self.loaders(dataset, vocab, batch_size, 1).into_iter().next()
    }

    /// Run up to `steps` optimizer steps; returns the last loss.
    fn run_steps(
        &self,
        model: Denoiser<B>,
        loader: &BatchLoader<B>,
        schedule: &NoiseSchedule,
        steps: usize,
    ) -> f64 {
        let lr = self.config().optimizer.lr;
        let mut optim = self.optimizer_config().init::<B, Denoiser<B>>();
        let mut model = model;
        let mut done = 0;
        let mut last = f64::NAN;
        while done < steps {
            let mut progressed = false;
            for batch in loader.iter() {
                let mut accumulator = GradientsAccumulator::new();
                last = self.accumulate_group(&model, vec![batch], 1.0, schedule, &mut accumulator);
                if !last.is_finite() {
                    return last;
                }
                model = optim.step(lr, model, accumulator.grads());
                done += 1;
                progressed = true;
                if done >= steps {
                    break;
                }
            }
            if !progressed {
                break;
            }
        }
        last
    }

    /// Double the batch size from the configured value until a trial fails
    /// or the whole dataset fits in one batch.
    fn scale_batch_size(
        &self,
        model: &Denoiser<B>,
        dataset: &Arc<ImageFolderDataset>,
        vocab: &Arc<TokenVocab>,
        schedule: &NoiseSchedule,
    ) -> usize {
        use burn::data::dataset::Dataset;

        let configured = self.config().trainer.batch_size.max(1);
        let limit = dataset.len().max(1);
        let mut size = configured.min(limit);
        let mut best = None;

        for _ in 0..MAX_TRIALS {
            let Some(loader) = self.single_loader(dataset, vocab, size) else {
                break;
            };
            let trial = catch_unwind(AssertUnwindSafe(|| {
                self.run_steps(model.clone(), &loader, schedule, STEPS_PER_TRIAL)
            }));
            match trial {
                Ok(loss) if loss.is_finite() => {
                    info!("Batch size {size} succeeded");
                    best = Some(size);
                }
                Ok(_) => {
                    warn!("Batch size {size} produced a non-finite loss");
                    break;
                }
                Err(_) => {
                    warn!("Batch size {size} failed");
                    break;
                }
            }
            if size >= limit {
                break;
            }
            size = (size * 2).min(limit);
        }

        best.unwrap_or_else(|| {
            warn!("No batch size trial succeeded, keeping {configured}");
            configured
        })
    }

    /// Exponential learning-rate sweep from `LR_MIN` to `LR_MAX`.
    fn find_lr(
        &self,
        model: &Denoiser<B>,
        dataset: &Arc<ImageFolderDataset>,
        vocab: &Arc<TokenVocab>,
        schedule: &NoiseSchedule,
    ) -> Option<f64> {
        let loader = self.single_loader(dataset, vocab, self.config().trainer.batch_size)?;
        let mut optim = self.optimizer_config().init::<B, Denoiser<B>>();
        let mut model = model.clone();
        let mut lrs = Vec::with_capacity(LR_TRIALS);
        let mut losses = Vec::with_capacity(LR_TRIALS);
        let mut average = 0.0;
        let mut best = f64::INFINITY;
        let mut iter = loader.iter();

        for i in 0..LR_TRIALS {
            let batch = match iter.next() {
                Some(batch) => batch,
                None => {
                    iter = loader.iter();
                    iter.next()?
                }
            };
            let lr = LR_MIN * (LR_MAX / LR_MIN).powf(i as f64 / (LR_TRIALS - 1) as f64);
            let mut accumulator = GradientsAccumulator::new();
            let loss = self.accumulate_group(&model, vec![batch], 1.0, schedule, &mut accumulator);
            if !loss.is_finite() {
                break;
            }

            average = SMOOTHING * average + (1.0 - SMOOTHING) * loss;
            let smoothed = average / (1.0 - SMOOTHING.powi(i as i32 + 1));
            lrs.push(lr);
            losses.push(smoothed);
            if i > 1 && smoothed > EARLY_STOP_FACTOR * best {
                break;
            }
            best = best.min(smoothed);
            model = optim.step(lr, model, accumulator.grads());
        }

        suggest_lr(&lrs, &losses)
    }
}
