//! The training loop.
//!
//! One optimizer step consumes `accumulation` micro-batch groups; a group
//! holds one batch per data-parallel rank. Each replica's loss is scaled by
//! `1 / (world * accumulation)` so the summed gradients are an average.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    grad_clipping::GradientClippingConfig,
    lr_scheduler::LrScheduler,
    module::{AutodiffModule, Module},
    optim::{AdamWConfig, GradientsAccumulator, GradientsParams, Optimizer},
    tensor::{ElementConversion, backend::AutodiffBackend},
};
use indicatif::ProgressStyle;
use kiln_config::RunConfig;
use kiln_core::{Denoiser, DenoiserConfig, LoadedModel, NoiseSchedule, TokenVocab, save_model};
use kiln_data::{DiffusionBatch, DiffusionBatcher, ImageFolderDataset, ShardDataset, ShardMode};
use tracing::{info, info_span, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::{
    Callback, CallbackAction, CallbackSet, CheckpointStore, ResumePoint, SharedLogger, Strategy,
    TrainContext, TrainError, TrainingState, WarmupSchedule,
};

pub type BatchLoader<B> = Arc<dyn DataLoader<B, DiffusionBatch<B>>>;

/// Directory under the root holding the exported model.
pub const FINAL_MODEL_DIR: &str = "model";

const PROGRESS_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] {msg:42} [{wide_bar:.cyan/blue}] {pos:>5}/{len:5} ({percent:>2}%) [{eta:>5}]";

fn progress_style() -> ProgressStyle {
    ProgressStyle::with_template(PROGRESS_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#*-")
}

/// What a finished `fit` produced.
#[derive(Clone, Debug)]
pub struct FitSummary {
    pub global_step: usize,
    pub epochs: usize,
    pub final_dir: PathBuf,
    pub metrics: BTreeMap<String, f64>,
}

#[derive(Debug, Default)]
struct LoopState {
    epoch: usize,
    global_step: usize,
    base_lr: f64,
    lr: f64,
    metrics: BTreeMap<String, f64>,
    /// Micro-batch groups accumulated since the last optimizer step.
    pending: usize,
    pending_loss: f64,
    epoch_loss: f64,
    epoch_steps: usize,
}

impl LoopState {
    fn context<'a>(&'a self, vocab: &'a TokenVocab, root_dir: &'a Path) -> TrainContext<'a> {
        TrainContext {
            epoch: self.epoch,
            global_step: self.global_step,
            lr: self.lr,
            metrics: &self.metrics,
            vocab,
            root_dir,
        }
    }
}

pub struct Trainer<B: AutodiffBackend> {
    config: RunConfig,
    strategy: Strategy,
    devices: Vec<B::Device>,
    callbacks: Vec<Box<dyn Callback<B>>>,
    logger: SharedLogger,
}

impl<B: AutodiffBackend> Trainer<B> {
    /// `devices` must not be empty; the first one holds the primary model.
    pub fn new(
        config: RunConfig,
        strategy: Strategy,
        devices: Vec<B::Device>,
        callbacks: CallbackSet<B>,
    ) -> Result<Self, TrainError> {
        if devices.is_empty() {
            return Err(TrainError::NoDevice);
        }
        Ok(Self {
            config,
            strategy,
            devices,
            callbacks: callbacks.callbacks,
            logger: callbacks.logger,
        })
    }

    #[must_use]
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub(crate) fn config_mut(&mut self) -> &mut RunConfig {
        &mut self.config
    }

    #[must_use]
    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    #[must_use]
    pub fn primary_device(&self) -> &B::Device {
        &self.devices[0]
    }

    #[must_use]
    pub fn callback_names(&self) -> Vec<&'static str> {
        self.callbacks.iter().map(|c| c.name()).collect()
    }

    /// Number of data-parallel ranks.
    #[must_use]
    pub fn world_size(&self) -> usize {
        match self.strategy {
            Strategy::Ddp { .. } => self.devices.len(),
            _ => 1,
        }
    }

    /// Micro-batch groups per optimizer step.
    #[must_use]
    pub fn accumulation(&self) -> usize {
        match self.strategy {
            Strategy::Collaborative { target_batch_size } => target_batch_size
                .div_ceil(self.config.trainer.batch_size.max(1))
                .max(1),
            _ => self.config.lightning.accumulate_grad_batches.max(1),
        }
    }

    pub(crate) fn optimizer_config(&self) -> AdamWConfig {
        let opt = &self.config.optimizer;
        AdamWConfig::new()
            .with_beta_1(opt.beta1)
            .with_beta_2(opt.beta2)
            .with_epsilon(opt.epsilon)
            .with_weight_decay(opt.weight_decay)
            .with_grad_clipping(
                self.config
                    .lightning
                    .gradient_clip_val
                    .map(GradientClippingConfig::Norm),
            )
    }

    /// One loader per rank over its shard of `dataset`.
    pub(crate) fn loaders(
        &self,
        dataset: &Arc<ImageFolderDataset>,
        vocab: &Arc<TokenVocab>,
        batch_size: usize,
        world: usize,
    ) -> Vec<BatchLoader<B>> {
        let mode = if self.config.lightning.replace_sampler_ddp {
            ShardMode::Contiguous
        } else {
            ShardMode::Strided
        };
        let data = &self.config.dataset;
        (0..world)
            .map(|rank| {
                let shard = ShardDataset::new(dataset.clone(), mode, rank, world);
                let batcher = DiffusionBatcher::new(vocab.clone(), data.resolution);
                let mut builder = DataLoaderBuilder::new(batcher)
                    .batch_size(batch_size)
                    .num_workers(data.num_workers.max(1))
                    .set_device(self.devices[rank].clone());
                if data.shuffle {
                    builder = builder.shuffle(self.config.trainer.seed.wrapping_add(rank as u64));
                }
                builder.build(shard)
            })
            .collect()
    }

    /// Forward and backward one batch per replica, accumulating onto the
    /// primary device. Returns the mean unscaled loss.
    pub(crate) fn accumulate_group(
        &self,
        model: &Denoiser<B>,
        group: Vec<DiffusionBatch<B>>,
        scale: f64,
        schedule: &NoiseSchedule,
        accumulator: &mut GradientsAccumulator<Denoiser<B>>,
    ) -> f64 {
        let world = group.len();
        let mut total = 0.0;
        let mut replicas = Vec::with_capacity(world);
        for (rank, batch) in group.into_iter().enumerate() {
            let replica = if rank == 0 {
                model.clone()
            } else {
                model.clone().fork(&self.devices[rank])
            };
            let loss = replica.forward_loss(batch.images, batch.tokens, schedule);
            let value: f64 = loss.clone().into_scalar().elem();
            total += value;
            replicas.push((replica, loss));
        }
        let mean = total / world as f64;
        if !mean.is_finite() {
            return mean;
        }

        for (rank, (replica, loss)) in replicas.into_iter().enumerate() {
            let grads = GradientsParams::from_grads(loss.mul_scalar(scale).backward(), &replica);
            let grads = if rank == 0 {
                grads
            } else {
                grads.to_device(&self.devices[0], &replica)
            };
            accumulator.accumulate(model, grads);
        }
        mean
    }

    fn notify_saved<O>(
        &mut self,
        store: &CheckpointStore,
        model: &Denoiser<B>,
        optim: &O,
        lr_schedule: &WarmupSchedule,
        st: &LoopState,
        vocab: &TokenVocab,
        resume_epoch: usize,
    ) -> Result<(), TrainError>
    where
        O: Optimizer<Denoiser<B>, B>,
    {
        let state = TrainingState {
            epoch: resume_epoch,
            global_step: st.global_step,
            base_lr: st.base_lr,
            metrics: st.metrics.clone(),
        };
        let saved = store.save(&st.global_step.to_string(), model, optim, lr_schedule, &state)?;
        let ctx = st.context(vocab, self.config.root_dir());
        for cb in &mut self.callbacks {
            cb.on_checkpoint_saved(&saved, &ctx)?;
        }
        Ok(())
    }

    fn optimizer_step<O>(
        &mut self,
        model: Denoiser<B>,
        optim: &mut O,
        grads: GradientsParams,
        st: &mut LoopState,
        lr_schedule: &mut WarmupSchedule,
        vocab: &TokenVocab,
    ) -> Result<(Denoiser<B>, CallbackAction), TrainError>
    where
        O: Optimizer<Denoiser<B>, B>,
    {
        let lr = lr_schedule.step();
        let mut model = optim.step(lr, model, grads);
        st.global_step += 1;
        st.lr = lr;

        let loss = st.pending_loss / st.pending.max(1) as f64;
        st.pending = 0;
        st.pending_loss = 0.0;
        st.epoch_loss += loss;
        st.epoch_steps += 1;
        st.metrics.insert("train_loss".into(), loss);
        st.metrics.insert("lr".into(), lr);
        st.metrics.insert("epoch".into(), st.epoch as f64);

        let ctx = st.context(vocab, self.config.root_dir());
        for cb in &mut self.callbacks {
            model = cb.on_after_optimizer_step(model, &ctx);
        }
        if st.global_step % self.config.lightning.log_every_n_steps.max(1) == 0 {
            self.logger.log_metrics(
                st.global_step,
                &[("train_loss", loss), ("lr", lr), ("epoch", st.epoch as f64)],
            );
        }

        let mut action = CallbackAction::Continue;
        for cb in &mut self.callbacks {
            action = action.merge(cb.on_train_batch_end(&model, &ctx)?);
        }
        Ok((model, action))
    }

    /// Train `loaded` on `dataset`, optionally continuing from `resume`.
    ///
    /// The final model (with any vocabulary added by callbacks) is written to
    /// `<root>/model`.
    pub fn fit(
        &mut self,
        loaded: LoadedModel<B>,
        dataset: Arc<ImageFolderDataset>,
        resume: Option<ResumePoint>,
    ) -> Result<FitSummary, TrainError> {
        let LoadedModel {
            mut model,
            config: model_config,
            mut vocab,
        } = loaded;
        let root = self.config.root_dir().to_path_buf();
        std::fs::create_dir_all(&root).map_err(|e| TrainError::io(&root, e))?;
        self.config.save(root.join("config.yaml"))?;

        for cb in &mut self.callbacks {
            model = cb.setup(model, &mut vocab)?;
        }

        let mut optim = self.optimizer_config().init::<B, Denoiser<B>>();
        let mut st = LoopState {
            base_lr: self.config.optimizer.lr,
            ..Default::default()
        };
        let mut resumed = None;
        if let Some(point) = resume {
            let store = CheckpointStore::new(&point.dir, self.config.trainer.precision);
            let (restored, restored_optim, state) =
                store.load(&point.tag, model, optim, self.primary_device())?;
            info!(
                "Resumed from {} at epoch {} step {}",
                store.model_file(&point.tag).display(),
                state.epoch,
                state.global_step
            );
            model = restored;
            optim = restored_optim;
            st.epoch = state.epoch;
            st.global_step = state.global_step;
            st.base_lr = state.base_lr;
            st.metrics = state.metrics;
            resumed = Some((store, point.tag));
        }
        st.lr = st.base_lr;
        let mut lr_schedule = WarmupSchedule::new(st.base_lr, self.config.trainer.lr_warmup_steps)?;
        if let Some((store, tag)) = &resumed {
            lr_schedule = store.load_scheduler::<B, _>(tag, lr_schedule, self.primary_device())?;
        }

        let world = self.world_size();
        let accumulation = self.accumulation();
        let scale = 1.0 / (world * accumulation) as f64;
        let schedule = model_config.schedule();
        let vocab_shared = Arc::new(vocab.clone());
        let loaders = self.loaders(&dataset, &vocab_shared, self.config.trainer.batch_size, world);
        let store = CheckpointStore::new(self.config.checkpoint_dir(), self.config.trainer.precision);

        let lightning = &self.config.lightning;
        let epoch_limit = lightning.epoch_limit();
        let max_steps = lightning.max_steps;
        let limit_batches = lightning.limit_train_batches;
        let batches_per_epoch = loaders
            .iter()
            .map(|l| l.num_items().div_ceil(self.config.trainer.batch_size.max(1)))
            .min()
            .unwrap_or(0)
            .min(limit_batches.unwrap_or(usize::MAX));

        info!(
            "Training with strategy {} on {} device(s): {} batches per epoch, accumulation {}",
            self.strategy,
            world,
            batches_per_epoch,
            accumulation
        );
        {
            let ctx = st.context(&vocab, &root);
            for cb in &mut self.callbacks {
                cb.on_train_start(&ctx)?;
            }
        }

        let mut stop = max_steps.is_some_and(|m| st.global_step >= m);
        let mut accumulator = GradientsAccumulator::<Denoiser<B>>::new();
        while !stop && st.epoch < epoch_limit {
            let span = info_span!("epoch", epoch = st.epoch);
            span.pb_set_style(&progress_style());
            span.pb_set_length(batches_per_epoch as u64);
            let _enter = span.enter();

            st.epoch_loss = 0.0;
            st.epoch_steps = 0;
            let mut iters: Vec<_> = loaders.iter().map(|l| l.iter()).collect();
            let mut batches = 0usize;

            loop {
                if limit_batches.is_some_and(|l| batches >= l) {
                    break;
                }
                let Some(group) = iters.iter_mut().map(|it| it.next()).collect::<Option<Vec<_>>>()
                else {
                    break;
                };
                batches += 1;
                span.pb_inc(1);

                let loss = self.accumulate_group(&model, group, scale, &schedule, &mut accumulator);
                if !loss.is_finite() {
                    warn!("Non-finite loss at step {}, skipping batch", st.global_step);
                    continue;
                }
                st.pending += 1;
                st.pending_loss += loss;
                if st.pending < accumulation {
                    continue;
                }

                let (next, action) = self.optimizer_step(
                    model,
                    &mut optim,
                    accumulator.grads(),
                    &mut st,
                    &mut lr_schedule,
                    &vocab,
                )?;
                model = next;
                span.pb_set_message(&format!(
                    "epoch {} step {} loss {:.4}",
                    st.epoch,
                    st.global_step,
                    st.metrics.get("train_loss").copied().unwrap_or_default()
                ));

                if action == CallbackAction::Checkpoint {
                    self.notify_saved(&store, &model, &optim, &lr_schedule, &st, &vocab, st.epoch)?;
                }
                if action == CallbackAction::Stop {
                    info!("Stop requested at step {}", st.global_step);
                    stop = true;
                }
                if max_steps.is_some_and(|m| st.global_step >= m) {
                    stop = true;
                }
                if stop {
                    break;
                }
            }

            // Incomplete accumulation window at the end of the epoch.
            if st.pending > 0 && !stop {
                let (next, action) = self.optimizer_step(
                    model,
                    &mut optim,
                    accumulator.grads(),
                    &mut st,
                    &mut lr_schedule,
                    &vocab,
                )?;
                model = next;
                if action == CallbackAction::Checkpoint {
                    self.notify_saved(&store, &model, &optim, &lr_schedule, &st, &vocab, st.epoch)?;
                }
                stop |= action == CallbackAction::Stop || max_steps.is_some_and(|m| st.global_step >= m);
            }
            st.pending = 0;
            st.pending_loss = 0.0;

            if st.epoch_steps > 0 {
                let epoch_loss = st.epoch_loss / st.epoch_steps as f64;
                st.metrics.insert("train_loss_epoch".into(), epoch_loss);
                self.logger
                    .log_metrics(st.global_step, &[("train_loss_epoch", epoch_loss)]);
                info!("Epoch {} finished: loss {epoch_loss:.5}", st.epoch);
            } else {
                warn!("Epoch {} produced no optimizer steps", st.epoch);
            }

            let mut action = CallbackAction::Continue;
            {
                let ctx = st.context(&vocab, &root);
                for cb in &mut self.callbacks {
                    action = action.merge(cb.on_train_epoch_end(&model, &ctx)?);
                }
            }
            if action == CallbackAction::Checkpoint {
                self.notify_saved(&store, &model, &optim, &lr_schedule, &st, &vocab, st.epoch + 1)?;
            }
            stop |= action == CallbackAction::Stop;
            st.epoch += 1;
            if st.epoch_steps == 0 {
                break;
            }
        }

        let final_dir = root.join(FINAL_MODEL_DIR);
        save_model(
            &final_dir,
            model.valid(),
            &model_config,
            &vocab,
            self.config.trainer.precision,
        )?;
        info!("Saved final model to {}", final_dir.display());
        {
            let ctx = st.context(&vocab, &root);
            for cb in &mut self.callbacks {
                cb.on_train_end(&model, &final_dir, &ctx)?;
            }
        }
        self.logger.flush();

        Ok(FitSummary {
            global_step: st.global_step,
            epochs: st.epoch,
            final_dir,
            metrics: st.metrics,
        })
    }
}

/// One-line model summary for logs.
#[must_use]
pub fn describe(model_config: &DenoiserConfig, num_params: usize) -> String {
    format!(
        "denoiser: {} blocks x {} channels, {} tokens, {} timesteps, {num_params} parameters",
        model_config.num_blocks,
        model_config.base_channels,
        model_config.vocab_size,
        model_config.train_timesteps
    )
}
