use std::{cmp::Ordering, collections::BTreeMap, path::PathBuf};

use burn::tensor::backend::AutodiffBackend;
use kiln_config::{CheckpointMode, CheckpointSection, WeightPrecision};
use kiln_core::Denoiser;
use tracing::{debug, info, warn};

use super::{Callback, CallbackAction, TrainContext};
use crate::{CheckpointStore, SavedCheckpoint, TrainError};

pub const LAST_TAG: &str = "last";

#[derive(Clone, Debug, PartialEq)]
struct Ranked {
    score: f64,
    step: usize,
    tag: String,
}

/// Requests checkpoints on the configured cadence and keeps the best `save_top_k`.
pub struct ModelCheckpoint {
    store: CheckpointStore,
    monitor: Option<String>,
    mode: CheckpointMode,
    save_top_k: i64,
    save_last: bool,
    every_n_train_steps: Option<usize>,
    every_n_epochs: Option<usize>,
    kept: Vec<Ranked>,
    last_requested_step: Option<usize>,
}

impl ModelCheckpoint {
    #[must_use]
    pub fn new(section: &CheckpointSection, dir: PathBuf, precision: WeightPrecision) -> Self {
        Self {
            store: CheckpointStore::new(dir, precision),
            monitor: section.monitor.clone(),
            mode: section.mode,
            save_top_k: section.save_top_k,
            save_last: section.save_last,
            every_n_train_steps: section.every_n_train_steps.filter(|n| *n > 0),
            every_n_epochs: section.every_n_epochs.filter(|n| *n > 0),
            kept: Vec::new(),
            last_requested_step: None,
        }
    }

    fn enabled(&self) -> bool {
        self.save_top_k != 0 || self.save_last
    }

    #[must_use]
    pub fn saves_on_step(&self, global_step: usize) -> bool {
        self.enabled()
            && global_step > 0
            && self
                .every_n_train_steps
                .is_some_and(|n| global_step % n == 0)
    }

    #[must_use]
    pub fn saves_on_epoch(&self, epoch: usize) -> bool {
        if !self.enabled() {
            return false;
        }
        match (self.every_n_epochs, self.every_n_train_steps) {
            (Some(n), _) => (epoch + 1) % n == 0,
            (None, Some(_)) => false,
            (None, None) => true,
        }
    }

    /// Ranking mode; without a monitored metric newer checkpoints win.
    fn effective_mode(&self) -> CheckpointMode {
        if self.monitor.is_some() {
            self.mode
        } else {
            CheckpointMode::Max
        }
    }

    fn score(&self, global_step: usize, metrics: &BTreeMap<String, f64>) -> f64 {
        let Some(key) = &self.monitor else {
            return global_step as f64;
        };
        if let Some(value) = metrics.get(key) {
            return *value;
        }
        warn!("Monitored metric '{key}' not available, ranking checkpoint last");
        match self.mode {
            CheckpointMode::Min => f64::INFINITY,
            CheckpointMode::Max => f64::NEG_INFINITY,
        }
    }

    fn request(&mut self, global_step: usize) -> CallbackAction {
        if self.last_requested_step == Some(global_step) {
            return CallbackAction::Continue;
        }
        self.last_requested_step = Some(global_step);
        CallbackAction::Checkpoint
    }

    /// Sort best first and drop everything past `save_top_k`.
    fn prune(&mut self) {
        let mode = self.effective_mode();
        self.kept.sort_by(|a, b| {
            if mode.is_better(a.score, b.score) {
                Ordering::Less
            } else if mode.is_better(b.score, a.score) {
                Ordering::Greater
            } else {
                b.step.cmp(&a.step)
            }
        });

        let Ok(limit) = usize::try_from(self.save_top_k) else {
            return;
        };
        for dropped in self.kept.split_off(limit.min(self.kept.len())) {
            debug!("Removing checkpoint {} (score {})", dropped.tag, dropped.score);
            self.store.remove(&dropped.tag);
        }
    }

    /// Tags currently kept by the top-k policy, best first.
    #[must_use]
    pub fn kept_tags(&self) -> Vec<&str> {
        self.kept.iter().map(|r| r.tag.as_str()).collect()
    }
}

impl<B: AutodiffBackend> Callback<B> for ModelCheckpoint {
    fn name(&self) -> &'static str {
        "model_checkpoint"
    }

    fn on_train_start(&mut self, _ctx: &TrainContext<'_>) -> Result<(), TrainError> {
        self.kept = self
            .store
            .complete_tags()
            .into_iter()
            .filter(|tag| tag != LAST_TAG)
            .filter_map(|tag| {
                let state = self.store.read_state(&tag).ok()?;
                Some(Ranked {
                    score: self.score(state.global_step, &state.metrics),
                    step: state.global_step,
                    tag,
                })
            })
            .collect();
        if !self.kept.is_empty() {
            info!(
                "Found {} existing checkpoints in {}",
                self.kept.len(),
                self.store.dir().display()
            );
        }
        Ok(())
    }

    fn on_train_batch_end(
        &mut self,
        _model: &Denoiser<B>,
        ctx: &TrainContext<'_>,
    ) -> Result<CallbackAction, TrainError> {
        if self.saves_on_step(ctx.global_step) {
            return Ok(self.request(ctx.global_step));
        }
        Ok(CallbackAction::Continue)
    }

    fn on_train_epoch_end(
        &mut self,
        _model: &Denoiser<B>,
        ctx: &TrainContext<'_>,
    ) -> Result<CallbackAction, TrainError> {
        if self.saves_on_epoch(ctx.epoch) {
            return Ok(self.request(ctx.global_step));
        }
        Ok(CallbackAction::Continue)
    }

    fn on_checkpoint_saved(
        &mut self,
        saved: &SavedCheckpoint,
        ctx: &TrainContext<'_>,
    ) -> Result<(), TrainError> {
        if saved.tag == LAST_TAG {
            return Ok(());
        }
        if self.save_last {
            self.store.copy(&saved.tag, LAST_TAG)?;
        }
        if self.save_top_k == 0 {
            self.store.remove(&saved.tag);
            return Ok(());
        }

        let score = self.score(saved.global_step, ctx.metrics);
        self.kept.retain(|r| r.tag != saved.tag);
        self.kept.push(Ranked {
            score,
            step: saved.global_step,
            tag: saved.tag.clone(),
        });
        self.prune();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use burn::backend::{Autodiff, NdArray};
    use kiln_core::TokenVocab;
    use test_case::test_case;

    use super::*;
    use crate::TrainingState;

    type B = Autodiff<NdArray<f32>>;

    fn section(yaml: &str) -> CheckpointSection {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn fake_save(dir: &Path, step: usize, metrics: &BTreeMap<String, f64>) -> SavedCheckpoint {
        let tag = step.to_string();
        std::fs::write(dir.join(format!("model-{tag}.mpk")), b"m").unwrap();
        std::fs::write(dir.join(format!("optim-{tag}.mpk")), b"o").unwrap();
        std::fs::write(dir.join(format!("scheduler-{tag}.mpk")), b"s").unwrap();
        let state = TrainingState {
            global_step: step,
            metrics: metrics.clone(),
            ..Default::default()
        };
        std::fs::write(
            dir.join(format!("state-{tag}.json")),
            serde_json::to_string(&state).unwrap(),
        )
        .unwrap();
        SavedCheckpoint {
            tag,
            epoch: 0,
            global_step: step,
            files: Vec::new(),
        }
    }

    fn notify(cb: &mut ModelCheckpoint, saved: &SavedCheckpoint, metrics: &BTreeMap<String, f64>) {
        let vocab = TokenVocab::default();
        let ctx = TrainContext {
            epoch: 0,
            global_step: saved.global_step,
            lr: 0.0,
            metrics,
            vocab: &vocab,
            root_dir: Path::new("."),
        };
        Callback::<B>::on_checkpoint_saved(cb, saved, &ctx).unwrap();
    }

    #[test_case("{}", 0 => true ; "defaults save every epoch")]
    #[test_case("every_n_epochs: 2", 0 => false ; "first of two epochs")]
    #[test_case("every_n_epochs: 2", 1 => true ; "second of two epochs")]
    #[test_case("every_n_train_steps: 10", 0 => false ; "step cadence only")]
    #[test_case("save_top_k: 0", 0 => false ; "disabled")]
    #[test_case("save_top_k: 0\nsave_last: true", 0 => true ; "last only")]
    fn test_epoch_trigger(yaml: &str, epoch: usize) -> bool {
        ModelCheckpoint::new(&section(yaml), PathBuf::new(), WeightPrecision::Fp32).saves_on_epoch(epoch)
    }

    #[test]
    fn test_step_trigger_skips_duplicates() {
        let mut cb = ModelCheckpoint::new(
            &section("every_n_train_steps: 5\nevery_n_epochs: 1"),
            PathBuf::new(),
            WeightPrecision::Fp32,
        );
        assert!(!cb.saves_on_step(0));
        assert!(!cb.saves_on_step(4));
        assert!(cb.saves_on_step(5));
        assert_eq!(cb.request(5), CallbackAction::Checkpoint);
        assert_eq!(cb.request(5), CallbackAction::Continue);
        assert_eq!(cb.request(6), CallbackAction::Checkpoint);
    }

    #[test]
    fn test_keeps_latest_without_monitor() {
        let dir = tempfile::tempdir().unwrap();
        let mut cb = ModelCheckpoint::new(
            &section("save_last: true"),
            dir.path().to_path_buf(),
            WeightPrecision::Fp32,
        );
        let metrics = BTreeMap::new();
        for step in [1, 2, 3] {
            let saved = fake_save(dir.path(), step, &metrics);
            notify(&mut cb, &saved, &metrics);
        }
        assert_eq!(cb.kept_tags(), vec!["3"]);
        let store = CheckpointStore::new(dir.path(), WeightPrecision::Fp32);
        assert_eq!(store.complete_tags(), vec!["3", "last"]);
        assert_eq!(store.read_state(LAST_TAG).unwrap().global_step, 3);
    }

    #[test]
    fn test_top_k_by_monitored_metric() {
        let dir = tempfile::tempdir().unwrap();
        let mut cb = ModelCheckpoint::new(
            &section("monitor: train_loss\nmode: min\nsave_top_k: 2"),
            dir.path().to_path_buf(),
            WeightPrecision::Fp32,
        );
        for (step, loss) in [(1, 0.9), (2, 0.3), (3, 0.5), (4, 0.7)] {
            let metrics = BTreeMap::from([("train_loss".to_string(), loss)]);
            let saved = fake_save(dir.path(), step, &metrics);
            notify(&mut cb, &saved, &metrics);
        }
        assert_eq!(cb.kept_tags(), vec!["2", "3"]);
        let store = CheckpointStore::new(dir.path(), WeightPrecision::Fp32);
        assert_eq!(store.complete_tags(), vec!["2", "3"]);
    }

    #[test]
    fn test_keep_all_and_keep_none() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = BTreeMap::new();
        let mut all = ModelCheckpoint::new(
            &section("save_top_k: -1"),
            dir.path().to_path_buf(),
            WeightPrecision::Fp32,
        );
        for step in [1, 2] {
            let saved = fake_save(dir.path(), step, &metrics);
            notify(&mut all, &saved, &metrics);
        }
        assert_eq!(all.kept_tags().len(), 2);

        let other = tempfile::tempdir().unwrap();
        let mut none = ModelCheckpoint::new(
            &section("save_top_k: 0\nsave_last: true"),
            other.path().to_path_buf(),
            WeightPrecision::Fp32,
        );
        let saved = fake_save(other.path(), 7, &metrics);
        notify(&mut none, &saved, &metrics);
        let store = CheckpointStore::new(other.path(), WeightPrecision::Fp32);
        assert_eq!(store.complete_tags(), vec!["last"]);
    }

    #[test]
    fn test_train_start_adopts_existing_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = BTreeMap::new();
        fake_save(dir.path(), 4, &metrics);
        fake_save(dir.path(), 8, &metrics);
        let mut cb = ModelCheckpoint::new(
            &section("save_top_k: 1"),
            dir.path().to_path_buf(),
            WeightPrecision::Fp32,
        );
        let vocab = TokenVocab::default();
        let ctx = TrainContext {
            epoch: 0,
            global_step: 8,
            lr: 0.0,
            metrics: &metrics,
            vocab: &vocab,
            root_dir: dir.path(),
        };
        Callback::<B>::on_train_start(&mut cb, &ctx).unwrap();
        let saved = fake_save(dir.path(), 12, &metrics);
        notify(&mut cb, &saved, &metrics);
        assert_eq!(cb.kept_tags(), vec!["12"]);
        assert!(!dir.path().join("model-4.mpk").exists());
    }
}
