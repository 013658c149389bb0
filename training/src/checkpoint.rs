//! Checkpoint files: `model-<tag>.mpk`, `optim-<tag>.mpk`,
//! `scheduler-<tag>.mpk` and `state-<tag>.json`.
//!
//! A checkpoint is complete only when all four files exist.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use burn::{
    lr_scheduler::LrScheduler,
    optim::Optimizer,
    record::{CompactRecorder, Recorder},
    tensor::backend::{AutodiffBackend, Backend},
};
use kiln_config::WeightPrecision;
use kiln_core::{Denoiser, load_weights, save_weights};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::TrainError;

/// Loop position and metrics stored next to the weights.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct TrainingState {
    /// Epoch the loop resumes at.
    pub epoch: usize,
    /// Optimizer steps taken.
    pub global_step: usize,
    /// Learning rate the run was using; restores tuned values.
    pub base_lr: f64,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

/// Files written for one checkpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct SavedCheckpoint {
    pub tag: String,
    pub epoch: usize,
    pub global_step: usize,
    pub files: Vec<PathBuf>,
}

/// Where to resume from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResumePoint {
    pub dir: PathBuf,
    pub tag: String,
}

#[derive(Clone, Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
    precision: WeightPrecision,
}

impl CheckpointStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, precision: WeightPrecision) -> Self {
        Self {
            dir: dir.into(),
            precision,
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn model_file(&self, tag: &str) -> PathBuf {
        self.dir.join(format!("model-{tag}.mpk"))
    }

    #[must_use]
    pub fn optim_file(&self, tag: &str) -> PathBuf {
        self.dir.join(format!("optim-{tag}.mpk"))
    }

    #[must_use]
    pub fn scheduler_file(&self, tag: &str) -> PathBuf {
        self.dir.join(format!("scheduler-{tag}.mpk"))
    }

    #[must_use]
    pub fn state_file(&self, tag: &str) -> PathBuf {
        self.dir.join(format!("state-{tag}.json"))
    }

    fn files(&self, tag: &str) -> [PathBuf; 4] {
        [
            self.model_file(tag),
            self.optim_file(tag),
            self.scheduler_file(tag),
            self.state_file(tag),
        ]
    }

    #[must_use]
    pub fn is_complete(&self, tag: &str) -> bool {
        self.files(tag).iter().all(|f| f.is_file())
    }

    pub fn save<B, O, S>(
        &self,
        tag: &str,
        model: &Denoiser<B>,
        optim: &O,
        scheduler: &S,
        state: &TrainingState,
    ) -> Result<SavedCheckpoint, TrainError>
    where
        B: AutodiffBackend,
        O: Optimizer<Denoiser<B>, B>,
        S: LrScheduler,
    {
        std::fs::create_dir_all(&self.dir).map_err(|e| TrainError::io(&self.dir, e))?;

        save_weights(
            model.clone(),
            self.dir.join(format!("model-{tag}")),
            self.precision,
        )?;
        Recorder::<B>::record(
            &CompactRecorder::new(),
            optim.to_record(),
            self.dir.join(format!("optim-{tag}")),
        )?;
        Recorder::<B>::record(
            &CompactRecorder::new(),
            scheduler.to_record::<B>(),
            self.dir.join(format!("scheduler-{tag}")),
        )?;

        let state_path = self.state_file(tag);
        let json = serde_json::to_string_pretty(state).map_err(|e| TrainError::State {
            path: state_path.clone(),
            message: e.to_string(),
        })?;
        std::fs::write(&state_path, json).map_err(|e| TrainError::io(&state_path, e))?;

        info!("Saved checkpoint {tag} at step {}", state.global_step);
        Ok(SavedCheckpoint {
            tag: tag.to_string(),
            epoch: state.epoch,
            global_step: state.global_step,
            files: self.files(tag).to_vec(),
        })
    }

    pub fn read_state(&self, tag: &str) -> Result<TrainingState, TrainError> {
        let path = self.state_file(tag);
        let json = std::fs::read_to_string(&path).map_err(|e| TrainError::io(&path, e))?;
        serde_json::from_str(&json).map_err(|e| TrainError::State {
            path,
            message: e.to_string(),
        })
    }

    /// Restore model weights, optimizer state and loop position.
    pub fn load<B, O>(
        &self,
        tag: &str,
        model: Denoiser<B>,
        optim: O,
        device: &B::Device,
    ) -> Result<(Denoiser<B>, O, TrainingState), TrainError>
    where
        B: AutodiffBackend,
        O: Optimizer<Denoiser<B>, B>,
    {
        if !self.is_complete(tag) {
            return Err(TrainError::IncompleteCheckpoint(self.model_file(tag)));
        }
        let model = load_weights(
            model,
            self.dir.join(format!("model-{tag}")),
            self.precision,
            device,
        )?;
        let record = Recorder::<B>::load(
            &CompactRecorder::new(),
            self.dir.join(format!("optim-{tag}")),
            device,
        )?;
        let optim = optim.load_record(record);
        let state = self.read_state(tag)?;
        Ok((model, optim, state))
    }

    /// Restore the learning-rate schedule position saved with `tag`.
    pub fn load_scheduler<B, S>(
        &self,
        tag: &str,
        scheduler: S,
        device: &B::Device,
    ) -> Result<S, TrainError>
    where
        B: Backend,
        S: LrScheduler,
    {
        let record = Recorder::<B>::load::<S::Record<B>>(
            &CompactRecorder::new(),
            self.dir.join(format!("scheduler-{tag}")),
            device,
        )?;
        Ok(scheduler.load_record::<B>(record))
    }

    pub fn remove(&self, tag: &str) {
        for file in self.files(tag) {
            if file.exists()
                && let Err(e) = std::fs::remove_file(&file)
            {
                warn!("Failed to remove {}: {e}", file.display());
            }
        }
    }

    /// Duplicate a complete checkpoint under another tag.
    pub fn copy(&self, from: &str, to: &str) -> Result<SavedCheckpoint, TrainError> {
        for (src, dst) in self.files(from).iter().zip(self.files(to)) {
            std::fs::copy(src, &dst).map_err(|e| TrainError::io(src, e))?;
        }
        let state = self.read_state(to)?;
        Ok(SavedCheckpoint {
            tag: to.to_string(),
            epoch: state.epoch,
            global_step: state.global_step,
            files: self.files(to).to_vec(),
        })
    }

    /// Tags of all complete checkpoints in the directory.
    #[must_use]
    pub fn complete_tags(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut tags: Vec<String> = entries
            .filter_map(Result::ok)
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                Some(name.strip_prefix("model-")?.strip_suffix(".mpk")?.to_string())
            })
            .filter(|tag| {
                let complete = self.is_complete(tag);
                if !complete {
                    warn!("Checkpoint {tag} is incomplete, skipping");
                }
                complete
            })
            .collect();
        tags.sort();
        tags
    }

    /// The complete checkpoint with the highest global step.
    #[must_use]
    pub fn find_latest_complete(&self) -> Option<String> {
        self.complete_tags()
            .into_iter()
            .filter_map(|tag| self.read_state(&tag).ok().map(|s| (s.global_step, tag)))
            .max()
            .map(|(_, tag)| tag)
    }
}

/// Interpret `--resume`: a checkpoint directory or a `model-<tag>.mpk` file.
pub fn resolve_resume(path: &Path) -> Result<ResumePoint, TrainError> {
    if path.is_dir() {
        let store = CheckpointStore::new(path, WeightPrecision::default());
        let tag = store
            .find_latest_complete()
            .ok_or_else(|| TrainError::NoCheckpoint(path.to_path_buf()))?;
        return Ok(ResumePoint {
            dir: path.to_path_buf(),
            tag,
        });
    }

    let tag = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_prefix("model-")?.strip_suffix(".mpk"))
        .ok_or_else(|| TrainError::NoCheckpoint(path.to_path_buf()))?
        .to_string();
    let dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
    let store = CheckpointStore::new(&dir, WeightPrecision::default());
    if !store.model_file(&tag).is_file() {
        return Err(TrainError::NoCheckpoint(path.to_path_buf()));
    }
    if !store.is_complete(&tag) {
        return Err(TrainError::IncompleteCheckpoint(path.to_path_buf()));
    }
    Ok(ResumePoint { dir, tag })
}
