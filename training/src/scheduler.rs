use burn::{
    lr_scheduler::{
        LrScheduler,
        linear::{LinearLrScheduler, LinearLrSchedulerConfig},
    },
    tensor::backend::Backend,
};

use crate::TrainError;

/// Linear warmup to `base_lr` over `warmup_steps` optimizer steps, then constant.
///
/// The ramp is burn's linear scheduler; the record is the number of steps
/// taken, so a resumed run continues where the ramp stopped.
#[derive(Clone)]
pub struct WarmupSchedule {
    base_lr: f64,
    warmup_steps: usize,
    ramp: Option<LinearLrScheduler>,
    steps: usize,
}

impl WarmupSchedule {
    pub fn new(base_lr: f64, warmup_steps: usize) -> Result<Self, TrainError> {
        Ok(Self {
            base_lr,
            warmup_steps,
            ramp: Self::ramp(base_lr, warmup_steps)?,
            steps: 0,
        })
    }

    fn ramp(base_lr: f64, warmup_steps: usize) -> Result<Option<LinearLrScheduler>, TrainError> {
        if warmup_steps < 2 {
            return Ok(None);
        }
        LinearLrSchedulerConfig::new(base_lr / warmup_steps as f64, base_lr, warmup_steps - 1)
            .init()
            .map(Some)
            .map_err(|e| TrainError::Schedule(e.to_string()))
    }

    #[must_use]
    pub fn base_lr(&self) -> f64 {
        self.base_lr
    }

    /// Optimizer steps this schedule has produced rates for.
    #[must_use]
    pub fn steps(&self) -> usize {
        self.steps
    }
}

impl LrScheduler for WarmupSchedule {
    type Record<B: Backend> = usize;

    fn step(&mut self) -> f64 {
        self.steps += 1;
        match self.ramp.as_mut() {
            Some(ramp) if self.steps <= self.warmup_steps => ramp.step(),
            _ => self.base_lr,
        }
    }

    fn to_record<B: Backend>(&self) -> Self::Record<B> {
        self.steps
    }

    fn load_record<B: Backend>(mut self, record: Self::Record<B>) -> Self {
        self.steps = 0;
        for _ in 0..record.min(self.warmup_steps) {
            LrScheduler::step(&mut self);
        }
        self.steps = record;
        self
    }
}
