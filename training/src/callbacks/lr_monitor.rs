use burn::tensor::backend::AutodiffBackend;
use kiln_core::Denoiser;

use super::{Callback, CallbackAction, TrainContext};
use crate::{SharedLogger, TrainError};

/// Metric key, named after the optimizer.
pub const LR_KEY: &str = "lr-AdamW";

/// Logs the learning rate after every optimizer step.
pub struct LearningRateMonitor {
    logger: SharedLogger,
}

impl LearningRateMonitor {
    #[must_use]
    pub fn new(logger: SharedLogger) -> Self {
        Self { logger }
    }
}

impl<B: AutodiffBackend> Callback<B> for LearningRateMonitor {
    fn name(&self) -> &'static str {
        "lr_monitor"
    }

    fn on_train_batch_end(
        &mut self,
        _model: &Denoiser<B>,
        ctx: &TrainContext<'_>,
    ) -> Result<CallbackAction, TrainError> {
        self.logger.log_metrics(ctx.global_step, &[(LR_KEY, ctx.lr)]);
        Ok(CallbackAction::Continue)
    }
}
