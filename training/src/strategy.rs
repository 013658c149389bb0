//! Distributed execution mode selection.

use kiln_config::{Accelerator, RunConfig};

/// How training is spread over devices or peers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// One model on one device.
    SingleDevice,
    /// Data-parallel replicas, one per configured device.
    Ddp { find_unused_parameters: bool },
    /// Accumulate locally until `target_batch_size` samples, then step.
    Collaborative { target_batch_size: usize },
}

impl Strategy {
    /// Pick the strategy for `config`, turning off the sampler replacement
    /// when DDP is selected.
    pub fn select(config: &mut RunConfig) -> Self {
        let tune = config.tune_requested();
        let mut strategy = Self::SingleDevice;

        if matches!(
            config.lightning.accelerator,
            Accelerator::Gpu | Accelerator::Cpu
        ) && !tune
        {
            strategy = Self::Ddp {
                find_unused_parameters: false,
            };
            config.lightning.replace_sampler_ddp = false;
        }

        if config.trainer.use_hivemind {
            strategy = Self::Collaborative {
                target_batch_size: config.hivemind_settings().target_batch_size,
            };
        }

        strategy
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::SingleDevice => "single_device",
            Self::Ddp {
                find_unused_parameters: false,
            } => "ddp_find_unused_parameters_false",
            Self::Ddp {
                find_unused_parameters: true,
            } => "ddp",
            Self::Collaborative { .. } => "collaborative",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
