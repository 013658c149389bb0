#![warn(clippy::pedantic)]
#![allow(
    clippy::too_many_arguments,
    clippy::similar_names,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::doc_markdown,
    clippy::default_trait_access,
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap,
    clippy::too_many_lines,
    clippy::type_complexity
)]

pub mod callbacks;
pub mod checkpoint;
pub mod error;
pub mod launch;
pub mod logger;
pub mod scheduler;
pub mod strategy;
pub mod trainer;
pub mod tuner;

pub use callbacks::{
    Callback, CallbackAction, CallbackSet, CustomEmbeddings, HfHubClient, HubCallback, HubClient,
    HubError, LearningRateMonitor, ModelCheckpoint, SamplingCallback, TrainContext,
    build_callbacks,
};
pub use checkpoint::{CheckpointStore, ResumePoint, SavedCheckpoint, TrainingState, resolve_resume};
pub use error::TrainError;
pub use launch::{LaunchOptions, LaunchOutcome, launch};
pub use logger::{CsvLogger, MetricLogger, ProjectLogger, SharedLogger};
pub use scheduler::WarmupSchedule;
pub use strategy::Strategy;
pub use trainer::{BatchLoader, FINAL_MODEL_DIR, FitSummary, Trainer};
pub use tuner::{TuneResult, suggest_lr};
