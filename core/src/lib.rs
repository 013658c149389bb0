#![warn(clippy::pedantic)]
#![allow(
    clippy::similar_names,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::doc_markdown,
    clippy::default_trait_access,
    //
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap,
    //
    clippy::too_many_lines,
    clippy::type_complexity,
)]

//! kiln core
//!
//! This crate provides:
//! - `Denoiser` - conditional epsilon-prediction network
//! - `NoiseSchedule` - forward noising and the strided deterministic sampler
//! - `TokenVocab` - conditioning vocabulary
//! - backend aliases and model loading/saving

pub mod backend;
pub mod error;
pub mod load;
pub mod model;
pub mod record;
pub mod schedule;
pub mod vocab;

pub use backend::{ComputeBackend, Device, TrainingBackend, devices};
pub use error::ModelError;
pub use load::{LoadedModel, load_model, save_model};
pub use model::{Denoiser, DenoiserConfig, ResBlock};
pub use record::{load_weights, save_weights};
pub use schedule::{NoiseSchedule, seeded_noise};
pub use vocab::{TokenVocab, UNCONDITIONAL};
