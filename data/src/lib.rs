//! kiln data - image loading and batching
//!
//! This crate provides:
//! - `ImageFolderDataset` - images under a directory, class = first sub-directory
//! - `ShardDataset` - per-rank views for data-parallel training
//! - `DiffusionBatcher` - batches of normalized images and token ids

pub mod batcher;
pub mod dataset;
pub mod error;
pub mod shard;
pub mod transform;

pub use batcher::{DiffusionBatch, DiffusionBatcher};
pub use dataset::{ImageFolderDataset, ImageItem};
pub use error::DataError;
pub use shard::{ShardDataset, ShardMode};
pub use transform::{image_to_chw, tensor_to_images};
