use std::path::Path;

use burn::{config::Config, prelude::Backend};
use kiln_config::{ModelArch, WeightPrecision};
use tracing::{info, warn};

use crate::{Denoiser, DenoiserConfig, ModelError, TokenVocab, load_weights, save_weights};

pub const CONFIG_FILE: &str = "model.json";
pub const TOKENS_FILE: &str = "tokens.json";
/// Weight file stem; the recorder adds `.mpk`.
pub const WEIGHTS_STEM: &str = "model";

/// A model together with the metadata needed to rebuild it.
#[derive(Debug)]
pub struct LoadedModel<B: Backend> {
    pub model: Denoiser<B>,
    pub config: DenoiserConfig,
    pub vocab: TokenVocab,
}

/// Load a model directory, falling back to `arch` and `fallback_tokens` for
/// anything the directory does not provide.
pub fn load_model<B: Backend>(
    model_path: &Path,
    arch: &ModelArch,
    precision: WeightPrecision,
    fallback_tokens: impl FnOnce() -> Vec<String>,
    device: &B::Device,
) -> Result<LoadedModel<B>, ModelError> {
    if !model_path.exists() {
        warn!(
            "Model path {} does not exist, initializing a new model",
            model_path.display()
        );
    }

    let tokens_path = model_path.join(TOKENS_FILE);
    let vocab = if tokens_path.is_file() {
        TokenVocab::load(&tokens_path)?
    } else {
        TokenVocab::from_names(fallback_tokens())
    };

    let config_path = model_path.join(CONFIG_FILE);
    let config = if config_path.is_file() {
        DenoiserConfig::load(&config_path).map_err(|e| ModelError::Metadata {
            path: config_path.clone(),
            message: e.to_string(),
        })?
    } else {
        DenoiserConfig::from_arch(arch, vocab.len())
    };

    if config.vocab_size != vocab.len() {
        return Err(ModelError::VocabMismatch {
            expected: config.vocab_size,
            found: vocab.len(),
        });
    }

    let model = config.init::<B>(device);
    let weights = model_path.join(format!("{WEIGHTS_STEM}.mpk"));
    let model = if weights.is_file() {
        info!("Loading weights from {}", weights.display());
        load_weights(model, model_path.join(WEIGHTS_STEM), precision, device)?
    } else {
        info!("No weights in {}, using fresh initialization", model_path.display());
        model
    };

    Ok(LoadedModel {
        model,
        config,
        vocab,
    })
}

/// Write a model directory readable by [`load_model`].
pub fn save_model<B: Backend>(
    dir: &Path,
    model: Denoiser<B>,
    config: &DenoiserConfig,
    vocab: &TokenVocab,
    precision: WeightPrecision,
) -> Result<(), ModelError> {
    std::fs::create_dir_all(dir).map_err(|e| ModelError::io(dir, e))?;
    let mut config = config.clone();
    config.vocab_size = model.vocab_size();
    config
        .save(dir.join(CONFIG_FILE))
        .map_err(|e| ModelError::io(dir.join(CONFIG_FILE), e))?;
    vocab.save(&dir.join(TOKENS_FILE))?;
    save_weights(model, dir.join(WEIGHTS_STEM), precision)?;
    Ok(())
}
