use std::{
    collections::BTreeMap,
    ops::Range,
    path::{Path, PathBuf},
};

use burn::{prelude::*, tensor::backend::AutodiffBackend};
use kiln_config::CustomEmbeddingsSection;
use kiln_core::{Denoiser, ModelError, TokenVocab};
use tracing::info;

use super::{Callback, CallbackAction, TrainContext};
use crate::TrainError;

pub const EMBEDDINGS_FILE: &str = "learned_embeds.json";

/// Learns new conditioning tokens, optionally with the rest of the model frozen.
pub struct CustomEmbeddings<B: Backend> {
    tokens: Vec<String>,
    init_from: Option<String>,
    freeze_model: bool,
    save_every_n_steps: Option<usize>,
    output_dir: PathBuf,
    trainable: Range<usize>,
    reference: Option<Tensor<B, 2>>,
}

impl<B: Backend> CustomEmbeddings<B> {
    #[must_use]
    pub fn new(section: &CustomEmbeddingsSection, root_dir: &Path) -> Self {
        Self {
            tokens: section.tokens.clone(),
            init_from: section.init_from.clone(),
            freeze_model: section.freeze_model,
            save_every_n_steps: section.save_every_n_steps.filter(|n| *n > 0),
            output_dir: section
                .output_dir
                .clone()
                .unwrap_or_else(|| root_dir.join("embeddings")),
            trainable: 0..0,
            reference: None,
        }
    }

    #[must_use]
    pub fn trainable_rows(&self) -> Range<usize> {
        self.trainable.clone()
    }

    fn export(&self, model: &Denoiser<B>, path: &Path) -> Result<(), TrainError> {
        let [_, dim] = model.tokens.weight.dims();
        let values = model
            .tokens
            .weight
            .val()
            .slice([self.trainable.clone()])
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| TrainError::Callback(format!("cannot read embeddings: {e:?}")))?;
        let embeds: BTreeMap<&str, &[f32]> = self
            .tokens
            .iter()
            .map(String::as_str)
            .zip(values.chunks(dim))
            .collect();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TrainError::io(parent, e))?;
        }
        let json = serde_json::to_string_pretty(&embeds).map_err(|e| TrainError::State {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        std::fs::write(path, json).map_err(|e| TrainError::io(path, e))?;
        info!("Saved {} embeddings to {}", self.tokens.len(), path.display());
        Ok(())
    }

    /// Rows of `tokens` when they already sit at the end of `vocab`.
    fn existing_rows(&self, vocab: &TokenVocab) -> Result<Option<Range<usize>>, ModelError> {
        let ids: Vec<usize> = self.tokens.iter().filter_map(|t| vocab.id(t)).collect();
        if ids.is_empty() {
            return Ok(None);
        }
        if ids.len() == self.tokens.len() {
            let tail = vocab.len() - ids.len()..vocab.len();
            if ids.iter().copied().eq(tail.clone()) {
                return Ok(Some(tail));
            }
        }
        let duplicate = self
            .tokens
            .iter()
            .find(|t| vocab.id(t).is_some())
            .cloned()
            .unwrap_or_default();
        Err(ModelError::DuplicateToken(duplicate))
    }
}

impl<B: AutodiffBackend> Callback<B> for CustomEmbeddings<B> {
    fn name(&self) -> &'static str {
        "custom_embeddings"
    }

    fn setup(
        &mut self,
        model: Denoiser<B>,
        vocab: &mut TokenVocab,
    ) -> Result<Denoiser<B>, TrainError> {
        let init_from = match &self.init_from {
            Some(token) => Some(
                vocab
                    .id(token)
                    .ok_or_else(|| ModelError::UnknownToken(token.clone()))?,
            ),
            None => None,
        };

        let mut model = model;
        self.trainable = if let Some(rows) = self.existing_rows(vocab)? {
            info!("Continuing training of {} existing tokens", rows.len());
            rows
        } else {
            let rows = vocab.extend(&self.tokens)?;
            model = model.with_extra_tokens(rows.len(), init_from);
            info!(
                "Added tokens {:?} at rows {}..{}",
                self.tokens, rows.start, rows.end
            );
            rows
        };

        if self.freeze_model {
            model = model.freeze_except_tokens();
            self.reference = Some(
                model
                    .tokens
                    .weight
                    .val()
                    .slice([0..self.trainable.start])
                    .detach(),
            );
        }
        Ok(model)
    }

    fn on_after_optimizer_step(&mut self, model: Denoiser<B>, _ctx: &TrainContext<'_>) -> Denoiser<B> {
        match &self.reference {
            Some(reference) => model.restore_token_rows(reference.clone(), self.trainable.clone()),
            None => model,
        }
    }

    fn on_train_batch_end(
        &mut self,
        model: &Denoiser<B>,
        ctx: &TrainContext<'_>,
    ) -> Result<CallbackAction, TrainError> {
        if self
            .save_every_n_steps
            .is_some_and(|n| ctx.global_step % n == 0)
        {
            let path = self
                .output_dir
                .join(format!("learned_embeds-step-{}.json", ctx.global_step));
            self.export(model, &path)?;
        }
        Ok(CallbackAction::Continue)
    }

    fn on_train_end(
        &mut self,
        model: &Denoiser<B>,
        final_dir: &Path,
        _ctx: &TrainContext<'_>,
    ) -> Result<(), TrainError> {
        self.export(model, &self.output_dir.join(EMBEDDINGS_FILE))?;
        self.export(model, &final_dir.join(EMBEDDINGS_FILE))
    }
}

#[cfg(test)]
mod tests {
    use burn::{
        backend::{Autodiff, NdArray},
        optim::{AdamWConfig, GradientsParams, Optimizer},
    };
    use kiln_core::{DenoiserConfig, NoiseSchedule};

    use super::*;

    type B = Autodiff<NdArray<f32>>;

    fn section(yaml: &str) -> CustomEmbeddingsSection {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn model(vocab: usize) -> Denoiser<B> {
        DenoiserConfig::new(vocab)
            .with_base_channels(4)
            .with_time_embed_dim(4)
            .with_num_blocks(1)
            .with_norm_groups(2)
            .with_train_timesteps(10)
            .init::<B>(&Default::default())
    }

    fn row_values(weight: Tensor<B, 2>, rows: Range<usize>) -> Vec<f32> {
        weight.slice([rows]).into_data().to_vec::<f32>().unwrap()
    }

    fn ctx<'a>(
        step: usize,
        metrics: &'a BTreeMap<String, f64>,
        vocab: &'a TokenVocab,
        root: &'a Path,
    ) -> TrainContext<'a> {
        TrainContext {
            epoch: 0,
            global_step: step,
            lr: 0.1,
            metrics,
            vocab,
            root_dir: root,
        }
    }

    #[test]
    fn test_setup_extends_vocab_and_model() {
        let dir = tempfile::tempdir().unwrap();
        let mut vocab = TokenVocab::from_names(["cat"]);
        let mut cb = CustomEmbeddings::<B>::new(
            &section("enabled: true\ntokens: ['<a>', '<b>']\ninit_from: cat"),
            dir.path(),
        );
        let m = cb.setup(model(vocab.len()), &mut vocab).unwrap();
        assert_eq!(vocab.len(), 4);
        assert_eq!(m.vocab_size(), 4);
        assert_eq!(cb.trainable_rows(), 2..4);

        let rows = m.tokens.weight.val();
        assert_eq!(row_values(rows.clone(), 1..2), row_values(rows, 3..4));
    }

    #[test]
    fn test_unknown_init_token() {
        let dir = tempfile::tempdir().unwrap();
        let mut vocab = TokenVocab::default();
        let mut cb = CustomEmbeddings::<B>::new(
            &section("enabled: true\ntokens: ['<a>']\ninit_from: missing"),
            dir.path(),
        );
        assert!(matches!(
            cb.setup(model(1), &mut vocab),
            Err(TrainError::Model(ModelError::UnknownToken(_)))
        ));
    }

    #[test]
    fn test_reuses_trailing_tokens_and_rejects_partial_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let mut vocab = TokenVocab::from_names(["cat", "<a>"]);
        let mut cb = CustomEmbeddings::<B>::new(&section("tokens: ['<a>']"), dir.path());
        let m = cb.setup(model(3), &mut vocab).unwrap();
        assert_eq!(m.vocab_size(), 3);
        assert_eq!(cb.trainable_rows(), 2..3);

        let mut vocab = TokenVocab::from_names(["<a>", "cat"]);
        let mut cb = CustomEmbeddings::<B>::new(&section("tokens: ['<a>', '<b>']"), dir.path());
        assert!(matches!(
            cb.setup(model(3), &mut vocab),
            Err(TrainError::Model(ModelError::DuplicateToken(_)))
        ));
    }

    #[test]
    fn test_frozen_rows_survive_optimizer_step() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let mut vocab = TokenVocab::from_names(["cat"]);
        let mut cb = CustomEmbeddings::<B>::new(
            &section("tokens: ['<a>']\nsave_every_n_steps: 1"),
            dir.path(),
        );
        let m = cb.setup(model(vocab.len()), &mut vocab).unwrap();
        let before = row_values(m.tokens.weight.val(), 0..2);
        let before_new = row_values(m.tokens.weight.val(), 2..3);

        let mut optim = AdamWConfig::new()
            .with_weight_decay(0.5)
            .init::<B, Denoiser<B>>();
        let schedule = NoiseSchedule::linear(10);
        let images = Tensor::<B, 4>::ones([2, 3, 4, 4], &device);
        let tokens = Tensor::<B, 1, Int>::from_ints([2, 1], &device);
        let loss = m.forward_loss(images, tokens, &schedule);
        let grads = GradientsParams::from_grads(loss.backward(), &m);
        let m = optim.step(0.1, m, grads);

        let metrics = BTreeMap::new();
        let context = ctx(1, &metrics, &vocab, dir.path());
        let m = cb.on_after_optimizer_step(m, &context);
        assert_eq!(row_values(m.tokens.weight.val(), 0..2), before);
        assert_ne!(row_values(m.tokens.weight.val(), 2..3), before_new);

        cb.on_train_batch_end(&m, &context).unwrap();
        let step_file = dir.path().join("embeddings/learned_embeds-step-1.json");
        let json: BTreeMap<String, Vec<f32>> =
            serde_json::from_str(&std::fs::read_to_string(step_file).unwrap()).unwrap();
        assert_eq!(json["<a>"].len(), 4);

        let final_dir = dir.path().join("model");
        cb.on_train_end(&m, &final_dir, &context).unwrap();
        assert!(final_dir.join(EMBEDDINGS_FILE).is_file());
        assert!(dir.path().join("embeddings").join(EMBEDDINGS_FILE).is_file());
    }
}
