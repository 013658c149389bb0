use std::sync::Arc;

use burn::{
    data::dataloader::batcher::Batcher,
    prelude::*,
    tensor::TensorData,
};
use kiln_core::{TokenVocab, UNCONDITIONAL};

use crate::ImageItem;

#[derive(Clone, Debug)]
pub struct DiffusionBatch<B: Backend> {
    /// `[batch, 3, resolution, resolution]`
    pub images: Tensor<B, 4>,
    /// `[batch]`
    pub tokens: Tensor<B, 1, Int>,
}

#[derive(Clone, Debug)]
pub struct DiffusionBatcher {
    vocab: Arc<TokenVocab>,
    resolution: usize,
}

impl DiffusionBatcher {
    #[must_use]
    pub fn new(vocab: Arc<TokenVocab>, resolution: usize) -> Self {
        Self { vocab, resolution }
    }
}

impl<B: Backend> Batcher<B, ImageItem, DiffusionBatch<B>> for DiffusionBatcher {
    fn batch(&self, items: Vec<ImageItem>, device: &B::Device) -> DiffusionBatch<B> {
        let n = items.len();
        let r = self.resolution;
        let mut pixels = Vec::with_capacity(n * 3 * r * r);
        let mut tokens = Vec::with_capacity(n);
        for item in items {
            pixels.extend(item.pixels);
            let id = item
                .class
                .as_deref()
                .map_or(UNCONDITIONAL, |c| self.vocab.encode(c));
            tokens.push(id as i64);
        }

        DiffusionBatch {
            images: Tensor::from_data(TensorData::new(pixels, [n, 3, r, r]), device),
            tokens: Tensor::from_data(TensorData::new(tokens, [n]), device),
        }
    }
}
