use std::ops::Range;

use burn::{
    config::Config,
    module::{Module, Param},
    nn::{
        Embedding, EmbeddingConfig, GroupNorm, GroupNormConfig, Linear, LinearConfig,
        PaddingConfig2d,
        conv::{Conv2d, Conv2dConfig},
        loss::{MseLoss, Reduction},
    },
    prelude::Backend,
    tensor::{Distribution, Int, Tensor, activation::silu},
};
use kiln_config::ModelArch;

use crate::NoiseSchedule;

#[derive(Config, Debug)]
pub struct DenoiserConfig {
    /// Number of conditioning tokens, including the unconditional row.
    pub vocab_size: usize,
    #[config(default = 3)]
    pub channels: usize,
    #[config(default = 64)]
    pub base_channels: usize,
    #[config(default = 128)]
    pub time_embed_dim: usize,
    #[config(default = 4)]
    pub num_blocks: usize,
    #[config(default = 8)]
    pub norm_groups: usize,
    #[config(default = 1000)]
    pub train_timesteps: usize,
}

impl DenoiserConfig {
    #[must_use]
    pub fn from_arch(arch: &ModelArch, vocab_size: usize) -> Self {
        Self::new(vocab_size)
            .with_base_channels(arch.base_channels)
            .with_time_embed_dim(arch.time_embed_dim)
            .with_num_blocks(arch.num_blocks)
            .with_norm_groups(arch.norm_groups)
            .with_train_timesteps(arch.train_timesteps)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Denoiser<B> {
        let conv = |c_in: usize, c_out: usize| {
            Conv2dConfig::new([c_in, c_out], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };

        Denoiser {
            conv_in: conv(self.channels, self.base_channels),
            time_in: LinearConfig::new(self.time_embed_dim, self.time_embed_dim).init(device),
            time_out: LinearConfig::new(self.time_embed_dim, self.time_embed_dim).init(device),
            tokens: EmbeddingConfig::new(self.vocab_size, self.time_embed_dim).init(device),
            blocks: (0..self.num_blocks)
                .map(|_| ResBlock {
                    norm1: GroupNormConfig::new(self.norm_groups, self.base_channels).init(device),
                    conv1: conv(self.base_channels, self.base_channels),
                    time_proj: LinearConfig::new(self.time_embed_dim, self.base_channels)
                        .init(device),
                    norm2: GroupNormConfig::new(self.norm_groups, self.base_channels).init(device),
                    conv2: conv(self.base_channels, self.base_channels),
                })
                .collect(),
            norm_out: GroupNormConfig::new(self.norm_groups, self.base_channels).init(device),
            conv_out: conv(self.base_channels, self.channels),
            time_embed_dim: self.time_embed_dim,
        }
    }

    #[must_use]
    pub fn schedule(&self) -> NoiseSchedule {
        NoiseSchedule::linear(self.train_timesteps)
    }
}

/// Pre-norm residual block conditioned on the time/token embedding.
#[derive(Module, Debug)]
pub struct ResBlock<B: Backend> {
    norm1: GroupNorm<B>,
    conv1: Conv2d<B>,
    time_proj: Linear<B>,
    norm2: GroupNorm<B>,
    conv2: Conv2d<B>,
}

impl<B: Backend> ResBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>, emb: Tensor<B, 2>) -> Tensor<B, 4> {
        let [batch, channels, _, _] = x.dims();
        let h = self.conv1.forward(silu(self.norm1.forward(x.clone())));
        let t = self
            .time_proj
            .forward(silu(emb))
            .reshape([batch, channels, 1, 1]);
        let h = self.conv2.forward(silu(self.norm2.forward(h + t)));
        x + h
    }
}

/// Conditional noise-prediction network.
#[derive(Module, Debug)]
pub struct Denoiser<B: Backend> {
    conv_in: Conv2d<B>,
    time_in: Linear<B>,
    time_out: Linear<B>,
    pub tokens: Embedding<B>,
    blocks: Vec<ResBlock<B>>,
    norm_out: GroupNorm<B>,
    conv_out: Conv2d<B>,
    time_embed_dim: usize,
}

/// Sinusoidal embedding of integer timesteps: `[batch] -> [batch, dim]`.
pub fn timestep_embedding<B: Backend>(timesteps: Tensor<B, 1, Int>, dim: usize) -> Tensor<B, 2> {
    let device = timesteps.device();
    let half = dim / 2;
    let freqs = Tensor::<B, 1, Int>::arange(0..half as i64, &device)
        .float()
        .mul_scalar(-(10_000f64.ln()) / half as f64)
        .exp();
    let args = timesteps.float().unsqueeze_dim::<2>(1) * freqs.unsqueeze_dim::<2>(0);
    let emb = Tensor::cat(vec![args.clone().sin(), args.cos()], 1);
    if dim % 2 == 1 {
        let [batch, _] = emb.dims();
        Tensor::cat(vec![emb, Tensor::zeros([batch, 1], &device)], 1)
    } else {
        emb
    }
}

impl<B: Backend> Denoiser<B> {
    /// Predict the noise in `x` at `timesteps`, conditioned on `tokens`.
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
        timesteps: Tensor<B, 1, Int>,
        tokens: Tensor<B, 1, Int>,
    ) -> Tensor<B, 4> {
        let [batch] = tokens.dims();
        let temb = timestep_embedding(timesteps, self.time_embed_dim);
        let temb = self.time_out.forward(silu(self.time_in.forward(temb)));
        let cond = self
            .tokens
            .forward(tokens.unsqueeze_dim(1))
            .reshape([batch, self.time_embed_dim]);
        let emb = temb + cond;

        let mut h = self.conv_in.forward(x);
        for block in &self.blocks {
            h = block.forward(h, emb.clone());
        }
        self.conv_out.forward(silu(self.norm_out.forward(h)))
    }

    /// Epsilon-prediction MSE on randomly noised `images`.
    pub fn forward_loss(
        &self,
        images: Tensor<B, 4>,
        tokens: Tensor<B, 1, Int>,
        schedule: &NoiseSchedule,
    ) -> Tensor<B, 1> {
        let device = images.device();
        let [batch, _, _, _] = images.dims();
        let noise = Tensor::random(images.shape(), Distribution::Normal(0.0, 1.0), &device);
        let timesteps = schedule.sample_timesteps::<B>(batch, &device);
        let noisy = schedule.add_noise(images, noise.clone(), timesteps.clone());
        let pred = self.forward(noisy, timesteps, tokens);
        MseLoss::new().forward(pred, noise, Reduction::Mean)
    }

    /// Denoise `noise` (`[n, channels, h, w]`) into images in `[-1, 1]`.
    pub fn sample(
        &self,
        schedule: &NoiseSchedule,
        tokens: Tensor<B, 1, Int>,
        noise: Tensor<B, 4>,
        steps: usize,
    ) -> Tensor<B, 4> {
        let device = tokens.device();
        let [n] = tokens.dims();
        let mut x = noise;
        let timesteps = schedule.sampling_timesteps(steps);
        for (i, &t) in timesteps.iter().enumerate() {
            let t_batch = Tensor::<B, 1, Int>::full([n], t as i64, &device);
            let eps = self.forward(x.clone(), t_batch, tokens.clone());
            x = schedule.step(x, eps, t, timesteps.get(i + 1).copied());
        }
        x.clamp(-1.0, 1.0)
    }

    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.tokens.weight.dims()[0]
    }

    /// Append `count` token rows, copied from `init_from` or freshly drawn.
    #[must_use]
    pub fn with_extra_tokens(mut self, count: usize, init_from: Option<usize>) -> Self {
        let weight = self.tokens.weight.val();
        let device = weight.device();
        let [rows, dim] = weight.dims();
        let extra = match init_from {
            Some(row) => weight
                .clone()
                .slice([row..row + 1])
                .repeat_dim(0, count),
            None => Tensor::random([count, dim], Distribution::Normal(0.0, 0.02), &device),
        };
        let extended = Tensor::cat(vec![weight.slice([0..rows]), extra], 0).detach();
        self.tokens.weight = Param::from_tensor(extended);
        self
    }

    /// Leave only the token embedding trainable.
    #[must_use]
    pub fn freeze_except_tokens(self) -> Self {
        let mut model = self.no_grad();
        model.tokens.weight = model.tokens.weight.set_require_grad(true);
        model
    }

    /// Overwrite every token row outside `trainable` with `reference`.
    #[must_use]
    pub fn restore_token_rows(mut self, reference: Tensor<B, 2>, trainable: Range<usize>) -> Self {
        let [rows, _] = reference.dims();
        debug_assert_eq!(trainable.end, self.vocab_size());
        debug_assert_eq!(trainable.start, rows);
        self.tokens.weight = self.tokens.weight.map(|w| {
            let learned = w.slice([trainable.clone()]).detach();
            Tensor::cat(vec![reference.clone(), learned], 0)
                .detach()
                .require_grad()
        });
        self
    }
}

#[cfg(all(test, feature = "ndarray"))]
mod tests {
    use burn::backend::{Autodiff, NdArray};

    use super::*;

    type B = NdArray<f32>;

    fn tiny() -> DenoiserConfig {
        DenoiserConfig::new(3)
            .with_base_channels(8)
            .with_time_embed_dim(16)
            .with_num_blocks(1)
            .with_norm_groups(4)
            .with_train_timesteps(50)
    }

    #[test]
    fn test_forward_shape() {
        let device = Default::default();
        let model = tiny().init::<B>(&device);
        let x = Tensor::<B, 4>::zeros([2, 3, 8, 8], &device);
        let t = Tensor::<B, 1, Int>::from_ints([3, 7], &device);
        let tokens = Tensor::<B, 1, Int>::from_ints([0, 2], &device);
        assert_eq!(model.forward(x, t, tokens).dims(), [2, 3, 8, 8]);
    }

    #[test]
    fn test_timestep_embedding_shape() {
        let device = Default::default();
        let t = Tensor::<B, 1, Int>::from_ints([0, 10, 20], &device);
        assert_eq!(timestep_embedding(t.clone(), 16).dims(), [3, 16]);
        assert_eq!(timestep_embedding(t, 15).dims(), [3, 15]);
    }

    #[test]
    fn test_sample_range() {
        let device = Default::default();
        let config = tiny();
        let model = config.init::<B>(&device);
        let tokens = Tensor::<B, 1, Int>::from_ints([1], &device);
        let noise = crate::schedule::seeded_noise::<B>([1, 3, 4, 4], 0, &device);
        let images = model.sample(&config.schedule(), tokens, noise, 3);
        assert_eq!(images.dims(), [1, 3, 4, 4]);
        let max: f32 = images.abs().max().into_scalar();
        assert!(max <= 1.0);
    }

    #[test]
    fn test_loss_backward() {
        let device = Default::default();
        let config = tiny();
        let model = config.init::<Autodiff<B>>(&device);
        let images = Tensor::<Autodiff<B>, 4>::zeros([2, 3, 4, 4], &device);
        let tokens = Tensor::<Autodiff<B>, 1, Int>::from_ints([0, 1], &device);
        let loss = model.forward_loss(images, tokens, &config.schedule());
        let value: f32 = loss.clone().into_scalar();
        assert!(value.is_finite());
        let grads = loss.backward();
        assert!(model.tokens.weight.grad(&grads).is_some());
    }

    #[test]
    fn test_extra_tokens_copy_init_row() {
        let device = Default::default();
        let model = tiny().init::<B>(&device).with_extra_tokens(2, Some(1));
        assert_eq!(model.vocab_size(), 5);
        let weight = model.tokens.weight.val();
        let src = weight.clone().slice([1..2]);
        let copy = weight.slice([4..5]);
        let diff: f32 = (src - copy).abs().sum().into_scalar();
        assert!(diff < 1e-9);
    }

    #[test]
    fn test_extended_tokens_train_under_autodiff() {
        type AB = Autodiff<B>;
        let device = Default::default();
        let config = tiny();
        let model = config
            .init::<AB>(&device)
            .with_extra_tokens(1, Some(2))
            .freeze_except_tokens();
        assert_eq!(model.vocab_size(), 4);

        let images = Tensor::<AB, 4>::zeros([2, 3, 4, 4], &device);
        let tokens = Tensor::<AB, 1, Int>::from_ints([3, 1], &device);
        let grads = model
            .forward_loss(images, tokens, &config.schedule())
            .backward();
        assert!(model.tokens.weight.grad(&grads).is_some());
        assert!(model.conv_in.weight.grad(&grads).is_none());

        let reference = model.tokens.weight.val().slice([0..3]).detach();
        let model = model.restore_token_rows(reference, 3..4);
        assert!(model.tokens.weight.val().is_require_grad());
    }

    #[test]
    fn test_restore_token_rows() {
        let device = Default::default();
        let model = tiny().init::<B>(&device).with_extra_tokens(1, None);
        let zeroed = Tensor::<B, 2>::zeros([3, 16], &device);
        let model = model.restore_token_rows(zeroed, 3..4);
        let head: f32 = model.tokens.weight.val().slice([0..3]).abs().sum().into_scalar();
        assert!(head < 1e-9);
        let tail = model.tokens.weight.val().slice([3..4]);
        assert_eq!(tail.dims(), [1, 16]);
    }
}
