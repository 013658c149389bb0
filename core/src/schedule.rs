//! Linear-beta noise schedule and the deterministic strided sampler step.

use burn::{
    prelude::Backend,
    tensor::{Distribution, Int, Tensor, TensorData},
};
use rand::{Rng, SeedableRng, rngs::StdRng};

const BETA_START: f64 = 1e-4;
const BETA_END: f64 = 0.02;

#[derive(Clone, Debug)]
pub struct NoiseSchedule {
    alphas_cumprod: Vec<f32>,
}

impl NoiseSchedule {
    #[must_use]
    pub fn linear(timesteps: usize) -> Self {
        let timesteps = timesteps.max(1);
        let step = if timesteps > 1 {
            (BETA_END - BETA_START) / (timesteps - 1) as f64
        } else {
            0.0
        };
        let mut product = 1.0f64;
        let alphas_cumprod = (0..timesteps)
            .map(|i| {
                product *= 1.0 - (BETA_START + step * i as f64);
                product as f32
            })
            .collect();
        Self { alphas_cumprod }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.alphas_cumprod.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.alphas_cumprod.is_empty()
    }

    #[must_use]
    pub fn alpha_cumprod(&self, t: usize) -> f32 {
        self.alphas_cumprod[t.min(self.len() - 1)]
    }

    /// Uniformly drawn training timesteps.
    pub fn sample_timesteps<B: Backend>(&self, batch: usize, device: &B::Device) -> Tensor<B, 1, Int> {
        Tensor::<B, 1>::random([batch], Distribution::Uniform(0.0, self.len() as f64), device)
            .int()
            .clamp(0, self.len() as i64 - 1)
    }

    /// `sqrt(a_t) * x0 + sqrt(1 - a_t) * noise`, per-sample `t`.
    pub fn add_noise<B: Backend>(
        &self,
        x0: Tensor<B, 4>,
        noise: Tensor<B, 4>,
        timesteps: Tensor<B, 1, Int>,
    ) -> Tensor<B, 4> {
        let device = x0.device();
        let [batch] = timesteps.dims();
        let table = Tensor::<B, 1>::from_data(
            TensorData::new(self.alphas_cumprod.clone(), [self.len()]),
            &device,
        );
        let alpha = table.select(0, timesteps).reshape([batch, 1, 1, 1]);
        let signal = alpha.clone().sqrt();
        let sigma = alpha.neg().add_scalar(1.0).sqrt();
        x0 * signal + noise * sigma
    }

    /// Descending timesteps visited by a sampler with `steps` steps.
    #[must_use]
    pub fn sampling_timesteps(&self, steps: usize) -> Vec<usize> {
        let steps = steps.clamp(1, self.len());
        let stride = self.len() / steps;
        (0..steps).map(|i| i * stride).rev().collect()
    }

    /// One deterministic update from `t` to `prev` (`None` means the clean image).
    pub fn step<B: Backend>(
        &self,
        x_t: Tensor<B, 4>,
        eps: Tensor<B, 4>,
        t: usize,
        prev: Option<usize>,
    ) -> Tensor<B, 4> {
        let a_t = self.alpha_cumprod(t);
        let a_prev = prev.map_or(1.0, |p| self.alpha_cumprod(p));

        let x0 = (x_t - eps.clone().mul_scalar((1.0 - a_t).sqrt()))
            .div_scalar(a_t.sqrt())
            .clamp(-1.0, 1.0);
        x0.mul_scalar(a_prev.sqrt()) + eps.mul_scalar((1.0 - a_prev).sqrt())
    }
}

/// Standard normal noise from a private generator, leaving the backend RNG untouched.
pub fn seeded_noise<B: Backend>(shape: [usize; 4], seed: u64, device: &B::Device) -> Tensor<B, 4> {
    let mut rng = StdRng::seed_from_u64(seed);
    let len: usize = shape.iter().product();
    let mut values = Vec::with_capacity(len + 1);
    while values.len() < len {
        // Box-Muller
        let u1: f32 = rng.r#gen::<f32>().max(f32::MIN_POSITIVE);
        let u2: f32 = rng.r#gen();
        let r = (-2.0 * u1.ln()).sqrt();
        let theta = std::f32::consts::TAU * u2;
        values.push(r * theta.cos());
        values.push(r * theta.sin());
    }
    values.truncate(len);
    Tensor::from_data(TensorData::new(values, shape), device)
}
