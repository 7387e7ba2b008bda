//! Stub collaborators for unit tests.

use std::cell::RefCell;
use std::rc::Rc;

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

use crate::models::{Denoiser, LatentDecoder};
use crate::pipelines::StableDiffusionParts;
use crate::schedulers::DiscreteSchedule;
use crate::transformers::{TextEncoder, Tokenizer};
use crate::utils::to_f64_vec;

/// Byte-level tokenizer with start (1), end (2) and padding (0) tokens.
pub struct ByteTokenizer;

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Vec<usize> {
        let mut tokens = vec![1];
        tokens.extend(text.bytes().map(|b| b as usize + 3));
        tokens.push(2);
        tokens
    }

    fn max_length(&self) -> usize {
        4
    }

    fn pad_token(&self) -> usize {
        0
    }
}

/// Embeds every token as its own id.
pub struct IdEncoder;

impl<B: Backend> TextEncoder<B> for IdEncoder {
    fn forward(&self, tokens: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let [batch, seq_len] = tokens.dims();
        tokens.float().reshape([batch, seq_len, 1])
    }
}

pub struct ZeroDecoder;

impl<B: Backend> LatentDecoder<B> for ZeroDecoder {
    fn decode(&self, latents: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, _, height, width] = latents.dims();
        Tensor::zeros([batch, 3, height * 8, width * 8], &latents.device())
    }
}

pub fn parts<B: Backend>(unet: impl Denoiser<B> + 'static) -> StableDiffusionParts<B> {
    StableDiffusionParts {
        tokenizer: Box::new(ByteTokenizer),
        text_encoder: Box::new(IdEncoder),
        unet: Box::new(unet),
        vae: Box::new(ZeroDecoder),
    }
}

/// Predicts `uncond` for the first half of the batch and `cond` for the
/// second half.
pub struct ConstantDenoiser {
    channels: usize,
    uncond: f64,
    cond: f64,
}

impl ConstantDenoiser {
    pub fn new(channels: usize, uncond: f64, cond: f64) -> Self {
        Self {
            channels,
            uncond,
            cond,
        }
    }
}

impl<B: Backend> Denoiser<B> for ConstantDenoiser {
    fn in_channels(&self) -> usize {
        self.channels
    }

    fn predict(
        &self,
        latents: Tensor<B, 4>,
        _timestep: f64,
        _encoder_hidden_states: Tensor<B, 3>,
    ) -> Tensor<B, 4> {
        let [batch, _, height, width] = latents.dims();
        let device = latents.device();
        let half = [batch / 2, self.channels, height, width];
        Tensor::cat(
            vec![
                Tensor::ones(half, &device).mul_scalar(self.uncond),
                Tensor::ones(half, &device).mul_scalar(self.cond),
            ],
            0,
        )
    }
}

/// Keeps the latents unchanged and records every guided prediction. The
/// number of timesteps is the request rounded up to a multiple of `round_to`.
pub struct RecordingSchedule {
    round_to: usize,
    timesteps: Vec<f64>,
    preds: Rc<RefCell<Vec<Vec<f64>>>>,
}

impl RecordingSchedule {
    pub fn new(round_to: usize) -> Self {
        Self {
            round_to,
            timesteps: Vec::new(),
            preds: Rc::default(),
        }
    }

    pub fn preds(&self) -> Rc<RefCell<Vec<Vec<f64>>>> {
        self.preds.clone()
    }
}

impl<B: Backend> DiscreteSchedule<B> for RecordingSchedule {
    fn set_timesteps(&mut self, inference_steps: usize) {
        let resolved = inference_steps.div_ceil(self.round_to) * self.round_to;
        self.timesteps = (0..resolved).rev().map(|t| t as f64).collect();
    }

    fn timesteps(&self) -> Vec<f64> {
        self.timesteps.clone()
    }

    fn init_noise_sigma(&self) -> f64 {
        1.0
    }

    fn scale_model_input(&self, sample: Tensor<B, 4>, _timestep: f64) -> Tensor<B, 4> {
        sample
    }

    fn step(&self, model_output: Tensor<B, 4>, _timestep: f64, sample: Tensor<B, 4>) -> Tensor<B, 4> {
        self.preds.borrow_mut().push(to_f64_vec(model_output));
        sample
    }
}
