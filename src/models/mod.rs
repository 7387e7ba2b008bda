//! # Models
//!
//! Interfaces of the networks driven by a diffusion loop. The loop only needs
//! their forward contracts, so any burn module (or a plain stub) can be
//! plugged in.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Noise prediction network, typically a conditional UNet.
pub trait Denoiser<B: Backend> {
    /// Number of latent channels the network works with.
    fn in_channels(&self) -> usize;

    /// Predicts the noise of `latents` at `timestep`.
    ///
    /// `latents` is `[batch, in_channels, height, width]` and
    /// `encoder_hidden_states` is `[batch, seq_len, embed_dim]`; the output
    /// has the same shape as `latents`.
    fn predict(
        &self,
        latents: Tensor<B, 4>,
        timestep: f64,
        encoder_hidden_states: Tensor<B, 3>,
    ) -> Tensor<B, 4>;

    /// Head dimensions of the cross-attention layers.
    fn attention_head_dims(&self) -> Vec<usize> {
        Vec::new()
    }

    /// Computes attention in slices of `slice_size` heads.
    fn set_attention_slice(&mut self, _slice_size: usize) {}
}

/// Decoder half of the latent autoencoder.
pub trait LatentDecoder<B: Backend> {
    /// Maps `[batch, channels, h, w]` latents to `[batch, 3, 8 * h, 8 * w]`
    /// pixels in `[-1, 1]`.
    fn decode(&self, latents: Tensor<B, 4>) -> Tensor<B, 4>;
}

/// Slice size for sliced attention: half the head dimension when every
/// layer shares a single one, otherwise the smallest head dimension.
pub fn attention_slice_size(head_dims: &[usize]) -> Option<usize> {
    match head_dims {
        [] => None,
        [single] => Some((single / 2).max(1)),
        dims => dims.iter().copied().min(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attention_slice_size() {
        assert_eq!(attention_slice_size(&[]), None);
        assert_eq!(attention_slice_size(&[8]), Some(4));
        assert_eq!(attention_slice_size(&[1]), Some(1));
        assert_eq!(attention_slice_size(&[5, 10, 20]), Some(5));
    }
}
