//! # Transformers
//!
//! Prompt side of the pipeline: a tokenizer and the text encoder that turns
//! token ids into conditioning embeddings.

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

pub trait Tokenizer {
    /// Token ids of `text`, start and end markers included.
    fn encode(&self, text: &str) -> Vec<usize>;

    /// Length every encoded prompt is padded or truncated to.
    fn max_length(&self) -> usize;

    fn pad_token(&self) -> usize;
}

pub trait TextEncoder<B: Backend> {
    /// Maps `[batch, seq_len]` token ids to `[batch, seq_len, embed_dim]`.
    fn forward(&self, tokens: Tensor<B, 2, Int>) -> Tensor<B, 3>;
}
