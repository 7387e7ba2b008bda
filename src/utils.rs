use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use num_traits::ToPrimitive;

use crate::error::{DiffusionError, Result};

/// Euclidean norm over every element of `tensor`.
pub fn l2_norm<B: Backend, const D: usize>(tensor: &Tensor<B, D>) -> f64 {
    let squared = tensor.clone() * tensor.clone();
    squared
        .sum()
        .into_scalar()
        .to_f64()
        .unwrap_or(f64::NAN)
        .sqrt()
}

/// Copies the values of a tensor to the host as `f64`.
pub fn to_f64_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f64> {
    tensor
        .into_data()
        .value
        .iter()
        .map(|v| v.to_f64().unwrap_or(f64::NAN))
        .collect()
}

/// Truncates or pads `tokens` to exactly `max_len` entries.
pub(crate) fn pad_tokens(mut tokens: Vec<usize>, max_len: usize, pad: usize) -> Vec<usize> {
    tokens.truncate(max_len);
    tokens.resize(max_len, pad);
    tokens
}

// Stacks the tensor twice along the batch axis, one copy per guidance branch.
pub(crate) fn duplicate_batch<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Tensor<B, D> {
    Tensor::cat(vec![tensor.clone(), tensor], 0)
}

pub(crate) fn ensure_dims<const D: usize>(
    context: &'static str,
    expected: [usize; D],
    actual: [usize; D],
) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(DiffusionError::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        })
    }
}

pub(crate) fn ensure_device<B: Backend>(
    context: &'static str,
    expected: &B::Device,
    actual: &B::Device,
) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(DiffusionError::DeviceMismatch {
            context,
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        })
    }
}
