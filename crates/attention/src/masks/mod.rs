//! Additive attention biases.
//!
//! Every builder returns a tensor that is added to the logits: `0.0` where
//! attention is permitted and [`NEG_BIAS`] where it is not. A finite constant
//! is used instead of `-inf` so that a fully masked row degrades to a uniform
//! softmax rather than NaN.

pub mod local;
pub mod sequence;

use candle_core::DType;
use mesh::ops::{affine, cast, equal_scalar};
use mesh::MeshTensor;

use crate::core::Result;

/// Bias applied to disallowed query/memory pairs.
pub const NEG_BIAS: f32 = -1e9;

/// Dtype of the biases built on the host.
pub const MASK_DTYPE: DType = DType::F32;

/// Converts a visibility mask (non-zero = visible) into an additive bias.
pub fn visibility_mask_to_attention_bias(visible: &MeshTensor, dtype: DType) -> Result<MeshTensor> {
    let hidden = cast(&equal_scalar(visible, 0.0)?, dtype)?;
    Ok(affine(&hidden, NEG_BIAS as f64, 0.0)?)
}

pub use local::{
    attention_bias_local_2d_block, attention_bias_local_block, dense_sliding_window_bias,
    incremental_window_bias, sliding_window_block_bias,
};
pub use sequence::{
    attention_mask_autoregressive, attention_mask_ignore_padding, attention_mask_same_segment,
    rename_length_to_memory_length,
};
