//! Sequence-level biases built from ids, positions and segment ids.
//!
//! Inputs are integer tensors over the query `length` dimension. The memory
//! side is the same tensor renamed to the memory length, so the result spans
//! `[..., length, memory_length]`.

use candle_core::DType;
use mesh::ops::{affine, cast, equal_scalar, less, not_equal, rename_dimension};
use mesh::MeshTensor;

use crate::core::Result;
use crate::masks::NEG_BIAS;

pub fn rename_length_to_memory_length(
    x: &MeshTensor,
    length_name: &str,
    memory_length_name: &str,
) -> Result<MeshTensor> {
    Ok(rename_dimension(x, length_name, memory_length_name)?)
}

fn to_bias(hidden: &MeshTensor, dtype: DType) -> Result<MeshTensor> {
    Ok(affine(&cast(hidden, dtype)?, NEG_BIAS as f64, 0.0)?)
}

/// Hides memory positions whose id is 0 (padding).
pub fn attention_mask_ignore_padding(
    inputs: &MeshTensor,
    length_name: &str,
    memory_length_name: &str,
    dtype: DType,
) -> Result<MeshTensor> {
    let padding = equal_scalar(inputs, 0.0)?;
    let memory = rename_length_to_memory_length(&padding, length_name, memory_length_name)?;
    to_bias(&memory, dtype)
}

/// Hides memory positions later than the query position.
pub fn attention_mask_autoregressive(
    query_pos: &MeshTensor,
    length_name: &str,
    memory_length_name: &str,
    dtype: DType,
) -> Result<MeshTensor> {
    let memory_pos = rename_length_to_memory_length(query_pos, length_name, memory_length_name)?;
    to_bias(&less(query_pos, &memory_pos)?, dtype)
}

/// Hides memory positions from a different segment.
///
/// `memory_segment` defaults to `query_segment` (self-attention).
pub fn attention_mask_same_segment(
    query_segment: &MeshTensor,
    memory_segment: Option<&MeshTensor>,
    length_name: &str,
    memory_length_name: &str,
    dtype: DType,
) -> Result<MeshTensor> {
    let memory_segment = match memory_segment {
        Some(segment) => segment.clone(),
        None => rename_length_to_memory_length(query_segment, length_name, memory_length_name)?,
    };
    to_bias(&not_equal(query_segment, &memory_segment)?, dtype)
}
