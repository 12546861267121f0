//! Relative position bucketing.
//!
//! Offsets are `memory_position - query_position`. Small distances get one
//! bucket each; larger ones share logarithmically wider buckets up to
//! `max_distance`, beyond which everything lands in the last bucket.

use candle_core::{DType, Tensor};
use mesh::MeshTensor;

use crate::core::{AttentionError, Result};

/// Distance at which buckets stop growing.
pub const DEFAULT_MAX_DISTANCE: usize = 128;

/// Maps one relative position to a bucket in `[0, num_buckets)`.
///
/// In bidirectional mode the upper half of the buckets is reserved for
/// memory positions after the query. Otherwise positive offsets are
/// clamped to the zero bucket. `num_buckets` must be positive.
pub fn relative_position_bucket(
    relative_position: i64,
    bidirectional: bool,
    num_buckets: usize,
    max_distance: usize,
) -> usize {
    let mut num_buckets = num_buckets;
    let mut ret = 0;
    let mut n = relative_position.saturating_neg();
    if bidirectional {
        num_buckets /= 2;
        if n < 0 {
            ret += num_buckets;
        }
        n = n.abs();
    } else {
        n = n.max(0);
    }
    if num_buckets == 0 {
        return ret;
    }
    let n = n.unsigned_abs() as usize;
    let max_exact = num_buckets / 2;
    if n < max_exact {
        return ret + n;
    }
    let large = if max_exact == 0 || max_distance <= max_exact {
        num_buckets - 1
    } else {
        let ratio = (n as f32 / max_exact as f32).ln() / (max_distance as f32 / max_exact as f32).ln();
        max_exact + (ratio * (num_buckets - max_exact) as f32) as usize
    };
    ret + large.min(num_buckets - 1)
}

/// Elementwise [`relative_position_bucket`] over an integer tensor.
///
/// The result has the shape of `relative_position` and dtype `I64`.
pub fn relative_position_buckets(
    relative_position: &MeshTensor,
    bidirectional: bool,
    num_buckets: usize,
    max_distance: usize,
) -> Result<MeshTensor> {
    if num_buckets == 0 {
        return Err(AttentionError::config("num_buckets must be positive"));
    }
    let offsets = relative_position
        .tensor()
        .flatten_all()?
        .to_dtype(DType::I64)?
        .to_vec1::<i64>()?;
    let buckets: Vec<i64> = offsets
        .into_iter()
        .map(|rel| relative_position_bucket(rel, bidirectional, num_buckets, max_distance) as i64)
        .collect();
    let tensor = Tensor::from_vec(
        buckets,
        relative_position.shape().sizes(),
        relative_position.device(),
    )?;
    Ok(MeshTensor::new(tensor, relative_position.shape().clone())?)
}
