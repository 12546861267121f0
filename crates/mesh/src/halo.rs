//! Neighbour exchange along a blocked dimension.
//!
//! A sequence reshaped to `[blocks, block]` is extended along `block` with
//! data from the neighbouring blocks. Whole-block contributions come from
//! shifting along `blocks`; a halo that is not a multiple of the block size
//! adds a partial margin sliced from the neighbour's edge. Both shifts fill
//! with zeros at the ends of the sequence, so nothing wraps around.

use crate::error::{MeshError, Result};
use crate::ops::{concat, shift, slice};
use crate::shape::Dimension;
use crate::tensor::MeshTensor;

fn check_dims(x: &MeshTensor, blocks_dim: &Dimension, block_size_dim: &Dimension) -> Result<()> {
    for dim in [blocks_dim, block_size_dim] {
        if !x.shape().contains(dim) {
            return Err(MeshError::UnknownDimension {
                name: dim.to_string(),
                shape: x.shape().to_string(),
            });
        }
    }
    Ok(())
}

/// Extends every block by `halo` elements from its left and right neighbours.
///
/// The result has `block_size_dim` grown to `block + 2 * halo`.
pub fn halo_exchange(
    x: &MeshTensor,
    blocks_dim: &Dimension,
    block_size_dim: &Dimension,
    halo: usize,
) -> Result<MeshTensor> {
    exchange(x, blocks_dim, block_size_dim, halo, true)
}

/// Extends every block by `halo` elements from its left neighbour only.
///
/// The result has `block_size_dim` grown to `block + halo`.
pub fn left_halo_exchange(
    x: &MeshTensor,
    blocks_dim: &Dimension,
    block_size_dim: &Dimension,
    halo: usize,
) -> Result<MeshTensor> {
    exchange(x, blocks_dim, block_size_dim, halo, false)
}

fn exchange(
    x: &MeshTensor,
    blocks_dim: &Dimension,
    block_size_dim: &Dimension,
    halo: usize,
    both_sides: bool,
) -> Result<MeshTensor> {
    check_dims(x, blocks_dim, block_size_dim)?;
    if halo == 0 {
        return Ok(x.clone());
    }
    let block = block_size_dim.size();
    let complete = halo / block;
    let partial = halo % block;
    let blocks = blocks_dim.name();
    let name = block_size_dim.name();

    // Parts are collected in their final left-to-right order.
    let mut left: Vec<MeshTensor> = Vec::new();
    if partial > 0 {
        let tail = slice(x, block - partial, partial, name)?;
        left.push(shift(&tail, complete as isize + 1, blocks)?);
    }
    for i in (1..=complete).rev() {
        left.push(shift(x, i as isize, blocks)?);
    }

    let mut right: Vec<MeshTensor> = Vec::new();
    if both_sides {
        for i in 1..=complete {
            right.push(shift(x, -(i as isize), blocks)?);
        }
        if partial > 0 {
            let head = slice(x, 0, partial, name)?;
            right.push(shift(&head, -(complete as isize + 1), blocks)?);
        }
    }

    let mut parts: Vec<&MeshTensor> = left.iter().collect();
    parts.push(x);
    parts.extend(right.iter());
    concat(&parts, name)
}
