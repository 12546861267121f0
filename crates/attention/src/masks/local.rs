//! Biases for blocked and windowed attention.
//!
//! These masks depend only on block geometry, so they are built on the host
//! with plain loops and uploaded once per configuration.

use candle_core::DType;
use mesh::{Dimension, Mesh, MeshTensor, Shape};

use crate::core::{AttentionError, Result};
use crate::halo::HaloMode;
use crate::masks::NEG_BIAS;

fn upload(mesh: &Mesh, data: Vec<f32>, dims: Vec<Dimension>, dtype: DType) -> Result<MeshTensor> {
    let shape = Shape::new(dims)?;
    Ok(MeshTensor::from_vec(data, &shape, mesh.device())?.to_dtype(dtype)?)
}

fn check_width(memory_dim: &Dimension, expected: usize) -> Result<()> {
    if memory_dim.size() != expected {
        return Err(AttentionError::shape(format!(
            "memory block {memory_dim} should have size {expected}"
        )));
    }
    Ok(())
}

/// Causal mask within a left-augmented block: memory `j` is visible to
/// query `i` iff `j <= i + halo`.
///
/// The borrowed halo is always visible, whatever the block index.
pub fn attention_bias_local_block(
    mesh: &Mesh,
    block_dim: &Dimension,
    memory_block_dim: &Dimension,
    halo: usize,
    dtype: DType,
) -> Result<MeshTensor> {
    let block = block_dim.size();
    let width = memory_block_dim.size();
    check_width(memory_block_dim, block + halo)?;
    let mut data = vec![0f32; block * width];
    for i in 0..block {
        for j in (i + halo + 1)..width {
            data[i * width + j] = NEG_BIAS;
        }
    }
    upload(
        mesh,
        data,
        vec![block_dim.clone(), memory_block_dim.clone()],
        dtype,
    )
}

/// Raster-order causal mask within a left/top-augmented 2D block.
///
/// Memory cell `(a, b)` sits at `(a - halo_h, b - halo_w)` in query
/// coordinates and is visible to query `(r, c)` iff it comes earlier in
/// raster order: a previous row, or the same row at or left of `c`.
pub fn attention_bias_local_2d_block(
    mesh: &Mesh,
    query_dims: (&Dimension, &Dimension),
    memory_dims: (&Dimension, &Dimension),
    halos: (usize, usize),
    dtype: DType,
) -> Result<MeshTensor> {
    let (h, w) = (query_dims.0.size(), query_dims.1.size());
    let (mh, mw) = (memory_dims.0.size(), memory_dims.1.size());
    check_width(memory_dims.0, h + halos.0)?;
    check_width(memory_dims.1, w + halos.1)?;
    let mut data = vec![0f32; h * w * mh * mw];
    for r in 0..h {
        for c in 0..w {
            let row = (r * w + c) * mh * mw;
            for a in 0..mh {
                for b in 0..mw {
                    // Shifted into query coordinates (+halo on the query side).
                    let (qa, qb) = (r + halos.0, c + halos.1);
                    let visible = a < qa || (a == qa && b <= qb);
                    if !visible {
                        data[row + a * mw + b] = NEG_BIAS;
                    }
                }
            }
        }
    }
    upload(
        mesh,
        data,
        vec![
            query_dims.0.clone(),
            query_dims.1.clone(),
            memory_dims.0.clone(),
            memory_dims.1.clone(),
        ],
        dtype,
    )
}

/// Whether memory position `m` lies inside the window of query `p`.
///
/// Causal: `p - window < m <= p`. Bidirectional: `|p - m| < window`.
/// Positions outside `[0, length)` are never visible.
fn in_window(p: i64, m: i64, window: usize, causal: bool, length: usize) -> bool {
    if m < 0 || m >= length as i64 {
        return false;
    }
    let window = window as i64;
    if causal {
        m <= p && p - m < window
    } else {
        (p - m).abs() < window
    }
}

/// Sliding-window bias for blocks augmented with a halo of `window`.
///
/// Unlike [`attention_bias_local_block`] this depends on the block index:
/// zero-filled halo slots before the start (or past the end) of the sequence
/// are hidden, so the blocked result equals dense windowed attention.
/// The result spans `[num_blocks, block, memory_block]`.
pub fn sliding_window_block_bias(
    mesh: &Mesh,
    num_blocks_dim: &Dimension,
    block_dim: &Dimension,
    memory_block_dim: &Dimension,
    window: usize,
    causal: bool,
    dtype: DType,
) -> Result<MeshTensor> {
    let (num_blocks, block) = (num_blocks_dim.size(), block_dim.size());
    let width = memory_block_dim.size();
    check_width(memory_block_dim, HaloMode::for_causal(causal).extended(block, window))?;
    let length = num_blocks * block;
    let mut data = vec![0f32; num_blocks * block * width];
    for n in 0..num_blocks {
        let start = (n * block) as i64;
        for i in 0..block {
            let row = (n * block + i) * width;
            let p = start + i as i64;
            for j in 0..width {
                let m = start - window as i64 + j as i64;
                if !in_window(p, m, window, causal, length) {
                    data[row + j] = NEG_BIAS;
                }
            }
        }
    }
    upload(
        mesh,
        data,
        vec![
            num_blocks_dim.clone(),
            block_dim.clone(),
            memory_block_dim.clone(),
        ],
        dtype,
    )
}

/// Dense `[length, memory_length]` version of the sliding-window bias.
pub fn dense_sliding_window_bias(
    mesh: &Mesh,
    length_dim: &Dimension,
    memory_length_dim: &Dimension,
    window: usize,
    causal: bool,
    dtype: DType,
) -> Result<MeshTensor> {
    if length_dim.size() != memory_length_dim.size() {
        return Err(AttentionError::shape(format!(
            "self-attention needs equal lengths, got {length_dim} and {memory_length_dim}"
        )));
    }
    let length = length_dim.size();
    let mut data = vec![0f32; length * length];
    for p in 0..length {
        for m in 0..length {
            if !in_window(p as i64, m as i64, window, causal, length) {
                data[p * length + m] = NEG_BIAS;
            }
        }
    }
    upload(
        mesh,
        data,
        vec![length_dim.clone(), memory_length_dim.clone()],
        dtype,
    )
}

/// Bias over a rolling window buffer at decode position `position`.
///
/// Slot `s` holds position `position - d` with
/// `d = (position - s) mod window_length`; it is visible iff that position
/// exists (`d <= position`) and lies within the attention window
/// (`d < window`).
pub fn incremental_window_bias(
    mesh: &Mesh,
    window_dim: &Dimension,
    position: usize,
    window: usize,
    dtype: DType,
) -> Result<MeshTensor> {
    let slots = window_dim.size();
    if slots == 0 {
        return Err(AttentionError::config("window buffer must not be empty"));
    }
    let data = (0..slots)
        .map(|s| {
            let d = (position % slots + slots - s) % slots;
            if d <= position && d < window {
                0.0
            } else {
                NEG_BIAS
            }
        })
        .collect();
    upload(mesh, data, vec![window_dim.clone()], dtype)
}
