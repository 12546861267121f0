//! Local attention over tensors that already carry block dimensions.
//!
//! Queries stay inside their block; keys and values are projected once,
//! extended with a halo from the neighbouring blocks and renamed to a memory
//! axis so the kernel sees queries and memory as independent axes of
//! different sizes.

use mesh::ops::{reshape, transpose_to};
use mesh::{Dimension, Mesh, MeshTensor, Shape};

use super::memory_block_name;
use crate::core::{AttentionError, KernelOptions, Result};
use crate::halo::{local_1d_halo_exchange, local_2d_halo_exchange, HaloMode, SpatialBlocks};
use crate::kernel::attention;
use crate::masks::{attention_bias_local_2d_block, attention_bias_local_block};
use crate::params::AttentionParams;

fn require_dims(x: &MeshTensor, dims: &[Option<&Dimension>]) -> Result<()> {
    for dim in dims.iter().flatten() {
        if !x.shape().contains(dim) {
            return Err(AttentionError::shape(format!(
                "blocked input {} does not carry {dim}",
                x.shape()
            )));
        }
    }
    Ok(())
}

/// Halo exchange, kernel and output projection for one blocked axis.
#[allow(clippy::too_many_arguments)]
pub(crate) fn attend_1d_blocks(
    params: &AttentionParams,
    x: &MeshTensor,
    num_blocks_dim: Option<&Dimension>,
    block_dim: &Dimension,
    halo: usize,
    mode: HaloMode,
    bias: Option<&MeshTensor>,
    options: &KernelOptions,
) -> Result<MeshTensor> {
    require_dims(x, &[num_blocks_dim, Some(block_dim)])?;
    let q = params.compute_q(x)?;
    let (k, v) = params.compute_memory(x)?;
    let memory_name = memory_block_name(block_dim.name());
    let (k, v) = local_1d_halo_exchange(&k, &v, num_blocks_dim, block_dim, &memory_name, halo, mode)?;
    let memory_dim = Dimension::new(memory_name, mode.extended(block_dim.size(), halo));
    let o = attention(
        &q,
        &k,
        &v,
        &memory_dim,
        params.key_dim(),
        params.value_dim(),
        bias,
        options,
    )?;
    params.compute_output(&o)
}

/// Self-attention inside 1D blocks of `x`.
///
/// `x` carries `block_dim` and, when the axis is split into several blocks,
/// `num_blocks_dim`. Without a blocks dimension the halo is zero padding.
/// With `causal`, memory slot `j` of the extended block is visible to query
/// `i` iff `j <= i + halo`; otherwise the symmetric halo is fully visible.
#[allow(clippy::too_many_arguments)]
pub fn local_self_attention_spatial_blocks(
    mesh: &Mesh,
    params: &AttentionParams,
    x: &MeshTensor,
    num_blocks_dim: Option<&Dimension>,
    block_dim: &Dimension,
    halo: usize,
    causal: bool,
    options: &KernelOptions,
) -> Result<MeshTensor> {
    let mode = HaloMode::for_causal(causal);
    let bias = if causal {
        let memory_dim = Dimension::new(
            memory_block_name(block_dim.name()),
            mode.extended(block_dim.size(), halo),
        );
        Some(attention_bias_local_block(mesh, block_dim, &memory_dim, halo, x.dtype())?)
    } else {
        None
    };
    attend_1d_blocks(
        params,
        x,
        num_blocks_dim,
        block_dim,
        halo,
        mode,
        bias.as_ref(),
        options,
    )
}

/// Merges two dimensions of `x` into `merged`, moving `second` next to
/// `first` if needed.
fn merge_dims(
    x: &MeshTensor,
    first: &Dimension,
    second: &Dimension,
    merged: &Dimension,
) -> Result<MeshTensor> {
    let mut ordered = Vec::with_capacity(x.rank());
    let mut output = Vec::with_capacity(x.rank());
    for dim in x.dims() {
        if dim == second {
            continue;
        }
        ordered.push(dim.clone());
        if dim == first {
            ordered.push(second.clone());
            output.push(merged.clone());
        } else {
            output.push(dim.clone());
        }
    }
    let adjacent = transpose_to(x, &Shape::new(ordered)?)?;
    Ok(reshape(&adjacent, &Shape::new(output)?)?)
}

/// Self-attention inside 2D blocks of `x`.
///
/// `x` carries `blocks.h_dim` and `blocks.w_dim` plus the optional blocks
/// dimensions. The extended memory block is `[h + halo_h, w + halo_w]` in
/// causal mode (raster-order mask) and `[h + 2 halo_h, w + 2 halo_w]`
/// otherwise. The kernel sees it as a single flattened memory axis.
pub fn local_2d_self_attention_spatial_blocks(
    mesh: &Mesh,
    params: &AttentionParams,
    x: &MeshTensor,
    blocks: &SpatialBlocks,
    halos: (usize, usize),
    causal: bool,
    options: &KernelOptions,
) -> Result<MeshTensor> {
    require_dims(
        x,
        &[
            blocks.num_h_blocks.as_ref(),
            blocks.num_w_blocks.as_ref(),
            Some(&blocks.h_dim),
            Some(&blocks.w_dim),
        ],
    )?;
    let mode = HaloMode::for_causal(causal);
    let q = params.compute_q(x)?;
    let (k, v) = params.compute_memory(x)?;
    let memory_h = Dimension::new(
        memory_block_name(blocks.h_dim.name()),
        mode.extended(blocks.h_dim.size(), halos.0),
    );
    let memory_w = Dimension::new(
        memory_block_name(blocks.w_dim.name()),
        mode.extended(blocks.w_dim.size(), halos.1),
    );
    let (k, v) = local_2d_halo_exchange(
        &k,
        &v,
        blocks,
        (memory_h.name(), memory_w.name()),
        halos,
        mode,
    )?;
    let memory = Dimension::new(
        format!("{}_{}", memory_h.name(), memory_w.name()),
        memory_h.size() * memory_w.size(),
    );
    let k = merge_dims(&k, &memory_h, &memory_w, &memory)?;
    let v = merge_dims(&v, &memory_h, &memory_w, &memory)?;
    let bias = if causal {
        let bias = attention_bias_local_2d_block(
            mesh,
            (&blocks.h_dim, &blocks.w_dim),
            (&memory_h, &memory_w),
            halos,
            x.dtype(),
        )?;
        Some(merge_dims(&bias, &memory_h, &memory_w, &memory)?)
    } else {
        None
    };
    let o = attention(
        &q,
        &k,
        &v,
        &memory,
        params.key_dim(),
        params.value_dim(),
        bias.as_ref(),
        options,
    )?;
    params.compute_output(&o)
}
