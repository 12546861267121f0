//! Local attention over whole sequences and images.
//!
//! These entry points partition the spatial axes with [`BlockPartition`],
//! run the blocked engine and merge the blocks back, so the output has the
//! shape of the input.

use mesh::{Dimension, Mesh, MeshTensor};

use super::blocks::{attend_1d_blocks, local_2d_self_attention_spatial_blocks};
use super::{memory_block_name, LocalAttentionOptions, WindowPolicy};
use crate::core::{AttentionError, KernelOptions, Result};
use crate::halo::{HaloMode, SpatialBlocks};
use crate::masks::{attention_bias_local_block, sliding_window_block_bias};
use crate::params::AttentionParams;
use crate::partition::BlockPartition;

/// Local self-attention along `length_dim` of `x`.
///
/// The halo is `options.window`; the visibility inside each extended block
/// follows `options.policy`.
pub fn local_attention_1d(
    mesh: &Mesh,
    params: &AttentionParams,
    x: &MeshTensor,
    length_dim: &Dimension,
    options: &LocalAttentionOptions,
) -> Result<MeshTensor> {
    options.validate()?;
    if !x.shape().contains(length_dim) {
        return Err(AttentionError::shape(format!(
            "input {} does not carry {length_dim}",
            x.shape()
        )));
    }
    let window = options.window;
    let partition = BlockPartition::new(mesh, length_dim, window, options.length_per_split)?;
    let block_dim = partition.block_length_dim();
    let mode = HaloMode::for_causal(options.causal);
    let memory_dim = Dimension::new(
        memory_block_name(block_dim.name()),
        mode.extended(block_dim.size(), window),
    );
    let dtype = x.dtype();
    let bias = match (options.policy, options.causal) {
        (WindowPolicy::Block, false) => None,
        (WindowPolicy::Block, true) => Some(attention_bias_local_block(
            mesh,
            block_dim,
            &memory_dim,
            window,
            dtype,
        )?),
        (WindowPolicy::Sliding, causal) => Some(sliding_window_block_bias(
            mesh,
            partition.num_blocks_dim(),
            block_dim,
            &memory_dim,
            window,
            causal,
            dtype,
        )?),
    };
    log::debug!(
        "local attention over {length_dim}: {} blocks of {}, halo {window} {mode:?}, policy {:?}",
        partition.num_blocks(),
        partition.block_length(),
        options.policy
    );

    let blocked = partition.to_blocks(x)?;
    let out = attend_1d_blocks(
        params,
        &blocked,
        Some(partition.num_blocks_dim()),
        block_dim,
        window,
        mode,
        bias.as_ref(),
        &options.kernel,
    )?;
    partition.from_blocks(&out)
}

/// Causal sliding-window attention: position `p` sees `(p - window, p]`.
pub fn masked_local_attention_1d(
    mesh: &Mesh,
    params: &AttentionParams,
    x: &MeshTensor,
    length_dim: &Dimension,
    window: usize,
    length_per_split: Option<usize>,
    kernel: &KernelOptions,
) -> Result<MeshTensor> {
    let options = LocalAttentionOptions {
        window,
        causal: true,
        policy: WindowPolicy::Sliding,
        length_per_split,
        kernel: kernel.clone(),
    };
    local_attention_1d(mesh, params, x, length_dim, &options)
}

/// Local self-attention over the `(h, w)` plane of an image.
///
/// Both axes are partitioned like a 1D sequence (block length chosen from
/// the per-shard size and the axis window) and each block attends to itself
/// plus a halo of `windows` rows and columns. In causal mode the order is
/// raster order within the extended block.
#[allow(clippy::too_many_arguments)]
pub fn local_attention_2d(
    mesh: &Mesh,
    params: &AttentionParams,
    x: &MeshTensor,
    spatial_dims: (&Dimension, &Dimension),
    windows: (usize, usize),
    causal: bool,
    kernel: &KernelOptions,
) -> Result<MeshTensor> {
    kernel.validate()?;
    let (h_dim, w_dim) = spatial_dims;
    for dim in [h_dim, w_dim] {
        if !x.shape().contains(dim) {
            return Err(AttentionError::shape(format!(
                "image {} does not carry {dim}",
                x.shape()
            )));
        }
    }
    let h_partition = BlockPartition::new(mesh, h_dim, windows.0, None)?
        .with_block_name(&format!("{}_block", h_dim.name()));
    let w_partition = BlockPartition::new(mesh, w_dim, windows.1, None)?
        .with_block_name(&format!("{}_block", w_dim.name()));
    let blocked = w_partition.to_blocks(&h_partition.to_blocks(x)?)?;
    let blocks = SpatialBlocks {
        num_h_blocks: Some(h_partition.num_blocks_dim().clone()),
        h_dim: h_partition.block_length_dim().clone(),
        num_w_blocks: Some(w_partition.num_blocks_dim().clone()),
        w_dim: w_partition.block_length_dim().clone(),
    };
    log::debug!(
        "local 2d attention: {}x{} blocks of {}x{}, halo {}x{}",
        h_partition.num_blocks(),
        w_partition.num_blocks(),
        h_partition.block_length(),
        w_partition.block_length(),
        windows.0,
        windows.1
    );
    let out = local_2d_self_attention_spatial_blocks(
        mesh, params, &blocked, &blocks, windows, causal, kernel,
    )?;
    h_partition.from_blocks(&w_partition.from_blocks(&out)?)
}
