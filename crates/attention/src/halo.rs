//! Halo exchange adapter for blocked attention and convolution.
//!
//! When a blocks dimension is present the neighbouring blocks supply the halo
//! through [`mesh::halo_exchange`]/[`mesh::left_halo_exchange`]. Without one,
//! the whole dimension lives in a single block and the halo is plain zero
//! padding, which is the one-shard case of the same exchange.

use mesh::ops::{pad, rename_dimension};
use mesh::{halo_exchange, left_halo_exchange, Dimension, MeshTensor};
use serde::{Deserialize, Serialize};

use crate::core::{AttentionError, Result};

/// Which neighbours contribute to a block's halo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaloMode {
    /// Only the left neighbour; used for causal attention.
    LeftOnly,
    /// Both neighbours; used for bidirectional attention and convolution.
    Symmetric,
}

impl HaloMode {
    pub fn for_causal(causal: bool) -> Self {
        if causal {
            Self::LeftOnly
        } else {
            Self::Symmetric
        }
    }

    /// Length of a block of `block` elements after augmentation.
    pub fn extended(self, block: usize, halo: usize) -> usize {
        match self {
            Self::LeftOnly => block + halo,
            Self::Symmetric => block + 2 * halo,
        }
    }
}

/// Extends `x` along `block_dim` by `halo` in the given direction(s).
pub fn exchange(
    x: &MeshTensor,
    blocks_dim: Option<&Dimension>,
    block_dim: &Dimension,
    halo: usize,
    mode: HaloMode,
) -> Result<MeshTensor> {
    let out = match (blocks_dim, mode) {
        (Some(blocks), HaloMode::LeftOnly) => left_halo_exchange(x, blocks, block_dim, halo)?,
        (Some(blocks), HaloMode::Symmetric) => halo_exchange(x, blocks, block_dim, halo)?,
        (None, HaloMode::LeftOnly) => pad(x, halo, 0, block_dim.name())?,
        (None, HaloMode::Symmetric) => pad(x, halo, halo, block_dim.name())?,
    };
    Ok(out)
}

/// Augments keys and values of a 1D blocked sequence and renames the block
/// dimension to `memory_block_name`.
///
/// Queries are never exchanged.
pub fn local_1d_halo_exchange(
    k: &MeshTensor,
    v: &MeshTensor,
    blocks_dim: Option<&Dimension>,
    block_dim: &Dimension,
    memory_block_name: &str,
    halo: usize,
    mode: HaloMode,
) -> Result<(MeshTensor, MeshTensor)> {
    let augment = |x: &MeshTensor| -> Result<MeshTensor> {
        let extended = exchange(x, blocks_dim, block_dim, halo, mode)?;
        Ok(rename_dimension(&extended, block_dim.name(), memory_block_name)?)
    };
    Ok((augment(k)?, augment(v)?))
}

/// The two spatial axes of a 2D blocked image and their halos.
#[derive(Debug, Clone)]
pub struct SpatialBlocks {
    pub num_h_blocks: Option<Dimension>,
    pub h_dim: Dimension,
    pub num_w_blocks: Option<Dimension>,
    pub w_dim: Dimension,
}

/// 2D analogue of [`local_1d_halo_exchange`]: exchanges along height, then
/// width, and renames the two block dimensions to the given memory names.
pub fn local_2d_halo_exchange(
    k: &MeshTensor,
    v: &MeshTensor,
    blocks: &SpatialBlocks,
    memory_names: (&str, &str),
    halos: (usize, usize),
    mode: HaloMode,
) -> Result<(MeshTensor, MeshTensor)> {
    let augment = |x: &MeshTensor| -> Result<MeshTensor> {
        let x = exchange(x, blocks.num_h_blocks.as_ref(), &blocks.h_dim, halos.0, mode)?;
        let x = exchange(&x, blocks.num_w_blocks.as_ref(), &blocks.w_dim, halos.1, mode)?;
        let x = rename_dimension(&x, blocks.h_dim.name(), memory_names.0)?;
        Ok(rename_dimension(&x, blocks.w_dim.name(), memory_names.1)?)
    };
    Ok((augment(k)?, augment(v)?))
}

/// Padding scheme of a spatial convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Padding {
    Same,
    Valid,
}

/// Halo a blocked convolution needs on each side of a block.
///
/// Regular convolutions need odd filters and borrow `filter / 2`; transposed
/// convolutions need even filters and borrow `filter / 2 - 1`.
pub fn conv_halo_size(filter_size: usize, transposed: bool) -> Result<usize> {
    let odd = filter_size % 2 == 1;
    match (transposed, odd) {
        (false, true) => Ok(filter_size / 2),
        (true, false) if filter_size >= 2 => Ok(filter_size / 2 - 1),
        _ => Err(AttentionError::FilterSize {
            filter_size,
            transposed,
        }),
    }
}

/// Prepares a blocked image for a convolution with `Padding::Valid`
/// semantics per block.
///
/// Each spatial axis gets the symmetric halo implied by its filter size, so
/// that convolving every augmented block without padding reproduces a
/// `Padding::Same` convolution over the whole image.
pub fn conv_halo_exchange_2d(
    x: &MeshTensor,
    blocks: &SpatialBlocks,
    filter: (usize, usize),
    padding: Padding,
    transposed: bool,
) -> Result<MeshTensor> {
    if padding != Padding::Same {
        return Err(AttentionError::UnsupportedPadding { requested: padding });
    }
    let halo_h = conv_halo_size(filter.0, transposed)?;
    let halo_w = conv_halo_size(filter.1, transposed)?;
    log::debug!(
        "conv halo for filter {}x{} (transposed={transposed}): {halo_h}x{halo_w}",
        filter.0,
        filter.1
    );
    let x = exchange(
        x,
        blocks.num_h_blocks.as_ref(),
        &blocks.h_dim,
        halo_h,
        HaloMode::Symmetric,
    )?;
    exchange(
        &x,
        blocks.num_w_blocks.as_ref(),
        &blocks.w_dim,
        halo_w,
        HaloMode::Symmetric,
    )
}
