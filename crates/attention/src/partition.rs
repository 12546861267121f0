//! Splitting a length dimension into equal blocks.
//!
//! The blocks dimension reuses the name of the length dimension, so a layout
//! that splits `length` across processors splits the blocks the same way and
//! every block stays on one shard.

use mesh::ops::{reshape, transpose_to};
use mesh::{Dimension, Mesh, MeshTensor, Shape};

use crate::core::{AttentionError, Result};

/// Smallest block length the partitioner aims for, whatever the window.
pub const MIN_BLOCK_TARGET: usize = 128;

/// Name of the within-block position dimension.
pub const BLOCK_LENGTH_NAME: &str = "block_length";

/// Largest `b <= max(window, 128)` dividing `length_per_split`.
///
/// Returns 1 in the degenerate case; that is legal, only slow.
pub fn choose_block_length(window: usize, length_per_split: usize) -> usize {
    let mut block = window.max(MIN_BLOCK_TARGET).min(length_per_split.max(1));
    while block > 1 && length_per_split % block != 0 {
        block -= 1;
    }
    block
}

/// A length dimension viewed as `[num_blocks, block_length]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPartition {
    length_dim: Dimension,
    num_blocks_dim: Dimension,
    block_length_dim: Dimension,
}

impl BlockPartition {
    /// Chooses the block length for `length_dim` given a window size.
    ///
    /// `length_per_split` defaults to the per-shard size under the mesh layout
    /// and must divide the full length.
    pub fn new(
        mesh: &Mesh,
        length_dim: &Dimension,
        window: usize,
        length_per_split: Option<usize>,
    ) -> Result<Self> {
        let length = length_dim.size();
        if length == 0 {
            return Err(AttentionError::config(format!(
                "cannot partition empty dimension {length_dim}"
            )));
        }
        let per_split = match length_per_split {
            Some(per_split) => per_split,
            None => mesh.layout().per_shard_size(length_dim)?,
        };
        if per_split == 0 || length % per_split != 0 {
            return Err(AttentionError::config(format!(
                "length per split {per_split} does not divide {length_dim}"
            )));
        }
        let block = choose_block_length(window, per_split);
        if block == 1 && per_split > 1 {
            log::warn!("partitioning {length_dim} into blocks of length 1");
        }
        log::debug!(
            "partitioning {length_dim} (per split {per_split}, window {window}) into {} blocks of {block}",
            length / block
        );
        Self::with_block_length(length_dim, block)
    }

    /// Uses an explicit block length, which must divide the length.
    pub fn with_block_length(length_dim: &Dimension, block_length: usize) -> Result<Self> {
        if block_length == 0 || length_dim.size() % block_length != 0 {
            return Err(AttentionError::config(format!(
                "block length {block_length} does not divide {length_dim}"
            )));
        }
        Ok(Self {
            length_dim: length_dim.clone(),
            num_blocks_dim: Dimension::new(length_dim.name(), length_dim.size() / block_length),
            block_length_dim: Dimension::new(BLOCK_LENGTH_NAME, block_length),
        })
    }

    /// Renames the within-block dimension, e.g. to partition two spatial axes
    /// of the same tensor.
    pub fn with_block_name(mut self, name: &str) -> Self {
        self.block_length_dim = self.block_length_dim.renamed(name);
        self
    }

    pub fn length_dim(&self) -> &Dimension {
        &self.length_dim
    }

    pub fn num_blocks_dim(&self) -> &Dimension {
        &self.num_blocks_dim
    }

    pub fn block_length_dim(&self) -> &Dimension {
        &self.block_length_dim
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks_dim.size()
    }

    pub fn block_length(&self) -> usize {
        self.block_length_dim.size()
    }

    /// Replaces the length dimension of `x` by `[num_blocks, block_length]`.
    pub fn to_blocks(&self, x: &MeshTensor) -> Result<MeshTensor> {
        if !x.shape().contains(&self.length_dim) {
            return Err(AttentionError::shape(format!(
                "{} does not carry {}",
                x.shape(),
                self.length_dim
            )));
        }
        let mut dims = Vec::with_capacity(x.rank() + 1);
        for dim in x.dims() {
            if dim == &self.length_dim {
                dims.push(self.num_blocks_dim.clone());
                dims.push(self.block_length_dim.clone());
            } else {
                dims.push(dim.clone());
            }
        }
        Ok(reshape(x, &Shape::new(dims)?)?)
    }

    /// Inverse of [`BlockPartition::to_blocks`].
    ///
    /// The block dimensions may have been moved apart; they are made adjacent
    /// before merging.
    pub fn from_blocks(&self, x: &MeshTensor) -> Result<MeshTensor> {
        for dim in [&self.num_blocks_dim, &self.block_length_dim] {
            if !x.shape().contains(dim) {
                return Err(AttentionError::shape(format!(
                    "{} does not carry {dim}",
                    x.shape()
                )));
            }
        }
        let mut ordered = Vec::with_capacity(x.rank());
        let mut merged = Vec::with_capacity(x.rank() - 1);
        for dim in x.dims() {
            if dim == &self.block_length_dim {
                continue;
            }
            ordered.push(dim.clone());
            if dim == &self.num_blocks_dim {
                ordered.push(self.block_length_dim.clone());
                merged.push(self.length_dim.clone());
            } else {
                merged.push(dim.clone());
            }
        }
        let adjacent = transpose_to(x, &Shape::new(ordered)?)?;
        Ok(reshape(&adjacent, &Shape::new(merged)?)?)
    }
}
