//! Blocked local self-attention.
//!
//! A long axis is cut into blocks, keys and values of every block are
//! extended with a halo borrowed from the neighbouring blocks, and each block
//! attends only to its extended memory. Cost grows with `length * window`
//! instead of `length^2`.
//!
//! [`blocks`] works on tensors that are already blocked; [`sequence`] does
//! the partitioning for whole 1D sequences and 2D images.

pub mod blocks;
pub mod sequence;

use serde::{Deserialize, Serialize};

use crate::core::{AttentionError, KernelOptions, Result};

/// Window size used when none is configured.
pub const DEFAULT_WINDOW: usize = 128;

/// How the visibility inside an extended block is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowPolicy {
    /// Block-local mask `j <= i + halo`: the whole halo is visible, including
    /// zero-filled slots before the sequence start.
    Block,
    /// Exact sliding window: query `p` sees `p - window < m <= p` (causal) or
    /// `|p - m| < window`, and never a position outside the sequence.
    #[default]
    Sliding,
}

/// Options of the sequence-level local attention entry points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalAttentionOptions {
    /// Attention radius; also the halo borrowed from neighbouring blocks.
    pub window: usize,
    pub causal: bool,
    pub policy: WindowPolicy,
    /// Part of the length held by one processor. Defaults to the per-shard
    /// size under the mesh layout.
    pub length_per_split: Option<usize>,
    pub kernel: KernelOptions,
}

impl Default for LocalAttentionOptions {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            causal: true,
            policy: WindowPolicy::default(),
            length_per_split: None,
            kernel: KernelOptions::default(),
        }
    }
}

impl LocalAttentionOptions {
    /// Causal sliding window of `window` positions.
    pub fn causal(window: usize) -> Self {
        Self {
            window,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.window == 0 {
            return Err(AttentionError::config("local attention window must be positive"));
        }
        self.kernel.validate()
    }
}

/// Name of the memory counterpart of a block dimension.
pub fn memory_block_name(block_name: &str) -> String {
    format!("memory_{block_name}")
}

pub use blocks::{local_2d_self_attention_spatial_blocks, local_self_attention_spatial_blocks};
pub use sequence::{local_attention_1d, local_attention_2d, masked_local_attention_1d};
