//! Local and blocked attention over named-dimension tensors.
//!
//! The crate builds attention computations on top of the [`mesh`] runtime:
//!
//! * [`partition`] splits a length dimension into equal blocks whose blocks
//!   dimension keeps the length name, so sharding carries over.
//! * [`halo`] extends blocks with data borrowed from their neighbours, or
//!   zero padding when the axis is not split.
//! * [`kernel`] is the dot-product attention kernel every engine ends in.
//! * [`local`] runs blocked 1D/2D self-attention; [`multihead`] runs full
//!   attention; [`incremental`] decodes one token at a time over a rolling
//!   window.
//! * [`masks`] builds additive biases and [`relative`] buckets relative
//!   positions.
//!
//! Every configuration problem is reported as an [`AttentionError`] by the
//! call that detects it, before any numeric work depends on it.

pub mod core;
pub mod halo;
pub mod incremental;
pub mod kernel;
pub mod local;
pub mod masks;
pub mod multihead;
pub mod params;
pub mod partition;
pub mod relative;

pub use crate::core::{AttentionError, KernelOptions, Result};
pub use halo::{HaloMode, Padding, SpatialBlocks};
pub use incremental::{masked_local_attention_1d_incremental, DecodeBuffers, DecodeState};
pub use kernel::{attention, dot_product_attention};
pub use local::{
    local_2d_self_attention_spatial_blocks, local_attention_1d, local_attention_2d,
    local_self_attention_spatial_blocks, masked_local_attention_1d, LocalAttentionOptions,
    WindowPolicy,
};
pub use multihead::{
    compress_mean, multihead_attention, multihead_encdec_attention_incremental,
    multihead_self_attention_incremental, multihead_self_attention_memory_compressed,
};
pub use params::{AttentionParams, HeadsLayout, ParamsConfig};
pub use partition::{choose_block_length, BlockPartition};
pub use relative::{relative_position_bucket, relative_position_buckets};
