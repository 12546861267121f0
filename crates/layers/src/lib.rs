//! Transformer attention layers over mesh tensors.
//!
//! [`AttentionLayer`] wraps the four attention variants of an
//! encoder-decoder transformer behind one `apply(context, input)` call:
//!
//! * [`SelfAttention`]: full attention with optional relative position
//!   biases;
//! * [`LocalSelfAttention`]: sliding-window attention that switches to the
//!   blocked engine of the [`attention`] crate on long sequences;
//! * [`EncDecAttention`]: attention to the encoder output;
//! * [`TransparentEncDecAttention`]: attention to a learned mixture of
//!   encoder layers.
//!
//! The [`Context`] of a forward pass carries the mode, the inputs every
//! layer may need, and the states threaded through incremental decoding.
//! Layers are described by serde-loadable [`LayerConfig`]s.

pub mod bias;
pub mod checks;
pub mod config;
pub mod context;
pub mod enc_dec;
pub mod error;
pub mod layer;
pub mod local;
pub mod self_attention;
pub mod transparent;

pub use bias::RelativeBias;
pub use config::{AttentionConfig, LayerConfig, LocalConfig, RelativeAttentionType, TransparentConfig};
pub use context::{BiasKey, ConstantState, Context, Mode, MEMORY_LENGTH_NAME};
pub use enc_dec::EncDecAttention;
pub use error::{LayerError, Result};
pub use layer::{apply_layers, build_layers, AttentionLayer};
pub use local::LocalSelfAttention;
pub use self_attention::SelfAttention;
pub use transparent::TransparentEncDecAttention;

#[cfg(test)]
mod tests;
