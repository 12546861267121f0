//! Error types emitted while assembling attention computations.

use mesh::MeshError;
use thiserror::Error;

use crate::halo::Padding;

/// Attention-specific error category.
///
/// All variants are configuration errors: they are returned by the call that
/// detected the inconsistency, before any numeric work depends on it.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape: {context}")]
    InvalidShape { context: String },
    /// A configuration value is out of range or inconsistent.
    #[error("invalid attention configuration: {context}")]
    Config { context: String },
    /// An incremental decode step was presented out of order.
    #[error("decode step expected position {expected}, got {got}")]
    DecodePosition { expected: usize, got: usize },
    /// Blocked spatial operations only support `Padding::Same`.
    #[error("padding {requested:?} is not supported with spatial blocks")]
    UnsupportedPadding { requested: Padding },
    /// Filter size parity does not allow a symmetric halo.
    #[error("filter size {filter_size} has the wrong parity (transposed: {transposed}); blocked convolutions need odd filters, transposed ones even filters")]
    FilterSize { filter_size: usize, transposed: bool },
    /// A failure raised by a mesh primitive.
    #[error(transparent)]
    Mesh(#[from] MeshError),
}

impl AttentionError {
    pub(crate) fn shape(context: impl Into<String>) -> Self {
        Self::InvalidShape {
            context: context.into(),
        }
    }

    pub(crate) fn config(context: impl Into<String>) -> Self {
        Self::Config {
            context: context.into(),
        }
    }
}

impl From<candle_core::Error> for AttentionError {
    fn from(err: candle_core::Error) -> Self {
        Self::Mesh(MeshError::Backend(err))
    }
}

pub type Result<T> = std::result::Result<T, AttentionError>;
