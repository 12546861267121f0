//! Errors raised while building or applying attention layers.

use attention::AttentionError;
use mesh::MeshError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LayerError {
    /// A layer configuration is out of range, or does not fit the context.
    #[error("invalid layer configuration: {context}")]
    Config { context: String },
    /// The layer needs an input the forward pass did not provide.
    #[error("context is missing {what}")]
    MissingContext { what: &'static str },
    #[error(transparent)]
    Attention(#[from] AttentionError),
    #[error(transparent)]
    Mesh(#[from] MeshError),
}

impl LayerError {
    pub(crate) fn config(context: impl Into<String>) -> Self {
        Self::Config {
            context: context.into(),
        }
    }
}

impl From<candle_core::Error> for LayerError {
    fn from(err: candle_core::Error) -> Self {
        Self::Mesh(MeshError::Backend(err))
    }
}

pub type Result<T> = std::result::Result<T, LayerError>;
