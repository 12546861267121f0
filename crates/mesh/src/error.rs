//! Error types emitted while building mesh computations.

use thiserror::Error;

/// Failure raised by a mesh primitive.
///
/// Every variant describes a problem detected while the computation is being
/// assembled; none of them is transient.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Two dimensions in one shape share a name.
    #[error("duplicate dimension name `{name}` in shape {shape}")]
    DuplicateDimension { name: String, shape: String },
    /// An operation referenced a dimension the tensor does not carry.
    #[error("dimension `{name}` not found in shape {shape}")]
    UnknownDimension { name: String, shape: String },
    /// Dimensions with the same name disagree on their size.
    #[error("dimension `{name}` has size {left} in one operand and {right} in another")]
    SizeMismatch {
        name: String,
        left: usize,
        right: usize,
    },
    /// Shapes are structurally incompatible for the requested operation.
    #[error("shape mismatch in {op}: {detail}")]
    ShapeMismatch { op: &'static str, detail: String },
    /// An argument is outside the accepted range.
    #[error("invalid argument to {op}: {detail}")]
    InvalidArgument { op: &'static str, detail: String },
    /// The mesh layout cannot split a dimension as requested.
    #[error("layout error: {0}")]
    Layout(String),
    /// The variable store could not register a variable.
    #[error("variable store: {0}")]
    Variables(String),
    /// A failure propagated from the tensor backend.
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MeshError>;
