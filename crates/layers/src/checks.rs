//! Lightweight validation helpers shared across the layer variants.
//!
//! These routines provide concise shape and dtype assertions for the forward
//! paths. They return [`LayerError`]s so call sites can propagate errors
//! without panicking.

use candle_core::DType;
use mesh::{Dimension, MeshTensor};

use crate::error::{LayerError, Result};

/// Ensures `x` carries `dim` with the same size.
pub fn expect_dim(x: &MeshTensor, dim: &Dimension) -> Result<()> {
    if x.shape().contains(dim) {
        Ok(())
    } else {
        Err(LayerError::config(format!(
            "expected {dim} in {}, got none",
            x.shape()
        )))
    }
}

/// Looks up the dimension called `name`.
pub fn require_dim<'a>(x: &'a MeshTensor, name: &str) -> Result<&'a Dimension> {
    x.dim(name).ok_or_else(|| {
        LayerError::config(format!("expected a `{name}` dimension in {}", x.shape()))
    })
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(x: &MeshTensor, allowed: &[DType]) -> Result<()> {
    let dtype = x.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(LayerError::config(format!(
            "expected dtype in {allowed:?}, got {dtype:?}"
        )))
    }
}

/// Activations the layers accept.
pub const FLOAT_DTYPES: &[DType] = &[DType::F32, DType::F64, DType::F16, DType::BF16];

#[cfg(test)]
mod tests {
    use super::*;
    use mesh::Shape;

    #[test]
    fn dimension_and_dtype_checks() -> Result<()> {
        let shape = Shape::new(vec![Dimension::new("batch", 2), Dimension::new("d_model", 3)])?;
        let x = MeshTensor::zeros(&shape, DType::F32, &candle_core::Device::Cpu)?;
        expect_dim(&x, &Dimension::new("d_model", 3))?;
        assert!(expect_dim(&x, &Dimension::new("d_model", 4)).is_err());
        assert_eq!(require_dim(&x, "batch")?.size(), 2);
        assert!(require_dim(&x, "length").is_err());
        expect_dtype_in(&x, FLOAT_DTYPES)?;
        assert!(expect_dtype_in(&x.to_dtype(DType::I64)?, FLOAT_DTYPES).is_err());
        Ok(())
    }
}
