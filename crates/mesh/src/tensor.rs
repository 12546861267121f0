//! Tensors with named dimensions.
//!
//! A [`MeshTensor`] pairs a candle tensor with a [`Shape`]. The candle axes are
//! always laid out in shape order. Values are logically immutable: every
//! operation in [`crate::ops`] returns a new tensor.

use candle_core::{DType, Device, Tensor, WithDType};

use crate::error::{MeshError, Result};
use crate::shape::{Dimension, Shape};

#[derive(Debug, Clone)]
pub struct MeshTensor {
    tensor: Tensor,
    shape: Shape,
}

impl MeshTensor {
    /// Attaches dimension names to a backend tensor whose dims match `shape`.
    pub fn new(tensor: Tensor, shape: Shape) -> Result<Self> {
        if tensor.dims() != shape.sizes().as_slice() {
            return Err(MeshError::ShapeMismatch {
                op: "MeshTensor::new",
                detail: format!(
                    "backend dims {:?} do not match named shape {shape}",
                    tensor.dims()
                ),
            });
        }
        Ok(Self { tensor, shape })
    }

    pub fn zeros(shape: &Shape, dtype: DType, device: &Device) -> Result<Self> {
        let tensor = Tensor::zeros(shape.sizes(), dtype, device)?;
        Self::new(tensor, shape.clone())
    }

    pub fn ones(shape: &Shape, dtype: DType, device: &Device) -> Result<Self> {
        let tensor = Tensor::ones(shape.sizes(), dtype, device)?;
        Self::new(tensor, shape.clone())
    }

    pub fn full(value: f32, shape: &Shape, dtype: DType, device: &Device) -> Result<Self> {
        let tensor = Tensor::full(value, shape.sizes(), device)?.to_dtype(dtype)?;
        Self::new(tensor, shape.clone())
    }

    pub fn from_vec<D: WithDType>(data: Vec<D>, shape: &Shape, device: &Device) -> Result<Self> {
        if data.len() != shape.elem_count() {
            return Err(MeshError::ShapeMismatch {
                op: "MeshTensor::from_vec",
                detail: format!(
                    "{} values cannot fill shape {shape} ({} elements)",
                    data.len(),
                    shape.elem_count()
                ),
            });
        }
        let tensor = Tensor::from_vec(data, shape.sizes(), device)?;
        Self::new(tensor, shape.clone())
    }

    /// A rank-0 tensor holding `value`.
    pub fn scalar(value: f32, dtype: DType, device: &Device) -> Result<Self> {
        Self::full(value, &Shape::scalar(), dtype, device)
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn into_tensor(self) -> Tensor {
        self.tensor
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[Dimension] {
        self.shape.dims()
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dtype(&self) -> DType {
        self.tensor.dtype()
    }

    pub fn device(&self) -> &Device {
        self.tensor.device()
    }

    pub fn dim(&self, name: &str) -> Option<&Dimension> {
        self.shape.get(name)
    }

    pub fn has_dim(&self, name: &str) -> bool {
        self.shape.contains_name(name)
    }

    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        if self.dtype() == dtype {
            return Ok(self.clone());
        }
        Self::new(self.tensor.to_dtype(dtype)?, self.shape.clone())
    }

    /// Flattens the values in shape order into an `f32` vector.
    pub fn to_vec_f32(&self) -> Result<Vec<f32>> {
        Ok(self
            .tensor
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?)
    }

    /// Reads a rank-0 tensor as `f32`.
    pub fn to_scalar_f32(&self) -> Result<f32> {
        if self.rank() != 0 {
            return Err(MeshError::ShapeMismatch {
                op: "MeshTensor::to_scalar_f32",
                detail: format!("expected a scalar, got {}", self.shape),
            });
        }
        Ok(self.tensor.to_dtype(DType::F32)?.to_vec0::<f32>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_dims_must_match_names() -> Result<()> {
        let device = Device::Cpu;
        let shape = Shape::new(vec![Dimension::new("a", 2), Dimension::new("b", 3)])?;
        let tensor = Tensor::zeros((3, 2), DType::F32, &device)?;
        assert!(MeshTensor::new(tensor, shape.clone()).is_err());

        let ok = MeshTensor::from_vec((0..6).map(|v| v as f32).collect(), &shape, &device)?;
        assert_eq!(ok.to_vec_f32()?, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        Ok(())
    }

    #[test]
    fn scalar_round_trip() -> Result<()> {
        let value = MeshTensor::scalar(2.5, DType::F32, &Device::Cpu)?;
        assert_eq!(value.rank(), 0);
        assert_eq!(value.to_scalar_f32()?, 2.5);
        Ok(())
    }
}
