//! Mesh description: device, activation dtype and dimension layout.
//!
//! The layout records how many processors each named dimension is split
//! across. Layout rules are keyed by dimension *name*, so a blocks dimension
//! that reuses the name of the length dimension is split the same way.

use std::collections::BTreeMap;

use candle_core::{DType, Device};

use crate::error::{MeshError, Result};
use crate::shape::Dimension;

/// Mapping from dimension names to the number of processors splitting them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeshLayout {
    splits: BTreeMap<String, usize>,
}

impl MeshLayout {
    /// A layout in which every dimension is replicated.
    pub fn replicated() -> Self {
        Self::default()
    }

    /// Splits `name` across `num_splits` processors.
    pub fn with_split(mut self, name: impl Into<String>, num_splits: usize) -> Result<Self> {
        let name = name.into();
        if num_splits == 0 {
            return Err(MeshError::Layout(format!(
                "dimension `{name}` cannot be split zero ways"
            )));
        }
        self.splits.insert(name, num_splits);
        Ok(self)
    }

    /// Number of processors the named dimension is split across (1 if replicated).
    pub fn num_splits(&self, name: &str) -> usize {
        self.splits.get(name).copied().unwrap_or(1)
    }

    pub fn is_split(&self, name: &str) -> bool {
        self.num_splits(name) > 1
    }

    /// Size of the slice of `dim` held by one processor.
    pub fn per_shard_size(&self, dim: &Dimension) -> Result<usize> {
        let splits = self.num_splits(dim.name());
        if dim.size() % splits != 0 {
            return Err(MeshError::Layout(format!(
                "dimension {dim} is not divisible across {splits} processors"
            )));
        }
        Ok(dim.size() / splits)
    }
}

/// The context a computation is assembled in.
#[derive(Debug, Clone)]
pub struct Mesh {
    device: Device,
    layout: MeshLayout,
    activation_dtype: DType,
}

impl Mesh {
    pub fn new(device: Device, layout: MeshLayout, activation_dtype: DType) -> Self {
        Self {
            device,
            layout,
            activation_dtype,
        }
    }

    /// A replicated `f32` mesh on the CPU.
    pub fn cpu() -> Self {
        Self::new(Device::Cpu, MeshLayout::replicated(), DType::F32)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn layout(&self) -> &MeshLayout {
        &self.layout
    }

    pub fn activation_dtype(&self) -> DType {
        self.activation_dtype
    }

    pub fn with_layout(mut self, layout: MeshLayout) -> Self {
        self.layout = layout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_shard_size_divides_split_dims() -> Result<()> {
        let layout = MeshLayout::replicated().with_split("length", 4)?;
        assert_eq!(layout.per_shard_size(&Dimension::new("length", 64))?, 16);
        assert_eq!(layout.per_shard_size(&Dimension::new("batch", 3))?, 3);
        assert!(layout.is_split("length"));
        assert!(!layout.is_split("batch"));
        Ok(())
    }

    #[test]
    fn indivisible_split_is_a_layout_error() -> Result<()> {
        let layout = MeshLayout::replicated().with_split("length", 3)?;
        let err = layout
            .per_shard_size(&Dimension::new("length", 16))
            .unwrap_err();
        assert!(matches!(err, MeshError::Layout(_)));
        assert!(MeshLayout::replicated().with_split("length", 0).is_err());
        Ok(())
    }
}
