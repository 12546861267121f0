//! Named dimensions and ordered shapes.
//!
//! A [`Dimension`] is an immutable `(name, size)` pair; two dimensions are
//! equal only when both components match. A [`Shape`] is an ordered list of
//! dimensions with unique names. The order defines the physical axis order of
//! the backing tensor, while names drive every alignment decision (einsum,
//! broadcasting, halo exchange).

use std::fmt;

use crate::error::{MeshError, Result};

/// A named, sized tensor axis.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dimension {
    name: String,
    size: usize,
}

impl Dimension {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Same size, different name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self::new(name, self.size)
    }

    /// Same name, different size.
    pub fn resized(&self, size: usize) -> Self {
        Self::new(self.name.clone(), size)
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.size)
    }
}

/// Ordered collection of dimensions without duplicate names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape {
    dims: Vec<Dimension>,
}

impl Shape {
    /// Builds a shape, rejecting duplicate dimension names.
    pub fn new(dims: Vec<Dimension>) -> Result<Self> {
        for (idx, dim) in dims.iter().enumerate() {
            if dims[..idx].iter().any(|other| other.name == dim.name) {
                return Err(MeshError::DuplicateDimension {
                    name: dim.name.clone(),
                    shape: format_dims(&dims),
                });
            }
        }
        Ok(Self { dims })
    }

    /// The rank-0 shape.
    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dims.is_empty()
    }

    /// Sizes in axis order, as consumed by the tensor backend.
    pub fn sizes(&self) -> Vec<usize> {
        self.dims.iter().map(Dimension::size).collect()
    }

    /// Total number of elements.
    pub fn elem_count(&self) -> usize {
        self.dims.iter().map(Dimension::size).product()
    }

    pub fn names(&self) -> Vec<&str> {
        self.dims.iter().map(Dimension::name).collect()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.dims.iter().position(|dim| dim.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&Dimension> {
        self.dims.iter().find(|dim| dim.name == name)
    }

    /// Looks a dimension up by name, failing with [`MeshError::UnknownDimension`].
    pub fn require(&self, name: &str) -> Result<&Dimension> {
        self.get(name).ok_or_else(|| MeshError::UnknownDimension {
            name: name.to_string(),
            shape: self.to_string(),
        })
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    /// True when a dimension with the same name *and* size is present.
    pub fn contains(&self, dim: &Dimension) -> bool {
        self.dims.iter().any(|d| d == dim)
    }

    /// Returns the dimension at `idx`; negative indices count from the end.
    pub fn dim(&self, idx: isize) -> Option<&Dimension> {
        let rank = self.dims.len() as isize;
        let resolved = if idx < 0 { rank + idx } else { idx };
        if (0..rank).contains(&resolved) {
            Some(&self.dims[resolved as usize])
        } else {
            None
        }
    }

    /// Removes the named dimensions, ignoring names that are absent.
    pub fn without(&self, names: &[&str]) -> Self {
        Self {
            dims: self
                .dims
                .iter()
                .filter(|dim| !names.contains(&dim.name()))
                .cloned()
                .collect(),
        }
    }

    /// Appends the dimensions of `other` that are not already present by name.
    ///
    /// Same-named dimensions must agree on their size.
    pub fn union(&self, other: &Shape) -> Result<Self> {
        let mut dims = self.dims.clone();
        for dim in &other.dims {
            match self.get(dim.name()) {
                Some(existing) if existing.size != dim.size => {
                    return Err(MeshError::SizeMismatch {
                        name: dim.name.clone(),
                        left: existing.size,
                        right: dim.size,
                    })
                }
                Some(_) => {}
                None => dims.push(dim.clone()),
            }
        }
        Ok(Self { dims })
    }

    /// Concatenates two shapes, failing on duplicate names.
    pub fn concat(&self, other: &Shape) -> Result<Self> {
        let mut dims = self.dims.clone();
        dims.extend(other.dims.iter().cloned());
        Self::new(dims)
    }

    /// Replaces the dimension called `old` with `new` in place.
    pub fn replace(&self, old: &str, new: Dimension) -> Result<Self> {
        let idx = self.index_of(old).ok_or_else(|| MeshError::UnknownDimension {
            name: old.to_string(),
            shape: self.to_string(),
        })?;
        let mut dims = self.dims.clone();
        dims[idx] = new;
        Self::new(dims)
    }

    /// Renames a dimension, keeping its size.
    pub fn rename(&self, old: &str, new: &str) -> Result<Self> {
        let size = self.require(old)?.size;
        self.replace(old, Dimension::new(new, size))
    }
}

impl TryFrom<Vec<Dimension>> for Shape {
    type Error = MeshError;

    fn try_from(dims: Vec<Dimension>) -> Result<Self> {
        Self::new(dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_dims(&self.dims))
    }
}

fn format_dims(dims: &[Dimension]) -> String {
    let parts: Vec<String> = dims.iter().map(ToString::to_string).collect();
    format!("[{}]", parts.join(", "))
}
