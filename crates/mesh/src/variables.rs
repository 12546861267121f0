//! Named trainable variables.
//!
//! Variables live in a [`candle_nn::VarMap`] so an external optimiser can pick
//! them up. Asking for a name that is already taken never aliases the earlier
//! variable: the store appends `_1`, `_2`, ... in request order, which keeps
//! naming deterministic for a given construction sequence.

use std::collections::HashMap;
use std::sync::Mutex;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Init, VarBuilder, VarMap};

use crate::error::{MeshError, Result};
use crate::shape::Shape;
use crate::tensor::MeshTensor;

/// How a fresh variable is filled.
#[derive(Debug, Clone)]
pub enum Initializer {
    Zeros,
    Constant(f64),
    Normal { stddev: f64 },
    /// Use the given values as-is; dims must match the requested shape.
    Value(Tensor),
}

pub struct VariableStore {
    varmap: VarMap,
    taken: Mutex<HashMap<String, usize>>,
}

impl Default for VariableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableStore {
    pub fn new() -> Self {
        Self {
            varmap: VarMap::new(),
            taken: Mutex::new(HashMap::new()),
        }
    }

    /// The backing map, for optimisers and checkpointing.
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Creates a variable named `name`, or `name_<n>` if `name` is taken.
    pub fn get_variable(
        &self,
        name: &str,
        shape: &Shape,
        initializer: Initializer,
        dtype: DType,
        device: &Device,
    ) -> Result<MeshTensor> {
        let unique = self.unique_name(name)?;
        if unique != name {
            log::debug!("variable `{name}` already exists, creating `{unique}`");
        }
        let tensor = match initializer {
            Initializer::Value(value) => {
                if value.dims() != shape.sizes().as_slice() {
                    return Err(MeshError::ShapeMismatch {
                        op: "get_variable",
                        detail: format!(
                            "initial value {:?} does not match {shape}",
                            value.dims()
                        ),
                    });
                }
                let var = Var::from_tensor(&value.to_dtype(dtype)?.to_device(device)?)?;
                let tensor = var.as_tensor().clone();
                self.varmap
                    .data()
                    .lock()
                    .map_err(|_| MeshError::Variables("variable map lock poisoned".into()))?
                    .insert(unique, var);
                tensor
            }
            Initializer::Zeros => self.fresh(&unique, shape, Init::Const(0.0), dtype, device)?,
            Initializer::Constant(value) => {
                self.fresh(&unique, shape, Init::Const(value), dtype, device)?
            }
            Initializer::Normal { stddev } => self.fresh(
                &unique,
                shape,
                Init::Randn {
                    mean: 0.0,
                    stdev: stddev,
                },
                dtype,
                device,
            )?,
        };
        MeshTensor::new(tensor, shape.clone())
    }

    /// Names of all variables created so far, sorted.
    pub fn names(&self) -> Result<Vec<String>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| MeshError::Variables("variable map lock poisoned".into()))?;
        let mut names: Vec<String> = data.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    pub fn len(&self) -> usize {
        self.varmap.all_vars().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn fresh(
        &self,
        name: &str,
        shape: &Shape,
        init: Init,
        dtype: DType,
        device: &Device,
    ) -> Result<Tensor> {
        Ok(VarBuilder::from_varmap(&self.varmap, dtype, device).get_with_hints(
            shape.sizes(),
            name,
            init,
        )?)
    }

    fn unique_name(&self, name: &str) -> Result<String> {
        let mut taken = self
            .taken
            .lock()
            .map_err(|_| MeshError::Variables("name table lock poisoned".into()))?;
        let existing = self
            .varmap
            .data()
            .lock()
            .map_err(|_| MeshError::Variables("variable map lock poisoned".into()))?;
        let count = taken.entry(name.to_string()).or_insert(0);
        // A generated suffix may collide with a name requested explicitly.
        loop {
            let unique = if *count == 0 {
                name.to_string()
            } else {
                format!("{name}_{count}")
            };
            *count += 1;
            if !existing.contains_key(&unique) {
                return Ok(unique);
            }
        }
    }
}

impl std::fmt::Debug for VariableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VariableStore")
            .field("variables", &self.len())
            .finish()
    }
}
