//! Options shared by every attention kernel call.
//!
//! [`KernelOptions`] captures the run-time knobs of the dot-product kernel so
//! that callers can tune them without changing the engine they go through.

use serde::{Deserialize, Serialize};

use super::errors::{AttentionError, Result};

/// Configuration driving the dot-product kernel.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelOptions {
    /// Dropout rate applied to the attention weights. `0.0` disables it.
    pub dropout_rate: f32,
    /// Dimension names along which one dropout decision is shared.
    pub dropout_broadcast_dims: Vec<String>,
    /// Multiplier applied to the logits before the bias is added.
    ///
    /// The default initialisers already fold `1/sqrt(d)` into the query and
    /// key projections, so this is normally left unset.
    pub scale: Option<f32>,
    /// Logit of an implicit extra key whose value is zero.
    pub extra_logit: Option<f32>,
}

impl KernelOptions {
    /// Deterministic options with dropout disabled.
    pub fn eval() -> Self {
        Self::default()
    }

    pub fn with_dropout(mut self, rate: f32, broadcast_dims: &[&str]) -> Self {
        self.dropout_rate = rate;
        self.dropout_broadcast_dims = broadcast_dims.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(AttentionError::config(format!(
                "dropout rate must be in [0, 1), got {}",
                self.dropout_rate
            )));
        }
        if let Some(scale) = self.scale {
            if !scale.is_finite() {
                return Err(AttentionError::config("logit scale must be finite"));
            }
        }
        Ok(())
    }
}
