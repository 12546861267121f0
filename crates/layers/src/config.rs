//! Serde-loadable layer configurations.
//!
//! Every struct has a `Default` matching the usual transformer settings and a
//! `validate()` that reports the first inconsistency as
//! [`LayerError::Config`]. A model description is a list of [`LayerConfig`]s,
//! tagged by `type`:
//!
//! ```json
//! [
//!   {"type": "self_attention", "num_heads": 4, "key_value_size": 16},
//!   {"type": "local_self_attention", "radius": 32},
//!   {"type": "enc_dec_attention", "shared_kv": true}
//! ]
//! ```

use attention::relative::DEFAULT_MAX_DISTANCE;
use attention::{HeadsLayout, KernelOptions, ParamsConfig};
use mesh::Dimension;
use serde::{Deserialize, Serialize};

use crate::error::{LayerError, Result};

/// Name of the key/value channel dimension of every layer.
pub const KV_NAME: &str = "d_kv";

/// How a layer turns relative positions into logit biases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelativeAttentionType {
    /// A learned `[heads, buckets]` table per layer.
    Bias,
    /// Like `Bias`, but the first layer's result is reused by every layer
    /// of the forward pass.
    BiasShared,
    /// Per-position tables projected from the layer input.
    Contextual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionConfig {
    pub num_heads: usize,
    /// `0` shares the query heads, `1` is multi-query, larger values group
    /// the query heads.
    pub num_memory_heads: usize,
    pub key_value_size: usize,
    pub shared_kv: bool,
    /// Store q, k, v and o in one stacked variable.
    pub combine: bool,
    pub dropout_rate: f32,
    pub relative_attention_type: Option<RelativeAttentionType>,
    pub relative_attention_num_buckets: usize,
    pub relative_attention_max_distance: usize,
    /// Extra kernel settings; the dropout fields are filled per forward pass.
    pub kernel: KernelOptions,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            num_heads: 8,
            num_memory_heads: 0,
            key_value_size: 128,
            shared_kv: false,
            combine: false,
            dropout_rate: 0.0,
            relative_attention_type: None,
            relative_attention_num_buckets: 32,
            relative_attention_max_distance: DEFAULT_MAX_DISTANCE,
            kernel: KernelOptions::default(),
        }
    }
}

impl AttentionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.key_value_size == 0 {
            return Err(LayerError::config("key_value_size must be positive"));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(LayerError::config(format!(
                "dropout_rate must be in [0, 1), got {}",
                self.dropout_rate
            )));
        }
        if self.relative_attention_type.is_some() && self.relative_attention_num_buckets == 0 {
            return Err(LayerError::config(
                "relative attention needs at least one bucket",
            ));
        }
        HeadsLayout::new(self.num_heads, self.num_memory_heads)?;
        self.kernel.validate()?;
        Ok(())
    }

    /// Projection settings for a model dimension of `model_dim`.
    pub fn params_config(&self, model_dim: &Dimension) -> Result<ParamsConfig> {
        let kv_dim = Dimension::new(KV_NAME, self.key_value_size);
        let mut config = ParamsConfig::multihead(model_dim.clone(), kv_dim, self.num_heads)?;
        config.heads = HeadsLayout::new(self.num_heads, self.num_memory_heads)?;
        config.shared_kv = self.shared_kv;
        config.combine = self.combine;
        config.validate()?;
        Ok(config)
    }
}

/// Sliding-window self attention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    #[serde(flatten)]
    pub attention: AttentionConfig,
    /// Number of positions each query sees, itself included.
    pub radius: usize,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            attention: AttentionConfig::default(),
            radius: 128,
        }
    }
}

impl LocalConfig {
    pub fn validate(&self) -> Result<()> {
        if self.radius == 0 {
            return Err(LayerError::config("radius must be positive"));
        }
        self.attention.validate()
    }
}

/// Encoder-decoder attention over a learned mixture of encoder layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransparentConfig {
    #[serde(flatten)]
    pub attention: AttentionConfig,
    pub layers_per_encoder_module: usize,
    pub layers_per_decoder_module: usize,
    pub encoder_num_modules: usize,
    pub decoder_num_modules: usize,
}

impl TransparentConfig {
    pub fn validate(&self) -> Result<()> {
        let counts = [
            ("layers_per_encoder_module", self.layers_per_encoder_module),
            ("layers_per_decoder_module", self.layers_per_decoder_module),
            ("encoder_num_modules", self.encoder_num_modules),
            ("decoder_num_modules", self.decoder_num_modules),
        ];
        if let Some((name, _)) = counts.iter().find(|(_, value)| *value == 0) {
            return Err(LayerError::config(format!("{name} must be positive")));
        }
        self.attention.validate()
    }
}

/// One attention layer of a model description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerConfig {
    SelfAttention(AttentionConfig),
    EncDecAttention(AttentionConfig),
    LocalSelfAttention(LocalConfig),
    TransparentEncDecAttention(TransparentConfig),
}

impl LayerConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::SelfAttention(config) | Self::EncDecAttention(config) => config.validate(),
            Self::LocalSelfAttention(config) => config.validate(),
            Self::TransparentEncDecAttention(config) => config.validate(),
        }
    }

    /// Short name used to scope the layer's variables.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SelfAttention(_) => "self_attention",
            Self::EncDecAttention(_) => "enc_dec_attention",
            Self::LocalSelfAttention(_) => "local_self_attention",
            Self::TransparentEncDecAttention(_) => "transparent_enc_dec_attention",
        }
    }
}
