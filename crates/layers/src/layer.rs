//! The attention layer variants behind one `apply` entry point.

use attention::AttentionParams;
use mesh::ops::add;
use mesh::{Dimension, Mesh, MeshTensor, VariableStore};

use crate::config::LayerConfig;
use crate::context::Context;
use crate::enc_dec::EncDecAttention;
use crate::error::Result;
use crate::local::LocalSelfAttention;
use crate::self_attention::SelfAttention;
use crate::transparent::TransparentEncDecAttention;

#[derive(Debug, Clone)]
pub enum AttentionLayer {
    SelfAttention(SelfAttention),
    EncDecAttention(EncDecAttention),
    LocalSelfAttention(LocalSelfAttention),
    TransparentEncDecAttention(TransparentEncDecAttention),
}

impl AttentionLayer {
    /// Builds the layer described by `config`, with variables under `name`.
    pub fn new(
        config: &LayerConfig,
        mesh: &Mesh,
        store: &VariableStore,
        name: &str,
        model_dim: &Dimension,
    ) -> Result<Self> {
        Self::build(config, mesh, store, name, model_dim, None)
    }

    fn build(
        config: &LayerConfig,
        mesh: &Mesh,
        store: &VariableStore,
        name: &str,
        model_dim: &Dimension,
        mixing: Option<MeshTensor>,
    ) -> Result<Self> {
        let layer = match config {
            LayerConfig::SelfAttention(config) => Self::SelfAttention(SelfAttention::new(
                mesh,
                store,
                name,
                model_dim,
                config.clone(),
            )?),
            LayerConfig::EncDecAttention(config) => Self::EncDecAttention(EncDecAttention::new(
                mesh,
                store,
                name,
                model_dim,
                config.clone(),
            )?),
            LayerConfig::LocalSelfAttention(config) => Self::LocalSelfAttention(
                LocalSelfAttention::new(mesh, store, name, model_dim, config.clone())?,
            ),
            LayerConfig::TransparentEncDecAttention(config) => Self::TransparentEncDecAttention(
                TransparentEncDecAttention::new(mesh, store, name, model_dim, config.clone(), mixing)?,
            ),
        };
        Ok(layer)
    }

    pub fn apply(&self, ctx: &mut Context, x: &MeshTensor) -> Result<MeshTensor> {
        match self {
            Self::SelfAttention(layer) => layer.apply(ctx, x),
            Self::EncDecAttention(layer) => layer.apply(ctx, x),
            Self::LocalSelfAttention(layer) => layer.apply(ctx, x),
            Self::TransparentEncDecAttention(layer) => layer.apply(ctx, x),
        }
    }

    pub fn params(&self) -> &AttentionParams {
        match self {
            Self::SelfAttention(layer) => layer.params(),
            Self::EncDecAttention(layer) => layer.params(),
            Self::LocalSelfAttention(layer) => layer.base().params(),
            Self::TransparentEncDecAttention(layer) => layer.base().params(),
        }
    }
}

/// Builds a stack of layers named `{prefix}/layer_{i}/{kind}`.
///
/// Transparent layers of one stack share a single mixing matrix.
pub fn build_layers(
    configs: &[LayerConfig],
    mesh: &Mesh,
    store: &VariableStore,
    prefix: &str,
    model_dim: &Dimension,
) -> Result<Vec<AttentionLayer>> {
    let mut mixing: Option<MeshTensor> = None;
    let mut layers = Vec::with_capacity(configs.len());
    for (index, config) in configs.iter().enumerate() {
        config.validate()?;
        let name = format!("{prefix}/layer_{index}/{}", config.kind());
        let layer = AttentionLayer::build(config, mesh, store, &name, model_dim, mixing.clone())?;
        if let AttentionLayer::TransparentEncDecAttention(transparent) = &layer {
            mixing.get_or_insert_with(|| transparent.mixing().clone());
        }
        layers.push(layer);
    }
    Ok(layers)
}

/// Runs `layers` in order with residual connections, setting
/// `ctx.layer_index` for each.
pub fn apply_layers(
    layers: &[AttentionLayer],
    ctx: &mut Context,
    x: &MeshTensor,
) -> Result<MeshTensor> {
    let mut x = x.clone();
    for (index, layer) in layers.iter().enumerate() {
        ctx.layer_index = index;
        let y = layer.apply(ctx, &x)?;
        x = add(&x, &y)?;
    }
    Ok(x)
}
