//! Attention biases of the self-attention layers.
//!
//! A layer asks for the bias of its query/memory positions with an optional
//! relative window `[min, max]`; sequence ids and relative position tables
//! are added on top. Biases without layer-specific variables are computed
//! once per [`Context`] and shared.

use attention::masks::visibility_mask_to_attention_bias;
use attention::relative_position_buckets;
use attention::HeadsLayout;
use candle_core::DType;
use mesh::ops::{
    add_n, affine, einsum, equal, greater_equal_scalar, less_equal_scalar, one_hot,
    rename_dimension, sub,
};
use mesh::{Dimension, Initializer, Mesh, MeshTensor, Shape, VariableStore};

use crate::config::{AttentionConfig, RelativeAttentionType};
use crate::context::{BiasKey, Context, Mode, MEMORY_LENGTH_NAME};
use crate::error::Result;

const BUCKETS_NAME: &str = "buckets";

/// Learned logit offsets indexed by relative position bucket.
#[derive(Debug, Clone)]
pub struct RelativeBias {
    kind: RelativeAttentionType,
    buckets_dim: Dimension,
    max_distance: usize,
    /// `heads... + [buckets]`, or `[model] + [buckets] + heads...` when
    /// contextual.
    weights: MeshTensor,
}

impl RelativeBias {
    /// Creates the variables of `config.relative_attention_type`, if any.
    pub fn new(
        mesh: &Mesh,
        store: &VariableStore,
        name: &str,
        config: &AttentionConfig,
        heads: &HeadsLayout,
        model_dim: &Dimension,
    ) -> Result<Option<Self>> {
        let Some(kind) = config.relative_attention_type else {
            return Ok(None);
        };
        let buckets_dim = Dimension::new(BUCKETS_NAME, config.relative_attention_num_buckets);
        let heads_dims = heads.query_heads_dims().to_vec();
        let (variable, dims, stddev) = match kind {
            RelativeAttentionType::Bias | RelativeAttentionType::BiasShared => {
                let mut dims = heads_dims;
                dims.push(buckets_dim.clone());
                let fan = (heads.num_query_heads() + buckets_dim.size()) as f64;
                ("relative_attention_bias", dims, (2.0 / fan).sqrt())
            }
            RelativeAttentionType::Contextual => {
                let mut dims = vec![model_dim.clone(), buckets_dim.clone()];
                dims.extend(heads_dims);
                (
                    "relative_attention_contextual",
                    dims,
                    (model_dim.size() as f64).powf(-0.5),
                )
            }
        };
        let weights = store.get_variable(
            &format!("{name}/{variable}"),
            &Shape::new(dims)?,
            Initializer::Normal { stddev },
            mesh.activation_dtype(),
            mesh.device(),
        )?;
        Ok(Some(Self {
            kind,
            buckets_dim,
            max_distance: config.relative_attention_max_distance,
            weights,
        }))
    }

    pub fn kind(&self) -> RelativeAttentionType {
        self.kind
    }

    /// Bias over `relative_position`'s dims plus the heads dims.
    pub fn values(
        &self,
        x: &MeshTensor,
        relative_position: &MeshTensor,
        bidirectional: bool,
    ) -> Result<MeshTensor> {
        let buckets = relative_position_buckets(
            relative_position,
            bidirectional,
            self.buckets_dim.size(),
            self.max_distance,
        )?;
        let selector = one_hot(&buckets, &self.buckets_dim, self.weights.dtype())?;
        let table = match self.kind {
            RelativeAttentionType::Contextual => {
                let model_name = self.weights.dims()[0].name().to_string();
                let output = x
                    .shape()
                    .without(&[model_name.as_str()])
                    .union(&self.weights.shape().without(&[model_name.as_str()]))?;
                einsum(&[x, &self.weights], &output)?
            }
            _ => self.weights.clone(),
        };
        let output = table
            .shape()
            .union(selector.shape())?
            .without(&[BUCKETS_NAME]);
        Ok(einsum(&[&table, &selector], &output)?)
    }
}

/// What a layer needs masked or added.
pub struct BiasRequest<'a> {
    pub min_relative_position: Option<i64>,
    pub max_relative_position: Option<i64>,
    pub relative: Option<&'a RelativeBias>,
    pub num_heads: usize,
}

/// The additive bias of a self-attention call, or `None` when nothing is
/// masked.
///
/// `memory_position` holds the position of every memory slot over
/// [`MEMORY_LENGTH_NAME`]; `x` is the layer input (used by contextual
/// relative attention).
pub fn compute_bias(
    ctx: &mut Context,
    request: &BiasRequest<'_>,
    memory_position: &MeshTensor,
    x: &MeshTensor,
    dtype: DType,
) -> Result<Option<MeshTensor>> {
    let relative_type = request.relative.map(RelativeBias::kind);
    let key = BiasKey {
        min_relative_position: request.min_relative_position,
        max_relative_position: request.max_relative_position,
        relative_attention_type: relative_type,
        num_heads: request.num_heads,
    };
    let cacheable = matches!(relative_type, None | Some(RelativeAttentionType::BiasShared));
    if cacheable {
        if let Some(bias) = ctx.cached_bias(&key) {
            log::debug!("attention bias cache hit for {key:?}");
            return Ok(bias.clone());
        }
    }

    let relative_position = match ctx.mode() {
        Mode::Incremental { position } => affine(memory_position, 1.0, -(position as f64))?,
        _ => sub(memory_position, &ctx.positions()?)?,
    };
    let mut biases = Vec::new();
    if let Some(min) = request.min_relative_position {
        let visible = greater_equal_scalar(&relative_position, min as f64)?;
        biases.push(visibility_mask_to_attention_bias(&visible, dtype)?);
    }
    if let Some(max) = request.max_relative_position {
        let visible = less_equal_scalar(&relative_position, max as f64)?;
        biases.push(visibility_mask_to_attention_bias(&visible, dtype)?);
    }
    if let Some(sequence_id) = &ctx.sequence_id {
        let length_name = ctx.length_dim.name();
        if sequence_id.has_dim(length_name) {
            let memory_id = rename_dimension(sequence_id, length_name, MEMORY_LENGTH_NAME)?;
            let visible = equal(sequence_id, &memory_id)?;
            biases.push(visibility_mask_to_attention_bias(&visible, dtype)?);
        }
    }
    if let Some(relative) = request.relative {
        let values = relative.values(x, &relative_position, !ctx.fully_autoregressive)?;
        biases.push(values.to_dtype(dtype)?);
    }
    let bias = add_n(&biases)?;
    if cacheable {
        log::debug!("attention bias cache miss for {key:?}");
        ctx.cache_bias(key, bias.clone());
    }
    Ok(bias)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh::ops::range;

    fn context(mode: Mode, length: usize) -> Context {
        Context::new(
            Mesh::cpu(),
            mode,
            Dimension::new("d_model", 4),
            Dimension::new("length", length),
        )
    }

    fn memory_positions(ctx: &Context) -> Result<MeshTensor> {
        Ok(rename_dimension(&ctx.positions()?, "length", MEMORY_LENGTH_NAME)?)
    }

    fn input(ctx: &Context) -> Result<MeshTensor> {
        let shape = Shape::new(vec![ctx.length_dim.clone(), ctx.model_dim.clone()])?;
        Ok(MeshTensor::zeros(&shape, DType::F32, ctx.mesh().device())?)
    }

    #[test]
    fn relative_window_masks_and_caches() -> Result<()> {
        let mut ctx = context(Mode::Eval, 4);
        let request = BiasRequest {
            min_relative_position: Some(-1),
            max_relative_position: Some(0),
            relative: None,
            num_heads: 2,
        };
        let x = input(&ctx)?;
        let memory = memory_positions(&ctx)?;
        let bias = compute_bias(&mut ctx, &request, &memory, &x, DType::F32)?
            .expect("window bias");
        let names = bias.shape().names();
        assert!(names.contains(&"length") && names.contains(&MEMORY_LENGTH_NAME));
        let bias = mesh::ops::transpose_to(
            &bias,
            &Shape::new(vec![
                Dimension::new("length", 4),
                Dimension::new(MEMORY_LENGTH_NAME, 4),
            ])?,
        )?;
        let values = bias.to_vec_f32()?;
        for p in 0..4 {
            for m in 0..4 {
                let visible = m <= p && p - m <= 1;
                assert_eq!(values[p * 4 + m] == 0.0, visible, "query {p} memory {m}");
            }
        }
        assert_eq!(ctx.bias_cache_len(), 1);
        compute_bias(&mut ctx, &request, &memory, &x, DType::F32)?;
        assert_eq!(ctx.bias_cache_len(), 1);
        Ok(())
    }

    #[test]
    fn nothing_to_mask_is_none() -> Result<()> {
        let mut ctx = context(Mode::Eval, 3);
        let request = BiasRequest {
            min_relative_position: None,
            max_relative_position: None,
            relative: None,
            num_heads: 2,
        };
        let x = input(&ctx)?;
        let memory = memory_positions(&ctx)?;
        assert!(compute_bias(&mut ctx, &request, &memory, &x, DType::F32)?.is_none());
        Ok(())
    }

    #[test]
    fn incremental_bias_uses_the_decode_position() -> Result<()> {
        let mut ctx = context(Mode::Incremental { position: 1 }, 3);
        let request = BiasRequest {
            min_relative_position: None,
            max_relative_position: Some(0),
            relative: None,
            num_heads: 2,
        };
        let x = MeshTensor::zeros(
            &Shape::new(vec![ctx.model_dim.clone()])?,
            DType::F32,
            ctx.mesh().device(),
        )?;
        let memory = range(ctx.mesh(), &ctx.memory_length_dim(), DType::I64)?;
        let bias = compute_bias(&mut ctx, &request, &memory, &x, DType::F32)?
            .expect("causal bias");
        assert_eq!(bias.shape().names(), vec![MEMORY_LENGTH_NAME]);
        let values = bias.to_vec_f32()?;
        assert_eq!(values[0], 0.0);
        assert_eq!(values[1], 0.0);
        assert!(values[2] < -1e8);
        Ok(())
    }

    #[test]
    fn sequence_ids_separate_segments() -> Result<()> {
        let mut ctx = context(Mode::Eval, 4);
        let shape = Shape::new(vec![ctx.length_dim.clone()])?;
        ctx.sequence_id = Some(MeshTensor::from_vec(
            vec![1i64, 1, 2, 2],
            &shape,
            ctx.mesh().device(),
        )?);
        let request = BiasRequest {
            min_relative_position: None,
            max_relative_position: None,
            relative: None,
            num_heads: 1,
        };
        let x = input(&ctx)?;
        let memory = memory_positions(&ctx)?;
        let bias = compute_bias(&mut ctx, &request, &memory, &x, DType::F32)?
            .expect("segment bias");
        assert_eq!(bias.shape().names(), vec!["length", MEMORY_LENGTH_NAME]);
        let values = bias.to_vec_f32()?;
        assert_eq!(values[1], 0.0);
        assert!(values[2] < -1e8);
        assert_eq!(values[2 * 4 + 3], 0.0);
        Ok(())
    }

    #[test]
    fn relative_tables_are_gathered_per_bucket() -> Result<()> {
        let mesh = Mesh::cpu();
        let store = VariableStore::new();
        let config = AttentionConfig {
            num_heads: 2,
            relative_attention_type: Some(RelativeAttentionType::Bias),
            relative_attention_num_buckets: 4,
            ..AttentionConfig::default()
        };
        let heads = HeadsLayout::new(2, 0)?;
        let model = Dimension::new("d_model", 4);
        let relative = RelativeBias::new(&mesh, &store, "layer", &config, &heads, &model)?
            .expect("bias table");
        assert_eq!(store.names()?, vec!["layer/relative_attention_bias".to_string()]);

        let mut ctx = context(Mode::Eval, 3);
        let request = BiasRequest {
            min_relative_position: None,
            max_relative_position: None,
            relative: Some(&relative),
            num_heads: 2,
        };
        let x = input(&ctx)?;
        let memory = memory_positions(&ctx)?;
        let bias = compute_bias(&mut ctx, &request, &memory, &x, DType::F32)?
            .expect("relative bias");
        let mut names = bias.shape().names();
        names.sort();
        assert_eq!(names, vec!["heads", "length", MEMORY_LENGTH_NAME]);
        // Per-layer tables are never cached.
        assert_eq!(ctx.bias_cache_len(), 0);

        // Equal relative positions read equal table entries.
        let ordered = mesh::ops::transpose_to(
            &bias,
            &Shape::new(vec![
                Dimension::new("heads", 2),
                Dimension::new("length", 3),
                Dimension::new(MEMORY_LENGTH_NAME, 3),
            ])?,
        )?
        .to_vec_f32()?;
        assert_eq!(ordered[0], ordered[4]);
        assert_eq!(ordered[1], ordered[5]);
        assert_eq!(ordered[3], ordered[7]);
        Ok(())
    }
}
