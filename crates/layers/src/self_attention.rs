//! Full self attention over the whole sequence.

use attention::incremental::blend;
use attention::{attention, AttentionParams};
use candle_core::DType;
use mesh::ops::{one_hot_scalar, range, rename_dimension, replace_dimensions};
use mesh::{Dimension, Mesh, MeshTensor, VariableStore};

use crate::bias::{compute_bias, BiasRequest, RelativeBias};
use crate::checks::{expect_dim, expect_dtype_in, FLOAT_DTYPES};
use crate::config::AttentionConfig;
use crate::context::{Context, Mode};
use crate::error::{LayerError, Result};

#[derive(Debug, Clone)]
pub struct SelfAttention {
    config: AttentionConfig,
    params: AttentionParams,
    relative: Option<RelativeBias>,
}

impl SelfAttention {
    /// Creates the projection (and relative bias) variables under `name`.
    pub fn new(
        mesh: &Mesh,
        store: &VariableStore,
        name: &str,
        model_dim: &Dimension,
        config: AttentionConfig,
    ) -> Result<Self> {
        config.validate()?;
        let params = AttentionParams::new(mesh, store, name, config.params_config(model_dim)?)?;
        let relative = RelativeBias::new(mesh, store, name, &config, params.heads(), model_dim)?;
        Ok(Self {
            config,
            params,
            relative,
        })
    }

    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    pub fn params(&self) -> &AttentionParams {
        &self.params
    }

    pub(crate) fn relative(&self) -> Option<&RelativeBias> {
        self.relative.as_ref()
    }

    /// Number of decode states this layer records per step.
    pub(crate) fn num_states(&self) -> usize {
        if self.config.shared_kv {
            1
        } else {
            2
        }
    }

    pub(crate) fn states_of(&self, k: MeshTensor, v: MeshTensor) -> Vec<MeshTensor> {
        if self.config.shared_kv {
            vec![k]
        } else {
            vec![k, v]
        }
    }

    pub(crate) fn check_input(&self, ctx: &Context, x: &MeshTensor) -> Result<()> {
        expect_dtype_in(x, FLOAT_DTYPES)?;
        expect_dim(x, &ctx.model_dim)
    }

    pub fn apply(&self, ctx: &mut Context, x: &MeshTensor) -> Result<MeshTensor> {
        self.check_input(ctx, x)?;
        let max_relative_position = ctx.fully_autoregressive.then_some(0);
        let memory_length = ctx.memory_length_dim();
        let (k, v, memory_position) = match ctx.mode() {
            Mode::Incremental { position } => {
                if position >= memory_length.size() {
                    return Err(LayerError::config(format!(
                        "decode position {position} is past {memory_length}"
                    )));
                }
                let states = ctx.take_states(self.num_states())?;
                let (new_k, new_v) = self.params.compute_memory(x)?;
                let slot = one_hot_scalar(ctx.mesh(), position, &memory_length, new_k.dtype())?;
                let k = blend(&states[0], &new_k, &slot)?;
                let v = match states.get(1) {
                    Some(old_v) => blend(old_v, &new_v, &slot)?,
                    None => k.clone(),
                };
                ctx.record_new_states(self.states_of(k.clone(), v.clone()));
                let memory_position = range(ctx.mesh(), &memory_length, DType::I64)?;
                (k, v, memory_position)
            }
            mode => {
                let (k, v) = self.memory(ctx, x)?;
                if let Mode::FirstPart { .. } = mode {
                    ctx.record_new_states(self.states_of(k.clone(), v.clone()));
                }
                (k, v, self.memory_positions(ctx)?)
            }
        };
        self.attend(ctx, x, &k, &v, &memory_position, None, max_relative_position)
    }

    /// Keys and values of the whole input, over the memory length.
    pub(crate) fn memory(&self, ctx: &Context, x: &MeshTensor) -> Result<(MeshTensor, MeshTensor)> {
        let memory = replace_dimensions(x, &ctx.length_dim, &ctx.memory_length_dim())?;
        Ok(self.params.compute_memory(&memory)?)
    }

    pub(crate) fn memory_positions(&self, ctx: &Context) -> Result<MeshTensor> {
        Ok(rename_dimension(
            &ctx.positions()?,
            ctx.length_dim.name(),
            ctx.memory_length_dim().name(),
        )?)
    }

    /// Attends `x` to `k`/`v` with the relative window `[min, max]`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn attend(
        &self,
        ctx: &mut Context,
        x: &MeshTensor,
        k: &MeshTensor,
        v: &MeshTensor,
        memory_position: &MeshTensor,
        min_relative_position: Option<i64>,
        max_relative_position: Option<i64>,
    ) -> Result<MeshTensor> {
        let q = self.params.compute_q(x)?;
        let request = BiasRequest {
            min_relative_position,
            max_relative_position,
            relative: self.relative(),
            num_heads: self.config.num_heads,
        };
        let bias = compute_bias(ctx, &request, memory_position, x, q.dtype())?;
        let options = ctx.kernel_options(&self.config);
        let o = attention(
            &q,
            k,
            v,
            &ctx.memory_length_dim(),
            self.params.key_dim(),
            self.params.value_dim(),
            bias.as_ref(),
            &options,
        )?;
        Ok(self.params.compute_output(&o)?)
    }
}
