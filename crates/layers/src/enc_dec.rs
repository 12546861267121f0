//! Decoder-to-encoder attention.

use attention::masks::visibility_mask_to_attention_bias;
use attention::{attention, AttentionParams};
use mesh::ops::equal;
use mesh::{Dimension, Mesh, MeshTensor, VariableStore};

use crate::checks::{expect_dim, expect_dtype_in, require_dim, FLOAT_DTYPES};
use crate::config::AttentionConfig;
use crate::context::{ConstantState, Context, Mode, MEMORY_LENGTH_NAME};
use crate::error::{LayerError, Result};

#[derive(Debug, Clone)]
pub struct EncDecAttention {
    config: AttentionConfig,
    params: AttentionParams,
}

impl EncDecAttention {
    pub fn new(
        mesh: &Mesh,
        store: &VariableStore,
        name: &str,
        model_dim: &Dimension,
        config: AttentionConfig,
    ) -> Result<Self> {
        config.validate()?;
        let params = AttentionParams::new(mesh, store, name, config.params_config(model_dim)?)?;
        Ok(Self { config, params })
    }

    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    pub fn params(&self) -> &AttentionParams {
        &self.params
    }

    /// Attends to `ctx.encoder_output`.
    pub fn apply(&self, ctx: &mut Context, x: &MeshTensor) -> Result<MeshTensor> {
        self.apply_to(ctx, x, |ctx| {
            ctx.encoder_output
                .clone()
                .ok_or(LayerError::MissingContext {
                    what: "the encoder output",
                })
        })
    }

    /// Attends to the memory produced by `memory`.
    ///
    /// In [`Mode::Incremental`] the keys and values recorded by the first
    /// part are used instead and `memory` is not called.
    pub(crate) fn apply_to<F>(&self, ctx: &mut Context, x: &MeshTensor, memory: F) -> Result<MeshTensor>
    where
        F: FnOnce(&mut Context) -> Result<MeshTensor>,
    {
        expect_dtype_in(x, FLOAT_DTYPES)?;
        expect_dim(x, &ctx.model_dim)?;
        let q = self.params.compute_q(x)?;
        let state = match ctx.mode() {
            Mode::Incremental { .. } => ctx.take_constant_state()?,
            mode => {
                let memory = memory(ctx)?;
                if !memory.shape().contains(self.params.io_dim()) {
                    return Err(LayerError::config(format!(
                        "encoder output {} does not match the decoder model dimension {}",
                        memory.shape(),
                        self.params.io_dim()
                    )));
                }
                let memory_length = require_dim(&memory, MEMORY_LENGTH_NAME)?.clone();
                let (k, v) = self.params.compute_memory(&memory)?;
                let state = ConstantState {
                    k,
                    v,
                    memory_length,
                };
                if let Mode::FirstPart { .. } = mode {
                    ctx.record_constant_state(state.clone());
                }
                state
            }
        };

        let bias = match (&ctx.sequence_id, &ctx.encoder_sequence_id) {
            (Some(decoder_id), Some(encoder_id)) => {
                let visible = equal(decoder_id, encoder_id)?;
                Some(visibility_mask_to_attention_bias(&visible, q.dtype())?)
            }
            _ => None,
        };
        let options = ctx.kernel_options(&self.config);
        let o = attention(
            &q,
            &state.k,
            &state.v,
            &state.memory_length,
            self.params.key_dim(),
            self.params.value_dim(),
            bias.as_ref(),
            &options,
        )?;
        Ok(self.params.compute_output(&o)?)
    }
}
