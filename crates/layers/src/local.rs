//! Sliding-window self attention.
//!
//! Each query sees the `radius` most recent positions, itself included; a
//! bidirectional model also sees the `radius - 1` following ones. Short
//! sequences are attended densely with a relative-position mask, long ones
//! go through the blocked engine. Decoding keeps a rolling window of
//! `radius` slots instead of the whole history.

use attention::{
    local_attention_1d, masked_local_attention_1d_incremental, DecodeBuffers, DecodeState,
    LocalAttentionOptions, WindowPolicy,
};
use mesh::{Dimension, Mesh, MeshTensor, VariableStore};

use crate::config::LocalConfig;
use crate::context::{Context, Mode};
use crate::error::{LayerError, Result};
use crate::self_attention::SelfAttention;

/// Sequences up to this length are always attended densely.
const DENSE_LENGTH: usize = 256;

#[derive(Debug, Clone)]
pub struct LocalSelfAttention {
    radius: usize,
    base: SelfAttention,
}

impl LocalSelfAttention {
    pub fn new(
        mesh: &Mesh,
        store: &VariableStore,
        name: &str,
        model_dim: &Dimension,
        config: LocalConfig,
    ) -> Result<Self> {
        config.validate()?;
        let base = SelfAttention::new(mesh, store, name, model_dim, config.attention)?;
        Ok(Self {
            radius: config.radius,
            base,
        })
    }

    pub fn radius(&self) -> usize {
        self.radius
    }

    pub fn base(&self) -> &SelfAttention {
        &self.base
    }

    fn relative_window(&self, ctx: &Context) -> (i64, i64) {
        let radius = self.radius as i64;
        let max = if ctx.fully_autoregressive { 0 } else { radius - 1 };
        (1 - radius, max)
    }

    /// Whether `ctx` needs the dense path for a sequence of `length`.
    fn attends_densely(&self, ctx: &Context, length: usize) -> bool {
        length <= DENSE_LENGTH.max(4 * self.radius)
            || self.base.relative().is_some()
            || ctx.sequence_id.is_some()
    }

    fn buffers(&self, states: Vec<MeshTensor>) -> Result<DecodeBuffers> {
        let mut states = states.into_iter();
        let buffers = match (states.next(), states.next()) {
            (Some(kv), None) if self.base.config().shared_kv => DecodeBuffers::Shared { kv },
            (Some(k), Some(v)) => DecodeBuffers::Separate { k, v },
            _ => {
                return Err(LayerError::MissingContext {
                    what: "the local attention window",
                })
            }
        };
        Ok(buffers)
    }

    fn record(&self, ctx: &mut Context, state: DecodeState) {
        match state.into_buffers() {
            DecodeBuffers::Separate { k, v } => ctx.record_new_states([k, v]),
            DecodeBuffers::Shared { kv } => ctx.record_new_states([kv]),
        }
    }

    pub fn apply(&self, ctx: &mut Context, x: &MeshTensor) -> Result<MeshTensor> {
        self.base.check_input(ctx, x)?;
        let params = self.base.params();
        match ctx.mode() {
            Mode::Incremental { position } => {
                let states = ctx.take_states(self.base.num_states())?;
                let state = DecodeState::from_buffers(self.buffers(states)?, position)?;
                let options = ctx.kernel_options(self.base.config());
                let (y, next) = masked_local_attention_1d_incremental(
                    ctx.mesh(),
                    params,
                    x,
                    &state,
                    position,
                    self.radius,
                    &options,
                )?;
                self.record(ctx, next);
                return Ok(y);
            }
            Mode::FirstPart { initial_position } => {
                let state = DecodeState::prefill(
                    ctx.mesh(),
                    params,
                    x,
                    &ctx.length_dim,
                    self.radius,
                    initial_position,
                )?;
                self.record(ctx, state);
            }
            Mode::Train | Mode::Eval => {}
        }

        let length = ctx.length_dim.size();
        if self.attends_densely(ctx, length) {
            let (min, max) = self.relative_window(ctx);
            let (k, v) = self.base.memory(ctx, x)?;
            let memory_position = self.base.memory_positions(ctx)?;
            return self
                .base
                .attend(ctx, x, &k, &v, &memory_position, Some(min), Some(max));
        }
        log::debug!(
            "blocked local attention over {} with radius {}",
            ctx.length_dim,
            self.radius
        );
        let options = LocalAttentionOptions {
            window: self.radius,
            causal: ctx.fully_autoregressive,
            policy: WindowPolicy::Sliding,
            length_per_split: None,
            kernel: ctx.kernel_options(self.base.config()),
        };
        Ok(local_attention_1d(
            ctx.mesh(),
            params,
            x,
            &ctx.length_dim,
            &options,
        )?)
    }
}
