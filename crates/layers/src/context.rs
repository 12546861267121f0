//! Per-forward-pass state shared by the layers of a model.
//!
//! A [`Context`] is created for one call of the model and handed to every
//! layer in order. Besides the inputs (positions, sequence ids, encoder
//! outputs) it carries three kinds of mutable state:
//!
//! * decode states: layers consume the states recorded by the previous step
//!   in the order they were recorded, and record their new states in the
//!   same order;
//! * constant states: values computed once in [`Mode::FirstPart`] and reused
//!   unchanged by every [`Mode::Incremental`] step (encoder keys and values);
//! * caches: attention biases that do not depend on the layer, and the
//!   mixed encoder outputs of transparent attention.

use std::collections::{HashMap, VecDeque};

use attention::KernelOptions;
use candle_core::DType;
use mesh::ops::range;
use mesh::{Dimension, Mesh, MeshTensor};

use crate::config::{AttentionConfig, RelativeAttentionType};
use crate::error::{LayerError, Result};

/// Name of the memory length dimension attended over by every layer.
pub const MEMORY_LENGTH_NAME: &str = "memory_length";

/// What the forward pass computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
    /// Process a prefix and record the states decoding resumes from.
    FirstPart { initial_position: usize },
    /// Process the single token at `position`.
    Incremental { position: usize },
}

/// Encoder keys and values kept for the whole decode session.
#[derive(Debug, Clone)]
pub struct ConstantState {
    pub k: MeshTensor,
    pub v: MeshTensor,
    pub memory_length: Dimension,
}

/// Identifies biases that are equal for every layer that asks for them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BiasKey {
    pub min_relative_position: Option<i64>,
    pub max_relative_position: Option<i64>,
    pub relative_attention_type: Option<RelativeAttentionType>,
    pub num_heads: usize,
}

#[derive(Debug)]
pub struct Context {
    mesh: Mesh,
    mode: Mode,
    pub model_dim: Dimension,
    pub length_dim: Dimension,
    /// Integer positions over `length_dim`; `0..length` when unset.
    pub position: Option<MeshTensor>,
    pub sequence_id: Option<MeshTensor>,
    /// Encoder output with a [`MEMORY_LENGTH_NAME`] dimension.
    pub encoder_output: Option<MeshTensor>,
    pub encoder_sequence_id: Option<MeshTensor>,
    /// Embedding output followed by the output of every encoder layer.
    pub encoder_layer_outputs: Vec<MeshTensor>,
    pub fully_autoregressive: bool,
    /// Index of the layer being applied within its stack.
    pub layer_index: usize,
    states: VecDeque<MeshTensor>,
    new_states: Vec<MeshTensor>,
    constant_states: VecDeque<ConstantState>,
    new_constant_states: Vec<ConstantState>,
    bias_cache: HashMap<BiasKey, Option<MeshTensor>>,
    decoder_inputs: Option<Vec<MeshTensor>>,
}

impl Context {
    pub fn new(mesh: Mesh, mode: Mode, model_dim: Dimension, length_dim: Dimension) -> Self {
        Self {
            mesh,
            mode,
            model_dim,
            length_dim,
            position: None,
            sequence_id: None,
            encoder_output: None,
            encoder_sequence_id: None,
            encoder_layer_outputs: Vec::new(),
            fully_autoregressive: true,
            layer_index: 0,
            states: VecDeque::new(),
            new_states: Vec::new(),
            constant_states: VecDeque::new(),
            new_constant_states: Vec::new(),
            bias_cache: HashMap::new(),
            decoder_inputs: None,
        }
    }

    /// States recorded by the previous decode step, in recording order.
    pub fn with_states(mut self, states: Vec<MeshTensor>) -> Self {
        self.states = states.into();
        self
    }

    /// Constant states recorded by the first part of the session.
    pub fn with_constant_states(mut self, states: Vec<ConstantState>) -> Self {
        self.constant_states = states.into();
        self
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_training(&self) -> bool {
        self.mode == Mode::Train
    }

    pub fn memory_length_dim(&self) -> Dimension {
        self.length_dim.renamed(MEMORY_LENGTH_NAME)
    }

    /// Query positions over `length_dim` as `i64`.
    pub fn positions(&self) -> Result<MeshTensor> {
        match &self.position {
            Some(position) => Ok(position.to_dtype(DType::I64)?),
            None => Ok(range(&self.mesh, &self.length_dim, DType::I64)?),
        }
    }

    /// Kernel options of `config` for this pass: dropout only while
    /// training, shared along the length dimension unless configured.
    pub fn kernel_options(&self, config: &AttentionConfig) -> KernelOptions {
        let mut options = config.kernel.clone();
        if self.is_training() && config.dropout_rate > 0.0 {
            options.dropout_rate = config.dropout_rate;
            if options.dropout_broadcast_dims.is_empty() {
                options.dropout_broadcast_dims = vec![self.length_dim.name().to_string()];
            }
        } else {
            options.dropout_rate = 0.0;
        }
        options
    }

    /// Takes the next `count` incoming decode states.
    pub fn take_states(&mut self, count: usize) -> Result<Vec<MeshTensor>> {
        if self.states.len() < count {
            return Err(LayerError::MissingContext {
                what: "decode states from the previous step",
            });
        }
        Ok(self.states.drain(..count).collect())
    }

    pub fn record_new_states(&mut self, states: impl IntoIterator<Item = MeshTensor>) {
        self.new_states.extend(states);
    }

    /// The states recorded during this pass, to seed the next step.
    pub fn take_new_states(&mut self) -> Vec<MeshTensor> {
        std::mem::take(&mut self.new_states)
    }

    pub fn take_constant_state(&mut self) -> Result<ConstantState> {
        self.constant_states
            .pop_front()
            .ok_or(LayerError::MissingContext {
                what: "constant states from the first part",
            })
    }

    pub fn record_constant_state(&mut self, state: ConstantState) {
        self.new_constant_states.push(state);
    }

    pub fn take_new_constant_states(&mut self) -> Vec<ConstantState> {
        std::mem::take(&mut self.new_constant_states)
    }

    pub fn cached_bias(&self, key: &BiasKey) -> Option<&Option<MeshTensor>> {
        self.bias_cache.get(key)
    }

    pub fn cache_bias(&mut self, key: BiasKey, bias: Option<MeshTensor>) {
        self.bias_cache.insert(key, bias);
    }

    pub fn bias_cache_len(&self) -> usize {
        self.bias_cache.len()
    }

    pub fn decoder_inputs(&self) -> Option<&[MeshTensor]> {
        self.decoder_inputs.as_deref()
    }

    pub fn set_decoder_inputs(&mut self, inputs: Vec<MeshTensor>) {
        self.decoder_inputs = Some(inputs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh::Shape;

    fn context(mode: Mode) -> Context {
        Context::new(
            Mesh::cpu(),
            mode,
            Dimension::new("d_model", 4),
            Dimension::new("length", 3),
        )
    }

    fn tensor(value: f32) -> Result<MeshTensor> {
        let shape = Shape::new(vec![Dimension::new("d_model", 4)])?;
        Ok(MeshTensor::full(value, &shape, DType::F32, &candle_core::Device::Cpu)?)
    }

    #[test]
    fn states_are_consumed_in_recording_order() -> Result<()> {
        let mut ctx = context(Mode::Incremental { position: 1 })
            .with_states(vec![tensor(1.0)?, tensor(2.0)?, tensor(3.0)?]);
        let first = ctx.take_states(2)?;
        assert_eq!(first[0].to_vec_f32()?[0], 1.0);
        assert_eq!(first[1].to_vec_f32()?[0], 2.0);
        assert!(matches!(
            ctx.take_states(2),
            Err(LayerError::MissingContext { .. })
        ));

        ctx.record_new_states([tensor(4.0)?]);
        ctx.record_new_states([tensor(5.0)?]);
        let recorded = ctx.take_new_states();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[1].to_vec_f32()?[0], 5.0);
        assert!(ctx.take_new_states().is_empty());
        assert!(ctx.take_constant_state().is_err());
        Ok(())
    }

    #[test]
    fn dropout_only_while_training() {
        let config = AttentionConfig {
            dropout_rate: 0.1,
            ..AttentionConfig::default()
        };
        let train = context(Mode::Train).kernel_options(&config);
        assert_eq!(train.dropout_rate, 0.1);
        assert_eq!(train.dropout_broadcast_dims, vec!["length".to_string()]);
        let eval = context(Mode::Eval).kernel_options(&config);
        assert_eq!(eval.dropout_rate, 0.0);
        assert!(!context(Mode::FirstPart { initial_position: 0 }).is_training());
    }

    #[test]
    fn default_positions_count_the_length() -> Result<()> {
        let ctx = context(Mode::Eval);
        let positions = ctx.positions()?;
        assert_eq!(positions.shape().names(), vec!["length"]);
        assert_eq!(positions.to_vec_f32()?, vec![0.0, 1.0, 2.0]);
        assert_eq!(ctx.memory_length_dim(), Dimension::new(MEMORY_LENGTH_NAME, 3));
        Ok(())
    }
}
