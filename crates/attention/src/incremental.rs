//! One-token-at-a-time local attention.
//!
//! Keys and values of the most recent positions live in a rolling window
//! buffer of `window_length` slots; position `t` is written to slot
//! `t mod window_length`. Each step returns a new [`DecodeState`] instead of
//! mutating the old one, so a step is a pure function of its inputs.

use candle_core::{DType, Device};
use mesh::ops::{add, affine, einsum, mul, one_hot_scalar, transpose_to};
use mesh::{Dimension, Mesh, MeshTensor, Shape};

use crate::core::{AttentionError, KernelOptions, Result};
use crate::kernel::attention;
use crate::masks::incremental_window_bias;
use crate::params::AttentionParams;

/// Name of the rolling window dimension.
pub const WINDOW_NAME: &str = "window";

/// Key/value buffers of a decode session.
#[derive(Debug, Clone)]
pub enum DecodeBuffers {
    Separate { k: MeshTensor, v: MeshTensor },
    /// One buffer serving as keys and values (`shared_kv` projections).
    Shared { kv: MeshTensor },
}

/// Rolling-window state threaded through incremental decode steps.
#[derive(Debug, Clone)]
pub struct DecodeState {
    buffers: DecodeBuffers,
    window_dim: Dimension,
    next_position: usize,
}

fn buffer_shape(
    batch_dims: &[Dimension],
    heads: &[Dimension],
    window_dim: &Dimension,
    channel: &Dimension,
) -> Result<Shape> {
    let mut dims = batch_dims.to_vec();
    dims.extend(heads.iter().cloned());
    dims.push(window_dim.clone());
    dims.push(channel.clone());
    Ok(Shape::new(dims)?)
}

impl DecodeState {
    /// Empty buffers for a session starting at position 0.
    pub fn zeros(
        params: &AttentionParams,
        batch_dims: &[Dimension],
        window_length: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        if window_length == 0 {
            return Err(AttentionError::config("window length must be positive"));
        }
        let window_dim = Dimension::new(WINDOW_NAME, window_length);
        let heads = params.heads().memory_heads_dims();
        let k_shape = buffer_shape(batch_dims, heads, &window_dim, params.key_dim())?;
        let buffers = if params.shared_kv() {
            DecodeBuffers::Shared {
                kv: MeshTensor::zeros(&k_shape, dtype, device)?,
            }
        } else {
            let v_shape = buffer_shape(batch_dims, heads, &window_dim, params.value_dim())?;
            DecodeBuffers::Separate {
                k: MeshTensor::zeros(&k_shape, dtype, device)?,
                v: MeshTensor::zeros(&v_shape, dtype, device)?,
            }
        };
        Ok(Self {
            buffers,
            window_dim,
            next_position: 0,
        })
    }

    /// Builds the window from a prefix that was processed in one pass.
    ///
    /// Positions `[initial_position - window_length, initial_position)` of
    /// `x` are projected and written to their slots; decoding resumes at
    /// `initial_position`.
    pub fn prefill(
        mesh: &Mesh,
        params: &AttentionParams,
        x: &MeshTensor,
        length_dim: &Dimension,
        window_length: usize,
        initial_position: usize,
    ) -> Result<Self> {
        if window_length == 0 {
            return Err(AttentionError::config("window length must be positive"));
        }
        if !x.shape().contains(length_dim) {
            return Err(AttentionError::shape(format!(
                "prefix {} does not carry {length_dim}",
                x.shape()
            )));
        }
        let length = length_dim.size();
        if initial_position > length {
            return Err(AttentionError::config(format!(
                "initial position {initial_position} is past the prefix {length_dim}"
            )));
        }
        let window_dim = Dimension::new(WINDOW_NAME, window_length);
        let oldest = initial_position.saturating_sub(window_length);
        let mut select = vec![0f32; length * window_length];
        for pos in oldest..initial_position {
            select[pos * window_length + pos % window_length] = 1.0;
        }
        let select_shape = Shape::new(vec![length_dim.clone(), window_dim.clone()])?;
        let select = MeshTensor::from_vec(select, &select_shape, mesh.device())?.to_dtype(x.dtype())?;

        let gather = |projected: &MeshTensor, channel: &Dimension| -> Result<MeshTensor> {
            let dims: Vec<Dimension> = projected
                .dims()
                .iter()
                .filter(|d| *d != length_dim && *d != channel)
                .cloned()
                .chain([window_dim.clone(), channel.clone()])
                .collect();
            Ok(einsum(&[projected, &select], &Shape::new(dims)?)?)
        };
        let buffers = if params.shared_kv() {
            DecodeBuffers::Shared {
                kv: gather(&params.compute_kv(x)?, params.key_dim())?,
            }
        } else {
            let (k, v) = params.compute_memory(x)?;
            DecodeBuffers::Separate {
                k: gather(&k, params.key_dim())?,
                v: gather(&v, params.value_dim())?,
            }
        };
        log::debug!(
            "prefilled decode window of {window_length} from {length_dim}, resuming at {initial_position}"
        );
        Ok(Self {
            buffers,
            window_dim,
            next_position: initial_position,
        })
    }

    /// Resumes a session from buffers carried outside of a [`DecodeState`].
    ///
    /// Every buffer must carry a [`WINDOW_NAME`] dimension of the same size.
    pub fn from_buffers(buffers: DecodeBuffers, next_position: usize) -> Result<Self> {
        let window_of = |buffer: &MeshTensor| -> Result<Dimension> {
            buffer.dim(WINDOW_NAME).cloned().ok_or_else(|| {
                AttentionError::shape(format!(
                    "decode buffer {} has no `{WINDOW_NAME}` dimension",
                    buffer.shape()
                ))
            })
        };
        let window_dim = match &buffers {
            DecodeBuffers::Separate { k, v } => {
                let window_dim = window_of(k)?;
                if window_of(v)? != window_dim {
                    return Err(AttentionError::shape(format!(
                        "key window {} and value window {} differ",
                        k.shape(),
                        v.shape()
                    )));
                }
                window_dim
            }
            DecodeBuffers::Shared { kv } => window_of(kv)?,
        };
        Ok(Self {
            buffers,
            window_dim,
            next_position,
        })
    }

    pub fn buffers(&self) -> &DecodeBuffers {
        &self.buffers
    }

    pub fn into_buffers(self) -> DecodeBuffers {
        self.buffers
    }

    /// The key buffer; the shared buffer with `shared_kv`.
    pub fn k(&self) -> &MeshTensor {
        match &self.buffers {
            DecodeBuffers::Separate { k, .. } => k,
            DecodeBuffers::Shared { kv } => kv,
        }
    }

    /// The value buffer; the shared buffer with `shared_kv`.
    pub fn v(&self) -> &MeshTensor {
        match &self.buffers {
            DecodeBuffers::Separate { v, .. } => v,
            DecodeBuffers::Shared { kv } => kv,
        }
    }

    pub fn window_dim(&self) -> &Dimension {
        &self.window_dim
    }

    pub fn window_length(&self) -> usize {
        self.window_dim.size()
    }

    /// The only position the next step accepts.
    pub fn next_position(&self) -> usize {
        self.next_position
    }
}

/// `old * (1 - one_hot) + new * one_hot`, in the layout of `old`.
pub fn blend(old: &MeshTensor, new: &MeshTensor, one_hot: &MeshTensor) -> Result<MeshTensor> {
    let keep = affine(one_hot, -1.0, 1.0)?;
    let blended = add(&mul(old, &keep)?, &mul(new, one_hot)?)?;
    Ok(transpose_to(&blended, old.shape())?)
}

/// One decode step of causal sliding-window attention.
///
/// `x` is the new token with shape `batch... + [io]`; `position` must equal
/// `state.next_position()`. The step writes the new key and value to slot
/// `position mod window_length` and attends to the slots that hold positions
/// in `(position - window, position]`. The result matches position
/// `position` of [`crate::local::masked_local_attention_1d`] over the same
/// sequence.
pub fn masked_local_attention_1d_incremental(
    mesh: &Mesh,
    params: &AttentionParams,
    x: &MeshTensor,
    state: &DecodeState,
    position: usize,
    window: usize,
    options: &KernelOptions,
) -> Result<(MeshTensor, DecodeState)> {
    if position != state.next_position {
        return Err(AttentionError::DecodePosition {
            expected: state.next_position,
            got: position,
        });
    }
    let window_length = state.window_length();
    if window == 0 || window_length < window {
        return Err(AttentionError::config(format!(
            "window {window} does not fit a buffer of {window_length} slots"
        )));
    }

    let q = params.compute_q(x)?;
    let dtype = q.dtype();
    let slot = one_hot_scalar(mesh, position % window_length, &state.window_dim, dtype)?;
    let buffers = match &state.buffers {
        DecodeBuffers::Separate { k, v } => {
            let (new_k, new_v) = params.compute_memory(x)?;
            DecodeBuffers::Separate {
                k: blend(k, &new_k, &slot)?,
                v: blend(v, &new_v, &slot)?,
            }
        }
        DecodeBuffers::Shared { kv } => DecodeBuffers::Shared {
            kv: blend(kv, &params.compute_kv(x)?, &slot)?,
        },
    };
    let next = DecodeState {
        buffers,
        window_dim: state.window_dim.clone(),
        next_position: position + 1,
    };

    let bias = incremental_window_bias(mesh, &next.window_dim, position, window, dtype)?;
    let o = attention(
        &q,
        next.k(),
        next.v(),
        &next.window_dim,
        params.key_dim(),
        params.value_dim(),
        Some(&bias),
        options,
    )?;
    Ok((params.compute_output(&o)?, next))
}
