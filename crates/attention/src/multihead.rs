//! Full (non-local) multi-head attention with input and output projections.

use candle_core::DType;
use mesh::ops::{affine, cast, less, one_hot_scalar, range, reduce_sum, rename_dimension, reshape};
use mesh::{Dimension, Mesh, MeshTensor, Shape};

use crate::core::{AttentionError, KernelOptions, Result};
use crate::incremental::blend;
use crate::kernel::attention;
use crate::masks::NEG_BIAS;
use crate::params::AttentionParams;

fn batch_dims(x: &MeshTensor, skip: &[&str]) -> Vec<Dimension> {
    x.dims()
        .iter()
        .filter(|d| !skip.contains(&d.name()))
        .cloned()
        .collect()
}

/// Multi-head attention from `query` to `memory` (self-attention when
/// `memory` is `None`).
///
/// `query` is `batch... + [length, io]`; `memory` is
/// `batch... + [memory_length, io]` with `memory_length_name` naming its
/// length axis. For self-attention the query is renamed to obtain it. The
/// batch dimensions and the io channels of both sides must agree.
pub fn multihead_attention(
    params: &AttentionParams,
    query: &MeshTensor,
    memory: Option<&MeshTensor>,
    length_dim: &Dimension,
    memory_length_name: &str,
    bias: Option<&MeshTensor>,
    options: &KernelOptions,
) -> Result<MeshTensor> {
    let io = params.io_dim();
    if !query.shape().contains(length_dim) || !query.shape().contains(io) {
        return Err(AttentionError::shape(format!(
            "query {} must carry {length_dim} and {io}",
            query.shape()
        )));
    }
    let memory = match memory {
        Some(memory) => memory.clone(),
        None => rename_dimension(query, length_dim.name(), memory_length_name)?,
    };
    let memory_length = memory.dim(memory_length_name).cloned().ok_or_else(|| {
        AttentionError::shape(format!(
            "memory {} has no `{memory_length_name}` dimension",
            memory.shape()
        ))
    })?;
    match memory.dim(io.name()) {
        Some(channels) if channels == io => {}
        _ => {
            return Err(AttentionError::shape(format!(
                "memory channels of {} must equal query channels {io}",
                memory.shape()
            )))
        }
    }
    let query_batch = batch_dims(query, &[length_dim.name(), io.name()]);
    let memory_batch = batch_dims(&memory, &[memory_length_name, io.name()]);
    if query_batch != memory_batch {
        return Err(AttentionError::shape(format!(
            "memory batch {memory_batch:?} must equal query batch {query_batch:?}"
        )));
    }

    let q = params.compute_q(query)?;
    let (k, v) = params.compute_memory(&memory)?;
    let o = attention(
        &q,
        &k,
        &v,
        &memory_length,
        params.key_dim(),
        params.value_dim(),
        bias,
        options,
    )?;
    params.compute_output(&o)
}

/// One decode step of full causal self-attention.
///
/// `prev_k`/`prev_v` hold every position so far along `memory_length_dim`;
/// the new token is written to slot `step` and attends to slots `<= step`.
/// Returns the output and the updated buffers.
#[allow(clippy::too_many_arguments)]
pub fn multihead_self_attention_incremental(
    mesh: &Mesh,
    params: &AttentionParams,
    x: &MeshTensor,
    prev_k: &MeshTensor,
    prev_v: &MeshTensor,
    memory_length_dim: &Dimension,
    step: usize,
    options: &KernelOptions,
) -> Result<(MeshTensor, MeshTensor, MeshTensor)> {
    let memory_length = memory_length_dim.size();
    if step >= memory_length {
        return Err(AttentionError::config(format!(
            "decode step {step} is past the buffer {memory_length_dim}"
        )));
    }
    let q = params.compute_q(x)?;
    let dtype = q.dtype();
    let slot = one_hot_scalar(mesh, step, memory_length_dim, dtype)?;
    let (new_k, new_v) = params.compute_memory(x)?;
    let k = blend(prev_k, &new_k, &slot)?;
    let v = blend(prev_v, &new_v, &slot)?;

    let data = (0..memory_length)
        .map(|m| if m > step { NEG_BIAS } else { 0.0 })
        .collect();
    let bias = MeshTensor::from_vec(
        data,
        &Shape::new(vec![memory_length_dim.clone()])?,
        mesh.device(),
    )?
    .to_dtype(dtype)?;
    let o = attention(
        &q,
        &k,
        &v,
        memory_length_dim,
        params.key_dim(),
        params.value_dim(),
        Some(&bias),
        options,
    )?;
    Ok((params.compute_output(&o)?, k, v))
}

/// One decode step of attention over precomputed encoder keys and values.
///
/// The batch dimensions of `k`/`v` must be a subset of those of `x`.
pub fn multihead_encdec_attention_incremental(
    params: &AttentionParams,
    x: &MeshTensor,
    k: &MeshTensor,
    v: &MeshTensor,
    memory_length_dim: &Dimension,
    bias: Option<&MeshTensor>,
    options: &KernelOptions,
) -> Result<MeshTensor> {
    let q = params.compute_q(x)?;
    let o = attention(
        &q,
        k,
        v,
        memory_length_dim,
        params.key_dim(),
        params.value_dim(),
        bias,
        options,
    )?;
    params.compute_output(&o)
}

const COMPRESSION_FACTOR_NAME: &str = "compression_factor";

/// Averages consecutive groups of `compression_factor` positions along
/// `dim_name`, which keeps its name and shrinks by that factor.
pub fn compress_mean(x: &MeshTensor, dim_name: &str, compression_factor: usize) -> Result<MeshTensor> {
    let dim = x.dim(dim_name).cloned().ok_or_else(|| {
        AttentionError::shape(format!("{} has no `{dim_name}` dimension", x.shape()))
    })?;
    if compression_factor == 0 || dim.size() % compression_factor != 0 {
        return Err(AttentionError::config(format!(
            "compression factor {compression_factor} does not divide {dim}"
        )));
    }
    let compressed = Dimension::new(dim_name, dim.size() / compression_factor);
    let mut grouped = Vec::with_capacity(x.dims().len() + 1);
    for d in x.dims() {
        if d.name() == dim_name {
            grouped.push(compressed.clone());
            grouped.push(Dimension::new(COMPRESSION_FACTOR_NAME, compression_factor));
        } else {
            grouped.push(d.clone());
        }
    }
    let grouped = reshape(x, &Shape::new(grouped)?)?;
    let output = x.shape().replace(dim_name, compressed)?;
    let total = reduce_sum(&grouped, &output)?;
    Ok(affine(&total, 1.0 / compression_factor as f64, 0.0)?)
}

/// Self-attention over a memory average-pooled by `compression_factor`.
///
/// Memory slot `m` summarises positions `[m * f, (m + 1) * f)`. With
/// `mask_right` a query only sees slots whose last position is not after it,
/// so the first `f - 1` queries see nothing but the implicit zero logit.
/// `extra_logit` defaults to `0.0`.
#[allow(clippy::too_many_arguments)]
pub fn multihead_self_attention_memory_compressed(
    mesh: &Mesh,
    params: &AttentionParams,
    x: &MeshTensor,
    length_dim: &Dimension,
    memory_length_name: &str,
    compression_factor: usize,
    mask_right: bool,
    options: &KernelOptions,
) -> Result<MeshTensor> {
    let compressed = compress_mean(x, length_dim.name(), compression_factor)?;
    let memory = rename_dimension(&compressed, length_dim.name(), memory_length_name)?;
    let bias = if mask_right {
        let memory_length = Dimension::new(memory_length_name, length_dim.size() / compression_factor);
        let query_pos = range(mesh, length_dim, DType::F32)?;
        let factor = compression_factor as f64;
        let memory_pos = affine(&range(mesh, &memory_length, DType::F32)?, factor, factor - 1.0)?;
        let hidden = cast(&less(&query_pos, &memory_pos)?, x.dtype())?;
        Some(affine(&hidden, NEG_BIAS as f64, 0.0)?)
    } else {
        None
    };
    let options = KernelOptions {
        extra_logit: options.extra_logit.or(Some(0.0)),
        ..options.clone()
    };
    multihead_attention(
        params,
        x,
        Some(&memory),
        length_dim,
        memory_length_name,
        bias.as_ref(),
        &options,
    )
}
