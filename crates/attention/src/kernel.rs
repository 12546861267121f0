//! Dot-product attention kernel.
//!
//! Every engine in this crate ends up here: logits are `q . k` contracted over
//! the key channels, an optional additive bias is applied, the weights are a
//! log-sum-exp stabilised softmax over the memory axis, and the output is the
//! weighted sum of values. Masking is expressed purely through the bias; use a
//! large negative constant ([`crate::masks::NEG_BIAS`]) for disallowed pairs.

use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

use mesh::ops::{add, affine, dropout, einsum, rename_dimension, softmax};
use mesh::{Dimension, MeshTensor, Shape};

use crate::core::{AttentionError, KernelOptions, Result};

static CONFIGURATIONS: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();

/// Logs the kernel configuration the first time it is seen. Returns whether
/// it was new.
fn note_configuration(q: &MeshTensor, options: &KernelOptions) -> bool {
    let summary = format!(
        "dtype={:?} dropout={} scale={:?} extra_logit={:?}",
        q.dtype(),
        options.dropout_rate,
        options.scale,
        options.extra_logit
    );
    let seen = CONFIGURATIONS.get_or_init(Default::default);
    let Ok(mut seen) = seen.lock() else {
        return false;
    };
    if !seen.insert(summary.clone()) {
        return false;
    }
    log::info!("attention::kernel init {summary}");
    true
}

/// Attention with explicitly named memory, key and value dimensions.
///
/// * `q` carries `key_dim` and must not carry `memory_length_dim`.
/// * `k` carries `memory_length_dim` and `key_dim`; its other dimensions must
///   also appear in `q` with the same size.
/// * `v` carries `memory_length_dim` and `value_dim`, with the same rule.
/// * `bias`, if given, may only use dimensions of the logits
///   (`q` without `key_dim`, plus `memory_length_dim`).
///
/// The output has the shape of `q` with `key_dim` replaced by `value_dim`.
#[allow(clippy::too_many_arguments)]
pub fn attention(
    q: &MeshTensor,
    k: &MeshTensor,
    v: &MeshTensor,
    memory_length_dim: &Dimension,
    key_dim: &Dimension,
    value_dim: &Dimension,
    bias: Option<&MeshTensor>,
    options: &KernelOptions,
) -> Result<MeshTensor> {
    options.validate()?;
    note_configuration(q, options);

    if !q.shape().contains(key_dim) {
        return Err(AttentionError::shape(format!(
            "q {} is missing key dimension {key_dim}",
            q.shape()
        )));
    }
    if q.has_dim(memory_length_dim.name()) {
        return Err(AttentionError::shape(format!(
            "q {} must not carry the memory dimension `{}`",
            q.shape(),
            memory_length_dim.name()
        )));
    }
    check_memory_operand("k", k, q, memory_length_dim, key_dim)?;
    check_memory_operand("v", v, q, memory_length_dim, value_dim)?;

    let logits_shape = q
        .shape()
        .without(&[key_dim.name()])
        .concat(&Shape::new(vec![memory_length_dim.clone()])?)?;
    let mut logits = einsum(&[q, k], &logits_shape)?;
    if let Some(scale) = options.scale {
        logits = affine(&logits, scale as f64, 0.0)?;
    }
    if let Some(bias) = bias {
        if let Some(extra) = bias
            .dims()
            .iter()
            .find(|dim| !logits_shape.contains(dim))
        {
            return Err(AttentionError::shape(format!(
                "bias dimension {extra} does not appear in logits {logits_shape}"
            )));
        }
        logits = add(&logits, bias)?;
    }

    let mut weights = softmax(&logits, memory_length_dim.name(), options.extra_logit)?;
    if options.dropout_rate > 0.0 {
        let broadcast: Vec<&str> = options
            .dropout_broadcast_dims
            .iter()
            .map(String::as_str)
            .collect();
        weights = dropout(&weights, options.dropout_rate, &broadcast)?;
    }

    let output_shape = q
        .shape()
        .without(&[key_dim.name()])
        .concat(&Shape::new(vec![value_dim.clone()])?)?;
    Ok(einsum(&[&weights, v], &output_shape)?)
}

fn check_memory_operand(
    role: &str,
    x: &MeshTensor,
    q: &MeshTensor,
    memory_length_dim: &Dimension,
    channel_dim: &Dimension,
) -> Result<()> {
    for required in [memory_length_dim, channel_dim] {
        if !x.shape().contains(required) {
            return Err(AttentionError::shape(format!(
                "{role} {} is missing {required}",
                x.shape()
            )));
        }
    }
    for dim in x.dims() {
        if dim == memory_length_dim || dim == channel_dim {
            continue;
        }
        match q.dim(dim.name()) {
            Some(other) if other == dim => {}
            _ => {
                return Err(AttentionError::shape(format!(
                    "{role} dimension {dim} does not match q {}",
                    q.shape()
                )))
            }
        }
    }
    Ok(())
}

/// Positional dot-product attention.
///
/// `q` is `[..., length_q, depth_k]`, `k` is `[..., length_kv, depth_k]` and `v`
/// is `[..., length_kv, depth_v]`; the leading dimensions of all three must be
/// identical. If `length_kv` shares its name with `length_q`, keys and values
/// are renamed to `memory_<name>` first, and the mask must use that name for
/// its memory axis. Returns
/// `[..., length_q, depth_v]`.
pub fn dot_product_attention(
    q: &MeshTensor,
    k: &MeshTensor,
    v: &MeshTensor,
    mask: Option<&MeshTensor>,
    options: &KernelOptions,
) -> Result<MeshTensor> {
    let (q_lead, q_tail) = split_last_two("q", q)?;
    let (k_lead, k_tail) = split_last_two("k", k)?;
    let (v_lead, v_tail) = split_last_two("v", v)?;
    if q_lead != k_lead || q_lead != v_lead {
        return Err(AttentionError::shape(format!(
            "leading dimensions differ: q {}, k {}, v {}",
            q.shape(),
            k.shape(),
            v.shape()
        )));
    }
    let (length_q, depth_k) = (&q_tail[0], &q_tail[1]);
    let (length_kv, k_depth) = (&k_tail[0], &k_tail[1]);
    let (v_length, depth_v) = (&v_tail[0], &v_tail[1]);
    if k_depth != depth_k {
        return Err(AttentionError::shape(format!(
            "key depth {k_depth} does not match query depth {depth_k}"
        )));
    }
    if v_length != length_kv {
        return Err(AttentionError::shape(format!(
            "value length {v_length} does not match key length {length_kv}"
        )));
    }

    if length_kv.name() != length_q.name() {
        return attention(q, k, v, length_kv, depth_k, depth_v, mask, options);
    }
    let memory_name = format!("memory_{}", length_kv.name());
    let memory_dim = length_kv.renamed(memory_name.as_str());
    let k = rename_dimension(k, length_kv.name(), &memory_name)?;
    let v = rename_dimension(v, length_kv.name(), &memory_name)?;
    attention(q, &k, &v, &memory_dim, depth_k, depth_v, mask, options)
}

fn split_last_two<'a>(role: &str, x: &'a MeshTensor) -> Result<(&'a [Dimension], &'a [Dimension])> {
    if x.rank() < 2 {
        return Err(AttentionError::shape(format!(
            "{role} must have at least two dimensions, got {}",
            x.shape()
        )));
    }
    Ok(x.dims().split_at(x.rank() - 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masks::NEG_BIAS;
    use candle_core::{DType, Device};
    use mesh::ops::transpose_to;

    fn named(spec: &[(&str, usize)], data: Vec<f32>) -> Result<MeshTensor> {
        let shape = Shape::new(
            spec.iter()
                .map(|(name, size)| Dimension::new(*name, *size))
                .collect(),
        )?;
        Ok(MeshTensor::from_vec(data, &shape, &Device::Cpu)?)
    }

    fn ramp(n: usize, step: f32) -> Vec<f32> {
        (0..n).map(|i| ((i * 7) % 11) as f32 * step - 0.2).collect()
    }

    // Plain loops over [heads, length, depth] buffers.
    fn naive_attention(
        q: &[f32],
        k: &[f32],
        v: &[f32],
        bias: Option<&[f32]>,
        heads: usize,
        q_len: usize,
        k_len: usize,
        depth: usize,
    ) -> Vec<f32> {
        let mut output = vec![0f32; heads * q_len * depth];
        for h in 0..heads {
            for qi in 0..q_len {
                let mut row = vec![0f32; k_len];
                for ki in 0..k_len {
                    let mut dot = 0f32;
                    for d in 0..depth {
                        dot += q[(h * q_len + qi) * depth + d] * k[(h * k_len + ki) * depth + d];
                    }
                    if let Some(bias) = bias {
                        dot += bias[qi * k_len + ki];
                    }
                    row[ki] = dot;
                }
                let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                let denom: f32 = row.iter().map(|x| (x - max).exp()).sum();
                for d in 0..depth {
                    let mut acc = 0f32;
                    for ki in 0..k_len {
                        acc += (row[ki] - max).exp() / denom * v[(h * k_len + ki) * depth + d];
                    }
                    output[(h * q_len + qi) * depth + d] = acc;
                }
            }
        }
        output
    }

    #[test]
    fn named_attention_matches_naive() -> Result<()> {
        let (heads, q_len, k_len, depth) = (2, 3, 4, 5);
        let q_data = ramp(heads * q_len * depth, 0.1);
        let k_data = ramp(heads * k_len * depth, 0.07);
        let v_data = ramp(heads * k_len * depth, 0.3);
        let bias_data: Vec<f32> = (0..q_len * k_len)
            .map(|i| if i % 5 == 3 { NEG_BIAS } else { 0.0 })
            .collect();

        let q = named(&[("heads", heads), ("length", q_len), ("d_k", depth)], q_data.clone())?;
        let k = named(
            &[("heads", heads), ("memory_length", k_len), ("d_k", depth)],
            k_data.clone(),
        )?;
        let v = named(
            &[("heads", heads), ("memory_length", k_len), ("d_k", depth)],
            v_data.clone(),
        )?;
        let bias = named(&[("length", q_len), ("memory_length", k_len)], bias_data.clone())?;

        let out = attention(
            &q,
            &k,
            &v,
            &Dimension::new("memory_length", k_len),
            &Dimension::new("d_k", depth),
            &Dimension::new("d_k", depth),
            Some(&bias),
            &KernelOptions::eval(),
        )?;
        assert_eq!(out.shape(), q.shape());
        let expected = naive_attention(
            &q_data,
            &k_data,
            &v_data,
            Some(&bias_data),
            heads,
            q_len,
            k_len,
            depth,
        );
        for (a, e) in out.to_vec_f32()?.iter().zip(&expected) {
            assert!((a - e).abs() < 1e-4, "{a} vs {e}");
        }
        Ok(())
    }

    #[test]
    fn single_unmasked_key_takes_all_weight() -> Result<()> {
        let q = named(&[("length", 2), ("d", 2)], vec![3.0, -1.0, 0.5, 2.0])?;
        let k = named(&[("memory_length", 3), ("d", 2)], vec![1.0, 2.0, -4.0, 0.0, 2.0, 2.0])?;
        let v = named(
            &[("memory_length", 3), ("d_v", 2)],
            vec![10.0, 11.0, 20.0, 21.0, 30.0, 31.0],
        )?;
        // Query 0 may only see key 1, query 1 only key 2.
        let bias = named(
            &[("length", 2), ("memory_length", 3)],
            vec![NEG_BIAS, 0.0, NEG_BIAS, NEG_BIAS, NEG_BIAS, 0.0],
        )?;
        let out = attention(
            &q,
            &k,
            &v,
            &Dimension::new("memory_length", 3),
            &Dimension::new("d", 2),
            &Dimension::new("d_v", 2),
            Some(&bias),
            &KernelOptions::eval(),
        )?;
        assert_eq!(out.shape().names(), vec!["length", "d_v"]);
        let values = out.to_vec_f32()?;
        for (a, e) in values.iter().zip([20.0, 21.0, 30.0, 31.0]) {
            assert!((a - e).abs() < 1e-4);
        }
        Ok(())
    }

    #[test]
    fn positional_kernel_renames_shared_length() -> Result<()> {
        let data = ramp(2 * 4 * 3, 0.2);
        let q = named(&[("heads", 2), ("length", 4), ("d", 3)], data.clone())?;
        let out = dot_product_attention(&q, &q, &q, None, &KernelOptions::eval())?;
        assert_eq!(out.shape(), q.shape());

        let memory = rename_dimension(&q, "length", "memory_length")?;
        let named_out = attention(
            &q,
            &memory,
            &memory,
            &Dimension::new("memory_length", 4),
            &Dimension::new("d", 3),
            &Dimension::new("d", 3),
            None,
            &KernelOptions::eval(),
        )?;
        assert_eq!(out.to_vec_f32()?, named_out.to_vec_f32()?);
        Ok(())
    }

    #[test]
    fn leading_dimension_mismatch_is_rejected() -> Result<()> {
        let q = named(&[("batch", 2), ("length", 3), ("d", 4)], vec![0.0; 24])?;
        let k = named(&[("batch", 3), ("length", 3), ("d", 4)], vec![0.0; 36])?;
        let err = dot_product_attention(&q, &k, &k, None, &KernelOptions::eval()).unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));

        let k = named(&[("memory_length", 3), ("d", 5)], vec![0.0; 15])?;
        let err = attention(
            &named(&[("length", 3), ("d", 4)], vec![0.0; 12])?,
            &k,
            &k,
            &Dimension::new("memory_length", 3),
            &Dimension::new("d", 4),
            &Dimension::new("d", 4),
            None,
            &KernelOptions::eval(),
        )
        .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
        Ok(())
    }

    #[test]
    fn extra_logit_absorbs_probability_mass() -> Result<()> {
        let q = named(&[("length", 1), ("d", 1)], vec![0.0])?;
        let k = named(&[("memory_length", 1), ("d", 1)], vec![0.0])?;
        let v = named(&[("memory_length", 1), ("d", 1)], vec![6.0])?;
        let options = KernelOptions {
            extra_logit: Some(0.0),
            ..KernelOptions::default()
        };
        let out = attention(
            &q,
            &k,
            &v,
            &Dimension::new("memory_length", 1),
            &Dimension::new("d", 1),
            &Dimension::new("d", 1),
            None,
            &options,
        )?;
        assert!((out.to_vec_f32()?[0] - 3.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn each_configuration_is_logged_once() -> Result<()> {
        let q = named(&[("length", 1), ("d", 2)], vec![1.0, 2.0])?;
        let options = KernelOptions {
            scale: Some(0.371),
            ..KernelOptions::eval()
        };
        assert!(note_configuration(&q, &options));
        assert!(!note_configuration(&q, &options));
        assert!(note_configuration(&q.to_dtype(DType::BF16)?, &options));
        let rescaled = KernelOptions {
            scale: Some(0.372),
            ..options
        };
        assert!(note_configuration(&q, &rescaled));
        Ok(())
    }

    #[test]
    fn large_logits_stay_finite_and_dtype_is_preserved() -> Result<()> {
        let q = named(&[("length", 4), ("d", 4)], vec![100.0; 16])?;
        let k = named(&[("memory_length", 4), ("d", 4)], vec![-100.0; 16])?;
        let v = named(&[("memory_length", 4), ("d", 4)], vec![1.0; 16])?;
        for dtype in [DType::F32, DType::BF16] {
            let out = attention(
                &q.to_dtype(dtype)?,
                &k.to_dtype(dtype)?,
                &v.to_dtype(dtype)?,
                &Dimension::new("memory_length", 4),
                &Dimension::new("d", 4),
                &Dimension::new("d", 4),
                None,
                &KernelOptions::eval(),
            )?;
            assert_eq!(out.dtype(), dtype);
            assert!(out.to_vec_f32()?.iter().all(|x| x.is_finite()));
        }
        Ok(())
    }

    #[test]
    fn zero_dropout_is_a_noop_and_bad_rates_fail() -> Result<()> {
        let data = ramp(12, 0.3);
        let q = named(&[("length", 3), ("d", 4)], data.clone())?;
        let k = transpose_to(
            &named(&[("d", 4), ("memory_length", 3)], data)?,
            &Shape::new(vec![Dimension::new("memory_length", 3), Dimension::new("d", 4)])?,
        )?;
        let dims = (
            Dimension::new("memory_length", 3),
            Dimension::new("d", 4),
        );
        let plain = attention(&q, &k, &k, &dims.0, &dims.1, &dims.1, None, &KernelOptions::eval())?;
        let zero = attention(
            &q,
            &k,
            &k,
            &dims.0,
            &dims.1,
            &dims.1,
            None,
            &KernelOptions::eval().with_dropout(0.0, &["length"]),
        )?;
        assert_eq!(plain.to_vec_f32()?, zero.to_vec_f32()?);

        let err = attention(
            &q,
            &k,
            &k,
            &dims.0,
            &dims.1,
            &dims.1,
            None,
            &KernelOptions::eval().with_dropout(1.5, &[]),
        )
        .unwrap_err();
        assert!(matches!(err, AttentionError::Config { .. }));
        Ok(())
    }
}
