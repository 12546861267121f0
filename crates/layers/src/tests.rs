use candle_core::{DType, Device};
use mesh::ops::{reshape, slice};
use mesh::{Dimension, Mesh, MeshTensor, Shape, VariableStore};

use super::*;

const MODEL: usize = 4;

fn model_dim() -> Dimension {
    Dimension::new("d_model", MODEL)
}

fn inputs(length: usize, seed: usize) -> Result<MeshTensor> {
    let shape = Shape::new(vec![
        Dimension::new("batch", 2),
        Dimension::new("length", length),
        model_dim(),
    ])?;
    let data = (0..shape.elem_count())
        .map(|v| ((v * 7 + seed) % 23) as f32 / 23.0 - 0.5)
        .collect();
    Ok(MeshTensor::from_vec(data, &shape, &Device::Cpu)?)
}

fn at(x: &MeshTensor, t: usize) -> Result<MeshTensor> {
    let token = slice(x, t, 1, "length")?;
    let shape = token.shape().without(&["length"]);
    Ok(reshape(&token, &shape)?)
}

fn assert_close(a: &MeshTensor, b: &MeshTensor, what: &str) -> Result<()> {
    assert_eq!(a.shape(), b.shape(), "{what}");
    for (x, y) in a.to_vec_f32()?.iter().zip(b.to_vec_f32()?) {
        assert!((x - y).abs() < 1e-5, "{what}: {x} vs {y}");
    }
    Ok(())
}

fn small(num_heads: usize) -> AttentionConfig {
    AttentionConfig {
        num_heads,
        key_value_size: 3,
        ..AttentionConfig::default()
    }
}

fn context(mode: Mode, length: usize) -> Context {
    Context::new(Mesh::cpu(), mode, model_dim(), Dimension::new("length", length))
}

/// Runs `layer` over the whole sequence, then again as a first part ending at
/// `prefix` followed by single-token steps, and compares every position.
fn check_decode(layer: &AttentionLayer, length: usize, prefix: usize) -> Result<()> {
    let x = inputs(length, 3)?;
    let batch = layer.apply(&mut context(Mode::Eval, length), &x)?;

    let mut ctx = context(
        Mode::FirstPart {
            initial_position: prefix,
        },
        length,
    );
    let first = layer.apply(&mut ctx, &x)?;
    for t in 0..prefix {
        assert_close(&at(&first, t)?, &at(&batch, t)?, "first part")?;
    }
    let mut states = ctx.take_new_states();
    for t in prefix..length {
        let mut step = context(Mode::Incremental { position: t }, length).with_states(states);
        let y = layer.apply(&mut step, &at(&x, t)?)?;
        assert_close(&y, &at(&batch, t)?, &format!("position {t}"))?;
        states = step.take_new_states();
    }
    Ok(())
}

#[test]
fn self_attention_decodes_like_the_batch_pass() -> Result<()> {
    let mesh = Mesh::cpu();
    let variants = [
        small(2),
        AttentionConfig {
            shared_kv: true,
            ..small(2)
        },
        AttentionConfig {
            num_memory_heads: 1,
            ..small(4)
        },
        AttentionConfig {
            relative_attention_type: Some(RelativeAttentionType::Bias),
            relative_attention_num_buckets: 8,
            ..small(2)
        },
        AttentionConfig {
            relative_attention_type: Some(RelativeAttentionType::Contextual),
            relative_attention_num_buckets: 8,
            ..small(2)
        },
    ];
    for (index, config) in variants.into_iter().enumerate() {
        let store = VariableStore::new();
        let layer = AttentionLayer::new(
            &LayerConfig::SelfAttention(config),
            &mesh,
            &store,
            &format!("self_{index}"),
            &model_dim(),
        )?;
        check_decode(&layer, 6, 0)?;
        check_decode(&layer, 6, 4)?;
    }
    Ok(())
}

#[test]
fn causal_self_attention_ignores_later_positions() -> Result<()> {
    let mesh = Mesh::cpu();
    let store = VariableStore::new();
    let layer = SelfAttention::new(&mesh, &store, "self", &model_dim(), small(2))?;
    let a = inputs(5, 1)?;
    let b = inputs(5, 9)?;
    // Same first three positions, different tails.
    let mixed = mesh::ops::concat(&[&slice(&a, 0, 3, "length")?, &slice(&b, 3, 2, "length")?], "length")?;
    let ya = layer.apply(&mut context(Mode::Eval, 5), &a)?;
    let ymixed = layer.apply(&mut context(Mode::Eval, 5), &mixed)?;
    for t in 0..3 {
        assert_close(&at(&ya, t)?, &at(&ymixed, t)?, "prefix")?;
    }

    let mut bidirectional = context(Mode::Eval, 5);
    bidirectional.fully_autoregressive = false;
    let yb = layer.apply(&mut bidirectional, &a)?;
    let diff: f32 = yb
        .to_vec_f32()?
        .iter()
        .zip(ya.to_vec_f32()?)
        .map(|(x, y)| (x - y).abs())
        .sum();
    assert!(diff > 1e-4);
    // Nothing to mask in bidirectional mode; the empty bias is cached too.
    assert_eq!(bidirectional.bias_cache_len(), 1);
    Ok(())
}

#[test]
fn shared_relative_bias_is_computed_once_per_pass() -> Result<()> {
    let mesh = Mesh::cpu();
    let store = VariableStore::new();
    let config = AttentionConfig {
        relative_attention_type: Some(RelativeAttentionType::BiasShared),
        relative_attention_num_buckets: 4,
        ..small(2)
    };
    let configs = vec![
        LayerConfig::SelfAttention(config.clone()),
        LayerConfig::SelfAttention(config),
    ];
    let layers = build_layers(&configs, &mesh, &store, "decoder", &model_dim())?;
    let mut ctx = context(Mode::Eval, 4);
    apply_layers(&layers, &mut ctx, &inputs(4, 0)?)?;
    assert_eq!(ctx.bias_cache_len(), 1);
    Ok(())
}

#[test]
fn local_attention_decodes_like_the_batch_pass() -> Result<()> {
    let mesh = Mesh::cpu();
    for (radius, shared_kv) in [(3, false), (2, true)] {
        let store = VariableStore::new();
        let config = LocalConfig {
            attention: AttentionConfig {
                shared_kv,
                ..small(2)
            },
            radius,
        };
        let layer = AttentionLayer::new(
            &LayerConfig::LocalSelfAttention(config),
            &mesh,
            &store,
            "local",
            &model_dim(),
        )?;
        check_decode(&layer, 7, 0)?;
        check_decode(&layer, 7, 5)?;
    }
    Ok(())
}

#[test]
fn local_attention_sees_only_the_radius() -> Result<()> {
    let mesh = Mesh::cpu();
    let store = VariableStore::new();
    let config = LocalConfig {
        attention: small(2),
        radius: 2,
    };
    let layer = LocalSelfAttention::new(&mesh, &store, "local", &model_dim(), config)?;
    let a = inputs(6, 1)?;
    let b = inputs(6, 5)?;
    // Position 4 sees positions 3 and 4 only.
    let mixed = mesh::ops::concat(&[&slice(&b, 0, 3, "length")?, &slice(&a, 3, 3, "length")?], "length")?;
    let ya = layer.apply(&mut context(Mode::Eval, 6), &a)?;
    let ymixed = layer.apply(&mut context(Mode::Eval, 6), &mixed)?;
    assert_close(&at(&ya, 4)?, &at(&ymixed, 4)?, "window")?;
    Ok(())
}

#[test]
fn long_sequences_use_the_blocked_engine() -> Result<()> {
    let mesh = Mesh::cpu();
    let store = VariableStore::new();
    let length = 260;
    for causal in [true, false] {
        let layer = LocalSelfAttention::new(
            &mesh,
            &store,
            "local",
            &model_dim(),
            LocalConfig {
                attention: small(2),
                radius: 2,
            },
        )?;
        let x = inputs(length, 2)?;
        let mut blocked_ctx = context(Mode::Eval, length);
        blocked_ctx.fully_autoregressive = causal;
        let blocked = layer.apply(&mut blocked_ctx, &x)?;
        // Identical sequence ids add nothing but force the dense path.
        assert_eq!(blocked_ctx.bias_cache_len(), 0);
        let mut dense_ctx = context(Mode::Eval, length);
        dense_ctx.fully_autoregressive = causal;
        let ids = Shape::new(vec![Dimension::new("length", length)])?;
        dense_ctx.sequence_id = Some(MeshTensor::ones(&ids, DType::I64, &Device::Cpu)?);
        let dense = layer.apply(&mut dense_ctx, &x)?;
        assert_eq!(dense_ctx.bias_cache_len(), 1);
        assert_close(&blocked, &dense, "blocked vs dense")?;
    }
    Ok(())
}

fn encoder_output(length: usize) -> Result<MeshTensor> {
    let shape = Shape::new(vec![
        Dimension::new("batch", 2),
        Dimension::new(MEMORY_LENGTH_NAME, length),
        model_dim(),
    ])?;
    let data = (0..shape.elem_count())
        .map(|v| ((v * 5) % 13) as f32 / 13.0 - 0.5)
        .collect();
    Ok(MeshTensor::from_vec(data, &shape, &Device::Cpu)?)
}

#[test]
fn enc_dec_attention_reuses_the_first_part_memory() -> Result<()> {
    let mesh = Mesh::cpu();
    let store = VariableStore::new();
    let layer = EncDecAttention::new(&mesh, &store, "enc_dec", &model_dim(), small(2))?;
    let x = inputs(4, 0)?;

    let mut eval = context(Mode::Eval, 4);
    eval.encoder_output = Some(encoder_output(5)?);
    let batch = layer.apply(&mut eval, &x)?;

    let mut first = context(Mode::FirstPart { initial_position: 2 }, 4);
    first.encoder_output = Some(encoder_output(5)?);
    layer.apply(&mut first, &x)?;
    let constants = first.take_new_constant_states();
    assert_eq!(constants.len(), 1);
    assert_eq!(constants[0].memory_length.size(), 5);

    // The encoder output is not needed any more.
    let mut step = context(Mode::Incremental { position: 2 }, 4).with_constant_states(constants);
    let y = layer.apply(&mut step, &at(&x, 2)?)?;
    assert_close(&y, &at(&batch, 2)?, "incremental enc-dec")
}

#[test]
fn enc_dec_attention_checks_its_inputs() -> Result<()> {
    let mesh = Mesh::cpu();
    let store = VariableStore::new();
    let layer = EncDecAttention::new(&mesh, &store, "enc_dec", &model_dim(), small(2))?;
    let x = inputs(3, 0)?;

    let err = layer.apply(&mut context(Mode::Eval, 3), &x).unwrap_err();
    assert!(matches!(err, LayerError::MissingContext { .. }));

    let mut wide = context(Mode::Eval, 3);
    let shape = Shape::new(vec![
        Dimension::new(MEMORY_LENGTH_NAME, 2),
        Dimension::new("d_model", MODEL + 1),
    ])?;
    wide.encoder_output = Some(MeshTensor::zeros(&shape, DType::F32, &Device::Cpu)?);
    assert!(matches!(
        layer.apply(&mut wide, &x),
        Err(LayerError::Config { .. })
    ));

    let err = layer
        .apply(&mut context(Mode::Incremental { position: 0 }, 3), &at(&x, 0)?)
        .unwrap_err();
    assert!(matches!(err, LayerError::MissingContext { .. }));
    Ok(())
}

#[test]
fn enc_dec_attention_masks_other_sequences() -> Result<()> {
    let mesh = Mesh::cpu();
    let store = VariableStore::new();
    let layer = EncDecAttention::new(&mesh, &store, "enc_dec", &model_dim(), small(2))?;
    let x = inputs(2, 0)?;
    let memory = encoder_output(4)?;
    let ids = |name: &str, values: Vec<i64>| -> Result<MeshTensor> {
        let shape = Shape::new(vec![Dimension::new(name, values.len())])?;
        Ok(MeshTensor::from_vec(values, &shape, &Device::Cpu)?)
    };

    // Query 0 is in sequence 1 (memory 0..2), query 1 in sequence 2.
    let mut ctx = context(Mode::Eval, 2);
    ctx.encoder_output = Some(memory.clone());
    ctx.sequence_id = Some(ids("length", vec![1, 2])?);
    ctx.encoder_sequence_id = Some(ids(MEMORY_LENGTH_NAME, vec![1, 1, 2, 2])?);
    let masked = layer.apply(&mut ctx, &x)?;

    // The same query against only its own half of the memory.
    let mut own = context(Mode::Eval, 2);
    own.encoder_output = Some(slice(&memory, 0, 2, MEMORY_LENGTH_NAME)?);
    let reference = layer.apply(&mut own, &x)?;
    assert_close(&at(&masked, 0)?, &at(&reference, 0)?, "sequence 1")
}

#[test]
fn transparent_layers_share_one_mixing_matrix() -> Result<()> {
    let mesh = Mesh::cpu();
    let store = VariableStore::new();
    let transparent = TransparentConfig {
        attention: small(2),
        layers_per_encoder_module: 1,
        layers_per_decoder_module: 1,
        encoder_num_modules: 2,
        decoder_num_modules: 2,
    };
    let configs = vec![
        LayerConfig::TransparentEncDecAttention(transparent.clone()),
        LayerConfig::TransparentEncDecAttention(transparent),
    ];
    let layers = build_layers(&configs, &mesh, &store, "decoder", &model_dim())?;
    let names = store.names()?;
    assert_eq!(names.iter().filter(|n| n.starts_with("transparent/")).count(), 1);

    let mut ctx = context(Mode::Eval, 5);
    // Encoder outputs carry the encoder length under the context's length name.
    ctx.encoder_layer_outputs = (0..3).map(|seed| inputs(5, seed)).collect::<Result<_>>()?;
    let x = inputs(5, 11)?;
    let y = apply_layers(&layers, &mut ctx, &x)?;
    assert_eq!(y.shape(), x.shape());
    assert_eq!(ctx.decoder_inputs().map(<[MeshTensor]>::len), Some(2));

    // A third layer would need a third decoder module.
    ctx.layer_index = 2;
    let AttentionLayer::TransparentEncDecAttention(layer) = &layers[0] else {
        unreachable!("built from a transparent config");
    };
    assert!(matches!(layer.apply(&mut ctx, &x), Err(LayerError::Config { .. })));
    Ok(())
}
