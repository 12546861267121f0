//! Query, key, value and output projections.
//!
//! Projection weights are created once per attention instance and shared by
//! every block and every decode step that goes through it. With `combine`
//! set, the four matrices are one stacked `qkvo` variable that is unstacked on
//! creation.

use candle_core::{DType, Tensor};
use mesh::ops::{einsum, unstack};
use mesh::{Dimension, Initializer, Mesh, MeshTensor, Shape, VariableStore};

use crate::core::{AttentionError, Result};

/// How query heads relate to memory (key/value) heads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadsLayout {
    query_heads_dims: Vec<Dimension>,
    memory_heads_dims: Vec<Dimension>,
}

impl HeadsLayout {
    /// Builds the heads dimensions for `num_heads` read heads.
    ///
    /// * `num_memory_heads == 0`: keys and values have the same `heads`.
    /// * `num_memory_heads == 1`: a single write head (multi-query attention);
    ///   memory tensors carry no heads dimension.
    /// * otherwise `num_memory_heads` must divide `num_heads`; memory uses
    ///   `heads = num_memory_heads` and queries add
    ///   `query_heads = num_heads / num_memory_heads`.
    pub fn new(num_heads: usize, num_memory_heads: usize) -> Result<Self> {
        if num_heads == 0 {
            return Err(AttentionError::config("num_heads must be positive"));
        }
        let heads = |size| Dimension::new("heads", size);
        let layout = if num_heads == 1 {
            Self {
                query_heads_dims: Vec::new(),
                memory_heads_dims: Vec::new(),
            }
        } else {
            match num_memory_heads {
                0 => Self {
                    query_heads_dims: vec![heads(num_heads)],
                    memory_heads_dims: vec![heads(num_heads)],
                },
                1 => Self {
                    query_heads_dims: vec![heads(num_heads)],
                    memory_heads_dims: Vec::new(),
                },
                m if num_heads % m != 0 => {
                    return Err(AttentionError::config(format!(
                        "num_memory_heads {m} must divide num_heads {num_heads}"
                    )))
                }
                m => Self {
                    query_heads_dims: vec![
                        heads(m),
                        Dimension::new("query_heads", num_heads / m),
                    ],
                    memory_heads_dims: vec![heads(m)],
                },
            }
        };
        Ok(layout)
    }

    pub fn query_heads_dims(&self) -> &[Dimension] {
        &self.query_heads_dims
    }

    pub fn memory_heads_dims(&self) -> &[Dimension] {
        &self.memory_heads_dims
    }

    pub fn num_query_heads(&self) -> usize {
        self.query_heads_dims.iter().map(Dimension::size).product()
    }
}

/// Shape and sharing options of an [`AttentionParams`] instance.
#[derive(Debug, Clone)]
pub struct ParamsConfig {
    /// Channel dimension of the inputs and of the projected output.
    pub io_dim: Dimension,
    pub key_dim: Dimension,
    pub value_dim: Dimension,
    pub heads: HeadsLayout,
    /// One projection serves as both keys and values.
    pub shared_kv: bool,
    /// Store q, k, v and o in one stacked variable.
    pub combine: bool,
}

impl ParamsConfig {
    /// Standard multi-head configuration with `kv_dim` for keys and values.
    pub fn multihead(io_dim: Dimension, kv_dim: Dimension, num_heads: usize) -> Result<Self> {
        Ok(Self {
            io_dim,
            key_dim: kv_dim.clone(),
            value_dim: kv_dim,
            heads: HeadsLayout::new(num_heads, 0)?,
            shared_kv: false,
            combine: false,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.shared_kv && self.key_dim != self.value_dim {
            return Err(AttentionError::config(format!(
                "shared_kv needs identical key and value dims, got {} and {}",
                self.key_dim, self.value_dim
            )));
        }
        if self.combine {
            if self.shared_kv {
                return Err(AttentionError::config("combine cannot be used with shared_kv"));
            }
            if self.key_dim != self.value_dim {
                return Err(AttentionError::config(
                    "combine needs identical key and value dims",
                ));
            }
            if self.heads.query_heads_dims != self.heads.memory_heads_dims {
                return Err(AttentionError::config(
                    "combine needs the same heads for queries and memory",
                ));
            }
        }
        Ok(())
    }
}

/// The projection weights of one attention instance.
#[derive(Debug, Clone)]
pub struct AttentionParams {
    config: ParamsConfig,
    wq: MeshTensor,
    wk: MeshTensor,
    wv: Option<MeshTensor>,
    wo: MeshTensor,
}

impl AttentionParams {
    /// Creates the variables under `name` in `store`.
    ///
    /// Initial stddevs: `io^-0.5 * kv^-0.25` for queries and keys (which
    /// folds the `1/sqrt(kv)` logit scaling into the weights), `io^-0.5` for
    /// values and `(io * heads)^-0.5` for the output.
    pub fn new(
        mesh: &Mesh,
        store: &VariableStore,
        name: &str,
        config: ParamsConfig,
    ) -> Result<Self> {
        config.validate()?;
        let io = config.io_dim.size() as f64;
        let kv = config.key_dim.size() as f64;
        let qk_stddev = io.powf(-0.5) * kv.powf(-0.25);
        let v_stddev = io.powf(-0.5);
        let o_stddev = (io * config.heads.num_query_heads() as f64).powf(-0.5);

        let weight_shape = |heads: &[Dimension], channel: &Dimension| -> Result<Shape> {
            let mut dims = heads.to_vec();
            dims.push(config.io_dim.clone());
            dims.push(channel.clone());
            Ok(Shape::new(dims)?)
        };
        let q_shape = weight_shape(&config.heads.query_heads_dims, &config.key_dim)?;
        let k_shape = weight_shape(&config.heads.memory_heads_dims, &config.key_dim)?;
        let v_shape = weight_shape(&config.heads.memory_heads_dims, &config.value_dim)?;
        let o_shape = weight_shape(&config.heads.query_heads_dims, &config.value_dim)?;
        let dtype = mesh.activation_dtype();
        let device = mesh.device();
        let variable = |suffix: &str, shape: &Shape, stddev: f64| {
            store.get_variable(
                &format!("{name}/{suffix}"),
                shape,
                Initializer::Normal { stddev },
                dtype,
                device,
            )
        };

        let (wq, wk, wv, wo) = if config.combine {
            let qkvo = Dimension::new("qkvo", 4);
            let stacked_shape = Shape::new(vec![qkvo.clone()])?.concat(&q_shape)?;
            let scales = Tensor::new(&[qk_stddev as f32, qk_stddev as f32, v_stddev as f32, o_stddev as f32], device)?
                .reshape(
                    std::iter::once(4)
                        .chain(std::iter::repeat(1).take(q_shape.rank()))
                        .collect::<Vec<_>>(),
                )?;
            let init = Tensor::randn(0f32, 1f32, stacked_shape.sizes(), device)?
                .broadcast_mul(&scales)?
                .to_dtype(dtype)?;
            let stacked = store.get_variable(
                &format!("{name}/qkvo"),
                &stacked_shape,
                Initializer::Value(init),
                dtype,
                device,
            )?;
            let mut parts = unstack(&stacked, qkvo.name())?.into_iter();
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(q), Some(k), Some(v), Some(o)) => (q, k, Some(v), o),
                _ => return Err(AttentionError::shape("qkvo variable did not unstack into 4 parts")),
            }
        } else if config.shared_kv {
            (
                variable("q", &q_shape, qk_stddev)?,
                variable("kv", &k_shape, qk_stddev)?,
                None,
                variable("o", &o_shape, o_stddev)?,
            )
        } else {
            (
                variable("q", &q_shape, qk_stddev)?,
                variable("k", &k_shape, qk_stddev)?,
                Some(variable("v", &v_shape, v_stddev)?),
                variable("o", &o_shape, o_stddev)?,
            )
        };
        log::debug!(
            "attention params `{name}`: io={} key={} value={} query_heads={:?} memory_heads={:?} combine={} shared_kv={}",
            config.io_dim,
            config.key_dim,
            config.value_dim,
            config.heads.query_heads_dims,
            config.heads.memory_heads_dims,
            config.combine,
            config.shared_kv
        );
        Ok(Self {
            config,
            wq,
            wk,
            wv,
            wo,
        })
    }

    pub fn config(&self) -> &ParamsConfig {
        &self.config
    }

    pub fn io_dim(&self) -> &Dimension {
        &self.config.io_dim
    }

    pub fn key_dim(&self) -> &Dimension {
        &self.config.key_dim
    }

    pub fn value_dim(&self) -> &Dimension {
        &self.config.value_dim
    }

    pub fn heads(&self) -> &HeadsLayout {
        &self.config.heads
    }

    pub fn shared_kv(&self) -> bool {
        self.config.shared_kv
    }

    pub fn wq(&self) -> &MeshTensor {
        &self.wq
    }

    pub fn wo(&self) -> &MeshTensor {
        &self.wo
    }

    fn project(&self, x: &MeshTensor, w: &MeshTensor, heads: &[Dimension], channel: &Dimension) -> Result<MeshTensor> {
        if !x.shape().contains(&self.config.io_dim) {
            return Err(AttentionError::shape(format!(
                "antecedent {} does not carry {}",
                x.shape(),
                self.config.io_dim
            )));
        }
        let mut dims: Vec<Dimension> = x
            .dims()
            .iter()
            .filter(|d| *d != &self.config.io_dim)
            .cloned()
            .collect();
        dims.extend(heads.iter().cloned());
        dims.push(channel.clone());
        Ok(einsum(&[x, w], &Shape::new(dims)?)?)
    }

    /// `x` with the io dimension replaced by query heads and key channels.
    pub fn compute_q(&self, x: &MeshTensor) -> Result<MeshTensor> {
        self.project(x, &self.wq, &self.config.heads.query_heads_dims, &self.config.key_dim)
    }

    /// Keys for `memory`; with `shared_kv` this is the shared projection.
    pub fn compute_k(&self, memory: &MeshTensor) -> Result<MeshTensor> {
        self.project(memory, &self.wk, &self.config.heads.memory_heads_dims, &self.config.key_dim)
    }

    /// Values for `memory`; with `shared_kv` this is the shared projection.
    pub fn compute_v(&self, memory: &MeshTensor) -> Result<MeshTensor> {
        let w = self.wv.as_ref().unwrap_or(&self.wk);
        self.project(memory, w, &self.config.heads.memory_heads_dims, &self.config.value_dim)
    }

    /// The shared key/value projection. Only valid with `shared_kv`.
    pub fn compute_kv(&self, memory: &MeshTensor) -> Result<MeshTensor> {
        if !self.config.shared_kv {
            return Err(AttentionError::config("compute_kv requires shared_kv"));
        }
        self.compute_k(memory)
    }

    /// Keys and values for `memory`, projecting only once with `shared_kv`.
    pub fn compute_memory(&self, memory: &MeshTensor) -> Result<(MeshTensor, MeshTensor)> {
        if self.config.shared_kv {
            let kv = self.compute_kv(memory)?;
            return Ok((kv.clone(), kv));
        }
        Ok((self.compute_k(memory)?, self.compute_v(memory)?))
    }

    /// Merges heads and value channels back into the io dimension.
    pub fn compute_output(&self, o: &MeshTensor) -> Result<MeshTensor> {
        let mut drop: Vec<&str> = self
            .config
            .heads
            .query_heads_dims
            .iter()
            .map(Dimension::name)
            .collect();
        drop.push(self.config.value_dim.name());
        for name in &drop {
            if !o.has_dim(name) {
                return Err(AttentionError::shape(format!(
                    "attention output {} is missing `{name}`",
                    o.shape()
                )));
            }
        }
        let shape = o
            .shape()
            .without(&drop)
            .concat(&Shape::new(vec![self.config.io_dim.clone()])?)?;
        Ok(einsum(&[o, &self.wo], &shape)?)
    }

    pub fn dtype(&self) -> DType {
        self.wq.dtype()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn input(mesh: &Mesh, io: usize) -> Result<MeshTensor> {
        let shape = Shape::new(vec![
            Dimension::new("batch", 2),
            Dimension::new("length", 3),
            Dimension::new("d_model", io),
        ])?;
        let data = (0..shape.elem_count()).map(|v| (v % 5) as f32 * 0.1).collect();
        Ok(MeshTensor::from_vec(data, &shape, mesh.device())?)
    }

    #[test]
    fn heads_layouts() -> Result<()> {
        let mqa = HeadsLayout::new(8, 1)?;
        assert!(mqa.memory_heads_dims().is_empty());
        assert_eq!(mqa.num_query_heads(), 8);

        let grouped = HeadsLayout::new(8, 2)?;
        assert_eq!(grouped.memory_heads_dims(), &[Dimension::new("heads", 2)]);
        assert_eq!(
            grouped.query_heads_dims(),
            &[Dimension::new("heads", 2), Dimension::new("query_heads", 4)]
        );
        assert!(matches!(
            HeadsLayout::new(8, 3),
            Err(AttentionError::Config { .. })
        ));
        assert!(HeadsLayout::new(1, 0)?.query_heads_dims().is_empty());
        Ok(())
    }

    #[test]
    fn projections_have_named_shapes() -> Result<()> {
        let mesh = Mesh::cpu();
        let store = VariableStore::new();
        let mut config = ParamsConfig::multihead(
            Dimension::new("d_model", 6),
            Dimension::new("d_kv", 4),
            2,
        )?;
        config.heads = HeadsLayout::new(4, 2)?;
        let params = AttentionParams::new(&mesh, &store, "self_attention", config)?;
        let x = input(&mesh, 6)?;

        let q = params.compute_q(&x)?;
        assert_eq!(q.shape().names(), vec!["batch", "length", "heads", "query_heads", "d_kv"]);
        let k = params.compute_k(&x)?;
        assert_eq!(k.shape().names(), vec!["batch", "length", "heads", "d_kv"]);
        let out = params.compute_output(&q)?;
        assert_eq!(out.shape(), x.shape());
        assert_eq!(
            store.names()?,
            vec![
                "self_attention/k",
                "self_attention/o",
                "self_attention/q",
                "self_attention/v"
            ]
        );
        Ok(())
    }

    #[test]
    fn combined_variable_is_unstacked() -> Result<()> {
        let mesh = Mesh::cpu();
        let store = VariableStore::new();
        let mut config = ParamsConfig::multihead(
            Dimension::new("d_model", 16),
            Dimension::new("d_kv", 16),
            4,
        )?;
        config.combine = true;
        let params = AttentionParams::new(&mesh, &store, "attn", config)?;
        assert_eq!(store.names()?, vec!["attn/qkvo"]);
        assert_eq!(params.wq().shape().names(), vec!["heads", "d_model", "d_kv"]);

        // q uses a smaller stddev than v: 16^-0.5 * 16^-0.25 = 0.125 vs 0.25.
        let std = |t: &MeshTensor| -> Result<f32> {
            let values = t.to_vec_f32()?;
            let n = values.len() as f32;
            Ok((values.iter().map(|v| v * v).sum::<f32>() / n).sqrt())
        };
        let q_std = std(params.wq())?;
        assert!((q_std - 0.125).abs() < 0.03, "{q_std}");
        Ok(())
    }

    #[test]
    fn shared_kv_and_invalid_combinations() -> Result<()> {
        let mesh = Mesh::cpu();
        let store = VariableStore::new();
        let mut config = ParamsConfig::multihead(
            Dimension::new("d_model", 4),
            Dimension::new("d_kv", 2),
            2,
        )?;
        config.shared_kv = true;
        let params = AttentionParams::new(&mesh, &store, "shared", config.clone())?;
        let x = input(&mesh, 4)?;
        let kv = params.compute_kv(&x)?;
        assert_eq!(kv.to_vec_f32()?, params.compute_v(&x)?.to_vec_f32()?);

        config.combine = true;
        assert!(AttentionParams::new(&mesh, &store, "bad", config).is_err());

        let plain = ParamsConfig::multihead(
            Dimension::new("d_model", 4),
            Dimension::new("d_kv", 2),
            2,
        )?;
        let params = AttentionParams::new(&mesh, &store, "plain", plain)?;
        assert!(params.compute_kv(&x).is_err());
        let wrong = MeshTensor::zeros(
            &Shape::new(vec![Dimension::new("d_model", 5)])?,
            DType::F32,
            &Device::Cpu,
        )?;
        assert!(matches!(
            params.compute_q(&wrong),
            Err(AttentionError::InvalidShape { .. })
        ));
        Ok(())
    }
}
