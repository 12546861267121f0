//! Operations on named tensors.
//!
//! Alignment is always by dimension name. Binary operations broadcast their
//! operands to the union of both shapes (left operand's order first) unless an
//! explicit output shape is given. Contractions go through [`einsum`], which
//! sums every dimension that does not survive into the output.

use candle_core::{DType, Tensor};

use crate::error::{MeshError, Result};
use crate::layout::Mesh;
use crate::shape::{Dimension, Shape};
use crate::tensor::MeshTensor;

fn axis(x: &MeshTensor, name: &str) -> Result<usize> {
    x.shape()
        .index_of(name)
        .ok_or_else(|| MeshError::UnknownDimension {
            name: name.to_string(),
            shape: x.shape().to_string(),
        })
}

fn product(dims: &[Dimension]) -> usize {
    dims.iter().map(Dimension::size).product()
}

/// Permutes the axes of `x` into the order of `order`.
///
/// `order` must hold exactly the dimensions of `x`.
pub fn transpose_to(x: &MeshTensor, order: &Shape) -> Result<MeshTensor> {
    if x.shape() == order {
        return Ok(x.clone());
    }
    if x.rank() != order.rank() || order.dims().iter().any(|dim| !x.shape().contains(dim)) {
        return Err(MeshError::ShapeMismatch {
            op: "transpose_to",
            detail: format!("cannot reorder {} into {order}", x.shape()),
        });
    }
    let perm = order
        .dims()
        .iter()
        .map(|dim| axis(x, dim.name()))
        .collect::<Result<Vec<_>>>()?;
    let tensor = x.tensor().permute(perm)?.contiguous()?;
    MeshTensor::new(tensor, order.clone())
}

/// Broadcasts `x` to `target`, inserting missing dimensions.
pub fn broadcast_to(x: &MeshTensor, target: &Shape) -> Result<MeshTensor> {
    if x.shape() == target {
        return Ok(x.clone());
    }
    for dim in x.dims() {
        match target.get(dim.name()) {
            Some(t) if t.size() == dim.size() => {}
            Some(t) => {
                return Err(MeshError::SizeMismatch {
                    name: dim.name().to_string(),
                    left: dim.size(),
                    right: t.size(),
                })
            }
            None => {
                return Err(MeshError::ShapeMismatch {
                    op: "broadcast_to",
                    detail: format!("{} is not contained in {target}", x.shape()),
                })
            }
        }
    }
    let present: Vec<Dimension> = target
        .dims()
        .iter()
        .filter(|dim| x.has_dim(dim.name()))
        .cloned()
        .collect();
    let aligned = transpose_to(x, &Shape::new(present)?)?;
    let expanded: Vec<usize> = target
        .dims()
        .iter()
        .map(|dim| if x.has_dim(dim.name()) { dim.size() } else { 1 })
        .collect();
    let tensor = aligned
        .tensor()
        .reshape(expanded)?
        .broadcast_as(target.sizes())?;
    MeshTensor::new(tensor, target.clone())
}

fn binary<F>(
    a: &MeshTensor,
    b: &MeshTensor,
    output: Option<&Shape>,
    f: F,
) -> Result<MeshTensor>
where
    F: Fn(&Tensor, &Tensor) -> candle_core::Result<Tensor>,
{
    let shape = match output {
        Some(shape) => shape.clone(),
        None => a.shape().union(b.shape())?,
    };
    let lhs = broadcast_to(a, &shape)?;
    let rhs = broadcast_to(b, &shape)?;
    MeshTensor::new(f(lhs.tensor(), rhs.tensor())?, shape)
}

pub fn add(a: &MeshTensor, b: &MeshTensor) -> Result<MeshTensor> {
    binary(a, b, None, |x, y| x.add(y))
}

pub fn sub(a: &MeshTensor, b: &MeshTensor) -> Result<MeshTensor> {
    binary(a, b, None, |x, y| x.sub(y))
}

pub fn mul(a: &MeshTensor, b: &MeshTensor) -> Result<MeshTensor> {
    binary(a, b, None, |x, y| x.mul(y))
}

/// Elementwise product broadcast into an explicit output shape.
pub fn mul_into(a: &MeshTensor, b: &MeshTensor, output: &Shape) -> Result<MeshTensor> {
    binary(a, b, Some(output), |x, y| x.mul(y))
}

pub fn div(a: &MeshTensor, b: &MeshTensor) -> Result<MeshTensor> {
    binary(a, b, None, |x, y| x.div(y))
}

pub fn maximum(a: &MeshTensor, b: &MeshTensor) -> Result<MeshTensor> {
    binary(a, b, None, |x, y| x.maximum(y))
}

pub fn minimum(a: &MeshTensor, b: &MeshTensor) -> Result<MeshTensor> {
    binary(a, b, None, |x, y| x.minimum(y))
}

/// Sums any number of same-dtype tensors, broadcasting by name.
pub fn add_n(xs: &[MeshTensor]) -> Result<Option<MeshTensor>> {
    let mut iter = xs.iter();
    let Some(first) = iter.next() else {
        return Ok(None);
    };
    let mut acc = first.clone();
    for x in iter {
        acc = add(&acc, x)?;
    }
    Ok(Some(acc))
}

/// Computes `x * mul + add` elementwise.
pub fn affine(x: &MeshTensor, mul: f64, add: f64) -> Result<MeshTensor> {
    MeshTensor::new(x.tensor().affine(mul, add)?, x.shape().clone())
}

pub fn cast(x: &MeshTensor, dtype: DType) -> Result<MeshTensor> {
    x.to_dtype(dtype)
}

macro_rules! comparison {
    ($(#[$meta:meta])* $name:ident, $scalar:ident, $method:ident) => {
        $(#[$meta])*
        pub fn $name(a: &MeshTensor, b: &MeshTensor) -> Result<MeshTensor> {
            binary(a, b, None, |x, y| x.$method(y))
        }

        /// Scalar form; the scalar is converted to the tensor's dtype.
        pub fn $scalar(a: &MeshTensor, value: f64) -> Result<MeshTensor> {
            MeshTensor::new(a.tensor().$method(value)?, a.shape().clone())
        }
    };
}

comparison!(
    /// `a > b` as a `u8` tensor.
    greater, greater_scalar, gt
);
comparison!(
    /// `a >= b` as a `u8` tensor.
    greater_equal, greater_equal_scalar, ge
);
comparison!(
    /// `a < b` as a `u8` tensor.
    less, less_scalar, lt
);
comparison!(
    /// `a <= b` as a `u8` tensor.
    less_equal, less_equal_scalar, le
);
comparison!(
    /// `a == b` as a `u8` tensor.
    equal, equal_scalar, eq
);
comparison!(
    /// `a != b` as a `u8` tensor.
    not_equal, not_equal_scalar, ne
);

/// Selects `on_true` where `condition` is non-zero and `on_false` elsewhere.
pub fn where_cond(
    condition: &MeshTensor,
    on_true: &MeshTensor,
    on_false: &MeshTensor,
    output: Option<&Shape>,
) -> Result<MeshTensor> {
    let shape = match output {
        Some(shape) => shape.clone(),
        None => condition
            .shape()
            .union(on_true.shape())?
            .union(on_false.shape())?,
    };
    let condition = broadcast_to(&condition.to_dtype(DType::U8)?, &shape)?;
    let on_true = broadcast_to(on_true, &shape)?;
    let on_false = broadcast_to(on_false, &shape)?;
    let tensor = condition
        .tensor()
        .where_cond(on_true.tensor(), on_false.tensor())?;
    MeshTensor::new(tensor, shape)
}

/// `[0, 1, ..., dim.size - 1]` along `dim`.
pub fn range(mesh: &Mesh, dim: &Dimension, dtype: DType) -> Result<MeshTensor> {
    let tensor = Tensor::arange(0i64, dim.size() as i64, mesh.device())?.to_dtype(dtype)?;
    MeshTensor::new(tensor, Shape::new(vec![dim.clone()])?)
}

/// One-hot encodes integer `indices` along a new trailing dimension.
///
/// Indices outside `[0, dim.size)` produce an all-zero row.
pub fn one_hot(indices: &MeshTensor, dim: &Dimension, dtype: DType) -> Result<MeshTensor> {
    let positions = Tensor::arange(0i64, dim.size() as i64, indices.device())?;
    let positions = MeshTensor::new(positions, Shape::new(vec![dim.clone()])?)?;
    let hits = equal(&indices.to_dtype(DType::I64)?, &positions)?;
    cast(&hits, dtype)
}

/// One-hot vector for a host-side index.
pub fn one_hot_scalar(
    mesh: &Mesh,
    index: usize,
    dim: &Dimension,
    dtype: DType,
) -> Result<MeshTensor> {
    if index >= dim.size() {
        return Err(MeshError::InvalidArgument {
            op: "one_hot_scalar",
            detail: format!("index {index} out of range for {dim}"),
        });
    }
    let mut data = vec![0f32; dim.size()];
    data[index] = 1.0;
    MeshTensor::from_vec(data, &Shape::new(vec![dim.clone()])?, mesh.device())?.to_dtype(dtype)
}

/// Reinterprets `x` with `shape`, preserving element order.
pub fn reshape(x: &MeshTensor, shape: &Shape) -> Result<MeshTensor> {
    if x.shape().elem_count() != shape.elem_count() {
        return Err(MeshError::ShapeMismatch {
            op: "reshape",
            detail: format!("cannot reshape {} into {shape}", x.shape()),
        });
    }
    let tensor = x.tensor().reshape(shape.sizes())?;
    MeshTensor::new(tensor, shape.clone())
}

/// Renames one dimension without moving data.
pub fn rename_dimension(x: &MeshTensor, old: &str, new: &str) -> Result<MeshTensor> {
    MeshTensor::new(x.tensor().clone(), x.shape().rename(old, new)?)
}

/// Replaces dimension `old` with an equally sized `new` dimension.
pub fn replace_dimensions(x: &MeshTensor, old: &Dimension, new: &Dimension) -> Result<MeshTensor> {
    if !x.shape().contains(old) {
        return Err(MeshError::UnknownDimension {
            name: old.to_string(),
            shape: x.shape().to_string(),
        });
    }
    if old.size() != new.size() {
        return Err(MeshError::ShapeMismatch {
            op: "replace_dimensions",
            detail: format!("{old} and {new} differ in size"),
        });
    }
    MeshTensor::new(x.tensor().clone(), x.shape().replace(old.name(), new.clone())?)
}

/// Sums out every dimension of `x` missing from `output`, then reorders.
pub fn reduce_sum(x: &MeshTensor, output: &Shape) -> Result<MeshTensor> {
    let reduced: Vec<usize> = x
        .dims()
        .iter()
        .enumerate()
        .filter(|(_, dim)| !output.contains_name(dim.name()))
        .map(|(idx, _)| idx)
        .collect();
    let summed = if reduced.is_empty() {
        x.clone()
    } else {
        let remaining: Vec<Dimension> = x
            .dims()
            .iter()
            .filter(|dim| output.contains_name(dim.name()))
            .cloned()
            .collect();
        MeshTensor::new(x.tensor().sum(reduced)?, Shape::new(remaining)?)?
    };
    if summed.rank() != output.rank() {
        return Err(MeshError::ShapeMismatch {
            op: "reduce_sum",
            detail: format!("{output} is not a subset of {}", x.shape()),
        });
    }
    transpose_to(&summed, output)
}

/// Generalised contraction producing `output`.
///
/// Operands are contracted pairwise from the left. Any dimension that is
/// neither in `output` nor needed by a later operand is summed away as soon
/// as possible. Same-named dimensions must agree in size.
pub fn einsum(operands: &[&MeshTensor], output: &Shape) -> Result<MeshTensor> {
    let Some((first, rest)) = operands.split_first() else {
        return Err(MeshError::InvalidArgument {
            op: "einsum",
            detail: "at least one operand is required".to_string(),
        });
    };
    for dim in output.dims() {
        let found = operands.iter().any(|x| x.shape().contains(dim));
        if !found {
            return Err(MeshError::ShapeMismatch {
                op: "einsum",
                detail: format!("output dimension {dim} does not appear in any operand"),
            });
        }
    }

    let mut acc = (*first).clone();
    for (idx, next) in rest.iter().enumerate() {
        let later = &rest[idx + 1..];
        let needed = |dim: &Dimension| {
            output.contains_name(dim.name()) || later.iter().any(|x| x.has_dim(dim.name()))
        };
        let mut keep: Vec<Dimension> = Vec::new();
        for dim in acc.dims().iter().chain(next.dims()) {
            if needed(dim) && !keep.iter().any(|d| d.name() == dim.name()) {
                keep.push(dim.clone());
            }
        }
        acc = contract_pair(&acc, next, &Shape::new(keep)?)?;
    }
    reduce_sum(&acc, output)
}

fn contract_pair(a: &MeshTensor, b: &MeshTensor, keep: &Shape) -> Result<MeshTensor> {
    for dim in a.dims() {
        if let Some(other) = b.dim(dim.name()) {
            if other.size() != dim.size() {
                return Err(MeshError::SizeMismatch {
                    name: dim.name().to_string(),
                    left: dim.size(),
                    right: other.size(),
                });
            }
        }
    }

    // Dimensions private to one operand and not kept are summed first.
    let retained = |x: &MeshTensor, other: &MeshTensor| -> Result<Shape> {
        Shape::new(
            x.dims()
                .iter()
                .filter(|dim| keep.contains_name(dim.name()) || other.has_dim(dim.name()))
                .cloned()
                .collect(),
        )
    };
    let a_kept = retained(a, b)?;
    let b_kept = retained(b, a)?;
    let a = reduce_sum(a, &a_kept)?;
    let b = reduce_sum(b, &b_kept)?;

    let shared = |dim: &&Dimension| b.has_dim(dim.name());
    let batch: Vec<Dimension> = a
        .dims()
        .iter()
        .filter(shared)
        .filter(|dim| keep.contains_name(dim.name()))
        .cloned()
        .collect();
    let contracted: Vec<Dimension> = a
        .dims()
        .iter()
        .filter(shared)
        .filter(|dim| !keep.contains_name(dim.name()))
        .cloned()
        .collect();
    let a_free: Vec<Dimension> = a
        .dims()
        .iter()
        .filter(|dim| !b.has_dim(dim.name()))
        .cloned()
        .collect();
    let b_free: Vec<Dimension> = b
        .dims()
        .iter()
        .filter(|dim| !a.has_dim(dim.name()))
        .cloned()
        .collect();

    // Half-precision matmul is not available on every device; accumulate in f32.
    let dtype = a.dtype();
    let a = promote(&a)?;
    let b = promote(&b)?;
    let a_order = Shape::new([batch.clone(), a_free.clone(), contracted.clone()].concat())?;
    let b_order = Shape::new([batch.clone(), contracted.clone(), b_free.clone()].concat())?;
    let lhs = transpose_to(&a, &a_order)?.tensor().reshape((
        product(&batch),
        product(&a_free),
        product(&contracted),
    ))?;
    let rhs = transpose_to(&b, &b_order)?.tensor().reshape((
        product(&batch),
        product(&contracted),
        product(&b_free),
    ))?;
    let out_shape = Shape::new([batch, a_free, b_free].concat())?;
    let out = lhs
        .matmul(&rhs)?
        .reshape(out_shape.sizes())?
        .to_dtype(dtype)?;
    transpose_to(&MeshTensor::new(out, out_shape)?, keep)
}

/// Zero-pads `dim_name` by `left` and `right` elements.
pub fn pad(x: &MeshTensor, left: usize, right: usize, dim_name: &str) -> Result<MeshTensor> {
    let idx = axis(x, dim_name)?;
    if left == 0 && right == 0 {
        return Ok(x.clone());
    }
    let size = x.dims()[idx].size() + left + right;
    let tensor = x.tensor().pad_with_zeros(idx, left, right)?;
    let shape = x.shape().replace(dim_name, Dimension::new(dim_name, size))?;
    MeshTensor::new(tensor, shape)
}

/// Takes `size` elements of `dim_name` starting at `begin`.
pub fn slice(x: &MeshTensor, begin: usize, size: usize, dim_name: &str) -> Result<MeshTensor> {
    let idx = axis(x, dim_name)?;
    let full = x.dims()[idx].size();
    if begin + size > full {
        return Err(MeshError::InvalidArgument {
            op: "slice",
            detail: format!("[{begin}, {}) exceeds `{dim_name}` of size {full}", begin + size),
        });
    }
    let tensor = x.tensor().narrow(idx, begin, size)?;
    let shape = x.shape().replace(dim_name, Dimension::new(dim_name, size))?;
    MeshTensor::new(tensor, shape)
}

/// Concatenates tensors along `dim_name`.
///
/// All other dimensions must agree by name and size; their order follows the
/// first operand.
pub fn concat(xs: &[&MeshTensor], dim_name: &str) -> Result<MeshTensor> {
    let Some(first) = xs.first() else {
        return Err(MeshError::InvalidArgument {
            op: "concat",
            detail: "no tensors to concatenate".to_string(),
        });
    };
    let idx = axis(first, dim_name)?;
    let mut parts = Vec::with_capacity(xs.len());
    let mut total = 0;
    for x in xs {
        let size = x
            .dim(dim_name)
            .ok_or_else(|| MeshError::UnknownDimension {
                name: dim_name.to_string(),
                shape: x.shape().to_string(),
            })?
            .size();
        let order = first
            .shape()
            .replace(dim_name, Dimension::new(dim_name, size))?;
        parts.push(transpose_to(x, &order)?.into_tensor());
        total += size;
    }
    let tensor = Tensor::cat(&parts, idx)?;
    let shape = first
        .shape()
        .replace(dim_name, Dimension::new(dim_name, total))?;
    MeshTensor::new(tensor, shape)
}

/// Shifts values along `dim_name` by `offset`, filling with zeros.
///
/// A positive offset moves element `i` to `i + offset`. Nothing wraps.
pub fn shift(x: &MeshTensor, offset: isize, dim_name: &str) -> Result<MeshTensor> {
    let idx = axis(x, dim_name)?;
    let size = x.dims()[idx].size();
    let magnitude = offset.unsigned_abs();
    if offset == 0 {
        return Ok(x.clone());
    }
    if magnitude >= size {
        return MeshTensor::zeros(x.shape(), x.dtype(), x.device());
    }
    let tensor = if offset > 0 {
        x.tensor()
            .pad_with_zeros(idx, magnitude, 0)?
            .narrow(idx, 0, size)?
    } else {
        x.tensor()
            .pad_with_zeros(idx, 0, magnitude)?
            .narrow(idx, magnitude, size)?
    };
    MeshTensor::new(tensor, x.shape().clone())
}

/// Stacks equally shaped tensors along a new dimension placed at `axis_index`.
pub fn stack(xs: &[&MeshTensor], dim_name: &str, axis_index: usize) -> Result<MeshTensor> {
    let Some(first) = xs.first() else {
        return Err(MeshError::InvalidArgument {
            op: "stack",
            detail: "no tensors to stack".to_string(),
        });
    };
    if axis_index > first.rank() {
        return Err(MeshError::InvalidArgument {
            op: "stack",
            detail: format!("axis {axis_index} out of range for rank {}", first.rank()),
        });
    }
    let parts = xs
        .iter()
        .map(|x| transpose_to(x, first.shape()).map(MeshTensor::into_tensor))
        .collect::<Result<Vec<_>>>()?;
    let tensor = Tensor::stack(&parts, axis_index)?;
    let mut dims = first.dims().to_vec();
    dims.insert(axis_index, Dimension::new(dim_name, xs.len()));
    MeshTensor::new(tensor, Shape::new(dims)?)
}

/// Splits `x` into its slices along `dim_name`, dropping that dimension.
pub fn unstack(x: &MeshTensor, dim_name: &str) -> Result<Vec<MeshTensor>> {
    let idx = axis(x, dim_name)?;
    let shape = x.shape().without(&[dim_name]);
    (0..x.dims()[idx].size())
        .map(|i| {
            let tensor = x.tensor().narrow(idx, i, 1)?.squeeze(idx)?;
            MeshTensor::new(tensor, shape.clone())
        })
        .collect()
}

fn promote(x: &MeshTensor) -> Result<MeshTensor> {
    match x.dtype() {
        DType::F16 | DType::BF16 => x.to_dtype(DType::F32),
        _ => Ok(x.clone()),
    }
}

/// Log-sum-exp over `dim_name`, keeping the reduced axis with size 1.
///
/// `extra_logit` behaves like an additional entry with that value.
fn logsumexp_keepdim(x: &Tensor, idx: usize, extra_logit: Option<f32>) -> Result<Tensor> {
    let mut max = x.max_keepdim(idx)?;
    if let Some(extra) = extra_logit {
        max = max.maximum(extra as f64)?;
    }
    let mut total = x.broadcast_sub(&max)?.exp()?.sum_keepdim(idx)?;
    if let Some(extra) = extra_logit {
        total = total.add(&max.affine(-1.0, extra as f64)?.exp()?)?;
    }
    Ok(total.log()?.add(&max)?)
}

/// Log-sum-exp over `dim_name`.
pub fn reduce_logsumexp(x: &MeshTensor, dim_name: &str) -> Result<MeshTensor> {
    let idx = axis(x, dim_name)?;
    let work = promote(x)?;
    let lse = logsumexp_keepdim(work.tensor(), idx, None)?
        .squeeze(idx)?
        .to_dtype(x.dtype())?;
    MeshTensor::new(lse, x.shape().without(&[dim_name]))
}

/// Numerically stable softmax over `dim_name`, computed as `exp(x - lse(x))`.
///
/// Half-precision inputs are reduced in `f32` and cast back.
pub fn softmax(x: &MeshTensor, dim_name: &str, extra_logit: Option<f32>) -> Result<MeshTensor> {
    let idx = axis(x, dim_name)?;
    let work = promote(x)?;
    let lse = logsumexp_keepdim(work.tensor(), idx, extra_logit)?;
    let weights = work.tensor().broadcast_sub(&lse)?.exp()?.to_dtype(x.dtype())?;
    MeshTensor::new(weights, x.shape().clone())
}

pub fn log_softmax(x: &MeshTensor, dim_name: &str) -> Result<MeshTensor> {
    let idx = axis(x, dim_name)?;
    let work = promote(x)?;
    let lse = logsumexp_keepdim(work.tensor(), idx, None)?;
    let out = work.tensor().broadcast_sub(&lse)?.to_dtype(x.dtype())?;
    MeshTensor::new(out, x.shape().clone())
}

/// Inverted dropout with `rate` in `[0, 1)`.
///
/// The noise is sampled over the shape of `x` minus `broadcast_dims`, so the
/// same keep/drop decision is shared along those dimensions.
pub fn dropout(x: &MeshTensor, rate: f32, broadcast_dims: &[&str]) -> Result<MeshTensor> {
    if !(0.0..1.0).contains(&rate) {
        return Err(MeshError::InvalidArgument {
            op: "dropout",
            detail: format!("rate must be in [0, 1), got {rate}"),
        });
    }
    if rate == 0.0 {
        return Ok(x.clone());
    }
    let noise_shape = x.shape().without(broadcast_dims);
    let noise = Tensor::rand(0f32, 1f32, noise_shape.sizes(), x.device())?;
    let keep = noise
        .ge(rate as f64)?
        .to_dtype(x.dtype())?
        .affine(1.0 / (1.0 - rate as f64), 0.0)?;
    mul_into(x, &MeshTensor::new(keep, noise_shape)?, x.shape())
}
