use std::{marker::PhantomData, sync::Arc};

use serde::{Deserialize, Serialize};
use tessel_derive::TensorOp;

use crate::loom::{num::Float, ops::InnerOp};

/// Whether an operand of a contraction is used as stored or with its contracted axes moved to
/// the other end.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransOp {
    #[default]
    #[serde(alias = "N")]
    NoTrans,
    #[serde(alias = "T")]
    Trans,
}

impl TransOp {
    #[inline]
    pub fn flip(self) -> Self {
        match self {
            TransOp::NoTrans => TransOp::Trans,
            TransOp::Trans => TransOp::NoTrans,
        }
    }
}

/// Pointwise nonlinearities.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Relu,
    /// GELU with the tanh approximation.
    GeluTanh,
}

impl Activation {
    const GELU_C: f64 = 0.7978845608028654;
    const GELU_K: f64 = 0.044715;

    pub fn apply(self, x: f64) -> f64 {
        match self {
            Activation::Relu => x.max(0.0),
            Activation::GeluTanh => {
                let t = (Self::GELU_C * (x + Self::GELU_K * x * x * x)).tanh();
                0.5 * x * (1.0 + t)
            }
        }
    }

    pub fn derivative(self, x: f64) -> f64 {
        match self {
            Activation::Relu => match x > 0.0 {
                true => 1.0,
                false => 0.0,
            },
            Activation::GeluTanh => {
                let t = (Self::GELU_C * (x + Self::GELU_K * x * x * x)).tanh();
                let dt = Self::GELU_C * (1.0 + 3.0 * Self::GELU_K * x * x);
                0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * dt
            }
        }
    }
}

/// Overwrites the output with dense row-major host contents.
#[derive(Debug, Clone, TensorOp)]
#[tensor_op(crate = "crate", bound = "T: Float", name = "write")]
pub struct WriteOp<T> {
    #[tensor_op]
    pub op: InnerOp<0, 1>,
    pub contents: Arc<[T]>,
}

/// `dst = 0`
#[derive(Debug, Clone, TensorOp)]
#[tensor_op(crate = "crate", bound = "T: Float", name = "clear")]
pub struct ClearOp<T> {
    #[tensor_op]
    pub op: InnerOp<0, 1>,
    pub phantom: PhantomData<T>,
}

/// `dst = value`
#[derive(Debug, Clone, TensorOp)]
#[tensor_op(crate = "crate", bound = "T: Float", name = "fill")]
pub struct FillOp<T> {
    #[tensor_op]
    pub op: InnerOp<0, 1>,
    pub value: f64,
    pub phantom: PhantomData<T>,
}

/// Fills the output with normal samples, deterministic in `seed`.
#[derive(Debug, Clone, TensorOp)]
#[tensor_op(crate = "crate", bound = "T: Float", name = "randn")]
pub struct RandnOp<T> {
    #[tensor_op]
    pub op: InnerOp<0, 1>,
    pub seed: u64,
    pub mean: f64,
    pub stddev: f64,
    pub phantom: PhantomData<T>,
}

/// `dst = src`
#[derive(Debug, Clone, TensorOp)]
#[tensor_op(crate = "crate", bound = "T: Float", name = "copy")]
pub struct CopyOp<T> {
    #[tensor_op]
    pub op: InnerOp<1, 1>,
    pub phantom: PhantomData<T>,
}

/// `dst = alpha * src + beta * dst`
#[derive(Debug, Clone, TensorOp)]
#[tensor_op(crate = "crate", bound = "T: Float", name = "add")]
pub struct AddOp<T> {
    #[tensor_op]
    pub op: InnerOp<1, 1>,
    pub alpha: f64,
    pub beta: f64,
    pub phantom: PhantomData<T>,
}

/// `dst = alpha * broadcast(src, axis) + beta * dst`, where `src` is `dst` without `axis`.
#[derive(Debug, Clone, TensorOp)]
#[tensor_op(crate = "crate", bound = "T: Float", name = "add_slice")]
pub struct AddSliceOp<T> {
    #[tensor_op]
    pub op: InnerOp<1, 1>,
    pub alpha: f64,
    pub beta: f64,
    pub axis: usize,
    pub phantom: PhantomData<T>,
}

/// `dst = alpha * sum(src, axis) + beta * dst`, where `dst` is `src` without `axis`.
#[derive(Debug, Clone, TensorOp)]
#[tensor_op(crate = "crate", bound = "T: Float", name = "sum_slice")]
pub struct SumSliceOp<T> {
    #[tensor_op]
    pub op: InnerOp<1, 1>,
    pub alpha: f64,
    pub beta: f64,
    pub axis: usize,
    pub phantom: PhantomData<T>,
}

/// `dst = alpha * broadcast(src) + beta * dst`, where `src` is a vector laid along `axis`.
#[derive(Debug, Clone, TensorOp)]
#[tensor_op(crate = "crate", bound = "T: Float", name = "add_fiber")]
pub struct AddFiberOp<T> {
    #[tensor_op]
    pub op: InnerOp<1, 1>,
    pub alpha: f64,
    pub beta: f64,
    pub axis: usize,
    pub phantom: PhantomData<T>,
}

/// `dst = alpha * sum(src, all but axis) + beta * dst`, where `dst` is a vector.
#[derive(Debug, Clone, TensorOp)]
#[tensor_op(crate = "crate", bound = "T: Float", name = "sum_fiber")]
pub struct SumFiberOp<T> {
    #[tensor_op]
    pub op: InnerOp<1, 1>,
    pub alpha: f64,
    pub beta: f64,
    pub axis: usize,
    pub phantom: PhantomData<T>,
}

/// `c = alpha * op(a) · op(b) + beta * c`, contracting `ndim` axes.
///
/// Without transposition the last `ndim` axes of `a` meet the first `ndim` axes of `b`;
/// [`TransOp::Trans`] takes the first axes of `a` or the last axes of `b` instead.
/// The axes of `c` are the free axes of `a` followed by the free axes of `b`.
#[derive(Debug, Clone, TensorOp)]
#[tensor_op(crate = "crate", bound = "T: Float", name = "contract")]
pub struct ContractOp<T> {
    #[tensor_op]
    pub op: InnerOp<2, 1>,
    pub alpha: f64,
    pub beta: f64,
    pub trans_a: TransOp,
    pub trans_b: TransOp,
    pub ndim: usize,
    pub phantom: PhantomData<T>,
}

/// `dst = convert(src) + beta * dst`, rounding once into the destination type.
#[derive(Debug, Clone, TensorOp)]
#[tensor_op(crate = "crate", bound = "S: Float, D: Float", name = "convert")]
pub struct ConvertOp<S, D> {
    #[tensor_op]
    pub op: InnerOp<1, 1>,
    pub beta: f64,
    pub phantom: PhantomData<(S, D)>,
}

/// `y = f(x)`
#[derive(Debug, Clone, TensorOp)]
#[tensor_op(crate = "crate", bound = "T: Float", name = "activation")]
pub struct ActivationOp<T> {
    #[tensor_op]
    pub op: InnerOp<1, 1>,
    pub func: Activation,
    pub phantom: PhantomData<T>,
}

/// `dx += f'(x) * dy`, inputs being `x` then `dy`.
#[derive(Debug, Clone, TensorOp)]
#[tensor_op(crate = "crate", bound = "T: Float", name = "activation_backward")]
pub struct ActivationBackwardOp<T> {
    #[tensor_op]
    pub op: InnerOp<2, 1>,
    pub func: Activation,
    pub phantom: PhantomData<T>,
}
