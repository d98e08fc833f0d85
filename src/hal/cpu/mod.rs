//! Host kernels of the reference runtime.
//!
//! Kernels gather whole tensors into dense row-major arrays, widen to `f64`, compute, and round
//! once on store. With the `rayon` feature, the heavy loops run in parallel.

use half::{bf16, f16};
use itertools::Itertools;

use super::ops::{
    ActivationBackwardOp, ActivationOp, AddFiberOp, AddOp, AddSliceOp, ClearOp, ContractOp,
    ConvertOp, CopyOp, FillOp, RandnOp, SumFiberOp, SumSliceOp, WriteOp,
};
use crate::loom::{
    num::Float,
    ops::{TensorIr, TensorOp},
    runtime::{CpuBuilder, RuntimeError},
};

mod act;
mod add;
mod contract;
mod convert;
mod fill;

impl CpuBuilder {
    /// Registers every op of [`hal::ops`](super::ops) for all supported scalar types.
    pub fn add_default_ops(self) -> Self {
        self.add_float_ops::<f32>()
            .add_float_ops::<f64>()
            .add_float_ops::<f16>()
            .add_float_ops::<bf16>()
            .add_convert_ops::<f32>()
            .add_convert_ops::<f64>()
            .add_op::<ConvertOp<f32, f64>>()
            .add_op::<ConvertOp<f64, f32>>()
    }

    /// Registers the ops that compute within one scalar type.
    pub fn add_float_ops<T: Float>(self) -> Self {
        self.add_op::<WriteOp<T>>()
            .add_op::<ClearOp<T>>()
            .add_op::<FillOp<T>>()
            .add_op::<RandnOp<T>>()
            .add_op::<CopyOp<T>>()
            .add_op::<AddOp<T>>()
            .add_op::<AddSliceOp<T>>()
            .add_op::<SumSliceOp<T>>()
            .add_op::<AddFiberOp<T>>()
            .add_op::<SumFiberOp<T>>()
            .add_op::<ContractOp<T>>()
            .add_op::<ActivationOp<T>>()
            .add_op::<ActivationBackwardOp<T>>()
    }

    /// Registers conversions between a working type and both narrow types.
    pub fn add_convert_ops<T: Float>(self) -> Self {
        self.add_op::<ConvertOp<T, f16>>()
            .add_op::<ConvertOp<f16, T>>()
            .add_op::<ConvertOp<T, bf16>>()
            .add_op::<ConvertOp<bf16, T>>()
    }
}

pub(crate) fn shape_error(op: &dyn TensorOp, reason: impl Into<String>) -> RuntimeError {
    let op = op.name().into_owned();
    let reason = reason.into();
    RuntimeError::Shape { op, reason }
}

/// Fails unless all operands share one shape.
pub(crate) fn check_same_shape(op: &dyn TensorOp, io: &[TensorIr]) -> Result<(), RuntimeError> {
    match io.iter().map(|ir| ir.shape()).all_equal() {
        true => Ok(()),
        false => {
            let shapes = io.iter().map(|ir| format!("{:?}", ir.shape())).join(", ");
            Err(shape_error(op, format!("operand shapes differ: {shapes}")))
        }
    }
}

/// Splits `shape` around `axis` into `(outer, extent, inner)` element counts.
pub(crate) fn split_axis(shape: &[usize], axis: usize) -> (usize, usize, usize) {
    let outer = shape[..axis].iter().product();
    let inner = shape[axis + 1..].iter().product();
    (outer, shape[axis], inner)
}

/// `y = f(x, y)` elementwise.
pub(crate) fn zip_apply(y: &mut [f64], x: &[f64], f: impl Fn(f64, f64) -> f64 + Send + Sync) {
    #[cfg(not(feature = "rayon"))]
    y.iter_mut().zip_eq(x.iter()).for_each(|(y, &x)| *y = f(x, *y));
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;
        y.par_iter_mut()
            .zip_eq(x.par_iter())
            .for_each(|(y, &x)| *y = f(x, *y));
    }
}

#[inline]
pub(crate) fn widen<T: Float>(data: Vec<T>) -> Vec<f64> {
    data.into_iter().map(T::to_f64).collect()
}

#[inline]
pub(crate) fn narrow<T: Float>(data: Vec<f64>) -> Vec<T> {
    data.into_iter().map(T::from_f64).collect()
}

/// `beta * y`, reading nothing when `beta` is zero so that stale contents never leak through.
#[inline]
pub(crate) fn scale(beta: f64, y: f64) -> f64 {
    match beta == 0.0 {
        true => 0.0,
        false => beta * y,
    }
}

#[cfg(test)]
mod tests {
    use super::split_axis;

    #[test]
    fn test_split_axis() {
        assert_eq!(split_axis(&[2, 3, 4], 0), (1, 2, 12));
        assert_eq!(split_axis(&[2, 3, 4], 1), (2, 3, 4));
        assert_eq!(split_axis(&[2, 3, 4], 2), (6, 4, 1));
    }
}
