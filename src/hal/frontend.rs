//! The `*_async` submission functions.
//!
//! Every function records one task on the runtime of its output tensor and returns immediately.
//! Nothing is validated here: shape mismatches surface as runtime failures at the next barrier.

use std::{marker::PhantomData, sync::Arc};

use tessel_derive::build_api;

use super::ops::{
    Activation, ActivationBackwardOp, ActivationOp, AddFiberOp, AddOp, AddSliceOp, ClearOp,
    ContractOp, ConvertOp, CopyOp, FillOp, RandnOp, SumFiberOp, SumSliceOp, TransOp, WriteOp,
};
use crate::loom::{
    num::Float,
    ops::{Access, InnerOp, TensorOp},
    runtime::{self, Runtime, RuntimeError, RuntimeEvent},
    tensor::{Tensor, TensorError, TensorUntyped},
};

build_api!(0);
build_api!(1);
build_api!(2);

/// Access mode of an output that is scaled by `beta` before being written.
#[inline]
fn output_access(beta: f64, redux: bool) -> Access {
    match (beta == 0.0, redux) {
        (true, _) => Access::WriteOnly,
        (false, true) => Access::Reduce,
        (false, false) => Access::ReadWrite,
    }
}

impl<R: Runtime, T: Float> Tensor<R, T> {
    /// Overwrites the tensor with a dense row-major host array.
    pub fn from_host(&self, contents: impl Into<Arc<[T]>>) -> Result<(), TensorError> {
        let contents: Arc<[T]> = contents.into();
        let expected = self.nelems();
        let found = contents.len();
        if expected != found {
            return Err(TensorError::Host { expected, found });
        }
        submit_api_0(
            move |op| WriteOp { op, contents },
            self,
            Access::WriteOnly,
        );
        Ok(())
    }

    /// Reads the tensor back as a dense row-major host array, once every earlier submission
    /// writing it has completed.
    pub async fn to_host(&self) -> Result<Box<[T]>, RuntimeError> {
        let data = runtime::read(self.runtime(), self.tag()).await?;
        let data: Vec<T> = bytemuck::pod_collect_to_vec(&data);
        Ok(data.into_boxed_slice())
    }
}

/// `dst = src`
pub fn copy_async<R: Runtime, T: Float>(src: &Tensor<R, T>, dst: &Tensor<R, T>) {
    let phantom = PhantomData::<T>;
    submit_api_1(
        move |op| CopyOp { op, phantom },
        dst,
        Access::WriteOnly,
        src,
    );
}

/// `dst = 0`
pub fn clear_async<R: Runtime, T: Float>(dst: &Tensor<R, T>) {
    let phantom = PhantomData::<T>;
    submit_api_0(move |op| ClearOp { op, phantom }, dst, Access::WriteOnly);
}

/// `dst = value`
pub fn fill_async<R: Runtime, T: Float>(value: f64, dst: &Tensor<R, T>) {
    let phantom = PhantomData::<T>;
    submit_api_0(
        move |op| FillOp { op, value, phantom },
        dst,
        Access::WriteOnly,
    );
}

/// Fills `dst` with samples of `N(mean, stddev²)`, reproducible for a given `seed`.
pub fn randn_async<R: Runtime, T: Float>(seed: u64, mean: f64, stddev: f64, dst: &Tensor<R, T>) {
    let phantom = PhantomData::<T>;
    submit_api_0(
        move |op| RandnOp {
            op,
            seed,
            mean,
            stddev,
            phantom,
        },
        dst,
        Access::WriteOnly,
    );
}

/// `dst = alpha * src + beta * dst`
pub fn add_async<R: Runtime, T: Float>(
    alpha: f64,
    src: &Tensor<R, T>,
    beta: f64,
    dst: &Tensor<R, T>,
) {
    let phantom = PhantomData::<T>;
    submit_api_1(
        move |op| AddOp {
            op,
            alpha,
            beta,
            phantom,
        },
        dst,
        output_access(beta, false),
        src,
    );
}

/// `dst = alpha * broadcast(src, axis) + beta * dst`
pub fn add_slice_async<R: Runtime, T: Float>(
    alpha: f64,
    src: &Tensor<R, T>,
    beta: f64,
    dst: &Tensor<R, T>,
    axis: usize,
) {
    let phantom = PhantomData::<T>;
    submit_api_1(
        move |op| AddSliceOp {
            op,
            alpha,
            beta,
            axis,
            phantom,
        },
        dst,
        output_access(beta, false),
        src,
    );
}

/// `dst = alpha * sum(src, axis) + beta * dst`
///
/// With `redux`, the write into `dst` is submitted as a reduction that commutes with other
/// accumulating writes into it.
pub fn sum_slice_async<R: Runtime, T: Float>(
    alpha: f64,
    src: &Tensor<R, T>,
    beta: f64,
    dst: &Tensor<R, T>,
    axis: usize,
    redux: bool,
) {
    let phantom = PhantomData::<T>;
    submit_api_1(
        move |op| SumSliceOp {
            op,
            alpha,
            beta,
            axis,
            phantom,
        },
        dst,
        output_access(beta, redux),
        src,
    );
}

/// `dst = alpha * broadcast(src) + beta * dst`, `src` being a vector along `axis` of `dst`.
pub fn add_fiber_async<R: Runtime, T: Float>(
    alpha: f64,
    src: &Tensor<R, T>,
    beta: f64,
    dst: &Tensor<R, T>,
    axis: usize,
) {
    let phantom = PhantomData::<T>;
    submit_api_1(
        move |op| AddFiberOp {
            op,
            alpha,
            beta,
            axis,
            phantom,
        },
        dst,
        output_access(beta, false),
        src,
    );
}

/// `dst = alpha * sum(src, all but axis) + beta * dst`
pub fn sum_fiber_async<R: Runtime, T: Float>(
    alpha: f64,
    src: &Tensor<R, T>,
    beta: f64,
    dst: &Tensor<R, T>,
    axis: usize,
    redux: bool,
) {
    let phantom = PhantomData::<T>;
    submit_api_1(
        move |op| SumFiberOp {
            op,
            alpha,
            beta,
            axis,
            phantom,
        },
        dst,
        output_access(beta, redux),
        src,
    );
}

/// `c = alpha * op(a) · op(b) + beta * c`, contracting `ndim` axes. See [`ContractOp`].
#[allow(clippy::too_many_arguments)]
pub fn contract_async<R: Runtime, T: Float>(
    alpha: f64,
    trans_a: TransOp,
    a: &Tensor<R, T>,
    trans_b: TransOp,
    b: &Tensor<R, T>,
    beta: f64,
    c: &Tensor<R, T>,
    ndim: usize,
) {
    let phantom = PhantomData::<T>;
    submit_api_2(
        move |op| ContractOp {
            op,
            alpha,
            beta,
            trans_a,
            trans_b,
            ndim,
            phantom,
        },
        c,
        output_access(beta, false),
        a,
        b,
    );
}

/// `dst = convert(src) + beta * dst`
pub fn convert_async<R: Runtime, S: Float, D: Float>(
    src: &Tensor<R, S>,
    beta: f64,
    dst: &Tensor<R, D>,
) {
    let phantom = PhantomData::<(S, D)>;
    submit_api_1(
        move |op| ConvertOp { op, beta, phantom },
        dst,
        output_access(beta, false),
        src,
    );
}

/// `y = f(x)`
pub fn activation_async<R: Runtime, T: Float>(
    func: Activation,
    x: &Tensor<R, T>,
    y: &Tensor<R, T>,
) {
    let phantom = PhantomData::<T>;
    submit_api_1(
        move |op| ActivationOp { op, func, phantom },
        y,
        Access::WriteOnly,
        x,
    );
}

/// `dx += f'(x) * dy`
pub fn activation_backward_async<R: Runtime, T: Float>(
    func: Activation,
    x: &Tensor<R, T>,
    dy: &Tensor<R, T>,
    dx: &Tensor<R, T>,
) {
    let phantom = PhantomData::<T>;
    submit_api_2(
        move |op| ActivationBackwardOp { op, func, phantom },
        dx,
        Access::ReadWrite,
        x,
        dy,
    );
}
