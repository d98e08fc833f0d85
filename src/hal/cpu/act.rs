use super::{check_same_shape, narrow, widen, zip_apply};
use crate::{
    hal::ops::{ActivationBackwardOp, ActivationOp},
    loom::{
        num::Float,
        ops::TensorIr,
        runtime::{BackendOp, RuntimeError, cpu::Backend},
    },
};

impl<T: Float> BackendOp<Backend> for ActivationOp<T> {
    fn execute(&self, backend: &mut Backend, io: Vec<TensorIr>) -> Result<(), RuntimeError> {
        check_same_shape(self, &io)?;
        let x = widen(backend.fetch::<T>(&io[0])?);
        let mut y = vec![0.0; x.len()];

        let func = self.func;
        zip_apply(&mut y, &x, |x, _| func.apply(x));
        backend.store(&io[1], &narrow::<T>(y))
    }
}

impl<T: Float> BackendOp<Backend> for ActivationBackwardOp<T> {
    fn execute(&self, backend: &mut Backend, io: Vec<TensorIr>) -> Result<(), RuntimeError> {
        check_same_shape(self, &io)?;
        let x = widen(backend.fetch::<T>(&io[0])?);
        let dy = widen(backend.fetch::<T>(&io[1])?);
        let mut dx = widen(backend.fetch::<T>(&io[2])?);

        let func = self.func;
        let mut grad = dy;
        zip_apply(&mut grad, &x, |x, dy| func.derivative(x) * dy);
        zip_apply(&mut dx, &grad, |grad, dx| dx + grad);
        backend.store(&io[2], &narrow::<T>(dx))
    }
}
