use rand::{SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, StandardNormal};

use super::{check_same_shape, shape_error};
use crate::{
    hal::ops::{ClearOp, CopyOp, FillOp, RandnOp, WriteOp},
    loom::{
        num::Float,
        ops::TensorIr,
        runtime::{BackendOp, RuntimeError, cpu::Backend},
    },
};

impl<T: Float> BackendOp<Backend> for WriteOp<T> {
    fn execute(&self, backend: &mut Backend, io: Vec<TensorIr>) -> Result<(), RuntimeError> {
        if self.contents.len() != io[0].nelems() {
            let reason = format!("{} elements for shape {:?}", self.contents.len(), io[0].shape());
            return Err(shape_error(self, reason));
        }
        backend.store(&io[0], &self.contents[..])
    }
}

impl<T: Float> BackendOp<Backend> for ClearOp<T> {
    fn execute(&self, backend: &mut Backend, io: Vec<TensorIr>) -> Result<(), RuntimeError> {
        let output = vec![T::zero(); io[0].nelems()];
        backend.store(&io[0], &output)
    }
}

impl<T: Float> BackendOp<Backend> for FillOp<T> {
    fn execute(&self, backend: &mut Backend, io: Vec<TensorIr>) -> Result<(), RuntimeError> {
        let output = vec![T::from_f64(self.value); io[0].nelems()];
        backend.store(&io[0], &output)
    }
}

impl<T: Float> BackendOp<Backend> for RandnOp<T> {
    fn execute(&self, backend: &mut Backend, io: Vec<TensorIr>) -> Result<(), RuntimeError> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let output: Vec<T> = StandardNormal
            .sample_iter(&mut rng)
            .take(io[0].nelems())
            .map(|z: f64| T::from_f64(self.mean + self.stddev * z))
            .collect();
        backend.store(&io[0], &output)
    }
}

impl<T: Float> BackendOp<Backend> for CopyOp<T> {
    fn execute(&self, backend: &mut Backend, io: Vec<TensorIr>) -> Result<(), RuntimeError> {
        check_same_shape(self, &io)?;
        let x = backend.fetch::<T>(&io[0])?;
        backend.store(&io[1], &x)
    }
}
