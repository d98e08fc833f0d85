use super::{check_same_shape, scale};
use crate::{
    hal::ops::ConvertOp,
    loom::{
        num::Float,
        ops::TensorIr,
        runtime::{BackendOp, RuntimeError, cpu::Backend},
    },
};

impl<S: Float, D: Float> BackendOp<Backend> for ConvertOp<S, D> {
    fn execute(&self, backend: &mut Backend, io: Vec<TensorIr>) -> Result<(), RuntimeError> {
        check_same_shape(self, &io)?;
        let x = backend.fetch::<S>(&io[0])?;
        let y = match self.beta == 0.0 {
            true => vec![D::zero(); x.len()],
            false => backend.fetch::<D>(&io[1])?,
        };
        let output: Vec<D> = x
            .into_iter()
            .zip(y)
            .map(|(x, y)| D::from_f64(x.to_f64() + scale(self.beta, y.to_f64())))
            .collect();
        backend.store(&io[1], &output)
    }
}
