use itertools::Itertools;

use super::{check_same_shape, narrow, scale, shape_error, split_axis, widen, zip_apply};
use crate::{
    hal::ops::{AddFiberOp, AddOp, AddSliceOp, SumFiberOp, SumSliceOp},
    loom::{
        num::Float,
        ops::{TensorIr, TensorOp},
        runtime::{BackendOp, RuntimeError, cpu::Backend},
    },
};

/// Fails unless `slice` is `full` without `axis`.
fn check_slice(
    op: &dyn TensorOp,
    full: &[usize],
    slice: &[usize],
    axis: usize,
) -> Result<(), RuntimeError> {
    if axis >= full.len() {
        return Err(shape_error(op, format!("axis {axis} out of rank {}", full.len())));
    }
    let expected = full
        .iter()
        .enumerate()
        .filter_map(|(index, &x)| (index != axis).then_some(x))
        .collect_vec();
    match expected == slice {
        true => Ok(()),
        false => Err(shape_error(
            op,
            format!("slice {slice:?} of {full:?} along axis {axis}"),
        )),
    }
}

/// Fails unless `fiber` is a vector as long as `full` along `axis`.
fn check_fiber(
    op: &dyn TensorOp,
    full: &[usize],
    fiber: &[usize],
    axis: usize,
) -> Result<(), RuntimeError> {
    if axis >= full.len() {
        return Err(shape_error(op, format!("axis {axis} out of rank {}", full.len())));
    }
    match fiber == [full[axis]] {
        true => Ok(()),
        false => Err(shape_error(
            op,
            format!("fiber {fiber:?} of {full:?} along axis {axis}"),
        )),
    }
}

impl<T: Float> BackendOp<Backend> for AddOp<T> {
    fn execute(&self, backend: &mut Backend, io: Vec<TensorIr>) -> Result<(), RuntimeError> {
        check_same_shape(self, &io)?;
        let x = widen(backend.fetch::<T>(&io[0])?);
        let mut y = widen(backend.fetch::<T>(&io[1])?);

        let (alpha, beta) = (self.alpha, self.beta);
        zip_apply(&mut y, &x, |x, y| alpha * x + scale(beta, y));
        backend.store(&io[1], &narrow::<T>(y))
    }
}

impl<T: Float> BackendOp<Backend> for AddSliceOp<T> {
    fn execute(&self, backend: &mut Backend, io: Vec<TensorIr>) -> Result<(), RuntimeError> {
        check_slice(self, io[1].shape(), io[0].shape(), self.axis)?;
        let x = widen(backend.fetch::<T>(&io[0])?);
        let mut y = widen(backend.fetch::<T>(&io[1])?);

        let (outer, extent, inner) = split_axis(io[1].shape(), self.axis);
        for (i, j, k) in itertools::iproduct!(0..outer, 0..extent, 0..inner) {
            let y = &mut y[(i * extent + j) * inner + k];
            *y = self.alpha * x[i * inner + k] + scale(self.beta, *y);
        }
        backend.store(&io[1], &narrow::<T>(y))
    }
}

impl<T: Float> BackendOp<Backend> for SumSliceOp<T> {
    fn execute(&self, backend: &mut Backend, io: Vec<TensorIr>) -> Result<(), RuntimeError> {
        check_slice(self, io[0].shape(), io[1].shape(), self.axis)?;
        let x = widen(backend.fetch::<T>(&io[0])?);
        let mut y = widen(backend.fetch::<T>(&io[1])?);

        let (outer, extent, inner) = split_axis(io[0].shape(), self.axis);
        for (i, k) in itertools::iproduct!(0..outer, 0..inner) {
            let sum: f64 = (0..extent)
                .map(|j| x[(i * extent + j) * inner + k])
                .sum();
            let y = &mut y[i * inner + k];
            *y = self.alpha * sum + scale(self.beta, *y);
        }
        backend.store(&io[1], &narrow::<T>(y))
    }
}

impl<T: Float> BackendOp<Backend> for AddFiberOp<T> {
    fn execute(&self, backend: &mut Backend, io: Vec<TensorIr>) -> Result<(), RuntimeError> {
        check_fiber(self, io[1].shape(), io[0].shape(), self.axis)?;
        let x = widen(backend.fetch::<T>(&io[0])?);
        let mut y = widen(backend.fetch::<T>(&io[1])?);

        let (outer, extent, inner) = split_axis(io[1].shape(), self.axis);
        for (i, j, k) in itertools::iproduct!(0..outer, 0..extent, 0..inner) {
            let y = &mut y[(i * extent + j) * inner + k];
            *y = self.alpha * x[j] + scale(self.beta, *y);
        }
        backend.store(&io[1], &narrow::<T>(y))
    }
}

impl<T: Float> BackendOp<Backend> for SumFiberOp<T> {
    fn execute(&self, backend: &mut Backend, io: Vec<TensorIr>) -> Result<(), RuntimeError> {
        check_fiber(self, io[0].shape(), io[1].shape(), self.axis)?;
        let x = widen(backend.fetch::<T>(&io[0])?);
        let mut y = widen(backend.fetch::<T>(&io[1])?);

        let (outer, extent, inner) = split_axis(io[0].shape(), self.axis);
        for (j, y) in y.iter_mut().enumerate() {
            let sum: f64 = itertools::iproduct!(0..outer, 0..inner)
                .map(|(i, k)| x[(i * extent + j) * inner + k])
                .sum();
            *y = self.alpha * sum + scale(self.beta, *y);
        }
        backend.store(&io[1], &narrow::<T>(y))
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use half::f16;
    use itertools::Itertools;

    use crate::{
        hal::frontend::{
            add_async, add_fiber_async, add_slice_async, sum_fiber_async, sum_slice_async,
        },
        loom::{
            placement::PlacementPolicy,
            runtime::{self, CpuBuilder, RuntimeError},
            tag::NextTag,
            tensor::TensorPlan,
        },
    };

    #[tokio::test]
    async fn test_add() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().add_default_ops().build().await;
        let plan = TensorPlan::new([4, 3], [3, 2], &PlacementPolicy::default())?;
        let next = NextTag::default();
        let (a, next) = plan.register::<_, f16>(cpu.clone(), next);
        let (b, _) = plan.register::<_, f16>(cpu.clone(), next);

        let data = (0..12).map(|x| f16::from_f32(x as f32)).collect_vec();
        a.from_host(data.clone())?;
        b.from_host(data.clone())?;
        add_async(2.0, &a, 1.0, &b);
        add_async(1.0, &a, 1.0, &b);

        let r#ref = data.iter().map(|x| x + x + x + x).collect_vec();
        assert_eq!(&b.to_host().await?[..], &r#ref[..]);
        Ok(())
    }

    #[tokio::test]
    async fn test_slice() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().add_default_ops().build().await;
        let next = NextTag::default();
        let policy = PlacementPolicy::default();
        let (u, next) = TensorPlan::new([2, 3, 2], [1, 2, 2], &policy)?
            .register::<_, f64>(cpu.clone(), next);
        let (y, next) = TensorPlan::new([2, 2], [1, 1], &policy)?
            .register::<_, f64>(cpu.clone(), next);
        let (s, _) = TensorPlan::new([2, 2], [2, 2], &policy)?
            .register::<_, f64>(cpu.clone(), next);

        u.from_host(vec![1.0; 12])?;
        y.from_host(vec![1.0, 2.0, 3.0, 4.0])?;
        add_slice_async(1.0, &y, 2.0, &u, 1);
        #[rustfmt::skip]
        assert_eq!(&u.to_host().await?[..], &[
            3.0, 4.0, 3.0, 4.0, 3.0, 4.0,
            5.0, 6.0, 5.0, 6.0, 5.0, 6.0,
        ]);

        s.from_host(vec![1.0; 4])?;
        sum_slice_async(0.5, &u, 1.0, &s, 1, false);
        assert_eq!(&s.to_host().await?[..], &[5.5, 7.0, 8.5, 10.0]);

        // wrong axis
        sum_slice_async(1.0, &u, 1.0, &s, 0, false);
        assert!(matches!(
            runtime::wait_for_all(&cpu).await,
            Err(RuntimeError::Shape { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_fiber() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().add_default_ops().build().await;
        let next = NextTag::default();
        let policy = PlacementPolicy::default();
        let (y, next) = TensorPlan::new([2, 3], [2, 2], &policy)?
            .register::<_, f32>(cpu.clone(), next);
        let (b, _) = TensorPlan::new([3], [2], &policy)?.register::<_, f32>(cpu.clone(), next);

        y.from_host(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0])?;
        b.from_host(vec![10.0, 20.0, 30.0])?;
        add_fiber_async(1.0, &b, 1.0, &y, 1);
        assert_eq!(
            &y.to_host().await?[..],
            &[10.0, 21.0, 32.0, 13.0, 24.0, 35.0]
        );

        sum_fiber_async(1.0, &y, 0.0, &b, 1, false);
        assert_eq!(&b.to_host().await?[..], &[23.0, 45.0, 67.0]);
        runtime::wait_for_all(&cpu).await?;
        Ok(())
    }
}
