use itertools::Itertools;

use super::{LayerOps, ParameterError};
use crate::{
    hal::frontend::{add_async, add_slice_async, copy_async, sum_slice_async},
    loom::{num::Float, runtime::Runtime, tag::NextTag},
    nn::moments::TensorMoments,
};

/// Broadcasts `y` along `axis` and adds it to `x`: `u = x + broadcast(y)`.
#[derive(Debug, Clone)]
pub struct AddSlice<R, T> {
    pub x: TensorMoments<R, T>,
    pub y: TensorMoments<R, T>,
    pub u: TensorMoments<R, T>,
    pub axis: usize,
    /// Whether the slice gradient is reduced across nodes.
    pub redux: bool,
}

impl<R: Runtime, T: Float> AddSlice<R, T> {
    /// Registers the output `u` like `x` and switches the gradient of `y` to accumulation.
    pub fn generate(
        x: &TensorMoments<R, T>,
        y: &TensorMoments<R, T>,
        axis: usize,
        redux: bool,
        next: NextTag,
    ) -> Result<(Self, NextTag), ParameterError> {
        let rank = x.ndim();
        if axis >= rank {
            return Err(ParameterError::Axis { axis, rank });
        }
        let remove = |shape: &[usize]| {
            shape
                .iter()
                .enumerate()
                .filter_map(|(index, &x)| (index != axis).then_some(x))
                .collect_vec()
        };
        let expected = remove(x.shape());
        if expected != y.shape() {
            let found = y.shape().to_vec();
            return Err(ParameterError::SliceShape { expected, found });
        }
        let expected = remove(x.basetile_shape());
        if expected != y.basetile_shape() {
            let found = y.basetile_shape().to_vec();
            return Err(ParameterError::SliceShape { expected, found });
        }

        let (u, next) = x.register_like(true, next);
        y.set_reduction_add();
        let layer = Self {
            x: x.clone(),
            y: y.clone(),
            u,
            axis,
            redux,
        };
        Ok((layer, next))
    }
}

impl<R: Runtime, T: Float> LayerOps<R, T> for AddSlice<R, T> {
    fn forward_async(&self) {
        copy_async(&self.x.value, &self.u.value);
        add_slice_async(1.0, &self.y.value, 1.0, &self.u.value, self.axis);
        self.x.value.hint_not_reused();
        self.y.value.hint_not_reused();
        self.u.value.hint_not_reused();
    }

    fn backward_async(&self) {
        let Some(du) = &self.u.grad else { return };
        if let Some(dx) = self.x.required_grad() {
            add_async(1.0, du, 1.0, dx);
            dx.hint_not_reused();
        }
        if let Some(dy) = self.y.required_grad() {
            sum_slice_async(1.0, du, 1.0, dy, self.axis, self.redux);
            dy.hint_not_reused();
        }
        du.hint_not_reused();
    }

    fn parameters(&self) -> Vec<&TensorMoments<R, T>> {
        vec![]
    }

    fn activations_input(&self) -> Vec<&TensorMoments<R, T>> {
        vec![&self.x, &self.y]
    }

    fn activations_output(&self) -> Vec<&TensorMoments<R, T>> {
        vec![&self.u]
    }

    fn unregister(&self) {
        self.u.unregister();
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::AddSlice;
    use crate::{
        loom::{
            placement::PlacementPolicy,
            runtime::{self, CpuBuilder},
            tag::NextTag,
            tensor::Reduction,
        },
        nn::{
            layer::{LayerOps, ParameterError},
            moments::TensorMoments,
        },
    };

    #[tokio::test]
    async fn test_generate() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().add_default_ops().build().await;
        let policy = PlacementPolicy::default();
        let next = NextTag::default();
        let (x, next) =
            TensorMoments::<_, f32>::generate(cpu.clone(), [4, 3, 2], [2, 2, 2], &policy, true, next)?;
        let (y, next) =
            TensorMoments::<_, f32>::generate(cpu.clone(), [4, 2], [2, 2], &policy, true, next)?;

        assert!(matches!(
            AddSlice::generate(&x, &y, 3, false, next),
            Err(ParameterError::Axis { axis: 3, rank: 3 })
        ));
        assert!(matches!(
            AddSlice::generate(&x, &y, 0, false, next),
            Err(ParameterError::SliceShape { .. })
        ));
        let (t, next) =
            TensorMoments::<_, f32>::generate(cpu.clone(), [4, 2], [1, 2], &policy, true, next)?;
        assert!(matches!(
            AddSlice::generate(&x, &t, 1, false, next),
            Err(ParameterError::SliceShape { .. })
        ));
        assert_eq!(y.grad_reduction(), Reduction::Overwrite);

        let (layer, _) = AddSlice::generate(&x, &y, 1, false, next)?;
        assert_eq!(layer.u.shape(), x.shape());
        assert_eq!(layer.u.value.distribution(), x.value.distribution());
        assert!(layer.u.grad_required);
        assert_eq!(y.grad_reduction(), Reduction::Accumulate);
        assert!(layer.parameters().is_empty());
        assert_eq!(layer.activations_input().len(), 2);

        layer.unregister();
        runtime::wait_for_all(&cpu).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_forward_backward() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().add_default_ops().build().await;
        let policy = PlacementPolicy::RoundRobin { nodes: 2 };
        let next = NextTag::default();
        let (x, next) =
            TensorMoments::<_, f64>::generate(cpu.clone(), [2, 3], [1, 2], &policy, true, next)?;
        let (y, next) =
            TensorMoments::<_, f64>::generate(cpu.clone(), [2], [1], &policy, true, next)?;
        let (layer, _) = AddSlice::generate(&x, &y, 1, false, next)?;

        x.value.from_host(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?;
        y.value.from_host(vec![10.0, 20.0])?;
        layer.forward_async();
        assert_eq!(
            &layer.u.value.to_host().await?[..],
            &[11.0, 12.0, 13.0, 24.0, 25.0, 26.0]
        );

        let (dx, dy, du) = (
            x.grad.as_ref().ok_or("missing grad")?,
            y.grad.as_ref().ok_or("missing grad")?,
            layer.u.grad.as_ref().ok_or("missing grad")?,
        );
        x.clear_grad_async();
        y.clear_grad_async();
        du.from_host(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?;
        layer.backward_async();
        assert_eq!(&dx.to_host().await?[..], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(&dy.to_host().await?[..], &[6.0, 15.0]);

        layer.backward_async();
        assert_eq!(&dx.to_host().await?[..], &[2.0, 4.0, 6.0, 8.0, 10.0, 12.0]);
        assert_eq!(&dy.to_host().await?[..], &[12.0, 30.0]);
        runtime::wait_for_all(&cpu).await?;
        Ok(())
    }
}
