use crate::{
    hal::frontend::clear_async,
    loom::{
        num::Float,
        placement::Placement,
        runtime::Runtime,
        tag::NextTag,
        tensor::{Reduction, Tensor, TensorError, TensorPlan},
    },
};

/// A value tensor together with its optional gradient.
///
/// The gradient, when present, is laid out and distributed exactly like the value, so that
/// combining the two never moves data between nodes.
#[derive(Debug, Clone)]
pub struct TensorMoments<R, T> {
    pub value: Tensor<R, T>,
    pub grad: Option<Tensor<R, T>>,
    pub grad_required: bool,
}

impl<R, T> PartialEq for TensorMoments<R, T> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value && self.grad == other.grad
    }
}

impl<R, T> Eq for TensorMoments<R, T> {}

impl<R: Runtime, T: Float> TensorMoments<R, T> {
    pub fn new(
        value: Tensor<R, T>,
        grad: Option<Tensor<R, T>>,
        grad_required: bool,
    ) -> Result<Self, TensorError> {
        match &grad {
            None if grad_required => return Err(TensorError::MissingGrad(value.tag())),
            Some(grad)
                if grad.traits() != value.traits()
                    || grad.distribution() != value.distribution() =>
            {
                let (value, grad) = (value.tag(), grad.tag());
                return Err(TensorError::GradLayout { value, grad });
            }
            _ => {}
        }
        Ok(Self {
            value,
            grad,
            grad_required,
        })
    }

    /// Registers a value and, if `grad` is set, a gradient of the same layout.
    pub fn register(
        runtime: R,
        plan: &TensorPlan,
        grad: bool,
        grad_required: bool,
        next: NextTag,
    ) -> (Self, NextTag) {
        let (value, next) = plan.register(runtime.clone(), next);
        let (grad, next) = match grad || grad_required {
            true => {
                let (grad, next) = plan.register(runtime, next);
                (Some(grad), next)
            }
            false => (None, next),
        };
        let moments = Self {
            value,
            grad,
            grad_required,
        };
        (moments, next)
    }

    /// Plans and registers a pair in one go.
    pub fn generate(
        runtime: R,
        shape: impl Into<Vec<usize>>,
        basetile_shape: impl Into<Vec<usize>>,
        placement: &dyn Placement,
        grad_required: bool,
        next: NextTag,
    ) -> Result<(Self, NextTag), TensorError> {
        let plan = TensorPlan::new(shape, basetile_shape, placement)?;
        Ok(Self::register(runtime, &plan, true, grad_required, next))
    }

    /// A fresh pair laid out and distributed like `self`, with a gradient.
    pub fn register_like(&self, grad_required: bool, next: NextTag) -> (Self, NextTag) {
        let plan = TensorPlan::like(&self.value);
        let runtime = self.value.runtime().clone();
        Self::register(runtime, &plan, true, grad_required, next)
    }

    #[inline]
    pub fn plan(&self) -> TensorPlan {
        TensorPlan::like(&self.value)
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }

    #[inline]
    pub fn basetile_shape(&self) -> &[usize] {
        self.value.basetile_shape()
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.value.ndim()
    }

    /// The gradient, if it should be computed.
    #[inline]
    pub fn required_grad(&self) -> Option<&Tensor<R, T>> {
        self.grad.as_ref().filter(|_| self.grad_required)
    }

    /// Reduction discipline of the gradient; [`Reduction::Overwrite`] without one.
    #[inline]
    pub fn grad_reduction(&self) -> Reduction {
        self.grad
            .as_ref()
            .map(|grad| grad.reduction())
            .unwrap_or_default()
    }

    /// Makes every write into the gradient accumulate. Idempotent.
    pub fn set_reduction_add(&self) {
        if let Some(grad) = &self.grad {
            if grad.reduction() != Reduction::Accumulate {
                grad.set_reduction(Reduction::Accumulate);
            }
        }
    }

    /// Zeroes the gradient.
    pub fn clear_grad_async(&self) {
        if let Some(grad) = &self.grad {
            clear_async(grad);
        }
    }

    /// Releases the value and the gradient.
    pub fn unregister(&self) {
        self.value.deregister();
        if let Some(grad) = &self.grad {
            grad.deregister();
        }
    }
}
