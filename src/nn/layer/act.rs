use super::LayerOps;
use crate::{
    hal::{
        frontend::{activation_async, activation_backward_async},
        ops::Activation,
    },
    loom::{num::Float, runtime::Runtime, tag::NextTag},
    nn::moments::TensorMoments,
};

/// Elementwise activation `y = f(x)`.
#[derive(Debug, Clone)]
pub struct Act<R, T> {
    pub func: Activation,
    pub x: TensorMoments<R, T>,
    pub y: TensorMoments<R, T>,
}

impl<R: Runtime, T: Float> Act<R, T> {
    pub fn generate(x: &TensorMoments<R, T>, func: Activation, next: NextTag) -> (Self, NextTag) {
        let (y, next) = x.register_like(true, next);
        let x = x.clone();
        (Self { func, x, y }, next)
    }
}

impl<R: Runtime, T: Float> LayerOps<R, T> for Act<R, T> {
    fn forward_async(&self) {
        activation_async(self.func, &self.x.value, &self.y.value);
        self.x.value.hint_not_reused();
    }

    fn backward_async(&self) {
        let (Some(dx), Some(dy)) = (self.x.required_grad(), &self.y.grad) else {
            return;
        };
        activation_backward_async(self.func, &self.x.value, dy, dx);
        self.x.value.hint_not_reused();
        dy.hint_not_reused();
    }

    fn parameters(&self) -> Vec<&TensorMoments<R, T>> {
        vec![]
    }

    fn activations_input(&self) -> Vec<&TensorMoments<R, T>> {
        vec![&self.x]
    }

    fn activations_output(&self) -> Vec<&TensorMoments<R, T>> {
        vec![&self.y]
    }

    fn unregister(&self) {
        self.y.unregister();
    }
}
