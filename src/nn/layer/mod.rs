use std::{str::FromStr, sync::Arc};

use derive_more::From;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::moments::TensorMoments;
use crate::loom::{
    num::Float,
    placement::Placement,
    runtime::Runtime,
    tensor::{TensorError, TensorPlan},
    traits::{ShapeError, TensorTraits},
};

pub use act::Act;
pub use add_slice::AddSlice;
pub use linear::{Linear, LinearConfig, LinearPlan, ShadowPrecision};

pub mod act;
pub mod add_slice;
pub mod linear;

#[derive(Debug, Error)]
pub enum ParameterError {
    #[error("side must be either \"L\" or \"R\", found {0:?}")]
    Side(String),
    #[error("contraction rank must be positive")]
    ContractRank,
    #[error("contraction rank {ndim} exceeds input rank {rank}")]
    ContractExceeds { ndim: usize, rank: usize },
    #[error("bias is supported only for outputs of rank at most 2, found {0}")]
    BiasRank(usize),
    #[error("bias axis {axis} out of output rank {rank}")]
    BiasAxis { axis: usize, rank: usize },
    #[error("axis {axis} out of rank {rank}")]
    Axis { axis: usize, rank: usize },
    #[error("slice expected {expected:?}, found {found:?}")]
    SliceShape {
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("a model needs at least 2 linear layers, found {0}")]
    Depth(usize),
    #[error("layer {0} does not continue the activation chain")]
    Chain(usize),
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// Plans a buffer, reporting an invalid layout as [`ParameterError::Shape`].
pub(crate) fn plan(
    shape: impl Into<Vec<usize>>,
    basetile_shape: impl Into<Vec<usize>>,
    placement: &dyn Placement,
) -> Result<TensorPlan, ParameterError> {
    let traits = TensorTraits::describe(shape, basetile_shape)?;
    let distribution = placement.distribute(&traits);
    Ok(TensorPlan::from_parts(Arc::new(traits), distribution)?)
}

/// Which side of the weight the input sits on.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    /// `Y = op(X) · W`
    #[default]
    #[serde(rename = "L", alias = "left")]
    Left,
    /// `Y = W · op(X)`
    #[serde(rename = "R", alias = "right")]
    Right,
}

impl FromStr for Side {
    type Err = ParameterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "L" | "left" => Ok(Side::Left),
            "R" | "right" => Ok(Side::Right),
            _ => Err(ParameterError::Side(s.into())),
        }
    }
}

/// The protocol shared by all layers.
///
/// Both passes only submit work and return at once; `backward_async` must follow the matching
/// `forward_async` and the population of the output gradients.
pub trait LayerOps<R, T> {
    fn forward_async(&self);
    fn backward_async(&self);
    /// Trainable pairs, for optimizer integration.
    fn parameters(&self) -> Vec<&TensorMoments<R, T>>;
    fn activations_input(&self) -> Vec<&TensorMoments<R, T>>;
    fn activations_output(&self) -> Vec<&TensorMoments<R, T>>;
    /// Releases owned parameters, shadows and outputs. Inputs belong to their producer.
    fn unregister(&self);
}

#[derive(Debug, Clone, From)]
pub enum Layer<R, T> {
    Linear(Linear<R, T>),
    AddSlice(AddSlice<R, T>),
    Act(Act<R, T>),
}

impl<R: Runtime, T: Float> LayerOps<R, T> for Layer<R, T> {
    fn forward_async(&self) {
        match self {
            Layer::Linear(layer) => layer.forward_async(),
            Layer::AddSlice(layer) => layer.forward_async(),
            Layer::Act(layer) => layer.forward_async(),
        }
    }

    fn backward_async(&self) {
        match self {
            Layer::Linear(layer) => layer.backward_async(),
            Layer::AddSlice(layer) => layer.backward_async(),
            Layer::Act(layer) => layer.backward_async(),
        }
    }

    fn parameters(&self) -> Vec<&TensorMoments<R, T>> {
        match self {
            Layer::Linear(layer) => layer.parameters(),
            Layer::AddSlice(layer) => layer.parameters(),
            Layer::Act(layer) => layer.parameters(),
        }
    }

    fn activations_input(&self) -> Vec<&TensorMoments<R, T>> {
        match self {
            Layer::Linear(layer) => layer.activations_input(),
            Layer::AddSlice(layer) => layer.activations_input(),
            Layer::Act(layer) => layer.activations_input(),
        }
    }

    fn activations_output(&self) -> Vec<&TensorMoments<R, T>> {
        match self {
            Layer::Linear(layer) => layer.activations_output(),
            Layer::AddSlice(layer) => layer.activations_output(),
            Layer::Act(layer) => layer.activations_output(),
        }
    }

    fn unregister(&self) {
        match self {
            Layer::Linear(layer) => layer.unregister(),
            Layer::AddSlice(layer) => layer.unregister(),
            Layer::Act(layer) => layer.unregister(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ParameterError, Side};

    #[test]
    fn test_side() -> Result<(), Box<dyn std::error::Error>> {
        assert_eq!("L".parse::<Side>()?, Side::Left);
        assert_eq!("right".parse::<Side>()?, Side::Right);
        assert!(matches!("X".parse::<Side>(), Err(ParameterError::Side(s)) if s == "X"));
        assert_eq!(serde_json::from_str::<Side>(r#""R""#)?, Side::Right);
        Ok(())
    }
}
