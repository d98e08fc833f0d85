use serde::{Deserialize, Serialize};

use super::{
    layer::{
        Act, Layer, LayerOps, Linear, LinearConfig, LinearPlan, ParameterError, ShadowPrecision,
        Side,
    },
    moments::TensorMoments,
};
use crate::{
    hal::ops::{Activation, TransOp},
    loom::{
        num::Float,
        placement::PlacementPolicy,
        runtime::{Runtime, RuntimeError},
        tag::NextTag,
    },
};

/// A linear chain of layers threaded by activation pairs.
///
/// `activations[0]` is the external input and `activations[i + 1]` the output of `layers[i]`.
#[derive(Debug, Clone)]
pub struct Model<R, T> {
    pub activations: Vec<TensorMoments<R, T>>,
    pub layers: Vec<Layer<R, T>>,
}

impl<R: Runtime, T: Float> Model<R, T> {
    pub fn new(
        activations: Vec<TensorMoments<R, T>>,
        layers: Vec<Layer<R, T>>,
    ) -> Result<Self, ParameterError> {
        if activations.len() != layers.len() + 1 {
            return Err(ParameterError::Chain(layers.len()));
        }
        for (index, layer) in layers.iter().enumerate() {
            let input = &activations[index];
            let output = &activations[index + 1];
            let inputs = layer.activations_input();
            if !inputs.contains(&input) || layer.activations_output() != [output] {
                return Err(ParameterError::Chain(index));
            }
        }
        Ok(Self {
            activations,
            layers,
        })
    }

    #[inline]
    pub fn input(&self) -> &TensorMoments<R, T> {
        &self.activations[0]
    }

    #[inline]
    pub fn output(&self) -> &TensorMoments<R, T> {
        &self.activations[self.activations.len() - 1]
    }

    pub fn forward_async(&self) {
        self.layers.iter().for_each(|layer| layer.forward_async());
    }

    pub fn backward_async(&self) {
        self.layers.iter().rev().for_each(|layer| layer.backward_async());
    }

    pub fn parameters(&self) -> Vec<&TensorMoments<R, T>> {
        self.layers.iter().flat_map(|layer| layer.parameters()).collect()
    }

    /// Zeroes the gradients of all parameters and activations.
    pub fn clear_gradients_async(&self) {
        self.parameters()
            .into_iter()
            .chain(&self.activations)
            .for_each(|moments| moments.clear_grad_async());
    }

    /// Reads every parameter gradient back, in [`Model::parameters`] order.
    pub async fn gradients(&self) -> Result<Vec<Box<[T]>>, RuntimeError> {
        let futures = self
            .parameters()
            .into_iter()
            .filter_map(|parameter| parameter.grad.as_ref())
            .map(|grad| grad.to_host());
        futures::future::try_join_all(futures).await
    }

    /// Draws every linear weight from `N(0, 2 / fan_in)` (Kaiming), one seed per layer.
    pub fn init_randn_async(&self, seed: u64) {
        let linears = self.layers.iter().filter_map(|layer| match layer {
            Layer::Linear(linear) => Some(linear),
            _ => None,
        });
        for (index, linear) in linears.enumerate() {
            let stddev = (2.0 / linear.fan_in() as f64).sqrt();
            linear.init_randn_async(seed.wrapping_add(index as u64), 0.0, stddev);
        }
    }

    /// Releases everything the layers own. The input pair stays registered.
    pub fn unregister(&self) {
        self.layers.iter().for_each(|layer| layer.unregister());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub side: Side,
    /// Contracted axes of the input in the first layer.
    pub ndim: usize,
    pub width: usize,
    pub width_tile: usize,
    /// Number of linear layers.
    pub depth: usize,
    /// Shape of the final projection. Defaults to the contracted axes of the input.
    pub output_shape: Option<Vec<usize>>,
    pub output_tile: Option<Vec<usize>>,
    pub activation: Activation,
    pub bias: bool,
    pub shadow: Option<ShadowPrecision>,
    pub placement: PlacementPolicy,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            side: Side::Left,
            ndim: 1,
            width: 1,
            width_tile: 1,
            depth: 2,
            output_shape: None,
            output_tile: None,
            activation: Activation::Relu,
            bias: false,
            shadow: None,
            placement: PlacementPolicy::default(),
        }
    }
}

/// A multilayer perceptron: linear layers interleaved with activations.
pub struct DeepRelu;

impl DeepRelu {
    /// Builds `depth` linear layers over `x` with an activation after all but the last.
    ///
    /// Every layer is planned before the first registration, so a rejected configuration
    /// registers nothing and leaves `next` unspent.
    pub fn generate<R: Runtime, T: Float>(
        x: &TensorMoments<R, T>,
        config: &ModelConfig,
        next: NextTag,
    ) -> Result<(Model<R, T>, NextTag), ParameterError> {
        let plans = Self::plan(x, config)?;
        let Some((last, hidden)) = plans.split_last() else {
            return Err(ParameterError::Depth(0));
        };

        let mut next = next;
        let mut layers: Vec<Layer<R, T>> = vec![];
        let mut input = x.clone();
        for plan in hidden {
            let (linear, advanced) = Linear::register(&input, plan, next);
            let (act, advanced) = Act::generate(&linear.y, config.activation, advanced);
            input = act.y.clone();
            next = advanced;
            layers.push(linear.into());
            layers.push(act.into());
        }
        let (linear, next) = Linear::register(&input, last, next);
        layers.push(linear.into());

        let outputs = layers
            .iter()
            .flat_map(|layer| layer.activations_output().into_iter().cloned())
            .collect::<Vec<_>>();
        let activations = std::iter::once(x.clone()).chain(outputs).collect();
        // chained by construction
        let model = Model {
            activations,
            layers,
        };
        Ok((model, next))
    }

    /// Plans the linear layers of the stack in order.
    pub fn plan<R: Runtime, T: Float>(
        x: &TensorMoments<R, T>,
        config: &ModelConfig,
    ) -> Result<Vec<LinearPlan>, ParameterError> {
        let (depth, ndim, rank) = (config.depth, config.ndim, x.ndim());
        if depth < 2 {
            return Err(ParameterError::Depth(depth));
        }
        if ndim == 0 {
            return Err(ParameterError::ContractRank);
        }
        if ndim > rank {
            return Err(ParameterError::ContractExceeds { ndim, rank });
        }

        let side = config.side;
        let (output_shape, output_tile) = match (&config.output_shape, side) {
            (Some(shape), _) => {
                let tile = config.output_tile.clone().unwrap_or_else(|| shape.clone());
                (shape.clone(), tile)
            }
            (None, Side::Left) => (
                x.shape()[rank - ndim..].to_vec(),
                x.basetile_shape()[rank - ndim..].to_vec(),
            ),
            (None, Side::Right) => (
                x.shape()[..ndim].to_vec(),
                x.basetile_shape()[..ndim].to_vec(),
            ),
        };
        let bias_axis = config.bias.then_some(match side {
            Side::Left => rank - ndim,
            Side::Right => 0,
        });
        let hidden = |ndim| LinearConfig {
            side,
            trans_x: TransOp::NoTrans,
            ndim,
            add_shape: vec![config.width],
            add_basetile_shape: vec![config.width_tile],
            bias_axis,
            shadow: config.shadow,
            placement: config.placement.clone(),
        };

        // activations keep the layout of the linear output they follow
        let mut input = x.plan();
        let mut plans = Vec::with_capacity(depth);
        for index in 0..depth - 1 {
            let ndim = if index == 0 { ndim } else { 1 };
            let plan = LinearPlan::new(&input, &hidden(ndim))?;
            input = plan.output().clone();
            plans.push(plan);
        }

        let config = LinearConfig {
            add_shape: output_shape,
            add_basetile_shape: output_tile,
            ..hidden(1)
        };
        plans.push(LinearPlan::new(&input, &config)?);
        Ok(plans)
    }
}
