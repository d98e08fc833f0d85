//! Value/gradient pairs, layers and the models chaining them.

pub mod layer;
pub mod model;
pub mod moments;

pub use layer::{Layer, LayerOps, ParameterError, Side};
pub use model::{DeepRelu, Model, ModelConfig};
pub use moments::TensorMoments;
