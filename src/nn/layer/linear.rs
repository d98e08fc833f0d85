use half::{bf16, f16};
use serde::{Deserialize, Serialize};

use super::{LayerOps, ParameterError, Side, plan};
use crate::{
    hal::{
        frontend::{
            add_fiber_async, clear_async, contract_async, convert_async, randn_async,
            sum_fiber_async,
        },
        ops::TransOp,
    },
    loom::{
        num::Float,
        placement::PlacementPolicy,
        runtime::Runtime,
        tag::NextTag,
        tensor::{Tensor, TensorPlan},
    },
    nn::moments::TensorMoments,
};

/// Narrow type the contractions of a [`Linear`] layer may run in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShadowPrecision {
    #[serde(rename = "f16")]
    F16,
    #[serde(rename = "bf16")]
    BF16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearConfig {
    pub side: Side,
    /// Whether the input enters the contraction transposed.
    pub trans_x: TransOp,
    /// Number of contracted axes.
    pub ndim: usize,
    /// Axes the weight contributes to the output.
    pub add_shape: Vec<usize>,
    pub add_basetile_shape: Vec<usize>,
    /// Output axis a bias vector is broadcast along, if any.
    pub bias_axis: Option<usize>,
    pub shadow: Option<ShadowPrecision>,
    pub placement: PlacementPolicy,
}

impl Default for LinearConfig {
    fn default() -> Self {
        Self {
            side: Side::Left,
            trans_x: TransOp::NoTrans,
            ndim: 1,
            add_shape: vec![],
            add_basetile_shape: vec![],
            bias_axis: None,
            shadow: None,
            placement: PlacementPolicy::default(),
        }
    }
}

/// Low-precision copies of the input, weight and output of a layer.
#[derive(Debug, Clone)]
pub struct ShadowPairs<R, S> {
    pub x: TensorMoments<R, S>,
    pub w: TensorMoments<R, S>,
    pub y: TensorMoments<R, S>,
}

impl<R: Runtime, S: Float> ShadowPairs<R, S> {
    fn register(runtime: R, plans: [&TensorPlan; 3], next: NextTag) -> (Self, NextTag) {
        let [x, w, y] = plans;
        let (x, next) = TensorMoments::register(runtime.clone(), x, true, false, next);
        let (w, next) = TensorMoments::register(runtime.clone(), w, true, false, next);
        let (y, next) = TensorMoments::register(runtime, y, true, false, next);
        (Self { x, w, y }, next)
    }

    fn unregister(&self) {
        self.x.unregister();
        self.w.unregister();
        self.y.unregister();
    }
}

#[derive(Debug, Clone)]
pub enum Shadow<R> {
    F16(ShadowPairs<R, f16>),
    BF16(ShadowPairs<R, bf16>),
}

impl<R: Runtime> Shadow<R> {
    fn unregister(&self) {
        match self {
            Shadow::F16(pairs) => pairs.unregister(),
            Shadow::BF16(pairs) => pairs.unregister(),
        }
    }
}

/// A bias vector and the output axis it runs along.
#[derive(Debug, Clone)]
pub struct Bias<R, T> {
    pub moments: TensorMoments<R, T>,
    pub axis: usize,
}

/// Splits the input layout into the weight and output layouts.
///
/// Works for shapes and base tiles alike.
fn layout(
    side: Side,
    trans_x: TransOp,
    ndim: usize,
    x: &[usize],
    add: &[usize],
) -> (Vec<usize>, Vec<usize>) {
    let rank = x.len();
    let (contracted, free) = match (side, trans_x) {
        (Side::Left, TransOp::NoTrans) | (Side::Right, TransOp::Trans) => {
            (&x[rank - ndim..], &x[..rank - ndim])
        }
        (Side::Left, TransOp::Trans) | (Side::Right, TransOp::NoTrans) => {
            (&x[..ndim], &x[ndim..])
        }
    };
    match side {
        Side::Left => ([contracted, add].concat(), [free, add].concat()),
        Side::Right => ([add, contracted].concat(), [add, free].concat()),
    }
}

/// A linear layer: `Y = op(X) · W` or `Y = W · op(X)`, contracting `ndim` axes.
#[derive(Debug, Clone)]
pub struct Linear<R, T> {
    pub side: Side,
    pub trans_x: TransOp,
    pub ndim: usize,
    pub x: TensorMoments<R, T>,
    pub w: TensorMoments<R, T>,
    pub bias: Option<Bias<R, T>>,
    pub y: TensorMoments<R, T>,
    pub shadow: Option<Shadow<R>>,
    fan_in: usize,
}

/// The validated layouts of a [`Linear`] layer over an input of a given layout.
///
/// Planning registers nothing, so a whole stack of layers can be checked before its first
/// registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearPlan {
    side: Side,
    trans_x: TransOp,
    ndim: usize,
    shadow: Option<ShadowPrecision>,
    x: TensorPlan,
    w: TensorPlan,
    bias: Option<(TensorPlan, usize)>,
    y: TensorPlan,
    fan_in: usize,
}

impl LinearPlan {
    pub fn new(x: &TensorPlan, config: &LinearConfig) -> Result<Self, ParameterError> {
        let ndim = config.ndim;
        let rank = x.shape().len();
        if ndim == 0 {
            return Err(ParameterError::ContractRank);
        }
        if ndim > rank {
            return Err(ParameterError::ContractExceeds { ndim, rank });
        }

        let (side, trans_x) = (config.side, config.trans_x);
        let (w_shape, y_shape) = layout(side, trans_x, ndim, x.shape(), &config.add_shape);
        let (w_tile, y_tile) = layout(
            side,
            trans_x,
            ndim,
            x.basetile_shape(),
            &config.add_basetile_shape,
        );
        let contracted = match side {
            Side::Left => &w_shape[..ndim],
            Side::Right => &w_shape[w_shape.len() - ndim..],
        };
        let fan_in = contracted.iter().product();

        let placement = &config.placement;
        let bias = match config.bias_axis {
            Some(axis) => {
                let rank = y_shape.len();
                if rank > 2 {
                    return Err(ParameterError::BiasRank(rank));
                }
                if axis >= rank {
                    return Err(ParameterError::BiasAxis { axis, rank });
                }
                Some((plan([y_shape[axis]], [y_tile[axis]], placement)?, axis))
            }
            None => None,
        };
        let w = plan(w_shape, w_tile, placement)?;
        let y = plan(y_shape, y_tile, placement)?;

        Ok(Self {
            side,
            trans_x,
            ndim,
            shadow: config.shadow,
            x: x.clone(),
            w,
            bias,
            y,
            fan_in,
        })
    }

    /// Layout of the output, which the next layer plans against.
    #[inline]
    pub fn output(&self) -> &TensorPlan {
        &self.y
    }
}

impl<R: Runtime, T: Float> Linear<R, T> {
    /// Builds a layer consuming `x`.
    ///
    /// Registers the weight, the bias, the output and the shadows, in this order, all with
    /// gradients. Nothing is registered if the configuration is rejected.
    pub fn generate(
        x: &TensorMoments<R, T>,
        config: &LinearConfig,
        next: NextTag,
    ) -> Result<(Self, NextTag), ParameterError> {
        let plan = LinearPlan::new(&x.plan(), config)?;
        Ok(Self::register(x, &plan, next))
    }

    /// Registers a planned layer. `x` must be laid out like the input of `plan`.
    pub fn register(x: &TensorMoments<R, T>, plan: &LinearPlan, next: NextTag) -> (Self, NextTag) {
        debug_assert_eq!(x.plan(), plan.x);
        let runtime = x.value.runtime().clone();
        let (w, next) = TensorMoments::register(runtime.clone(), &plan.w, true, true, next);
        let (bias, next) = match &plan.bias {
            Some((bias, axis)) => {
                let (moments, next) =
                    TensorMoments::register(runtime.clone(), bias, true, true, next);
                moments.set_reduction_add();
                let axis = *axis;
                (Some(Bias { moments, axis }), next)
            }
            None => (None, next),
        };
        let (y, next) = TensorMoments::register(runtime.clone(), &plan.y, true, true, next);

        let plans = [&plan.x, &plan.w, &plan.y];
        let (shadow, next) = match plan.shadow {
            Some(ShadowPrecision::F16) => {
                let (pairs, next) = ShadowPairs::register(runtime, plans, next);
                (Some(Shadow::F16(pairs)), next)
            }
            Some(ShadowPrecision::BF16) => {
                let (pairs, next) = ShadowPairs::register(runtime, plans, next);
                (Some(Shadow::BF16(pairs)), next)
            }
            None => (None, next),
        };

        let layer = Self {
            side: plan.side,
            trans_x: plan.trans_x,
            ndim: plan.ndim,
            x: x.clone(),
            w,
            bias,
            y,
            shadow,
            fan_in: plan.fan_in,
        };
        (layer, next)
    }

    /// Number of input elements each output element reads.
    #[inline]
    pub fn fan_in(&self) -> usize {
        self.fan_in
    }

    /// Draws the weight from a normal distribution and zeroes the bias.
    pub fn init_randn_async(&self, seed: u64, mean: f64, stddev: f64) {
        randn_async(seed, mean, stddev, &self.w.value);
        if let Some(bias) = &self.bias {
            clear_async(&bias.moments.value);
        }
    }

    fn contract_forward<S: Float>(&self, x: &Tensor<R, S>, w: &Tensor<R, S>, y: &Tensor<R, S>) {
        let ndim = self.ndim;
        match self.side {
            Side::Left => contract_async(1.0, self.trans_x, x, TransOp::NoTrans, w, 0.0, y, ndim),
            Side::Right => contract_async(1.0, TransOp::NoTrans, w, self.trans_x, x, 0.0, y, ndim),
        }
    }

    /// `dW = op(X)ᵀ · dY` or `dW = dY · op(X)ᵀ`, over the free axes of `X`.
    fn contract_weight_grad<S: Float>(
        &self,
        x: &Tensor<R, S>,
        dy: &Tensor<R, S>,
        dw: &Tensor<R, S>,
        beta: f64,
    ) {
        let ndim = x.ndim() - self.ndim;
        let trans = self.trans_x.flip();
        match self.side {
            Side::Left => contract_async(1.0, trans, x, TransOp::NoTrans, dy, beta, dw, ndim),
            Side::Right => contract_async(1.0, TransOp::NoTrans, dy, trans, x, beta, dw, ndim),
        }
    }

    /// Contracts `dY` with `W` over the axes the weight added.
    fn contract_input_grad<S: Float>(
        &self,
        w: &Tensor<R, S>,
        dy: &Tensor<R, S>,
        dx: &Tensor<R, S>,
        beta: f64,
    ) {
        let ndim = w.ndim() - self.ndim;
        let (n, t) = (TransOp::NoTrans, TransOp::Trans);
        match (self.side, self.trans_x) {
            (Side::Left, TransOp::NoTrans) => contract_async(1.0, n, dy, t, w, beta, dx, ndim),
            (Side::Left, TransOp::Trans) => contract_async(1.0, n, w, t, dy, beta, dx, ndim),
            (Side::Right, TransOp::NoTrans) => contract_async(1.0, t, w, n, dy, beta, dx, ndim),
            (Side::Right, TransOp::Trans) => contract_async(1.0, t, dy, n, w, beta, dx, ndim),
        }
    }

    fn shadow_forward<S: Float>(&self, pairs: &ShadowPairs<R, S>) {
        convert_async(&self.x.value, 0.0, &pairs.x.value);
        convert_async(&self.w.value, 0.0, &pairs.w.value);
        self.contract_forward(&pairs.x.value, &pairs.w.value, &pairs.y.value);
        convert_async(&pairs.y.value, 0.0, &self.y.value);
        pairs.w.value.hint_not_reused();
    }

    fn bias_backward(&self, dy: &Tensor<R, T>) {
        let Some(bias) = &self.bias else { return };
        if let Some(db) = bias.moments.required_grad() {
            sum_fiber_async(1.0, dy, 1.0, db, bias.axis, false);
            db.hint_not_reused();
        }
    }

    fn plain_backward(&self, dy: &Tensor<R, T>) {
        if let Some(dw) = self.w.required_grad() {
            self.contract_weight_grad(&self.x.value, dy, dw, 1.0);
            dw.hint_not_reused();
        }
        self.bias_backward(dy);
        if let Some(dx) = self.x.required_grad() {
            self.contract_input_grad(&self.w.value, dy, dx, 1.0);
            self.w.value.hint_not_reused();
        }
    }

    fn shadow_backward<S: Float>(&self, pairs: &ShadowPairs<R, S>, dy: &Tensor<R, T>) {
        let (Some(dx_s), Some(dw_s), Some(dy_s)) = (&pairs.x.grad, &pairs.w.grad, &pairs.y.grad)
        else {
            return;
        };
        convert_async(dy, 0.0, dy_s);
        if let Some(dw) = self.w.required_grad() {
            self.contract_weight_grad(&pairs.x.value, dy_s, dw_s, 0.0);
            convert_async(dw_s, 1.0, dw);
            dw.hint_not_reused();
        }
        self.bias_backward(dy);
        if let Some(dx) = self.x.required_grad() {
            self.contract_input_grad(&pairs.w.value, dy_s, dx_s, 0.0);
            convert_async(dx_s, 1.0, dx);
            self.w.value.hint_not_reused();
        }
    }
}

impl<R: Runtime, T: Float> LayerOps<R, T> for Linear<R, T> {
    fn forward_async(&self) {
        match &self.shadow {
            None => self.contract_forward(&self.x.value, &self.w.value, &self.y.value),
            Some(Shadow::F16(pairs)) => self.shadow_forward(pairs),
            Some(Shadow::BF16(pairs)) => self.shadow_forward(pairs),
        }
        if let Some(bias) = &self.bias {
            add_fiber_async(1.0, &bias.moments.value, 1.0, &self.y.value, bias.axis);
        }
        self.w.value.hint_not_reused();
    }

    fn backward_async(&self) {
        let Some(dy) = &self.y.grad else { return };
        match &self.shadow {
            None => self.plain_backward(dy),
            Some(Shadow::F16(pairs)) => self.shadow_backward(pairs, dy),
            Some(Shadow::BF16(pairs)) => self.shadow_backward(pairs, dy),
        }
    }

    fn parameters(&self) -> Vec<&TensorMoments<R, T>> {
        let bias = self.bias.iter().map(|bias| &bias.moments);
        std::iter::once(&self.w).chain(bias).collect()
    }

    fn activations_input(&self) -> Vec<&TensorMoments<R, T>> {
        vec![&self.x]
    }

    fn activations_output(&self) -> Vec<&TensorMoments<R, T>> {
        vec![&self.y]
    }

    fn unregister(&self) {
        self.w.unregister();
        if let Some(bias) = &self.bias {
            bias.moments.unregister();
        }
        self.y.unregister();
        if let Some(shadow) = &self.shadow {
            shadow.unregister();
        }
    }
}
