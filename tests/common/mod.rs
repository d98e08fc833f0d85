//! Dense `f64` references the tiled runtime is checked against.
#![allow(dead_code)]

use itertools::Itertools;
use tessel::{hal::ops::TransOp, loom::num::Float, nn::Side};

/// Uniform samples in `[-1, 1)`.
pub fn random(seed: u64, len: usize) -> Vec<f64> {
    let mut rng = fastrand::Rng::with_seed(seed);
    (0..len).map(|_| 2.0 * rng.f64() - 1.0).collect()
}

pub fn cast<T: Float>(data: &[f64]) -> Vec<T> {
    data.iter().map(|&x| T::from_f64(x)).collect()
}

pub fn widen<T: Float>(data: &[T]) -> Vec<f64> {
    data.iter().map(|&x| x.to_f64()).collect()
}

/// Rounds through `T`, so that references see exactly what the runtime sees.
pub fn round<T: Float>(data: &[f64]) -> Vec<f64> {
    widen(&cast::<T>(data))
}

pub fn dot(x: &[f64], y: &[f64]) -> f64 {
    x.iter().zip_eq(y).map(|(x, y)| x * y).sum()
}

/// `||found - expected|| / ||expected||`
pub fn relative_error(found: &[f64], expected: &[f64]) -> f64 {
    let diff = found
        .iter()
        .zip_eq(expected)
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt();
    let norm = expected.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm == 0.0 { diff } else { diff / norm }
}

#[track_caller]
pub fn assert_close(found: &[f64], expected: &[f64], tolerance: f64) {
    assert_eq!(found.len(), expected.len());
    let error = relative_error(found, expected);
    assert!(
        error <= tolerance,
        "relative error {error:e} exceeds {tolerance:e}"
    );
}

/// `(free, contracted)` element counts of a row-major operand.
fn dims(shape: &[usize], ndim: usize, contracted_last: bool) -> (usize, usize) {
    let at = match contracted_last {
        true => shape.len() - ndim,
        false => ndim,
    };
    let (head, tail) = shape.split_at(at);
    let (head, tail) = (head.iter().product(), tail.iter().product());
    match contracted_last {
        true => (head, tail),
        false => (tail, head),
    }
}

/// Naive contraction of `ndim` axes; the output is the free axes of `a` then of `b`.
pub fn contract(
    trans_a: TransOp,
    a: &[f64],
    a_shape: &[usize],
    trans_b: TransOp,
    b: &[f64],
    b_shape: &[usize],
    ndim: usize,
) -> Vec<f64> {
    let a_last = trans_a == TransOp::NoTrans;
    let b_last = trans_b == TransOp::Trans;
    let (m, k) = dims(a_shape, ndim, a_last);
    let (n, kb) = dims(b_shape, ndim, b_last);
    assert_eq!(k, kb);

    let mut c = vec![0.0; m * n];
    for (i, j) in itertools::iproduct!(0..m, 0..n) {
        for p in 0..k {
            let a = match a_last {
                true => a[i * k + p],
                false => a[p * m + i],
            };
            let b = match b_last {
                true => b[j * k + p],
                false => b[p * n + j],
            };
            c[i * n + j] += a * b;
        }
    }
    c
}

/// Reference linear layer without bias.
pub fn linear(
    side: Side,
    trans_x: TransOp,
    x: &[f64],
    x_shape: &[usize],
    w: &[f64],
    w_shape: &[usize],
    ndim: usize,
) -> Vec<f64> {
    match side {
        Side::Left => contract(trans_x, x, x_shape, TransOp::NoTrans, w, w_shape, ndim),
        Side::Right => contract(TransOp::NoTrans, w, w_shape, trans_x, x, x_shape, ndim),
    }
}

/// Gradient of `<dy, f(v)>` for a linear `f`, evaluating one basis vector at a time.
pub fn pullback(len: usize, dy: &[f64], f: impl Fn(&[f64]) -> Vec<f64>) -> Vec<f64> {
    let mut basis = vec![0.0; len];
    (0..len)
        .map(|index| {
            basis[index] = 1.0;
            let y = f(&basis);
            basis[index] = 0.0;
            dot(&y, dy)
        })
        .collect()
}

/// Sums `y` over every axis but `axis`.
pub fn sum_fiber(y: &[f64], shape: &[usize], axis: usize) -> Vec<f64> {
    let extent = shape[axis];
    let inner: usize = shape[axis + 1..].iter().product();
    let mut sum = vec![0.0; extent];
    for (index, y) in y.iter().enumerate() {
        sum[(index / inner) % extent] += y;
    }
    sum
}

/// Gradients of a relu perceptron `y = W_n(relu(... relu(x W_1)))` for rows of `x`.
pub struct Mlp {
    pub y: Vec<f64>,
    pub dx: Vec<f64>,
    pub dw: Vec<Vec<f64>>,
}

impl Mlp {
    /// `dims[i]` and `dims[i + 1]` are the extents of weight `i`.
    pub fn new(rows: usize, dims: &[usize], x: &[f64], weights: &[Vec<f64>], dy: &[f64]) -> Self {
        let n = weights.len();
        let shape = |i: usize| [rows, dims[i]];
        let w_shape = |i: usize| [dims[i], dims[i + 1]];
        let (notrans, trans) = (TransOp::NoTrans, TransOp::Trans);

        let mut inputs = vec![x.to_vec()];
        let mut pre = vec![];
        for (i, w) in weights.iter().enumerate() {
            let z = contract(notrans, &inputs[i], &shape(i), notrans, w, &w_shape(i), 1);
            if i + 1 < n {
                inputs.push(z.iter().map(|&z| z.max(0.0)).collect());
            }
            pre.push(z);
        }
        let y = pre[n - 1].clone();

        let mut grad = dy.to_vec();
        let mut dw = vec![vec![]; n];
        let mut dx = vec![];
        for i in (0..n).rev() {
            dw[i] = contract(trans, &inputs[i], &shape(i), notrans, &grad, &shape(i + 1), 1);
            let da = contract(notrans, &grad, &shape(i + 1), trans, &weights[i], &w_shape(i), 1);
            match i {
                0 => dx = da,
                _ => {
                    grad = da
                        .iter()
                        .zip_eq(&pre[i - 1])
                        .map(|(&da, &z)| if z > 0.0 { da } else { 0.0 })
                        .collect()
                }
            }
        }
        Self { y, dx, dw }
    }
}
