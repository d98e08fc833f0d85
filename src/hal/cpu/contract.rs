use itertools::Itertools;

use super::{narrow, scale, shape_error, widen};
use crate::{
    hal::ops::{ContractOp, TransOp},
    loom::{
        num::Float,
        ops::TensorIr,
        runtime::{BackendOp, RuntimeError, cpu::Backend},
    },
};

/// Splits the axes of a contraction operand into `(free, contracted)`.
///
/// The contracted axes sit at the end of the left operand and at the start of the right one
/// unless transposed.
fn split(shape: &[usize], ndim: usize, trans: TransOp, left: bool) -> (&[usize], &[usize]) {
    let at_end = matches!((left, trans), (true, TransOp::NoTrans) | (false, TransOp::Trans));
    match at_end {
        true => {
            let (free, contracted) = shape.split_at(shape.len() - ndim);
            (free, contracted)
        }
        false => {
            let (contracted, free) = shape.split_at(ndim);
            (free, contracted)
        }
    }
}

/// Packs an operand into a row-major `rows × k` matrix, rows being the free index.
fn pack(data: &[f64], rows: usize, k: usize, contracted_first: bool) -> Vec<f64> {
    match contracted_first {
        false => data.to_vec(),
        true => itertools::iproduct!(0..rows, 0..k)
            .map(|(row, col)| data[col * rows + row])
            .collect(),
    }
}

impl<T: Float> BackendOp<Backend> for ContractOp<T> {
    fn execute(&self, backend: &mut Backend, io: Vec<TensorIr>) -> Result<(), RuntimeError> {
        let ndim = self.ndim;
        let (a_shape, b_shape, c_shape) = (io[0].shape(), io[1].shape(), io[2].shape());
        if ndim > a_shape.len() || ndim > b_shape.len() {
            let reason = format!("cannot contract {ndim} axes of {a_shape:?} and {b_shape:?}");
            return Err(shape_error(self, reason));
        }

        let (a_free, a_contracted) = split(a_shape, ndim, self.trans_a, true);
        let (b_free, b_contracted) = split(b_shape, ndim, self.trans_b, false);
        if a_contracted != b_contracted {
            let reason = format!("contracted axes {a_contracted:?} and {b_contracted:?} differ");
            return Err(shape_error(self, reason));
        }
        let expected = a_free.iter().chain(b_free).copied().collect_vec();
        if expected != c_shape {
            let reason = format!("output {c_shape:?} mismatches expected {expected:?}");
            return Err(shape_error(self, reason));
        }

        let m: usize = a_free.iter().product();
        let n: usize = b_free.iter().product();
        let k: usize = a_contracted.iter().product();

        let a = widen(backend.fetch::<T>(&io[0])?);
        let b = widen(backend.fetch::<T>(&io[1])?);
        let mut c = widen(backend.fetch::<T>(&io[2])?);

        // both packed as free × contracted
        let a = pack(&a, m, k, matches!(self.trans_a, TransOp::Trans));
        let b = pack(&b, n, k, matches!(self.trans_b, TransOp::NoTrans));

        let (alpha, beta) = (self.alpha, self.beta);
        let row = |i: usize, c: &mut [f64]| {
            let a = &a[i * k..(i + 1) * k];
            for (j, c) in c.iter_mut().enumerate() {
                let b = &b[j * k..(j + 1) * k];
                let dot: f64 = a.iter().zip_eq(b).map(|(a, b)| a * b).sum();
                *c = alpha * dot + scale(beta, *c);
            }
        };

        #[cfg(not(feature = "rayon"))]
        c.chunks_mut(n).enumerate().for_each(|(i, c)| row(i, c));
        #[cfg(feature = "rayon")]
        {
            use rayon::prelude::*;
            c.par_chunks_mut(n).enumerate().for_each(|(i, c)| row(i, c));
        }

        backend.store(&io[2], &narrow::<T>(c))
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use half::f16;
    use itertools::Itertools;

    use super::split;
    use crate::{
        hal::{frontend::contract_async, ops::TransOp},
        loom::{
            placement::PlacementPolicy,
            runtime::{self, CpuBuilder, RuntimeError},
            tag::NextTag,
            tensor::{TensorError, TensorPlan},
        },
    };

    #[test]
    fn test_split() {
        let shape = [2, 3, 4, 5];
        assert_eq!(split(&shape, 1, TransOp::NoTrans, true), (&[2, 3, 4][..], &[5][..]));
        assert_eq!(split(&shape, 1, TransOp::Trans, true), (&[3, 4, 5][..], &[2][..]));
        assert_eq!(split(&shape, 2, TransOp::NoTrans, false), (&[4, 5][..], &[2, 3][..]));
        assert_eq!(split(&shape, 2, TransOp::Trans, false), (&[2, 3][..], &[4, 5][..]));
    }

    #[tokio::test]
    async fn test_matmul() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().add_default_ops().build().await;
        let policy = PlacementPolicy::default();
        // a: 2 × 3, b: 3 × 2, at: 3 × 2, bt: 2 × 3
        let mut next = NextTag::default();
        let mut register = |shape: [usize; 2], tile: [usize; 2]| {
            let plan = TensorPlan::new(shape, tile, &policy)?;
            let (tensor, advanced) = plan.register::<_, f32>(cpu.clone(), next);
            next = advanced;
            Ok::<_, TensorError>(tensor)
        };
        let a = register([2, 3], [1, 2])?;
        let at = register([3, 2], [2, 2])?;
        let b = register([3, 2], [3, 1])?;
        let bt = register([2, 3], [2, 3])?;
        let c = register([2, 2], [1, 1])?;

        a.from_host(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?;
        at.from_host(vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0])?;
        b.from_host(vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0])?;
        bt.from_host(vec![7.0, 9.0, 11.0, 8.0, 10.0, 12.0])?;
        let r#ref = [58.0, 64.0, 139.0, 154.0];

        use TransOp::{NoTrans as N, Trans as T};
        let cases = [(N, &a, N, &b), (T, &at, N, &b), (N, &a, T, &bt), (T, &at, T, &bt)];
        for (trans_a, a, trans_b, b) in cases {
            contract_async(1.0, trans_a, a, trans_b, b, 0.0, &c, 1);
            assert_eq!(&c.to_host().await?[..], &r#ref[..]);
        }

        // accumulate
        contract_async(2.0, N, &a, N, &b, 1.0, &c, 1);
        let thrice = r#ref.iter().map(|x| 3.0 * x).collect_vec();
        assert_eq!(&c.to_host().await?[..], &thrice[..]);
        runtime::wait_for_all(&cpu).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_contract_ranks() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().add_default_ops().build().await;
        let policy = PlacementPolicy::default();
        let next = NextTag::default();
        // a: [2, 2, 3], contract last two axes with b: [2, 3, 2]
        let (a, next) = TensorPlan::new([2, 2, 3], [1, 2, 2], &policy)?
            .register::<_, f16>(cpu.clone(), next);
        let (b, next) = TensorPlan::new([2, 3, 2], [2, 2, 1], &policy)?
            .register::<_, f16>(cpu.clone(), next);
        let (c, next) =
            TensorPlan::new([2, 2], [2, 2], &policy)?.register::<_, f16>(cpu.clone(), next);
        let (bad, _) =
            TensorPlan::new([3, 2], [3, 2], &policy)?.register::<_, f16>(cpu.clone(), next);

        let data = (0..12).map(|x| f16::from_f32(x as f32)).collect_vec();
        a.from_host(data.clone())?;
        b.from_host(data.clone())?;
        contract_async(1.0, TransOp::NoTrans, &a, TransOp::NoTrans, &b, 0.0, &c, 2);

        // c[i, j] = sum_p a[i, p] * b[p, j] over the flattened 6 contracted elements
        let r#ref = itertools::iproduct!(0..2, 0..2)
            .map(|(i, j)| (0..6).map(|p| ((i * 6 + p) * (p * 2 + j)) as f32).sum::<f32>())
            .map(f16::from_f32)
            .collect_vec();
        assert_eq!(&c.to_host().await?[..], &r#ref[..]);

        contract_async(1.0, TransOp::NoTrans, &a, TransOp::NoTrans, &b, 0.0, &bad, 2);
        assert!(matches!(
            runtime::wait_for_all(&cpu).await,
            Err(RuntimeError::Shape { .. })
        ));
        Ok(())
    }
}
