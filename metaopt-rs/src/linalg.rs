//! Differentiable batched linear algebra built from basic tensor ops.
//!
//! Candle has no native matrix inverse or linear solve, so inverses of the
//! symmetric positive definite systems that appear in the base learners are
//! computed with an unrolled Newton-Schulz iteration. Every step is a
//! matmul, so gradients flow through the solve like any other op.

use candle_core::{Result, Tensor, D};

/// Transpose the last two dimensions and make the result contiguous.
pub fn transpose_last(x: &Tensor) -> Result<Tensor> {
    let rank = x.rank();
    x.transpose(rank - 2, rank - 1)?.contiguous()
}

/// Batched Gram matrix `x xᵗ` for `x` of shape `[b, n, d]`.
pub fn gram(x: &Tensor) -> Result<Tensor> {
    x.matmul(&transpose_last(x)?)
}

/// Batched cross kernel `q sᵗ` for `q: [b, m, d]`, `s: [b, n, d]`.
pub fn cross_kernel(q: &Tensor, s: &Tensor) -> Result<Tensor> {
    q.matmul(&transpose_last(s)?)
}

/// Batched squared euclidean distances between rows of `q: [b, m, d]` and
/// rows of `p: [b, k, d]`, shape `[b, m, k]`.
pub fn pairwise_sq_dist(q: &Tensor, p: &Tensor) -> Result<Tensor> {
    let q_sq = q.sqr()?.sum_keepdim(D::Minus1)?; // [b, m, 1]
    let p_sq = transpose_last(&p.sqr()?.sum_keepdim(D::Minus1)?)?; // [b, 1, k]
    let cross = cross_kernel(q, p)?;
    q_sq.broadcast_add(&p_sq)?.broadcast_sub(&(cross * 2.0)?)
}

/// Identity matrices of shape `[b, n, n]` matching `like`'s dtype and device.
pub fn batched_eye(b: usize, n: usize, like: &Tensor) -> Result<Tensor> {
    Tensor::eye(n, like.dtype(), like.device())?
        .unsqueeze(0)?
        .broadcast_as((b, n, n))?
        .contiguous()
}

/// Add `shift · I` to each matrix of a batch `[b, n, n]`.
///
/// `shift` is either a scalar tensor or `[b, 1, 1]`; gradient flows into it.
pub fn add_diagonal(a: &Tensor, shift: &Tensor) -> Result<Tensor> {
    let (b, n, _) = a.dims3()?;
    let eye = batched_eye(b, n, a)?;
    a + eye.broadcast_mul(shift)?
}

/// Batched inverse of symmetric positive definite matrices `[b, n, n]`.
///
/// Starts from `X₀ = I / ‖A‖_F` so that the spectrum of `A X₀` lies in
/// `(0, 1]`, then iterates `X ← X (2I − A X)`. The residual `I − A X`
/// squares each step, so the iteration count needed grows with
/// `log₂(cond(A))`.
pub fn spd_inverse(a: &Tensor, iterations: usize) -> Result<Tensor> {
    let (b, n, m) = a.dims3()?;
    if n != m {
        candle_core::bail!("spd_inverse expects square matrices, got [{b}, {n}, {m}]");
    }
    let eye = batched_eye(b, n, a)?;
    let two_eye = (&eye * 2.0)?;

    let frob = a
        .detach()
        .sqr()?
        .sum_keepdim(2)?
        .sum_keepdim(1)?
        .sqrt()?;
    let mut x = eye.broadcast_div(&frob)?;
    for _ in 0..iterations {
        let ax = a.matmul(&x)?;
        x = x.matmul(&(&two_eye - ax)?)?;
    }
    Ok(x)
}

/// Solve `A X = B` for a batch of SPD systems.
pub fn spd_solve(a: &Tensor, rhs: &Tensor, iterations: usize) -> Result<Tensor> {
    spd_inverse(a, iterations)?.matmul(rhs)
}

/// Integer labels `[b, n]` to a one-hot float tensor `[b, n, depth]`.
pub fn one_hot(labels: &Tensor, depth: usize, like: &Tensor) -> Result<Tensor> {
    let classes = Tensor::arange(0u32, depth as u32, labels.device())?;
    labels
        .to_dtype(candle_core::DType::U32)?
        .unsqueeze(D::Minus1)?
        .broadcast_eq(&classes)?
        .to_dtype(like.dtype())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Var};

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_inverse_of_diagonal_batch() {
        let dev = Device::Cpu;
        let a = Tensor::new(
            &[
                [[2.0f32, 0.0], [0.0, 4.0]],
                [[10.0f32, 0.0], [0.0, 0.5]],
            ],
            &dev,
        )
        .unwrap();
        let inv = spd_inverse(&a, 30).unwrap();
        let expected = Tensor::new(
            &[[[0.5f32, 0.0], [0.0, 0.25]], [[0.1f32, 0.0], [0.0, 2.0]]],
            &dev,
        )
        .unwrap();
        assert!(max_abs_diff(&inv, &expected) < 1e-4);
    }

    #[test]
    fn test_inverse_of_ridge_system() {
        let dev = Device::Cpu;
        let x = Tensor::new(
            &[[[1.0f32, 2.0, 0.0], [0.0, 1.0, 1.0], [1.0, 0.0, 3.0]]],
            &dev,
        )
        .unwrap();
        let shift = Tensor::new(0.5f32, &dev).unwrap();
        let a = add_diagonal(&gram(&x).unwrap(), &shift).unwrap();
        let inv = spd_inverse(&a, 40).unwrap();
        let product = a.matmul(&inv).unwrap();
        let eye = batched_eye(1, 3, &a).unwrap();
        assert!(max_abs_diff(&product, &eye) < 1e-3);
    }

    #[test]
    fn test_gradient_flows_through_inverse() {
        let dev = Device::Cpu;
        let v = Var::new(&[[[3.0f32]]], &dev).unwrap();
        let inv = spd_inverse(v.as_tensor(), 30).unwrap();
        let grads = inv.sum_all().unwrap().backward().unwrap();
        // d(1/x)/dx = -1/x² = -1/9
        let g = grads.get(v.as_tensor()).unwrap();
        let g = g.flatten_all().unwrap().to_vec1::<f32>().unwrap()[0];
        assert!((g + 1.0 / 9.0).abs() < 1e-3);
    }

    #[test]
    fn test_pairwise_sq_dist() {
        let dev = Device::Cpu;
        let q = Tensor::new(&[[[0.9f32, 0.1]]], &dev).unwrap();
        let p = Tensor::new(&[[[1.0f32, 0.0], [0.0, 1.0]]], &dev).unwrap();
        let d = pairwise_sq_dist(&q, &p).unwrap();
        let d = d.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!((d[0] - 0.02).abs() < 1e-5);
        assert!((d[1] - 1.62).abs() < 1e-5);
    }

    #[test]
    fn test_one_hot() {
        let dev = Device::Cpu;
        let labels = Tensor::new(&[[0u32, 2, 1]], &dev).unwrap();
        let like = Tensor::zeros(1, DType::F32, &dev).unwrap();
        let oh = one_hot(&labels, 3, &like).unwrap();
        assert_eq!(oh.dims(), &[1, 3, 3]);
        assert_eq!(
            oh.squeeze(0).unwrap().to_vec2::<f32>().unwrap(),
            vec![
                vec![1.0, 0.0, 0.0],
                vec![0.0, 0.0, 1.0],
                vec![0.0, 1.0, 0.0]
            ]
        );
    }
}
