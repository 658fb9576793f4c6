//! Differentiable per-episode base learners.
//!
//! A head fits a classifier on the support embeddings of each episode and
//! scores the query embeddings with it. The fit is built from tensor ops
//! only, so the query loss back-propagates through it into the embedding.

use candle_core::{Tensor, D};
use candle_nn::{Init, VarBuilder};

use crate::config::{EmbeddingSettings, HeadKind, SolverSettings};
use crate::embedding::BoundedScalar;
use crate::error::{MetaOptError, Result};
use crate::linalg::{
    add_diagonal, cross_kernel, gram, one_hot, pairwise_sq_dist, spd_solve, transpose_last,
};

/// Fitting rule of a head.
enum BaseLearner {
    ProtoNet {
        normalize: bool,
    },
    Ridge {
        lambda: f64,
        iterations: usize,
    },
    R2d2 {
        lambda: BoundedScalar,
        bias: Tensor,
        iterations: usize,
    },
    Svm {
        c: f64,
        steps: usize,
    },
}

/// Classification head with a learned logit scale.
pub struct ClassificationHead {
    kind: HeadKind,
    scale: Tensor,
    learner: BaseLearner,
}

impl ClassificationHead {
    /// Build the configured head, registering its variables in `vb`.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be created.
    pub fn build(
        kind: HeadKind,
        solver: &SolverSettings,
        embedding: &EmbeddingSettings,
        vb: &VarBuilder,
    ) -> Result<Self> {
        let scale = vb.get_with_hints((), "scale", Init::Const(1.0))?;
        let learner = match kind {
            HeadKind::ProtoNet => BaseLearner::ProtoNet {
                normalize: embedding.normalize,
            },
            HeadKind::Ridge => BaseLearner::Ridge {
                lambda: solver.ridge_lambda,
                iterations: solver.solver_iterations,
            },
            HeadKind::R2d2 => BaseLearner::R2d2 {
                lambda: BoundedScalar::new(
                    vb,
                    "lambda",
                    solver.ridge_lambda,
                    solver.lambda_min,
                    solver.lambda_max,
                )?,
                bias: vb.get_with_hints((), "bias", Init::Const(0.0))?,
                iterations: solver.solver_iterations,
            },
            HeadKind::Svm => BaseLearner::Svm {
                c: solver.svm_c,
                steps: solver.svm_iterations,
            },
        };
        Ok(Self {
            kind,
            scale,
            learner,
        })
    }

    /// Head variant.
    #[must_use]
    pub fn kind(&self) -> HeadKind {
        self.kind
    }

    /// Logits `[E, nQ, way]` for query `[E, nQ, d]` given support `[E, nS, d]`
    /// with labels `[E, nS]` in `[0, way)`. Each episode is solved on its own.
    ///
    /// Takes no [`Mode`](crate::embedding::Mode): the head has no
    /// mode-dependent state, so training and evaluation share this path.
    ///
    /// # Errors
    ///
    /// Returns [`MetaOptError::Config`] for `way < 2` with a discriminative
    /// head and [`MetaOptError::ShapeMismatch`] for inconsistent inputs.
    pub fn forward(
        &self,
        query: &Tensor,
        support: &Tensor,
        support_labels: &Tensor,
        way: usize,
        shot: usize,
    ) -> Result<Tensor> {
        if way == 0 || (self.kind.is_discriminative() && way < 2) {
            return Err(MetaOptError::config(format!(
                "{:?} head cannot fit a {way}-way episode",
                self.kind
            )));
        }
        let (e, _, d) = query.dims3()?;
        let (e_s, n_s, d_s) = support.dims3()?;
        if e_s != e || d_s != d || n_s != way * shot {
            return Err(MetaOptError::shape_mismatch(
                format!("support [{e}, {}, {d}]", way * shot),
                format!("{:?}", support.dims()),
            ));
        }
        if support_labels.dims() != [e, n_s] {
            return Err(MetaOptError::shape_mismatch(
                format!("support labels [{e}, {n_s}]"),
                format!("{:?}", support_labels.dims()),
            ));
        }

        let targets = one_hot(support_labels, way, support)?;
        let logits = match &self.learner {
            BaseLearner::ProtoNet { normalize } => {
                protonet_logits(query, support, &targets, *normalize)?
            }
            BaseLearner::Ridge { lambda, iterations } => {
                let shift = Tensor::new(*lambda, support.device())?.to_dtype(support.dtype())?;
                ridge_logits(query, support, &targets, &shift, *iterations)?
            }
            BaseLearner::R2d2 {
                lambda,
                bias,
                iterations,
            } => ridge_logits(query, support, &targets, lambda.tensor(), *iterations)?
                .broadcast_add(bias)?,
            BaseLearner::Svm { c, steps } => svm_logits(query, support, &targets, *c, *steps)?,
        };
        Ok(logits.broadcast_mul(&self.scale)?)
    }

    /// Clamp bounded head parameters back into range.
    ///
    /// # Errors
    ///
    /// Returns an error if a parameter cannot be updated.
    pub fn clamp(&self) -> Result<()> {
        if let BaseLearner::R2d2 { lambda, .. } = &self.learner {
            lambda.clamp()?;
        }
        Ok(())
    }

    /// Learned ridge penalty of the R2D2 head.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be read back.
    pub fn learned_lambda(&self) -> Result<Option<f64>> {
        match &self.learner {
            BaseLearner::R2d2 { lambda, .. } => Ok(Some(lambda.value()?)),
            _ => Ok(None),
        }
    }
}

/// `−‖q − p_k‖²` against class-mean prototypes, divided by `d` when normalized.
fn protonet_logits(
    query: &Tensor,
    support: &Tensor,
    targets: &Tensor,
    normalize: bool,
) -> Result<Tensor> {
    let d = support.dim(D::Minus1)?;
    let per_class = transpose_last(targets)?;
    let counts = per_class.sum_keepdim(D::Minus1)?.maximum(1.0)?;
    let prototypes = per_class.matmul(support)?.broadcast_div(&counts)?;
    let logits = pairwise_sq_dist(query, &prototypes)?.neg()?;
    if normalize {
        return Ok((logits / d as f64)?);
    }
    Ok(logits)
}

/// Kernel ridge regression `(Q Sᵗ)(S Sᵗ + λ I)⁻¹ Y`.
fn ridge_logits(
    query: &Tensor,
    support: &Tensor,
    targets: &Tensor,
    lambda: &Tensor,
    iterations: usize,
) -> Result<Tensor> {
    let system = add_diagonal(&gram(support)?, lambda)?;
    let alpha = spd_solve(&system, targets, iterations)?;
    Ok(cross_kernel(query, support)?.matmul(&alpha)?)
}

/// Crammer-Singer SVM dual, relaxed through a softmax parameterisation.
///
/// `Z = C Y − C softmax(Θ)` keeps `Z ≤ C Y` with zero row sums. Θ follows
/// exponentiated-gradient steps on `½ tr(Zᵗ K Z) − tr(Zᵗ Y)`, with the step
/// normalised by a Gershgorin bound on the largest eigenvalue of `K`.
fn svm_logits(
    query: &Tensor,
    support: &Tensor,
    targets: &Tensor,
    c: f64,
    steps: usize,
) -> Result<Tensor> {
    let kernel = gram(support)?;
    let bound = kernel
        .detach()
        .abs()?
        .sum_keepdim(D::Minus1)?
        .max_keepdim(1)?
        .maximum(1e-6)?;
    let eta = (bound * c)?.recip()?;

    let cy = (targets * c)?;
    let mut theta = targets.zeros_like()?;
    let mut duals = (&cy - candle_nn::ops::softmax_last_dim(&theta)?.affine(c, 0.0)?)?;
    for _ in 0..steps {
        let grad = (kernel.matmul(&duals)? - targets)?;
        theta = (theta + grad.broadcast_mul(&eta)?)?;
        duals = (&cy - candle_nn::ops::softmax_last_dim(&theta)?.affine(c, 0.0)?)?;
    }
    Ok(cross_kernel(query, support)?.matmul(&duals)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Var};
    use candle_nn::VarMap;

    fn head(kind: HeadKind, varmap: &VarMap) -> ClassificationHead {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        ClassificationHead::build(
            kind,
            &SolverSettings::default(),
            &EmbeddingSettings::default(),
            &vb,
        )
        .unwrap()
    }

    /// Two episodes, 2-way 2-shot, classes along orthogonal axes.
    fn separable_episode() -> (Tensor, Tensor, Tensor, Tensor) {
        let dev = Device::Cpu;
        let support = Tensor::new(
            &[
                [[1.0f32, 0.1], [0.0, 1.0], [0.9, -0.1], [0.1, 0.8]],
                [[0.0f32, 1.0], [1.0, 0.0], [0.1, 1.1], [0.8, 0.2]],
            ],
            &dev,
        )
        .unwrap();
        let labels = Tensor::new(&[[0u32, 1, 0, 1], [0, 1, 0, 1]], &dev).unwrap();
        let query = Tensor::new(
            &[
                [[0.95f32, 0.0], [0.05, 0.9]],
                [[0.1f32, 0.9], [1.0, 0.1]],
            ],
            &dev,
        )
        .unwrap();
        let query_labels = Tensor::new(&[[0u32, 1], [0, 1]], &dev).unwrap();
        (query, support, labels, query_labels)
    }

    fn predictions(logits: &Tensor) -> Vec<Vec<u32>> {
        logits.argmax(D::Minus1).unwrap().to_vec2::<u32>().unwrap()
    }

    #[test]
    fn test_protonet_two_way_one_shot() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let embedding = EmbeddingSettings {
            normalize: false,
            ..EmbeddingSettings::default()
        };
        let head =
            ClassificationHead::build(HeadKind::ProtoNet, &SolverSettings::default(), &embedding, &vb)
                .unwrap();

        let support = Tensor::new(&[[[1.0f32, 0.0], [0.0, 1.0]]], &dev).unwrap();
        let labels = Tensor::new(&[[0u32, 1]], &dev).unwrap();
        let query = Tensor::new(&[[[0.9f32, 0.1]]], &dev).unwrap();
        let logits = head.forward(&query, &support, &labels, 2, 1).unwrap();
        let values = logits.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!((values[0] + 0.02).abs() < 1e-5);
        assert!((values[1] + 1.62).abs() < 1e-5);
    }

    #[test]
    fn test_protonet_normalize_divides_by_dim() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let head = head(HeadKind::ProtoNet, &varmap);
        let support = Tensor::new(&[[[1.0f32, 0.0], [0.0, 1.0]]], &dev).unwrap();
        let labels = Tensor::new(&[[0u32, 1]], &dev).unwrap();
        let query = Tensor::new(&[[[0.9f32, 0.1]]], &dev).unwrap();
        let logits = head.forward(&query, &support, &labels, 2, 1).unwrap();
        let values = logits.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!((values[0] + 0.01).abs() < 1e-5);
    }

    #[test]
    fn test_every_head_separates_linearly_separable_episodes() {
        let (query, support, labels, query_labels) = separable_episode();
        let expected = query_labels.to_vec2::<u32>().unwrap();
        for kind in [HeadKind::ProtoNet, HeadKind::Ridge, HeadKind::R2d2, HeadKind::Svm] {
            let varmap = VarMap::new();
            let head = head(kind, &varmap);
            let logits = head.forward(&query, &support, &labels, 2, 2).unwrap();
            assert_eq!(logits.dims(), &[2, 2, 2], "{kind:?}");
            assert_eq!(predictions(&logits), expected, "{kind:?}");
        }
    }

    #[test]
    fn test_way_one_rejected_for_discriminative_heads() {
        let dev = Device::Cpu;
        let support = Tensor::ones((1, 2, 3), DType::F32, &dev).unwrap();
        let labels = Tensor::zeros((1, 2), DType::U32, &dev).unwrap();
        let query = Tensor::ones((1, 1, 3), DType::F32, &dev).unwrap();
        for kind in [HeadKind::Ridge, HeadKind::R2d2, HeadKind::Svm] {
            let varmap = VarMap::new();
            let result = head(kind, &varmap).forward(&query, &support, &labels, 1, 2);
            assert!(matches!(result, Err(MetaOptError::Config(_))), "{kind:?}");
        }
        let varmap = VarMap::new();
        let logits = head(HeadKind::ProtoNet, &varmap)
            .forward(&query, &support, &labels, 1, 2)
            .unwrap();
        assert_eq!(logits.dims(), &[1, 1, 1]);
    }

    #[test]
    fn test_support_count_mismatch() {
        let (query, support, labels, _) = separable_episode();
        let varmap = VarMap::new();
        let result = head(HeadKind::Ridge, &varmap).forward(&query, &support, &labels, 2, 3);
        assert!(matches!(result, Err(MetaOptError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_gradient_flows_through_svm_solve() {
        let (query, support, labels, query_labels) = separable_episode();
        let support = Var::from_tensor(&support).unwrap();
        let varmap = VarMap::new();
        let head = head(HeadKind::Svm, &varmap);
        let logits = head
            .forward(&query, support.as_tensor(), &labels, 2, 2)
            .unwrap()
            .reshape(((), 2))
            .unwrap();
        // Rows of the dual sum to zero, so the summed logits carry no gradient.
        let loss = candle_nn::loss::cross_entropy(&logits, &query_labels.flatten_all().unwrap())
            .unwrap();
        let grads = loss.backward().unwrap();
        let g = grads.get(support.as_tensor()).unwrap();
        let total = g.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(total > 0.0);
    }

    #[test]
    fn test_r2d2_lambda_is_clamped() {
        let mut varmap = VarMap::new();
        let head = head(HeadKind::R2d2, &varmap);
        assert_eq!(head.learned_lambda().unwrap(), Some(50.0));
        varmap
            .set_one("lambda", Tensor::new(1e9f32, &Device::Cpu).unwrap())
            .unwrap();
        head.clamp().unwrap();
        let lambda = head.learned_lambda().unwrap().unwrap();
        assert!((lambda - 1e4).abs() < 1e-2);
    }
}
