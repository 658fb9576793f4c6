//! Auxiliary basis and the refinement layer that consumes it.
//!
//! The basis is `Phi = Xᵗ X / m` where `X` is the detached embedding of a
//! fixed set of `m` reference centers. Phi is `[d, d]` and usually low rank
//! (`m ≪ d`), so the layer keeps it in factored form and evaluates
//!
//! ```text
//! f Phi (Phi + a I)⁻¹ = f Xᵗ (X Xᵗ + m a I)⁻¹ X
//! ```
//!
//! which only inverts an `[m, m]` matrix.

use std::path::Path;

use candle_core::{Device, Tensor, Var};
use candle_nn::{Init, VarBuilder};

use crate::config::ReferenceSpec;
use crate::error::{MetaOptError, Result};
use crate::linalg::{add_diagonal, gram, spd_inverse, transpose_last};

/// Learnable scalar parameter clamped into `[min, max]` after each step.
#[derive(Debug, Clone)]
pub struct BoundedScalar {
    var: Var,
    min: f64,
    max: f64,
}

impl BoundedScalar {
    /// Register a scalar named `name` in `vb`, initialised to `init`.
    ///
    /// # Errors
    ///
    /// Returns [`MetaOptError::Config`] if `min > max`.
    pub fn new(vb: &VarBuilder, name: &str, init: f64, min: f64, max: f64) -> Result<Self> {
        if min > max {
            return Err(MetaOptError::config(format!(
                "bounds of '{name}' are inverted: [{min}, {max}]"
            )));
        }
        let tensor = vb.get_with_hints((), name, Init::Const(init))?;
        let var = Var::from_tensor(&tensor)?;
        Ok(Self { var, min, max })
    }

    /// The parameter as a graph tensor (gradients flow into it).
    #[must_use]
    pub fn tensor(&self) -> &Tensor {
        self.var.as_tensor()
    }

    /// Current value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be read back.
    pub fn value(&self) -> Result<f64> {
        let v = self
            .var
            .as_tensor()
            .to_dtype(candle_core::DType::F64)?
            .to_scalar::<f64>()?;
        Ok(v)
    }

    /// Project the value back into its bounds.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameter cannot be updated.
    pub fn clamp(&self) -> Result<()> {
        let clamped = self.var.as_tensor().detach().clamp(self.min, self.max)?;
        self.var.set(&clamped)?;
        Ok(())
    }

    /// Lower and upper bound.
    #[must_use]
    pub fn bounds(&self) -> (f64, f64) {
        (self.min, self.max)
    }
}

/// Detached basis factor `X` for a centers embedding `[m, d]`.
///
/// # Errors
///
/// Returns [`MetaOptError::ShapeMismatch`] unless the input is 2-d with at
/// least one row.
pub fn basis_factor(centers_embedding: &Tensor) -> Result<Tensor> {
    let (m, _) = centers_embedding.dims2().map_err(|_| {
        MetaOptError::shape_mismatch("[num_centers, d]", format!("{:?}", centers_embedding.dims()))
    })?;
    if m == 0 {
        return Err(MetaOptError::shape_mismatch("at least one center", "0"));
    }
    Ok(centers_embedding.detach().contiguous()?)
}

/// `Xᵗ X / m` for a factor `X` of shape `[m, d]`.
///
/// # Errors
///
/// Returns an error if the factor is not 2-d.
pub fn basis_matrix(factor: &Tensor) -> Result<Tensor> {
    let (m, _) = factor.dims2()?;
    let phi = factor.t()?.matmul(factor)?;
    Ok((phi / m as f64)?)
}

/// `z = (1 − γ) f + γ f Phi (Phi + a I)⁻¹` over a refreshed basis.
pub struct BasisRefinement {
    a: BoundedScalar,
    gamma: f64,
    factor: Tensor,
    iterations: usize,
}

impl BasisRefinement {
    /// Create the layer with an initial basis factor `[m, d]`.
    ///
    /// `a` is registered as `a` in `vb` with initial value `a_init`.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid factor or bounds.
    pub fn new(
        vb: &VarBuilder,
        initial_factor: &Tensor,
        a_init: f64,
        a_bounds: (f64, f64),
        gamma: f64,
        iterations: usize,
    ) -> Result<Self> {
        Ok(Self {
            a: BoundedScalar::new(vb, "a", a_init, a_bounds.0, a_bounds.1)?,
            gamma,
            factor: basis_factor(initial_factor)?,
            iterations,
        })
    }

    /// Feature dimension the current basis expects.
    #[must_use]
    pub fn dim(&self) -> usize {
        self.factor.dims()[1]
    }

    /// Replace the basis with one computed from a new centers embedding.
    ///
    /// # Errors
    ///
    /// Returns [`MetaOptError::ShapeMismatch`] if the feature dimension changes.
    pub fn refresh(&mut self, centers_embedding: &Tensor) -> Result<()> {
        let factor = basis_factor(centers_embedding)?;
        if factor.dims()[1] != self.dim() {
            return Err(MetaOptError::shape_mismatch(
                format!("[_, {}]", self.dim()),
                format!("{:?}", factor.dims()),
            ));
        }
        self.factor = factor;
        Ok(())
    }

    /// Current basis Phi `[d, d]`.
    ///
    /// # Errors
    ///
    /// Returns an error if the matrix product fails.
    pub fn basis(&self) -> Result<Tensor> {
        basis_matrix(&self.factor)
    }

    /// Refinement regularizer.
    #[must_use]
    pub fn a(&self) -> &BoundedScalar {
        &self.a
    }

    /// Apply the layer to features `[n, d]`.
    ///
    /// # Errors
    ///
    /// Returns [`MetaOptError::ShapeMismatch`] when the feature dimension does
    /// not match the basis.
    pub fn forward(&self, features: &Tensor) -> Result<Tensor> {
        let (_, d) = features.dims2()?;
        if d != self.dim() {
            return Err(MetaOptError::shape_mismatch(
                format!("[n, {}]", self.dim()),
                format!("{:?}", features.dims()),
            ));
        }
        let m = self.factor.dims()[0];
        let x = self.factor.unsqueeze(0)?;
        let shift = self.a.tensor().affine(m as f64, 0.0)?;
        let system = add_diagonal(&gram(&x)?, &shift)?;
        let inv = spd_inverse(&system, self.iterations)?.squeeze(0)?;

        let projected = features.matmul(&transpose_last(&self.factor)?)?;
        let filtered = projected.matmul(&inv)?.matmul(&self.factor)?;
        Ok(((features * (1.0 - self.gamma))? + (filtered * self.gamma)?)?)
    }
}

/// Precomputed reference-set artifacts.
///
/// Excitation and importance matrices are shape-checked at startup and kept
/// alongside the centers, but no computation reads them.
#[derive(Debug, Clone)]
pub struct ReferenceArtifacts {
    /// Raw center inputs, leading dimension `num_centers`.
    pub centers_raw: Tensor,
    /// Precomputed center embeddings `[num_centers, d]`.
    pub centers_out: Tensor,
    /// Excitation matrix `[nclass, nclass]`.
    pub excitation: Tensor,
    /// Importance matrix `[nclass, nclass]`.
    pub importance: Tensor,
}

impl ReferenceArtifacts {
    /// File stems, each also the key of the single tensor inside the file.
    pub const CENTERS_RAW: &'static str = "centers_raw";
    /// See [`Self::CENTERS_RAW`].
    pub const CENTERS_OUT: &'static str = "centers_out";
    /// See [`Self::CENTERS_RAW`].
    pub const EXCITATION: &'static str = "exc_matrix";
    /// See [`Self::CENTERS_RAW`].
    pub const IMPORTANCE: &'static str = "imp_matrix";

    /// Load and shape-check the four artifacts from `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`MetaOptError::Artifact`] for missing files or tensors and
    /// [`MetaOptError::ShapeMismatch`] for wrongly shaped ones.
    pub fn load(dir: &Path, spec: &ReferenceSpec, device: &Device) -> Result<Self> {
        let artifacts = Self {
            centers_raw: load_single(dir, Self::CENTERS_RAW, device)?,
            centers_out: load_single(dir, Self::CENTERS_OUT, device)?,
            excitation: load_single(dir, Self::EXCITATION, device)?,
            importance: load_single(dir, Self::IMPORTANCE, device)?,
        };
        artifacts.validate(spec)?;
        tracing::info!(
            "Loaded reference artifacts from {} ({} centers, out dim {})",
            dir.display(),
            spec.num_centers,
            artifacts.output_dim()
        );
        Ok(artifacts)
    }

    /// Write the four artifacts to `dir`, one file each.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be written.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        for (stem, tensor) in [
            (Self::CENTERS_RAW, &self.centers_raw),
            (Self::CENTERS_OUT, &self.centers_out),
            (Self::EXCITATION, &self.excitation),
            (Self::IMPORTANCE, &self.importance),
        ] {
            tensor.save_safetensors(stem, dir.join(format!("{stem}.safetensors")))?;
        }
        Ok(())
    }

    /// Check every artifact against the reference constants.
    ///
    /// # Errors
    ///
    /// Returns [`MetaOptError::ShapeMismatch`] describing the first bad shape.
    pub fn validate(&self, spec: &ReferenceSpec) -> Result<()> {
        let raw = self.centers_raw.dims();
        if raw.first() != Some(&spec.num_centers) {
            return Err(MetaOptError::shape_mismatch(
                format!("{} with leading dim {}", Self::CENTERS_RAW, spec.num_centers),
                format!("{raw:?}"),
            ));
        }
        let out = self.centers_out.dims();
        if out.len() != 2 || out[0] != spec.num_centers {
            return Err(MetaOptError::shape_mismatch(
                format!("{} [{}, d]", Self::CENTERS_OUT, spec.num_centers),
                format!("{out:?}"),
            ));
        }
        for (stem, tensor) in [
            (Self::EXCITATION, &self.excitation),
            (Self::IMPORTANCE, &self.importance),
        ] {
            if tensor.dims() != [spec.nclass, spec.nclass] {
                return Err(MetaOptError::shape_mismatch(
                    format!("{stem} [{}, {}]", spec.nclass, spec.nclass),
                    format!("{:?}", tensor.dims()),
                ));
            }
        }
        Ok(())
    }

    /// Embedding dimension of the precomputed centers.
    #[must_use]
    pub fn output_dim(&self) -> usize {
        self.centers_out.dims().get(1).copied().unwrap_or(0)
    }

    /// Fail unless the precomputed centers match the backbone output dim `d`.
    ///
    /// # Errors
    ///
    /// Returns [`MetaOptError::ShapeMismatch`] on mismatch.
    pub fn check_output_dim(&self, d: usize) -> Result<()> {
        if self.output_dim() != d {
            return Err(MetaOptError::shape_mismatch(
                format!("{} [_, {d}] to match the embedding", Self::CENTERS_OUT),
                format!("{:?}", self.centers_out.dims()),
            ));
        }
        Ok(())
    }
}

fn load_single(dir: &Path, stem: &str, device: &Device) -> Result<Tensor> {
    let path = dir.join(format!("{stem}.safetensors"));
    if !path.exists() {
        return Err(MetaOptError::artifact(format!(
            "missing {}",
            path.display()
        )));
    }
    let mut tensors = candle_core::safetensors::load(&path, device)
        .map_err(|e| MetaOptError::artifact(format!("failed to read {}: {e}", path.display())))?;
    let tensor = tensors.remove(stem).ok_or_else(|| {
        MetaOptError::artifact(format!("{} has no tensor named '{stem}'", path.display()))
    })?;
    Ok(tensor.to_dtype(candle_core::DType::F32)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::VarMap;

    fn reference(num_centers: usize, nclass: usize) -> ReferenceSpec {
        ReferenceSpec {
            num_centers,
            a_init: 0.01,
            nclass,
        }
    }

    fn artifacts(m: usize, d: usize, nclass: usize) -> ReferenceArtifacts {
        let dev = Device::Cpu;
        ReferenceArtifacts {
            centers_raw: Tensor::randn(0f32, 1f32, (m, d), &dev).unwrap(),
            centers_out: Tensor::randn(0f32, 1f32, (m, d), &dev).unwrap(),
            excitation: Tensor::zeros((nclass, nclass), DType::F32, &dev).unwrap(),
            importance: Tensor::ones((nclass, nclass), DType::F32, &dev).unwrap(),
        }
    }

    #[test]
    fn test_bounded_scalar_clamps() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let s = BoundedScalar::new(&vb, "a", 0.5, 0.1, 1.0).unwrap();

        s.var.set(&Tensor::new(5.0f32, &Device::Cpu).unwrap()).unwrap();
        s.clamp().unwrap();
        assert!((s.value().unwrap() - 1.0).abs() < 1e-6);

        s.var.set(&Tensor::new(-3.0f32, &Device::Cpu).unwrap()).unwrap();
        s.clamp().unwrap();
        assert!((s.value().unwrap() - 0.1).abs() < 1e-6);

        // The clamped value is what the var map holds.
        let stored = varmap.data().lock().unwrap()["a"].as_tensor().to_scalar::<f32>().unwrap();
        assert!((stored - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_degenerate_bounds_pin_value() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let s = BoundedScalar::new(&vb, "a", 0.3, 0.004, 0.004).unwrap();
        s.clamp().unwrap();
        assert!((s.value().unwrap() - 0.004).abs() < 1e-7);
        assert!(BoundedScalar::new(&vb, "b", 0.3, 1.0, 0.5).is_err());
    }

    #[test]
    fn test_basis_is_symmetric_and_detached() {
        let dev = Device::Cpu;
        let v = Var::new(&[[1.0f32, 2.0], [3.0, 4.0], [0.5, -1.0]], &dev).unwrap();
        let factor = basis_factor(v.as_tensor()).unwrap();
        let phi = basis_matrix(&factor).unwrap();
        assert_eq!(phi.dims(), &[2, 2]);
        let rows = phi.to_vec2::<f32>().unwrap();
        assert!((rows[0][1] - rows[1][0]).abs() < 1e-6);
        // (1 + 9 + 0.25) / 3
        assert!((rows[0][0] - 10.25 / 3.0).abs() < 1e-5);

        let grads = phi.sum_all().unwrap().backward().unwrap();
        assert!(grads.get(v.as_tensor()).is_none());
    }

    #[test]
    fn test_refinement_matches_dense_formula() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        // Orthonormal centers: Phi = diag(1/2, 1/2, 0), a = 0.5
        let centers = Tensor::new(&[[1.0f32, 0.0, 0.0], [0.0, 1.0, 0.0]], &dev).unwrap();
        let layer = BasisRefinement::new(&vb, &centers, 0.5, (0.5, 0.5), 1.0, 40).unwrap();

        let f = Tensor::new(&[[2.0f32, 4.0, 6.0]], &dev).unwrap();
        let z = layer.forward(&f).unwrap().to_vec2::<f32>().unwrap();
        // Phi (Phi + aI)⁻¹ = diag(0.5, 0.5, 0)
        let expected = [1.0f32, 2.0, 0.0];
        for (got, want) in z[0].iter().zip(expected) {
            assert!((got - want).abs() < 1e-3, "got {got}, want {want}");
        }
    }

    #[test]
    fn test_gamma_zero_is_identity() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let centers = Tensor::randn(0f32, 1f32, (4, 3), &dev).unwrap();
        let layer = BasisRefinement::new(&vb, &centers, 0.01, (0.01, 0.01), 0.0, 40).unwrap();
        let f = Tensor::new(&[[1.0f32, -2.0, 3.0]], &dev).unwrap();
        let z = layer.forward(&f).unwrap();
        assert_eq!(z.to_vec2::<f32>().unwrap(), f.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn test_gradient_reaches_a_and_features() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let centers = Tensor::new(&[[1.0f32, 0.5], [0.0, 1.0]], &dev).unwrap();
        let layer = BasisRefinement::new(&vb, &centers, 0.1, (0.01, 1.0), 1.0, 40).unwrap();
        let f = Var::new(&[[1.0f32, 2.0]], &dev).unwrap();
        let loss = layer.forward(f.as_tensor()).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        assert!(grads.get(f.as_tensor()).is_some());
        assert!(grads.get(layer.a().tensor()).is_some());
    }

    #[test]
    fn test_refresh_rejects_dimension_change() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let centers = Tensor::zeros((4, 3), DType::F32, &dev).unwrap();
        let mut layer = BasisRefinement::new(&vb, &centers, 0.1, (0.1, 0.1), 1.0, 10).unwrap();
        let wrong = Tensor::zeros((4, 5), DType::F32, &dev).unwrap();
        assert!(matches!(
            layer.refresh(&wrong),
            Err(MetaOptError::ShapeMismatch { .. })
        ));
        let right = Tensor::ones((4, 3), DType::F32, &dev).unwrap();
        layer.refresh(&right).unwrap();
        let phi = layer.basis().unwrap().to_vec2::<f32>().unwrap();
        assert!((phi[0][0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_artifact_roundtrip_and_shape_checks() {
        let dir = tempfile::tempdir().unwrap();
        let spec = reference(6, 3);
        artifacts(6, 4, 3).save(dir.path()).unwrap();

        let loaded = ReferenceArtifacts::load(dir.path(), &spec, &Device::Cpu).unwrap();
        assert_eq!(loaded.output_dim(), 4);
        assert!(loaded.check_output_dim(4).is_ok());
        assert!(matches!(
            loaded.check_output_dim(8),
            Err(MetaOptError::ShapeMismatch { .. })
        ));

        let wrong_count = reference(5, 3);
        assert!(ReferenceArtifacts::load(dir.path(), &wrong_count, &Device::Cpu).is_err());
        let wrong_nclass = reference(6, 4);
        assert!(matches!(
            ReferenceArtifacts::load(dir.path(), &wrong_nclass, &Device::Cpu),
            Err(MetaOptError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_missing_artifact_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        artifacts(6, 4, 3).save(dir.path()).unwrap();
        std::fs::remove_file(dir.path().join("imp_matrix.safetensors")).unwrap();
        let result = ReferenceArtifacts::load(dir.path(), &reference(6, 3), &Device::Cpu);
        assert!(matches!(result, Err(MetaOptError::Artifact(_))));
    }
}
