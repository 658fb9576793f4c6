//! Embedding function: a backbone optionally followed by basis refinement.

pub mod backbone;
pub mod basis;

use candle_core::Tensor;

pub use backbone::Backbone;
pub use basis::{BasisRefinement, BoundedScalar, ReferenceArtifacts};

use crate::error::Result;

/// Forward-pass mode of the embedding network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Batch statistics and dropout active.
    Training,
    /// Running statistics, no dropout.
    Evaluation,
}

impl Mode {
    /// Whether layers should behave as in training.
    #[must_use]
    pub fn is_train(self) -> bool {
        matches!(self, Mode::Training)
    }
}

/// Maps inputs `[n, ...]` to embeddings `[n, d]`.
///
/// The only mutable state is the auxiliary basis, and it only changes
/// through [`EmbeddingFunction::refresh_basis`].
pub struct EmbeddingFunction {
    backbone: Backbone,
    refinement: Option<BasisRefinement>,
}

impl EmbeddingFunction {
    /// Combine a backbone with an optional refinement layer.
    #[must_use]
    pub fn new(backbone: Backbone, refinement: Option<BasisRefinement>) -> Self {
        Self {
            backbone,
            refinement,
        }
    }

    /// Embed a batch of inputs.
    ///
    /// # Errors
    ///
    /// Returns an error for inputs the backbone cannot process or a feature
    /// dimension that does not match the basis.
    pub fn embed(&self, inputs: &Tensor, mode: Mode) -> Result<Tensor> {
        let features = self.backbone.forward(inputs, mode)?;
        match &self.refinement {
            Some(layer) => layer.forward(&features),
            None => Ok(features),
        }
    }

    /// Recompute the basis from the raw centers with the current parameters.
    ///
    /// The centers embedding is detached, so no gradient reaches the basis.
    /// A no-op without a refinement layer.
    ///
    /// # Errors
    ///
    /// Returns an error if the centers cannot be embedded.
    pub fn refresh_basis(&mut self, centers_raw: &Tensor, mode: Mode) -> Result<()> {
        let Some(layer) = self.refinement.as_mut() else {
            return Ok(());
        };
        let centers = self.backbone.forward(centers_raw, mode)?.detach();
        layer.refresh(&centers)
    }

    /// Whether a refinement layer is present.
    #[must_use]
    pub fn uses_basis(&self) -> bool {
        self.refinement.is_some()
    }

    /// Current basis Phi, if a refinement layer is present.
    ///
    /// # Errors
    ///
    /// Returns an error if the matrix product fails.
    pub fn basis(&self) -> Result<Option<Tensor>> {
        self.refinement.as_ref().map(BasisRefinement::basis).transpose()
    }

    /// Current refinement regularizer `a`.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be read back.
    pub fn a_value(&self) -> Result<Option<f64>> {
        self.refinement
            .as_ref()
            .map(|layer| layer.a().value())
            .transpose()
    }

    /// Clamp bounded parameters back into range.
    ///
    /// # Errors
    ///
    /// Returns an error if a parameter cannot be updated.
    pub fn clamp(&self) -> Result<()> {
        if let Some(layer) = &self.refinement {
            layer.a().clamp()?;
        }
        Ok(())
    }
}
