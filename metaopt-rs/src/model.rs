//! Embedding network and classification head assembled from configuration.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

use crate::config::MetaOptConfig;
use crate::embedding::{Backbone, BasisRefinement, EmbeddingFunction, Mode, ReferenceArtifacts};
use crate::episode::Episode;
use crate::error::{MetaOptError, Result};
use crate::head::ClassificationHead;

/// Prefix of embedding tensors in checkpoints.
pub const EMBEDDING_PREFIX: &str = "embedding";
/// Prefix of head tensors in checkpoints.
pub const HEAD_PREFIX: &str = "head";

/// Embedding function plus base learner, each with its own variable map.
pub struct FewShotModel {
    /// Embedding function.
    pub embedding: EmbeddingFunction,
    /// Classification head.
    pub head: ClassificationHead,
    embedding_vars: VarMap,
    head_vars: VarMap,
    device: Device,
}

impl FewShotModel {
    /// Build the configured model.
    ///
    /// When basis refinement is enabled, `reference` supplies the initial
    /// basis and the backbone output dimension is probed against it.
    ///
    /// # Errors
    ///
    /// Returns [`MetaOptError::Config`] if refinement is enabled without
    /// reference artifacts, and [`MetaOptError::ShapeMismatch`] if the
    /// precomputed centers do not match the backbone.
    pub fn build(
        config: &MetaOptConfig,
        in_channels: usize,
        reference: Option<&ReferenceArtifacts>,
        device: &Device,
    ) -> Result<Self> {
        let embedding_vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&embedding_vars, DType::F32, device);
        let backbone = Backbone::build(
            config.network,
            &config.embedding,
            in_channels,
            vb.pp("backbone"),
        )?;

        let refinement = if config.embedding.refine_with_basis {
            let spec = config.dataset.reference().ok_or_else(|| {
                MetaOptError::config(format!(
                    "dataset {} has no reference set",
                    config.dataset.dir_name()
                ))
            })?;
            let reference = reference.ok_or_else(|| {
                MetaOptError::config("basis refinement needs reference artifacts")
            })?;
            let probe = reference.centers_raw.narrow(0, 0, 1)?.to_device(device)?;
            let d = backbone.forward(&probe, Mode::Evaluation)?.dim(1)?;
            reference.check_output_dim(d)?;
            Some(BasisRefinement::new(
                &vb.pp("refine"),
                &reference.centers_out.to_device(device)?,
                spec.a_init,
                (config.training.a_clip_min, config.training.a_clip_max),
                config.embedding.gamma,
                config.solver.solver_iterations,
            )?)
        } else {
            None
        };
        let embedding = EmbeddingFunction::new(backbone, refinement);

        let head_vars = VarMap::new();
        let hb = VarBuilder::from_varmap(&head_vars, DType::F32, device);
        let head = ClassificationHead::build(config.head, &config.solver, &config.embedding, &hb)?;

        let model = Self {
            embedding,
            head,
            embedding_vars,
            head_vars,
            device: device.clone(),
        };
        // Bring bounded scalars into range before the first step.
        model.clamp_bounded()?;
        tracing::info!(
            "Built {:?} embedding with {:?} head ({} parameters)",
            config.network,
            config.head,
            model.parameter_count()?
        );
        Ok(model)
    }

    /// Device holding the parameters.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Embedding and head variable maps, in that order.
    #[must_use]
    pub fn varmaps(&self) -> [&VarMap; 2] {
        [&self.embedding_vars, &self.head_vars]
    }

    /// Number of scalar parameters, including batch norm statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable map lock is poisoned.
    pub fn parameter_count(&self) -> Result<usize> {
        let mut count = 0;
        for varmap in self.varmaps() {
            let vars = lock(varmap.data())?;
            count += vars.values().map(|v| v.elem_count()).sum::<usize>();
        }
        Ok(count)
    }

    /// Clamp every bounded scalar into its range.
    ///
    /// # Errors
    ///
    /// Returns an error if a parameter cannot be updated.
    pub fn clamp_bounded(&self) -> Result<()> {
        self.embedding.clamp()?;
        self.head.clamp()
    }

    /// Query logits `[E, nQ, way]` for a batch of episodes.
    ///
    /// # Errors
    ///
    /// Returns an error for inconsistent episode tensors.
    pub fn episode_logits(&self, episode: &Episode, mode: Mode) -> Result<Tensor> {
        let e = episode.num_episodes();
        let shape = episode.shape;
        let support = self
            .embedding
            .embed(&episode.support_inputs.flatten(0, 1)?, mode)?;
        let support = support.reshape((e, shape.n_support(), ()))?;
        let query = self
            .embedding
            .embed(&episode.query_inputs.flatten(0, 1)?, mode)?;
        let query = query.reshape((e, shape.n_query(), ()))?;
        self.head.forward(
            &query,
            &support,
            &episode.support_labels,
            shape.way,
            shape.shot,
        )
    }

    /// All parameters keyed `embedding.<name>` and `head.<name>`.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable map lock is poisoned.
    pub fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        let mut tensors = HashMap::new();
        for (prefix, varmap) in [
            (EMBEDDING_PREFIX, &self.embedding_vars),
            (HEAD_PREFIX, &self.head_vars),
        ] {
            for (name, var) in lock(varmap.data())?.iter() {
                tensors.insert(format!("{prefix}.{name}"), var.as_tensor().detach());
            }
        }
        Ok(tensors)
    }

    /// Overwrite parameters from a prefixed state dict.
    ///
    /// Returns the number of tensors loaded. Parameters without an entry
    /// are left unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`MetaOptError::Checkpoint`] if a tensor has the wrong shape.
    pub fn load_state_dict(
        &self,
        tensors: &HashMap<String, Tensor>,
        include_head: bool,
    ) -> Result<usize> {
        let mut maps = vec![(EMBEDDING_PREFIX, &self.embedding_vars)];
        if include_head {
            maps.push((HEAD_PREFIX, &self.head_vars));
        }
        let mut loaded = 0;
        for (prefix, varmap) in maps {
            for (name, var) in lock(varmap.data())?.iter() {
                let key = format!("{prefix}.{name}");
                let Some(tensor) = tensors.get(&key) else {
                    tracing::warn!("No value for {key}; keeping current parameter");
                    continue;
                };
                let tensor = tensor.to_device(&self.device)?.to_dtype(var.dtype())?;
                var.set(&tensor)
                    .map_err(|e| MetaOptError::Checkpoint(format!("cannot load {key}: {e}")))?;
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// Initialise the embedding from a pretrained checkpoint file.
    ///
    /// # Errors
    ///
    /// Returns [`MetaOptError::Checkpoint`] if the file cannot be read or
    /// holds no embedding tensors.
    pub fn load_pretrained(&self, path: &Path) -> Result<()> {
        let tensors = candle_core::safetensors::load(path, &self.device).map_err(|e| {
            MetaOptError::Checkpoint(format!("failed to read {}: {e}", path.display()))
        })?;
        let loaded = self.load_state_dict(&tensors, false)?;
        if loaded == 0 {
            return Err(MetaOptError::Checkpoint(format!(
                "{} contains no {EMBEDDING_PREFIX}.* tensors",
                path.display()
            )));
        }
        self.clamp_bounded()?;
        tracing::info!("Loaded {loaded} pretrained tensors from {}", path.display());
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|e| MetaOptError::Training(format!("variable map lock poisoned: {e}")))
}
