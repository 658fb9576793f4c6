//! Checkpoint files in the output directory.
//!
//! A checkpoint is one safetensors file holding the model state dict
//! (`embedding.*` and `head.*`). Optimizer state is not saved.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};

use crate::error::{MetaOptError, Result};
use crate::model::FewShotModel;

/// Writes `best_model`, `last_epoch` and `epoch_{N}` checkpoints.
#[derive(Debug)]
pub struct CheckpointManager {
    dir: PathBuf,
    best_accuracy: f64,
}

impl CheckpointManager {
    /// Best model file name.
    pub const BEST: &'static str = "best_model.safetensors";
    /// Most recent validation file name.
    pub const LAST: &'static str = "last_epoch.safetensors";

    /// Use `dir` for checkpoints, creating it if needed.
    ///
    /// The best accuracy starts at 0.0.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            best_accuracy: 0.0,
        })
    }

    /// Best validation accuracy seen so far.
    #[must_use]
    pub fn best_accuracy(&self) -> f64 {
        self.best_accuracy
    }

    /// Path of the best model.
    #[must_use]
    pub fn best_path(&self) -> PathBuf {
        self.dir.join(Self::BEST)
    }

    /// Path of the most recent checkpoint.
    #[must_use]
    pub fn last_path(&self) -> PathBuf {
        self.dir.join(Self::LAST)
    }

    /// Path of the periodic checkpoint for `epoch`.
    #[must_use]
    pub fn epoch_path(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("epoch_{epoch}.safetensors"))
    }

    /// Write `state` to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`MetaOptError::Checkpoint`] if the file cannot be written.
    pub fn write(state: &HashMap<String, Tensor>, path: &Path) -> Result<()> {
        candle_core::safetensors::save(state, path).map_err(|e| {
            MetaOptError::Checkpoint(format!("failed to write {}: {e}", path.display()))
        })?;
        tracing::debug!("Saved checkpoint {}", path.display());
        Ok(())
    }

    /// Read a checkpoint file.
    ///
    /// # Errors
    ///
    /// Returns [`MetaOptError::Checkpoint`] if the file cannot be read.
    pub fn read(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
        candle_core::safetensors::load(path, device)
            .map_err(|e| MetaOptError::Checkpoint(format!("failed to read {}: {e}", path.display())))
    }

    /// Overwrite the best model if `accuracy` is strictly higher than every
    /// previous one. Returns whether it was written.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_best_if_improved(
        &mut self,
        state: &HashMap<String, Tensor>,
        accuracy: f64,
    ) -> Result<bool> {
        if accuracy <= self.best_accuracy {
            return Ok(false);
        }
        Self::write(state, &self.best_path())?;
        self.best_accuracy = accuracy;
        Ok(true)
    }

    /// Write the checkpoints due after a validation pass in `epoch`.
    ///
    /// Always writes `last_epoch`; writes `epoch_{N}` when `epoch` is a
    /// multiple of `save_epoch`. Returns whether the best model improved.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be written.
    pub fn after_validation(
        &mut self,
        model: &FewShotModel,
        accuracy: f64,
        epoch: usize,
        save_epoch: usize,
    ) -> Result<bool> {
        let state = model.state_dict()?;
        let improved = self.save_best_if_improved(&state, accuracy)?;
        Self::write(&state, &self.last_path())?;
        if save_epoch > 0 && epoch % save_epoch == 0 {
            Self::write(&state, &self.epoch_path(epoch))?;
        }
        Ok(improved)
    }

    /// Load a checkpoint file into `model`, head included.
    ///
    /// # Errors
    ///
    /// Returns [`MetaOptError::Checkpoint`] if the file cannot be read or
    /// does not fit the model.
    pub fn restore(model: &FewShotModel, path: &Path) -> Result<usize> {
        let state = Self::read(path, model.device())?;
        let loaded = model.load_state_dict(&state, true)?;
        model.clamp_bounded()?;
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(value: f32) -> HashMap<String, Tensor> {
        HashMap::from([(
            "head.scale".to_string(),
            Tensor::new(value, &Device::Cpu).unwrap(),
        )])
    }

    fn stored_scale(path: &Path) -> f32 {
        CheckpointManager::read(path, &Device::Cpu).unwrap()["head.scale"]
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_best_model_overwrite_semantics() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = CheckpointManager::new(dir.path()).unwrap();

        // 0.50, 0.62, 0.61, 0.62, 0.70: written at 1, 2 and 5 only.
        let sequence = [0.50, 0.62, 0.61, 0.62, 0.70];
        let written: Vec<bool> = sequence
            .iter()
            .enumerate()
            .map(|(i, &acc)| {
                manager
                    .save_best_if_improved(&state(i as f32 + 1.0), acc)
                    .unwrap()
            })
            .collect();
        assert_eq!(written, vec![true, true, false, false, true]);
        assert_eq!(manager.best_accuracy(), 0.70);
        assert_eq!(stored_scale(&manager.best_path()), 5.0);
    }

    #[test]
    fn test_zero_accuracy_never_saved() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = CheckpointManager::new(dir.path()).unwrap();
        assert!(!manager.save_best_if_improved(&state(1.0), 0.0).unwrap());
        assert!(!manager.best_path().exists());
    }

    #[test]
    fn test_paths() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("nested")).unwrap();
        assert!(dir.path().join("nested").is_dir());
        assert!(manager.epoch_path(10).ends_with("epoch_10.safetensors"));
        assert!(manager.last_path().ends_with("last_epoch.safetensors"));
    }

    #[test]
    fn test_restore_loads_and_clamps() {
        use crate::config::{HeadKind, MetaOptConfig, Network};

        let mut config = MetaOptConfig::default();
        config.network = Network::Identity;
        config.head = HeadKind::R2d2;
        config.embedding.refine_with_basis = false;
        let model = FewShotModel::build(&config, 1, None, &Device::Cpu).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path()).unwrap();
        let mut saved = model.state_dict().unwrap();
        saved.insert("head.scale".into(), Tensor::new(4.0f32, &Device::Cpu).unwrap());
        saved.insert("head.lambda".into(), Tensor::new(1e9f32, &Device::Cpu).unwrap());
        CheckpointManager::write(&saved, &manager.last_path()).unwrap();

        let loaded = CheckpointManager::restore(&model, &manager.last_path()).unwrap();
        assert_eq!(loaded, saved.len());
        let state = model.state_dict().unwrap();
        assert_eq!(state["head.scale"].to_scalar::<f32>().unwrap(), 4.0);
        let lambda = model.head.learned_lambda().unwrap().unwrap();
        assert!((lambda - config.solver.lambda_max).abs() < 1e-2);
    }

    #[test]
    fn test_read_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = CheckpointManager::read(&dir.path().join("nope.safetensors"), &Device::Cpu);
        assert!(matches!(result, Err(MetaOptError::Checkpoint(_))));
    }
}
