//! Configuration parsing and validation.
//!
//! A run is described by one [`MetaOptConfig`], loaded from YAML once at
//! startup and passed by reference into every component constructor.

use std::path::{Path, PathBuf};

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::error::{MetaOptError, Result};
use crate::scheduler::PiecewiseSchedule;

/// Main configuration for an episodic training run.
///
/// # Example
///
/// ```rust
/// use metaopt_rs::MetaOptConfig;
///
/// # fn main() -> metaopt_rs::Result<()> {
/// let config = MetaOptConfig::from_preset("mini_imagenet")?;
/// config.validate()?;
/// assert_eq!(config.episodes.train_way, 5);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaOptConfig {
    /// Embedding network variant.
    #[serde(default)]
    pub network: Network,

    /// Base learner variant.
    #[serde(default)]
    pub head: HeadKind,

    /// Dataset selector.
    #[serde(default)]
    pub dataset: DatasetKind,

    /// Compute device.
    #[serde(default)]
    pub device: DeviceSelector,

    /// CUDA ordinal used when `device` is `cuda`.
    #[serde(default)]
    pub gpu: usize,

    /// Optional pretrained embedding weights (safetensors).
    #[serde(default)]
    pub pretrained: Option<String>,

    /// Root directory holding `<dataset>/{train,val}.safetensors`.
    #[serde(default = "default_data_root")]
    pub data_root: String,

    /// Root directory holding `<dataset>/` precomputed artifacts.
    #[serde(default = "default_artifacts_root")]
    pub artifacts_root: String,

    /// Output directory for checkpoints and the run log.
    #[serde(default = "default_save_path")]
    pub save_path: String,

    /// Random seed for episode sampling.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Episode shapes.
    #[serde(default)]
    pub episodes: EpisodeSettings,

    /// Optimization and schedule.
    #[serde(default)]
    pub training: TrainingSettings,

    /// Embedding options.
    #[serde(default)]
    pub embedding: EmbeddingSettings,

    /// Inner solver options.
    #[serde(default)]
    pub solver: SolverSettings,
}

fn default_data_root() -> String {
    "./data".into()
}
fn default_artifacts_root() -> String {
    "./pre_stores".into()
}
fn default_save_path() -> String {
    "./experiments/exp_1".into()
}
fn default_seed() -> u64 {
    42
}

/// Embedding network variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Four-block convolutional network.
    #[default]
    ProtoNet,
    /// R2D2 convolutional network with concatenated block outputs.
    R2d2,
    /// ResNet-12.
    ResNet,
    /// Flattened raw input (feature-vector datasets).
    Identity,
}

/// Base learner variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeadKind {
    /// Class-mean prototypes with squared-distance logits.
    #[default]
    ProtoNet,
    /// Closed-form ridge regression with fixed lambda.
    Ridge,
    /// Closed-form ridge regression with learned lambda, scale and bias.
    R2d2,
    /// Crammer-Singer multi-class SVM dual.
    Svm,
}

impl HeadKind {
    /// Whether the head fits a discriminative model that needs at least two classes.
    #[must_use]
    pub fn is_discriminative(self) -> bool {
        !matches!(self, HeadKind::ProtoNet)
    }
}

/// Dataset selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    /// miniImageNet (84x84).
    #[default]
    MiniImagenet,
    /// tieredImageNet (84x84).
    TieredImagenet,
    /// CIFAR-FS (32x32).
    CifarFs,
    /// FC100 (32x32).
    Fc100,
}

/// Constants of the fixed reference set used for the auxiliary basis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceSpec {
    /// Number of center samples.
    pub num_centers: usize,
    /// Initial value of the refinement regularizer `a`.
    pub a_init: f64,
    /// Side length of the excitation / importance matrices.
    pub nclass: usize,
}

impl DatasetKind {
    /// Directory name used under `data_root` and `artifacts_root`.
    #[must_use]
    pub fn dir_name(self) -> &'static str {
        match self {
            DatasetKind::MiniImagenet => "mini_imagenet",
            DatasetKind::TieredImagenet => "tiered_imagenet",
            DatasetKind::CifarFs => "cifar_fs",
            DatasetKind::Fc100 => "fc100",
        }
    }

    /// Name of the split used for validation.
    #[must_use]
    pub fn val_split(self) -> &'static str {
        match self {
            DatasetKind::MiniImagenet => "test",
            _ => "val",
        }
    }

    /// Reference-set constants, if precomputed centers exist for this dataset.
    #[must_use]
    pub fn reference(self) -> Option<ReferenceSpec> {
        match self {
            DatasetKind::MiniImagenet => Some(ReferenceSpec {
                num_centers: 120,
                a_init: 0.000_625,
                nclass: 144,
            }),
            DatasetKind::CifarFs => Some(ReferenceSpec {
                num_centers: 240,
                a_init: 0.004,
                nclass: 150,
            }),
            DatasetKind::TieredImagenet | DatasetKind::Fc100 => None,
        }
    }
}

/// Compute device selector, resolved once into a [`Device`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceSelector {
    /// Host CPU.
    #[default]
    Cpu,
    /// CUDA accelerator.
    Cuda,
}

/// Episode shapes for training and validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeSettings {
    /// Classes per training episode.
    #[serde(default = "default_way")]
    pub train_way: usize,
    /// Classes per validation episode.
    #[serde(default = "default_way")]
    pub test_way: usize,
    /// Support examples per training class.
    #[serde(default = "default_train_shot")]
    pub train_shot: usize,
    /// Support examples per validation class.
    #[serde(default = "default_val_shot")]
    pub val_shot: usize,
    /// Query examples per training class.
    #[serde(default = "default_train_query")]
    pub train_query: usize,
    /// Query examples per validation class.
    #[serde(default = "default_val_query")]
    pub val_query: usize,
    /// Episodes grouped into one training batch.
    #[serde(default = "default_episodes_per_batch")]
    pub episodes_per_batch: usize,
    /// Training iterations per epoch.
    #[serde(default = "default_num_batch")]
    pub num_batch: usize,
    /// Validation episodes per validation pass.
    #[serde(default = "default_val_episode")]
    pub val_episode: usize,
    /// Background sampling workers (0 samples inline).
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
}

fn default_way() -> usize {
    5
}
fn default_train_shot() -> usize {
    15
}
fn default_val_shot() -> usize {
    5
}
fn default_train_query() -> usize {
    6
}
fn default_val_query() -> usize {
    15
}
fn default_episodes_per_batch() -> usize {
    8
}
fn default_num_batch() -> usize {
    1000
}
fn default_val_episode() -> usize {
    2000
}
fn default_num_workers() -> usize {
    4
}

impl Default for EpisodeSettings {
    fn default() -> Self {
        Self {
            train_way: default_way(),
            test_way: default_way(),
            train_shot: default_train_shot(),
            val_shot: default_val_shot(),
            train_query: default_train_query(),
            val_query: default_val_query(),
            episodes_per_batch: default_episodes_per_batch(),
            num_batch: default_num_batch(),
            val_episode: default_val_episode(),
            num_workers: default_num_workers(),
        }
    }
}

/// Optimization, schedule, logging and checkpoint cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// Number of training epochs.
    #[serde(default = "default_num_epoch")]
    pub num_epoch: usize,
    /// Write `epoch_{N}` every this many epochs.
    #[serde(default = "default_save_epoch")]
    pub save_epoch: usize,
    /// Log and validate every this many iterations.
    #[serde(default = "default_print_every")]
    pub print_every: usize,
    /// Base learning rate.
    #[serde(default = "default_lr")]
    pub lr: f64,
    /// Epoch breakpoints of the schedule, whitespace separated.
    #[serde(default = "default_lr_epochs")]
    pub lr_epochs: String,
    /// Rate multipliers of the schedule, one more than breakpoints.
    #[serde(default = "default_lr_values")]
    pub lr_values: String,
    /// SGD momentum.
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    /// L2 weight decay.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    /// Use Nesterov momentum.
    #[serde(default = "default_true")]
    pub nesterov: bool,
    /// Label smoothing epsilon.
    #[serde(default)]
    pub eps: f64,
    /// Lower clamp bound of the refinement regularizer `a`.
    #[serde(default = "default_a_clip")]
    pub a_clip_min: f64,
    /// Upper clamp bound of the refinement regularizer `a`.
    #[serde(default = "default_a_clip")]
    pub a_clip_max: f64,
    /// Keep the last training basis during validation instead of refreshing it.
    #[serde(default = "default_true")]
    pub freeze_basis_for_eval: bool,
}

fn default_num_epoch() -> usize {
    60
}
fn default_save_epoch() -> usize {
    10
}
fn default_print_every() -> usize {
    100
}
fn default_lr() -> f64 {
    0.1
}
fn default_lr_epochs() -> String {
    "20 40 50".into()
}
fn default_lr_values() -> String {
    "1.0 0.06 0.012 0.0024".into()
}
fn default_momentum() -> f64 {
    0.9
}
fn default_weight_decay() -> f64 {
    5e-4
}
fn default_true() -> bool {
    true
}
fn default_a_clip() -> f64 {
    0.000_625
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epoch: default_num_epoch(),
            save_epoch: default_save_epoch(),
            print_every: default_print_every(),
            lr: default_lr(),
            lr_epochs: default_lr_epochs(),
            lr_values: default_lr_values(),
            momentum: default_momentum(),
            weight_decay: default_weight_decay(),
            nesterov: true,
            eps: 0.0,
            a_clip_min: default_a_clip(),
            a_clip_max: default_a_clip(),
            freeze_basis_for_eval: true,
        }
    }
}

/// Embedding options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingSettings {
    /// L2-normalize backbone output (ProtoNet backbone) and scale ProtoNet logits by 1/d.
    #[serde(default = "default_true")]
    pub normalize: bool,
    /// Trade-off between raw and basis-filtered features.
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    /// Wrap the backbone with the basis refinement layer.
    #[serde(default = "default_true")]
    pub refine_with_basis: bool,
    /// Dropout rate for R2D2 / ResNet backbones.
    #[serde(default = "default_drop_rate")]
    pub drop_rate: f32,
}

fn default_gamma() -> f64 {
    1.0
}
fn default_drop_rate() -> f32 {
    0.1
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            normalize: true,
            gamma: default_gamma(),
            refine_with_basis: true,
            drop_rate: default_drop_rate(),
        }
    }
}

/// Inner solver options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverSettings {
    /// Ridge penalty of the fixed-lambda ridge head, and initial R2D2 lambda.
    #[serde(default = "default_ridge_lambda")]
    pub ridge_lambda: f64,
    /// Lower clamp bound of the learned R2D2 lambda.
    #[serde(default = "default_lambda_min")]
    pub lambda_min: f64,
    /// Upper clamp bound of the learned R2D2 lambda.
    #[serde(default = "default_lambda_max")]
    pub lambda_max: f64,
    /// SVM box constraint.
    #[serde(default = "default_svm_c")]
    pub svm_c: f64,
    /// Unrolled dual iterations of the SVM head.
    #[serde(default = "default_svm_iterations")]
    pub svm_iterations: usize,
    /// Newton-Schulz iterations of every matrix inverse.
    #[serde(default = "default_solver_iterations")]
    pub solver_iterations: usize,
}

fn default_ridge_lambda() -> f64 {
    50.0
}
fn default_lambda_min() -> f64 {
    1e-2
}
fn default_lambda_max() -> f64 {
    1e4
}
fn default_svm_c() -> f64 {
    0.1
}
fn default_svm_iterations() -> usize {
    50
}
fn default_solver_iterations() -> usize {
    40
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            ridge_lambda: default_ridge_lambda(),
            lambda_min: default_lambda_min(),
            lambda_max: default_lambda_max(),
            svm_c: default_svm_c(),
            svm_iterations: default_svm_iterations(),
            solver_iterations: default_solver_iterations(),
        }
    }
}

impl Default for MetaOptConfig {
    fn default() -> Self {
        Self {
            network: Network::default(),
            head: HeadKind::default(),
            dataset: DatasetKind::default(),
            device: DeviceSelector::default(),
            gpu: 0,
            pretrained: None,
            data_root: default_data_root(),
            artifacts_root: default_artifacts_root(),
            save_path: default_save_path(),
            seed: default_seed(),
            episodes: EpisodeSettings::default(),
            training: TrainingSettings::default(),
            embedding: EmbeddingSettings::default(),
            solver: SolverSettings::default(),
        }
    }
}

impl MetaOptConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a dataset preset.
    ///
    /// Available presets: `mini_imagenet`, `tiered_imagenet`, `cifar_fs`, `fc100`.
    ///
    /// # Errors
    ///
    /// Returns [`MetaOptError::Config`] for an unknown preset name.
    pub fn from_preset(preset: &str) -> Result<Self> {
        let dataset = match preset {
            "mini_imagenet" => DatasetKind::MiniImagenet,
            "tiered_imagenet" => DatasetKind::TieredImagenet,
            "cifar_fs" => DatasetKind::CifarFs,
            "fc100" => DatasetKind::Fc100,
            _ => return Err(MetaOptError::config(format!("Unknown preset: {preset}"))),
        };

        let mut config = Self {
            dataset,
            save_path: format!("./experiments/{}", dataset.dir_name()),
            ..Self::default()
        };
        match dataset.reference() {
            Some(reference) => {
                config.training.a_clip_min = reference.a_init;
                config.training.a_clip_max = reference.a_init;
            }
            None => config.embedding.refine_with_basis = false,
        }
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`MetaOptError::Config`] describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        let ep = &self.episodes;
        let tr = &self.training;

        for (name, value) in [
            ("train_shot", ep.train_shot),
            ("val_shot", ep.val_shot),
            ("train_query", ep.train_query),
            ("val_query", ep.val_query),
            ("episodes_per_batch", ep.episodes_per_batch),
            ("num_batch", ep.num_batch),
            ("val_episode", ep.val_episode),
            ("num_epoch", tr.num_epoch),
            ("save_epoch", tr.save_epoch),
            ("print_every", tr.print_every),
            ("svm_iterations", self.solver.svm_iterations),
            ("solver_iterations", self.solver.solver_iterations),
        ] {
            if value == 0 {
                return Err(MetaOptError::config(format!("{name} must be positive")));
            }
        }

        // Label smoothing divides by (way - 1).
        if ep.train_way < 2 {
            return Err(MetaOptError::config(format!(
                "train_way must be at least 2, got {}",
                ep.train_way
            )));
        }
        if ep.test_way == 0 {
            return Err(MetaOptError::config("test_way must be positive"));
        }
        if self.head.is_discriminative() && ep.test_way < 2 {
            return Err(MetaOptError::config(format!(
                "{:?} head needs at least 2 classes per episode, got test_way = {}",
                self.head, ep.test_way
            )));
        }

        if !(0.0..1.0).contains(&tr.eps) {
            return Err(MetaOptError::config(format!(
                "eps must lie in [0, 1), got {}",
                tr.eps
            )));
        }
        if tr.lr <= 0.0 {
            return Err(MetaOptError::config("lr must be positive"));
        }
        if tr.a_clip_min <= 0.0 || tr.a_clip_min > tr.a_clip_max {
            return Err(MetaOptError::config(format!(
                "a clip bounds must satisfy 0 < a_clip_min <= a_clip_max, got [{}, {}]",
                tr.a_clip_min, tr.a_clip_max
            )));
        }
        let solver = &self.solver;
        if solver.lambda_min <= 0.0 || solver.lambda_min > solver.lambda_max {
            return Err(MetaOptError::config(format!(
                "lambda bounds must satisfy 0 < lambda_min <= lambda_max, got [{}, {}]",
                solver.lambda_min, solver.lambda_max
            )));
        }
        if solver.ridge_lambda <= 0.0 || solver.svm_c <= 0.0 {
            return Err(MetaOptError::config(
                "ridge_lambda and svm_c must be positive",
            ));
        }

        self.lr_schedule()?;

        if self.embedding.refine_with_basis && self.dataset.reference().is_none() {
            return Err(MetaOptError::config(format!(
                "dataset {} has no reference centers; set embedding.refine_with_basis: false",
                self.dataset.dir_name()
            )));
        }

        Ok(())
    }

    /// Parse the learning-rate schedule strings.
    ///
    /// # Errors
    ///
    /// Returns [`MetaOptError::Config`] for malformed schedule strings.
    pub fn lr_schedule(&self) -> Result<PiecewiseSchedule> {
        PiecewiseSchedule::parse(&self.training.lr_epochs, &self.training.lr_values)
    }

    /// Resolve the device selector into a candle device.
    ///
    /// Falls back to the CPU with a warning when CUDA is unavailable.
    #[must_use]
    pub fn resolve_device(&self) -> Device {
        match self.device {
            DeviceSelector::Cpu => Device::Cpu,
            DeviceSelector::Cuda if cfg!(feature = "cuda") => {
                match Device::cuda_if_available(self.gpu) {
                    Ok(device @ Device::Cuda(_)) => {
                        tracing::info!("Training device: CUDA (device {})", self.gpu);
                        device
                    }
                    Ok(_) => {
                        tracing::warn!("CUDA not available; falling back to CPU.");
                        Device::Cpu
                    }
                    Err(err) => {
                        tracing::warn!("CUDA init failed ({err}); falling back to CPU.");
                        Device::Cpu
                    }
                }
            }
            DeviceSelector::Cuda => {
                tracing::warn!(
                    "CUDA feature disabled; falling back to CPU. Enable with --features cuda."
                );
                Device::Cpu
            }
        }
    }

    /// Path of a dataset split file.
    #[must_use]
    pub fn split_path(&self, split: &str) -> PathBuf {
        Path::new(&self.data_root)
            .join(self.dataset.dir_name())
            .join(format!("{split}.safetensors"))
    }

    /// Directory holding the precomputed reference artifacts.
    #[must_use]
    pub fn artifacts_dir(&self) -> PathBuf {
        Path::new(&self.artifacts_root).join(self.dataset.dir_name())
    }

    /// Support examples per training episode.
    #[must_use]
    pub fn train_n_support(&self) -> usize {
        self.episodes.train_way * self.episodes.train_shot
    }

    /// Query examples per training episode.
    #[must_use]
    pub fn train_n_query(&self) -> usize {
        self.episodes.train_way * self.episodes.train_query
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = MetaOptConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.train_n_support(), 75);
        assert_eq!(config.train_n_query(), 30);
    }

    #[test]
    fn test_presets() {
        for preset in ["mini_imagenet", "tiered_imagenet", "cifar_fs", "fc100"] {
            let config = MetaOptConfig::from_preset(preset).unwrap();
            assert!(config.validate().is_ok(), "preset {preset} should validate");
        }
        let cifar = MetaOptConfig::from_preset("cifar_fs").unwrap();
        assert_eq!(cifar.training.a_clip_min, 0.004);
        let tiered = MetaOptConfig::from_preset("tiered_imagenet").unwrap();
        assert!(!tiered.embedding.refine_with_basis);
    }

    #[test]
    fn test_unknown_preset() {
        let result = MetaOptConfig::from_preset("omniglot");
        assert!(matches!(result, Err(MetaOptError::Config(_))));
    }

    #[test]
    fn test_way_one_rejected_for_training() {
        let mut config = MetaOptConfig::default();
        config.episodes.train_way = 1;
        assert!(matches!(config.validate(), Err(MetaOptError::Config(_))));
    }

    #[test]
    fn test_way_one_rejected_for_discriminative_heads() {
        let mut config = MetaOptConfig::default();
        config.episodes.test_way = 1;
        config.head = HeadKind::ProtoNet;
        assert!(config.validate().is_ok());

        for head in [HeadKind::Ridge, HeadKind::R2d2, HeadKind::Svm] {
            config.head = head;
            assert!(matches!(config.validate(), Err(MetaOptError::Config(_))));
        }
    }

    #[test]
    fn test_malformed_schedule_rejected() {
        let mut config = MetaOptConfig::default();
        config.training.lr_epochs = "20 forty 50".into();
        assert!(matches!(config.validate(), Err(MetaOptError::Config(_))));

        let mut config = MetaOptConfig::default();
        config.training.lr_values = "1.0 0.06".into();
        assert!(matches!(config.validate(), Err(MetaOptError::Config(_))));
    }

    #[test]
    fn test_inverted_clip_bounds_rejected() {
        let mut config = MetaOptConfig::default();
        config.training.a_clip_min = 0.01;
        config.training.a_clip_max = 0.001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_basis_requires_reference_set() {
        let mut config = MetaOptConfig::default();
        config.dataset = DatasetKind::Fc100;
        config.embedding.refine_with_basis = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_roundtrip_and_selectors() {
        let yaml = r#"
network: resnet
head: svm
dataset: cifar_fs
device: cpu
episodes:
  train_way: 5
  train_shot: 5
training:
  eps: 0.1
  a_clip_min: 0.004
  a_clip_max: 0.004
"#;
        let config: MetaOptConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.network, Network::ResNet);
        assert_eq!(config.head, HeadKind::Svm);
        assert_eq!(config.dataset, DatasetKind::CifarFs);
        assert_eq!(config.episodes.train_shot, 5);
        assert_eq!(config.episodes.val_query, 15);
        assert!(config.validate().is_ok());

        let unknown = "head: knn\n";
        assert!(serde_yaml::from_str::<MetaOptConfig>(unknown).is_err());
    }

    #[test]
    fn test_config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let config = MetaOptConfig::from_preset("cifar_fs").unwrap();
        config.to_file(&path).unwrap();

        let loaded = MetaOptConfig::from_file(&path).unwrap();
        assert_eq!(loaded.dataset, DatasetKind::CifarFs);
        assert_eq!(loaded.training.lr_values, config.training.lr_values);
    }

    #[test]
    fn test_split_and_artifact_paths() {
        let config = MetaOptConfig::default();
        assert!(config
            .split_path("train")
            .ends_with("mini_imagenet/train.safetensors"));
        assert!(config.artifacts_dir().ends_with("pre_stores/mini_imagenet"));
        assert_eq!(DatasetKind::MiniImagenet.val_split(), "test");
        assert_eq!(DatasetKind::CifarFs.val_split(), "val");
    }
}
