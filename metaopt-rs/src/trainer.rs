//! Episodic training loop with periodic validation and checkpointing.

use std::path::Path;
use std::sync::Arc;

use candle_core::{Device, Tensor};
use candle_nn::Optimizer;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::checkpoint::CheckpointManager;
use crate::config::MetaOptConfig;
use crate::embedding::{Mode, ReferenceArtifacts};
use crate::episode::{Episode, EpisodeLoader, EpisodeSampler, EpisodeShape, FewShotDataset};
use crate::error::{MetaOptError, Result};
use crate::logging::{TrainLog, Timer};
use crate::metrics::{accuracy, cross_entropy, smoothed_cross_entropy, RunningStats};
use crate::model::FewShotModel;
use crate::optimizer::{NesterovSgd, ParamsSgd};
use crate::scheduler::LRScheduler;

/// Outcome of one validation pass.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationRecord {
    /// Epoch of the pass (1-based).
    pub epoch: usize,
    /// Training iteration within the epoch that triggered it.
    pub iteration: usize,
    /// Mean cross-entropy loss.
    pub loss: f64,
    /// Mean accuracy in percent.
    pub accuracy: f64,
    /// 95% confidence half-width in percent.
    pub ci95: f64,
    /// Whether this pass produced a new best model.
    pub best: bool,
}

/// Summary returned by [`Trainer::train`] and written as `summary.json`.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingSummary {
    /// Epochs run.
    pub epochs: usize,
    /// Best validation accuracy in percent.
    pub best_accuracy: f64,
    /// Every validation pass, in order.
    pub validations: Vec<ValidationRecord>,
}

/// Training orchestrator.
///
/// # Example
///
/// ```no_run
/// use metaopt_rs::{MetaOptConfig, Trainer};
///
/// # fn main() -> metaopt_rs::Result<()> {
/// let config = MetaOptConfig::from_file("configs/mini_imagenet.yaml")?;
/// let mut trainer = Trainer::new(config)?;
/// let summary = trainer.train()?;
/// println!("best accuracy {:.2} %", summary.best_accuracy);
/// # Ok(())
/// # }
/// ```
pub struct Trainer {
    config: MetaOptConfig,
    device: Device,
    model: FewShotModel,
    optimizer: NesterovSgd,
    scheduler: LRScheduler,
    train_sampler: EpisodeSampler,
    val_sampler: EpisodeSampler,
    centers: Option<Tensor>,
    checkpoints: CheckpointManager,
    log: TrainLog,
}

impl Trainer {
    /// Create a trainer from configuration, loading data and artifacts from
    /// the configured paths.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or any dataset or
    /// artifact file is missing or malformed.
    pub fn new(config: MetaOptConfig) -> Result<Self> {
        config.validate()?;
        let device = config.resolve_device();

        let train = FewShotDataset::load(&config.split_path("train"))?;
        let val = FewShotDataset::load(&config.split_path(config.dataset.val_split()))?;
        let reference = if config.embedding.refine_with_basis {
            let spec = config.dataset.reference().ok_or_else(|| {
                MetaOptError::config(format!(
                    "dataset {} has no reference set",
                    config.dataset.dir_name()
                ))
            })?;
            Some(ReferenceArtifacts::load(
                &config.artifacts_dir(),
                &spec,
                &Device::Cpu,
            )?)
        } else {
            None
        };
        Self::from_parts(config, device, train, val, reference)
    }

    /// Create a trainer from already loaded data.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the model,
    /// samplers or output directory cannot be set up.
    pub fn from_parts(
        config: MetaOptConfig,
        device: Device,
        train: FewShotDataset,
        val: FewShotDataset,
        reference: Option<ReferenceArtifacts>,
    ) -> Result<Self> {
        config.validate()?;
        let model = FewShotModel::build(&config, train.in_channels(), reference.as_ref(), &device)?;
        if let Some(path) = &config.pretrained {
            model.load_pretrained(Path::new(path))?;
        }

        let optimizer = NesterovSgd::from_varmaps(&model.varmaps(), ParamsSgd::from(&config.training))?;
        tracing::info!(
            "Initialized SGD with lr={}, momentum={}, {} parameters",
            config.training.lr,
            config.training.momentum,
            optimizer.parameter_count()
        );
        let scheduler = LRScheduler::new(config.lr_schedule()?, config.training.lr);

        let train_sampler = EpisodeSampler::new(
            Arc::new(train),
            EpisodeShape::train(&config),
            config.episodes.episodes_per_batch,
        )?;
        let val_sampler = EpisodeSampler::new(Arc::new(val), EpisodeShape::validation(&config), 1)?;
        let centers = reference
            .map(|r| r.centers_raw.to_device(&device))
            .transpose()?;

        let checkpoints = CheckpointManager::new(&config.save_path)?;
        let log = TrainLog::open(Path::new(&config.save_path))?;
        config.to_file(Path::new(&config.save_path).join("config.yaml"))?;

        Ok(Self {
            config,
            device,
            model,
            optimizer,
            scheduler,
            train_sampler,
            val_sampler,
            centers,
            checkpoints,
            log,
        })
    }

    /// The model being trained.
    #[must_use]
    pub fn model(&self) -> &FewShotModel {
        &self.model
    }

    /// Run every epoch.
    ///
    /// # Errors
    ///
    /// Any error inside an iteration ends the run and is returned.
    pub fn train(&mut self) -> Result<TrainingSummary> {
        let num_epoch = self.config.training.num_epoch;
        let num_batch = self.config.episodes.num_batch;
        let print_every = self.config.training.print_every;

        self.log.log_header(&self.config)?;
        let timer = Timer::new();
        let mut validations = Vec::new();

        for epoch in 1..=num_epoch {
            let lr = self.scheduler.step_epoch(epoch, &mut self.optimizer);
            self.log
                .log(&format!("Train Epoch: {epoch}\tLearning Rate: {lr:.4}"))?;

            let pb = ProgressBar::new(num_batch as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}")?
                    .progress_chars("#>-"),
            );

            let mut stats = RunningStats::new();
            let loader = EpisodeLoader::new(
                self.train_sampler.clone(),
                self.config.seed,
                epoch,
                num_batch,
                self.config.episodes.num_workers,
            );
            for (i, batch) in (1..).zip(loader) {
                let episode = batch?.to_device(&self.device)?;
                let (loss, acc) = self.train_step(&episode)?;
                stats.push(loss, acc);
                pb.set_message(format!("{loss:.4}"));
                pb.inc(1);

                if i % print_every == 0 {
                    let (train_acc, _) = stats.accuracy_ci95();
                    self.log.log(&format!(
                        "Train Epoch: {epoch}\tBatch: [{i}/{num_batch}]\tLoss: {loss:.4}\tAccuracy: {:.2} % ({:.2} %)",
                        train_acc * 100.0,
                        acc * 100.0
                    ))?;

                    let record = self.validate(epoch, i)?;
                    validations.push(record);

                    self.log.log(&format!(
                        "Elapsed Time: {}/{}\n",
                        timer.measure(),
                        timer.estimate(epoch as f64 / num_epoch as f64)
                    ))?;
                }
            }
            pb.finish_and_clear();
        }

        let summary = TrainingSummary {
            epochs: num_epoch,
            best_accuracy: self.checkpoints.best_accuracy(),
            validations,
        };
        let summary_path = Path::new(&self.config.save_path).join("summary.json");
        std::fs::write(&summary_path, serde_json::to_string_pretty(&summary)?)?;
        tracing::info!(
            "Training complete, best accuracy {:.2} %",
            summary.best_accuracy
        );
        Ok(summary)
    }

    /// One optimization step on a batch of episodes; returns the loss and
    /// the accuracy fraction.
    ///
    /// Refreshes the basis, computes the smoothed loss, steps the optimizer
    /// and clamps the bounded parameters, in that order.
    ///
    /// # Errors
    ///
    /// Returns [`MetaOptError::Training`] for a non-finite loss, or any error
    /// from the forward or backward pass.
    pub fn train_step(&mut self, episode: &Episode) -> Result<(f64, f64)> {
        if let Some(centers) = &self.centers {
            self.model.embedding.refresh_basis(centers, Mode::Training)?;
        }
        let way = episode.shape.way;
        let logits = self
            .model
            .episode_logits(episode, Mode::Training)?
            .reshape(((), way))?;
        let labels = episode.query_labels.flatten_all()?;

        let loss = smoothed_cross_entropy(&logits, &labels, self.config.training.eps)?;
        let acc = accuracy(&logits, &labels)?;
        let loss_value = f64::from(loss.to_scalar::<f32>()?);
        if !loss_value.is_finite() {
            return Err(MetaOptError::Training(format!(
                "non-finite training loss {loss_value}"
            )));
        }

        self.optimizer.backward_step(&loss)?;
        self.model.clamp_bounded()?;
        Ok((loss_value, acc))
    }

    /// Validation pass over `val_episode` single-episode batches.
    ///
    /// Writes checkpoints and the validation log line.
    ///
    /// # Errors
    ///
    /// Returns an error if an episode or checkpoint fails.
    pub fn validate(&mut self, epoch: usize, iteration: usize) -> Result<ValidationRecord> {
        if !self.config.training.freeze_basis_for_eval {
            if let Some(centers) = &self.centers {
                self.model.embedding.refresh_basis(centers, Mode::Evaluation)?;
            }
        }

        let loader = EpisodeLoader::new(
            self.val_sampler.clone(),
            self.config.seed,
            epoch,
            self.config.episodes.val_episode,
            0,
        );
        let mut stats = RunningStats::new();
        for batch in loader {
            let episode = batch?.to_device(&self.device)?;
            let way = episode.shape.way;
            let logits = self
                .model
                .episode_logits(&episode, Mode::Evaluation)?
                .detach()
                .reshape(((), way))?;
            let labels = episode.query_labels.flatten_all()?;
            let loss = cross_entropy(&logits, &labels)?.to_scalar::<f32>()?;
            stats.push(f64::from(loss), accuracy(&logits, &labels)? * 100.0);
        }

        let (acc, ci95) = stats.accuracy_ci95();
        let loss = stats.mean_loss();
        let best = self.checkpoints.after_validation(
            &self.model,
            acc,
            epoch,
            self.config.training.save_epoch,
        )?;
        let suffix = if best { " (Best)" } else { "" };
        self.log.log(&format!(
            "Validation Epoch: {epoch}\t\t\tLoss: {loss:.4}\tAccuracy: {acc:.2} ± {ci95:.2} %{suffix}"
        ))?;

        Ok(ValidationRecord {
            epoch,
            iteration,
            loss,
            accuracy: acc,
            ci95,
            best,
        })
    }
}
