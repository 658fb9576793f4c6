//! Few-shot datasets, episode sampling and batch loading.
//!
//! A dataset split is a safetensors file with an `images` tensor `[N, ...]`
//! and a `labels` tensor `[N]`. Episodes are drawn from it by
//! [`EpisodeSampler`] and delivered by [`EpisodeLoader`], either inline or
//! from a background producer thread.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;

use candle_core::{DType, Device, Tensor};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::config::MetaOptConfig;
use crate::error::{MetaOptError, Result};

/// Number of classes, support items and query items of one episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpisodeShape {
    /// Classes per episode.
    pub way: usize,
    /// Support items per class.
    pub shot: usize,
    /// Query items per class.
    pub num_query: usize,
}

impl EpisodeShape {
    /// Training episode shape.
    #[must_use]
    pub fn train(config: &MetaOptConfig) -> Self {
        Self {
            way: config.episodes.train_way,
            shot: config.episodes.train_shot,
            num_query: config.episodes.train_query,
        }
    }

    /// Validation episode shape.
    #[must_use]
    pub fn validation(config: &MetaOptConfig) -> Self {
        Self {
            way: config.episodes.test_way,
            shot: config.episodes.val_shot,
            num_query: config.episodes.val_query,
        }
    }

    /// Support items per episode.
    #[must_use]
    pub fn n_support(&self) -> usize {
        self.way * self.shot
    }

    /// Query items per episode.
    #[must_use]
    pub fn n_query(&self) -> usize {
        self.way * self.num_query
    }
}

/// A batch of episodes sharing one shape.
///
/// Inputs are `[E, n, ...]`, labels `[E, n]` (u32), with labels re-indexed
/// into `[0, way)` independently per episode.
#[derive(Debug, Clone)]
pub struct Episode {
    /// Support inputs `[E, way * shot, ...]`.
    pub support_inputs: Tensor,
    /// Support labels `[E, way * shot]`.
    pub support_labels: Tensor,
    /// Query inputs `[E, way * num_query, ...]`.
    pub query_inputs: Tensor,
    /// Query labels `[E, way * num_query]`.
    pub query_labels: Tensor,
    /// Shape shared by every episode of the batch.
    pub shape: EpisodeShape,
}

impl Episode {
    /// Number of episodes in the batch.
    #[must_use]
    pub fn num_episodes(&self) -> usize {
        self.support_inputs.dims().first().copied().unwrap_or(0)
    }

    /// Check sizes and label ranges of every episode.
    ///
    /// # Errors
    ///
    /// Returns [`MetaOptError::ShapeMismatch`] for wrong sizes and
    /// [`MetaOptError::Dataset`] for out-of-range or unbalanced labels.
    pub fn validate(&self) -> Result<()> {
        let e = self.num_episodes();
        let shape = self.shape;
        for (name, inputs, labels, per_class) in [
            ("support", &self.support_inputs, &self.support_labels, shape.shot),
            ("query", &self.query_inputs, &self.query_labels, shape.num_query),
        ] {
            let n = shape.way * per_class;
            let dims = inputs.dims();
            if dims.len() < 3 || dims[0] != e || dims[1] != n {
                return Err(MetaOptError::shape_mismatch(
                    format!("{name} inputs [{e}, {n}, ...]"),
                    format!("{dims:?}"),
                ));
            }
            if labels.dims() != [e, n] {
                return Err(MetaOptError::shape_mismatch(
                    format!("{name} labels [{e}, {n}]"),
                    format!("{:?}", labels.dims()),
                ));
            }
            for (i, row) in labels.to_dtype(DType::U32)?.to_vec2::<u32>()?.iter().enumerate() {
                let mut counts = vec![0usize; shape.way];
                for &label in row {
                    let slot = counts.get_mut(label as usize).ok_or_else(|| {
                        MetaOptError::Dataset(format!(
                            "episode {i}: {name} label {label} outside [0, {})",
                            shape.way
                        ))
                    })?;
                    *slot += 1;
                }
                if counts.iter().any(|&c| c != per_class) {
                    return Err(MetaOptError::Dataset(format!(
                        "episode {i}: {name} class counts {counts:?}, expected {per_class} each"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Copy every tensor to `device`.
    ///
    /// # Errors
    ///
    /// Returns an error if a copy fails.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            support_inputs: self.support_inputs.to_device(device)?,
            support_labels: self.support_labels.to_device(device)?,
            query_inputs: self.query_inputs.to_device(device)?,
            query_labels: self.query_labels.to_device(device)?,
            shape: self.shape,
        })
    }
}

/// One labeled split held in host memory.
#[derive(Debug)]
pub struct FewShotDataset {
    images: Tensor,
    by_class: BTreeMap<u32, Vec<u32>>,
}

impl FewShotDataset {
    /// Load a split from a safetensors file with `images` and `labels`.
    ///
    /// # Errors
    ///
    /// Returns [`MetaOptError::Dataset`] if the file is missing or malformed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(MetaOptError::Dataset(format!(
                "dataset file not found: {}",
                path.display()
            )));
        }
        let mut tensors = candle_core::safetensors::load(path, &Device::Cpu).map_err(|e| {
            MetaOptError::Dataset(format!("failed to read {}: {e}", path.display()))
        })?;
        let images = tensors.remove("images").ok_or_else(|| {
            MetaOptError::Dataset(format!("{} has no 'images' tensor", path.display()))
        })?;
        let labels = tensors.remove("labels").ok_or_else(|| {
            MetaOptError::Dataset(format!("{} has no 'labels' tensor", path.display()))
        })?;
        let dataset = Self::from_tensors(images, &labels)?;
        tracing::info!(
            "Loaded {} examples in {} classes from {}",
            dataset.len(),
            dataset.num_classes(),
            path.display()
        );
        Ok(dataset)
    }

    /// Build a split from in-memory tensors.
    ///
    /// # Errors
    ///
    /// Returns [`MetaOptError::Dataset`] if the label count differs from the
    /// number of images.
    pub fn from_tensors(images: Tensor, labels: &Tensor) -> Result<Self> {
        let images = images.to_device(&Device::Cpu)?.to_dtype(DType::F32)?;
        let labels = labels.to_device(&Device::Cpu)?.to_dtype(DType::U32)?.to_vec1::<u32>()?;
        let n = images.dims().first().copied().unwrap_or(0);
        if images.rank() < 2 || labels.len() != n {
            return Err(MetaOptError::Dataset(format!(
                "images {:?} do not match {} labels",
                images.dims(),
                labels.len()
            )));
        }
        let mut by_class: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        for (i, label) in labels.into_iter().enumerate() {
            by_class.entry(label).or_default().push(i as u32);
        }
        Ok(Self { images, by_class })
    }

    /// Number of examples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.images.dims()[0]
    }

    /// Whether the split has no examples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of distinct classes.
    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.by_class.len()
    }

    /// Shape of one example.
    #[must_use]
    pub fn sample_dims(&self) -> &[usize] {
        &self.images.dims()[1..]
    }

    /// Channel count of image examples `[c, h, w]`, 1 for anything else.
    #[must_use]
    pub fn in_channels(&self) -> usize {
        match self.sample_dims() {
            [c, _, _] => *c,
            _ => 1,
        }
    }

    fn gather(&self, indices: Vec<u32>, lead: (usize, usize)) -> Result<Tensor> {
        let count = indices.len();
        let idx = Tensor::from_vec(indices, count, &Device::Cpu)?;
        let mut dims = vec![lead.0, lead.1];
        dims.extend_from_slice(self.sample_dims());
        Ok(self.images.index_select(&idx, 0)?.reshape(dims)?)
    }
}

/// Draws batches of N-way K-shot episodes from a dataset.
#[derive(Debug, Clone)]
pub struct EpisodeSampler {
    dataset: Arc<FewShotDataset>,
    shape: EpisodeShape,
    episodes_per_batch: usize,
}

impl EpisodeSampler {
    /// Create a sampler.
    ///
    /// # Errors
    ///
    /// Returns [`MetaOptError::Dataset`] if the dataset has fewer than `way`
    /// classes.
    pub fn new(
        dataset: Arc<FewShotDataset>,
        shape: EpisodeShape,
        episodes_per_batch: usize,
    ) -> Result<Self> {
        if dataset.num_classes() < shape.way {
            return Err(MetaOptError::Dataset(format!(
                "{}-way episodes need {} classes, dataset has {}",
                shape.way,
                shape.way,
                dataset.num_classes()
            )));
        }
        Ok(Self {
            dataset,
            shape,
            episodes_per_batch,
        })
    }

    /// Episode shape.
    #[must_use]
    pub fn shape(&self) -> EpisodeShape {
        self.shape
    }

    /// Sample one batch.
    ///
    /// # Errors
    ///
    /// Returns [`MetaOptError::Dataset`] if a drawn class has fewer than
    /// `shot + num_query` examples.
    pub fn sample_batch(&self, rng: &mut ChaCha8Rng) -> Result<Episode> {
        let EpisodeShape {
            way,
            shot,
            num_query,
        } = self.shape;
        let e = self.episodes_per_batch;
        let classes: Vec<u32> = self.dataset.by_class.keys().copied().collect();

        let mut support_idx = Vec::with_capacity(e * way * shot);
        let mut support_lbl = Vec::with_capacity(e * way * shot);
        let mut query_idx = Vec::with_capacity(e * way * num_query);
        let mut query_lbl = Vec::with_capacity(e * way * num_query);

        for _ in 0..e {
            let mut support: Vec<(u32, u32)> = Vec::with_capacity(way * shot);
            let mut query: Vec<(u32, u32)> = Vec::with_capacity(way * num_query);
            for (new_label, class) in classes.choose_multiple(rng, way).enumerate() {
                let members = &self.dataset.by_class[class];
                if members.len() < shot + num_query {
                    return Err(MetaOptError::Dataset(format!(
                        "class {class} has {} examples, episodes need {}",
                        members.len(),
                        shot + num_query
                    )));
                }
                let picked: Vec<u32> = members
                    .choose_multiple(rng, shot + num_query)
                    .copied()
                    .collect();
                let label = new_label as u32;
                support.extend(picked[..shot].iter().map(|&i| (i, label)));
                query.extend(picked[shot..].iter().map(|&i| (i, label)));
            }
            support.shuffle(rng);
            query.shuffle(rng);
            support_idx.extend(support.iter().map(|p| p.0));
            support_lbl.extend(support.iter().map(|p| p.1));
            query_idx.extend(query.iter().map(|p| p.0));
            query_lbl.extend(query.iter().map(|p| p.1));
        }

        let n_s = way * shot;
        let n_q = way * num_query;
        Ok(Episode {
            support_inputs: self.dataset.gather(support_idx, (e, n_s))?,
            support_labels: Tensor::from_vec(support_lbl, (e, n_s), &Device::Cpu)?,
            query_inputs: self.dataset.gather(query_idx, (e, n_q))?,
            query_labels: Tensor::from_vec(query_lbl, (e, n_q), &Device::Cpu)?,
            shape: self.shape,
        })
    }
}

/// Per-epoch stream of validated episode batches.
///
/// The stream for epoch `k` is determined by `seed + k` whether it is
/// produced inline or by the background worker.
pub struct EpisodeLoader {
    source: Source,
    remaining: usize,
}

enum Source {
    Inline {
        sampler: EpisodeSampler,
        rng: ChaCha8Rng,
    },
    Background {
        receiver: Option<Receiver<Result<Episode>>>,
        worker: Option<JoinHandle<()>>,
    },
}

impl EpisodeLoader {
    /// Start loading `num_batches` batches for `epoch`.
    ///
    /// `num_workers == 0` samples on the calling thread. Otherwise a producer
    /// thread keeps up to `num_workers` batches buffered ahead.
    #[must_use]
    pub fn new(
        sampler: EpisodeSampler,
        seed: u64,
        epoch: usize,
        num_batches: usize,
        num_workers: usize,
    ) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(epoch as u64));
        let source = if num_workers == 0 {
            Source::Inline { sampler, rng }
        } else {
            let (sender, receiver) = sync_channel(num_workers);
            let worker = std::thread::spawn(move || {
                let mut rng = rng;
                for _ in 0..num_batches {
                    let batch = sampler.sample_batch(&mut rng).and_then(|b| {
                        b.validate()?;
                        Ok(b)
                    });
                    let failed = batch.is_err();
                    if sender.send(batch).is_err() || failed {
                        break;
                    }
                }
            });
            Source::Background {
                receiver: Some(receiver),
                worker: Some(worker),
            }
        };
        Self {
            source,
            remaining: num_batches,
        }
    }

    /// Batches not yet delivered.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

impl Iterator for EpisodeLoader {
    type Item = Result<Episode>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        match &mut self.source {
            Source::Inline { sampler, rng } => Some(sampler.sample_batch(rng).and_then(|b| {
                b.validate()?;
                Ok(b)
            })),
            Source::Background { receiver, .. } => {
                let received = receiver.as_ref().and_then(|r| r.recv().ok());
                if received.is_none() {
                    self.remaining = 0;
                    return Some(Err(MetaOptError::Dataset(
                        "episode worker stopped early".into(),
                    )));
                }
                received
            }
        }
    }
}

impl Drop for EpisodeLoader {
    fn drop(&mut self) {
        if let Source::Background { receiver, worker } = &mut self.source {
            // Unblocks a producer waiting on a full channel.
            receiver.take();
            if let Some(handle) = worker.take() {
                if handle.join().is_err() {
                    tracing::warn!("episode worker panicked");
                }
            }
        }
    }
}
