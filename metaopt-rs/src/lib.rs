//! # metaopt-rs
//!
//! Episodic meta-learning for few-shot image classification.
//!
//! An embedding network is trained jointly with a differentiable base
//! learner. Each iteration samples a batch of N-way K-shot episodes, fits
//! the base learner on the support embeddings, and back-propagates the query
//! loss through that fit into the embedding.
//!
//! ## Features
//!
//! - **Base learners** - prototypes, ridge regression, R2D2 and a relaxed
//!   Crammer-Singer SVM, all built from differentiable tensor ops
//! - **Backbones** - four-block conv net, R2D2 conv net, ResNet-12, identity
//! - **Basis refinement** - features filtered through an auxiliary basis
//!   recomputed from a fixed reference set every iteration
//! - **YAML configuration** with dataset presets
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a config for a dataset preset
//! metaopt init config.yaml --dataset cifar_fs
//!
//! # Validate it
//! metaopt validate config.yaml
//!
//! # Train
//! metaopt train config.yaml
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use metaopt_rs::{MetaOptConfig, Trainer};
//!
//! # fn main() -> metaopt_rs::Result<()> {
//! let config = MetaOptConfig::from_file("config.yaml")?;
//! let mut trainer = Trainer::new(config)?;
//! trainer.train()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Using Presets
//!
//! ```rust
//! use metaopt_rs::MetaOptConfig;
//! use metaopt_rs::config::HeadKind;
//!
//! # fn main() -> metaopt_rs::Result<()> {
//! let mut config = MetaOptConfig::from_preset("cifar_fs")?;
//! config.head = HeadKind::Svm;
//! config.episodes.train_shot = 5;
//! config.validate()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checkpoint;
pub mod config;
pub mod embedding;
pub mod episode;
pub mod error;
pub mod head;
pub mod linalg;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;

pub use config::MetaOptConfig;
pub use error::{MetaOptError, Result};
pub use trainer::{Trainer, TrainingSummary};
