//! Synthetic datasets and reference artifacts shared by integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use metaopt_rs::config::{DatasetKind, HeadKind, Network, ReferenceSpec};
use metaopt_rs::embedding::ReferenceArtifacts;
use metaopt_rs::MetaOptConfig;

/// Feature dimension of the synthetic data.
pub const DIM: usize = 4;

/// Well separated clusters: class `c < 4` sits at `+3 e_c`, class `c >= 4`
/// at `-3 e_{c-4}`, with small deterministic jitter.
pub fn cluster_features(classes: usize, per_class: usize) -> (Tensor, Tensor) {
    let mut values = Vec::with_capacity(classes * per_class * DIM);
    let mut labels = Vec::with_capacity(classes * per_class);
    for c in 0..classes {
        let (axis, sign) = if c < DIM { (c, 3.0) } else { (c - DIM, -3.0) };
        for i in 0..per_class {
            for k in 0..DIM {
                let jitter = 0.05 * (((i * 7 + k * 3) % 5) as f32 - 2.0);
                let base = if k == axis { sign } else { 0.0 };
                values.push(base + jitter);
            }
            labels.push(c as u32);
        }
    }
    let n = classes * per_class;
    let images = Tensor::from_vec(values, (n, DIM), &Device::Cpu).unwrap();
    let labels = Tensor::from_vec(labels, n, &Device::Cpu).unwrap();
    (images, labels)
}

/// Write `<root>/<dataset>/<split>.safetensors`.
pub fn write_split(root: &Path, dataset: DatasetKind, split: &str, classes: usize, per_class: usize) {
    let dir = root.join(dataset.dir_name());
    std::fs::create_dir_all(&dir).unwrap();
    let (images, labels) = cluster_features(classes, per_class);
    let tensors = HashMap::from([
        ("images".to_string(), images),
        ("labels".to_string(), labels),
    ]);
    candle_core::safetensors::save(&tensors, dir.join(format!("{split}.safetensors"))).unwrap();
}

/// Write reference artifacts matching `spec` for `DIM`-dimensional features.
pub fn write_reference(root: &Path, dataset: DatasetKind, spec: &ReferenceSpec) {
    let (centers, _) = cluster_features(8, spec.num_centers.div_ceil(8));
    let centers = centers.narrow(0, 0, spec.num_centers).unwrap();
    let artifacts = ReferenceArtifacts {
        centers_raw: centers.clone(),
        centers_out: centers,
        excitation: Tensor::zeros((spec.nclass, spec.nclass), DType::F32, &Device::Cpu).unwrap(),
        importance: Tensor::ones((spec.nclass, spec.nclass), DType::F32, &Device::Cpu).unwrap(),
    };
    artifacts.save(&root.join(dataset.dir_name())).unwrap();
}

/// Two short epochs of 3-way 2-shot episodes on identity features.
pub fn tiny_config(root: &Path, dataset: DatasetKind, head: HeadKind) -> MetaOptConfig {
    let mut config = MetaOptConfig::default();
    config.network = Network::Identity;
    config.head = head;
    config.dataset = dataset;
    config.data_root = root.join("data").display().to_string();
    config.artifacts_root = root.join("pre_stores").display().to_string();
    config.save_path = root.join("out").display().to_string();
    config.embedding.refine_with_basis = false;

    let ep = &mut config.episodes;
    ep.train_way = 3;
    ep.test_way = 3;
    ep.train_shot = 2;
    ep.val_shot = 2;
    ep.train_query = 2;
    ep.val_query = 2;
    ep.episodes_per_batch = 2;
    ep.num_batch = 4;
    ep.val_episode = 5;
    ep.num_workers = 1;

    let tr = &mut config.training;
    tr.num_epoch = 2;
    tr.save_epoch = 2;
    tr.print_every = 2;
    tr.lr_epochs = "2".into();
    tr.lr_values = "1.0 0.1".into();

    config.solver.svm_iterations = 10;
    config
}

/// Write train and validation splits for `config`.
pub fn write_splits(root: &Path, config: &MetaOptConfig) {
    let data = root.join("data");
    write_split(&data, config.dataset, "train", 6, 8);
    write_split(&data, config.dataset, config.dataset.val_split(), 5, 8);
}
