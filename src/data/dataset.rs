// ============================================================
// Layer 4 — Image Dataset
// ============================================================
// Wraps labelled images in Burn's Dataset trait and assembles
// the three splits used by a training run:
//
//   train split on disk ──split_train_val──▶ train + val
//   test split on disk  ─────────────────▶ test
//
// The loader is picked from the configured dataset name.
//
// Reference: Burn Book §4 (Datasets and Dataloaders)

use anyhow::{bail, Result};
use burn::data::dataset::Dataset;

use crate::config::{DataConfig, DatasetName};
use crate::data::{
    cifar10::Cifar10Source,
    image_folder::ImageFolderSource,
    mnist::MnistSource,
    splitter::split_train_val,
};
use crate::domain::{
    image::{LabeledImage, Split},
    traits::ImageSource,
};

pub struct ImageDataset {
    samples: Vec<LabeledImage>,
}

impl ImageDataset {
    pub fn new(samples: Vec<LabeledImage>) -> Self { Self { samples } }

    pub fn labels(&self) -> Vec<usize> {
        self.samples.iter().map(|s| s.label).collect()
    }
}

impl Dataset<LabeledImage> for ImageDataset {
    fn get(&self, index: usize) -> Option<LabeledImage> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// Everything a training run reads from disk.
pub struct DataSplits {
    pub train:   ImageDataset,
    pub val:     ImageDataset,
    pub test:    ImageDataset,
    pub classes: Vec<String>,
}

/// Pick the on-disk reader for the configured dataset.
pub fn source_for(cfg: &DataConfig) -> Box<dyn ImageSource> {
    match cfg.name {
        DatasetName::Cifar10     => Box::new(Cifar10Source::new(&cfg.data_dir)),
        DatasetName::Mnist       => Box::new(MnistSource::new(&cfg.data_dir)),
        DatasetName::ImageFolder => Box::new(ImageFolderSource::new(
            &cfg.data_dir, cfg.input_channels, cfg.image_size,
        )),
    }
}

/// Load train/val/test for `cfg`, splitting validation off with `seed`.
pub fn load_splits(cfg: &DataConfig, seed: u64) -> Result<DataSplits> {
    load_splits_from(source_for(cfg).as_ref(), cfg.val_split, seed)
}

pub fn load_splits_from(source: &dyn ImageSource, val_split: f64, seed: u64) -> Result<DataSplits> {
    let classes   = source.classes()?;
    let train_all = source.load(Split::Train)?;
    let test      = source.load(Split::Test)?;

    for sample in train_all.iter().chain(test.iter()) {
        if sample.label >= classes.len() {
            bail!(
                "{}: label {} outside the {} known classes",
                source.name(), sample.label, classes.len()
            );
        }
    }

    let (train, val) = split_train_val(train_all, val_split, seed);
    tracing::info!(
        "Dataset {}: train={} val={} test={} classes={}",
        source.name(), train.len(), val.len(), test.len(), classes.len()
    );

    Ok(DataSplits {
        train: ImageDataset::new(train),
        val:   ImageDataset::new(val),
        test:  ImageDataset::new(test),
        classes,
    })
}
