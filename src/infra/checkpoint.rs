// ============================================================
// Layer 6 — Checkpoint Manager
// ============================================================
// A checkpoint is two files sharing one stem:
//
//   models/
//     simple_cnn_best.mpk     ← model parameters (CompactRecorder)
//     simple_cnn_best.json    ← CheckpointMeta: architecture,
//                               epoch, val_acc, class names and
//                               the full AppConfig snapshot
//
// The JSON sidecar is what lets `predict` and `serve` rebuild
// the exact architecture (model name, channels, image size,
// number of classes) before loading the weights into it.
//
// Paths handed in by users may name the stem, the weights file
// or the JSON file; `checkpoint_stem` normalises all three.
//
// Reference: Burn Book §5 (Records and Checkpointing)

use anyhow::{Context, Result};
use burn::{
    prelude::*,
    record::{CompactRecorder, FileRecorder, Recorder},
};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::config::{AppConfig, ModelName};

/// Everything stored next to the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub model_name: ModelName,
    pub epoch:      usize,
    pub val_acc:    f64,
    pub classes:    Vec<String>,
    pub config:     AppConfig,
}

/// Strip a known checkpoint extension, if any.
pub fn checkpoint_stem(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    for ext in [".mpk.gz", ".mpk", ".json", ".bin"] {
        if let Some(stripped) = s.strip_suffix(ext) {
            return PathBuf::from(stripped);
        }
    }
    path.to_path_buf()
}

fn with_suffix(stem: &Path, ext: &str) -> PathBuf {
    let mut os = stem.as_os_str().to_os_string();
    os.push(".");
    os.push(ext);
    PathBuf::from(os)
}

pub fn meta_path(stem: &Path) -> PathBuf {
    with_suffix(stem, "json")
}

/// Weights file the recorder writes for `stem`.
pub fn weights_path<B: Backend>(stem: &Path) -> PathBuf {
    with_suffix(stem, <CompactRecorder as FileRecorder<B>>::file_extension())
}

/// Manages saving and loading of model checkpoints.
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    /// Create a manager rooted at `dir`, creating it if missing.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Cannot create checkpoint dir '{}'", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stem of the best checkpoint for a model, e.g. models/resnet_best
    pub fn best_stem(&self, model: ModelName) -> PathBuf {
        self.dir.join(format!("{}_best", model.as_str()))
    }

    /// Write weights + metadata. Returns the weights file path.
    pub fn save<B: Backend, M: Module<B>>(
        &self,
        model: &M,
        stem:  &Path,
        meta:  &CheckpointMeta,
    ) -> Result<PathBuf> {
        CompactRecorder::new()
            .record(model.clone().into_record(), stem.to_path_buf())
            .with_context(|| format!("Failed to save checkpoint to '{}'", stem.display()))?;

        let json_path = meta_path(stem);
        fs::write(&json_path, serde_json::to_string_pretty(meta)?)
            .with_context(|| format!("Cannot write '{}'", json_path.display()))?;

        tracing::debug!("Saved checkpoint '{}' (epoch {})", stem.display(), meta.epoch);
        Ok(weights_path::<B>(stem))
    }
}

/// Read the metadata sidecar of a checkpoint.
pub fn load_meta(path: &Path) -> Result<CheckpointMeta> {
    let json_path = meta_path(&checkpoint_stem(path));
    let json = fs::read_to_string(&json_path).with_context(|| {
        format!(
            "Cannot read checkpoint metadata '{}'. Have you trained a model first?",
            json_path.display()
        )
    })?;
    serde_json::from_str(&json)
        .with_context(|| format!("Malformed checkpoint metadata '{}'", json_path.display()))
}

/// Load saved parameters into a model of the matching architecture.
pub fn load_weights<B: Backend, M: Module<B>>(model: M, path: &Path, device: &B::Device) -> Result<M> {
    let stem   = checkpoint_stem(path);
    let record = CompactRecorder::new()
        .load(stem.clone(), device)
        .with_context(|| format!("Cannot load checkpoint weights '{}'", stem.display()))?;
    Ok(model.load_record(record))
}
