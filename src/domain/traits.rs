// ============================================================
// Layer 3 — Core Traits (Abstractions)
// ============================================================
// Two seams keep the layers apart:
//   - ImageSource    → where labelled images come from
//                      (CIFAR-10 batches, MNIST IDX, a folder tree)
//   - ImagePredictor → anything that turns an image into a
//                      Prediction (the burn model, or a stub
//                      in the HTTP tests)
//
// The application and serving layers only see these traits.
//
// Reference: Rust Book §10 (Traits: Defining Shared Behaviour)

use anyhow::Result;

use crate::domain::{
    image::{LabeledImage, RawImage, Split},
    prediction::{ModelInfo, Prediction},
};

// ─── ImageSource ──────────────────────────────────────────────────────────────
/// A dataset on disk that can produce labelled images per split.
pub trait ImageSource {
    /// Short dataset identifier, e.g. "cifar10"
    fn name(&self) -> &str;

    /// Class names indexed by label.
    fn classes(&self) -> Result<Vec<String>>;

    /// Load every sample of the given split.
    fn load(&self, split: Split) -> Result<Vec<LabeledImage>>;
}

// ─── ImagePredictor ───────────────────────────────────────────────────────────
/// Classifies decoded images.
pub trait ImagePredictor: Send + Sync {
    fn predict(&self, image: &RawImage) -> Result<Prediction>;

    fn classes(&self) -> &[String];

    fn info(&self) -> ModelInfo;
}
