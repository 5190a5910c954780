// ============================================================
// Layer 4 — Image Batcher
// ============================================================
// Implements Burn's Batcher trait to turn a Vec<LabeledImage>
// into tensors the model can consume.
//
// How batching works here:
//   Input:  N labelled images (u8, CHW)
//   Output: ImageBatch with
//             images  [N, C, H, W]  f32, normalised
//             targets [N]           int class indices
//
//   Every image runs through the ImageTransform into a flat
//   C*H*W float buffer; the buffers are concatenated and the
//   resulting 1-D tensor reshaped to 4-D.
//
// Augmentation needs randomness but Batcher::batch takes &self,
// so the RNG sits behind Arc<Mutex<..>>. Worker threads share
// it; the stream is seeded from the run seed.
//
// Reference: Burn Book §4 (Batcher)

use burn::{
    data::dataloader::batcher::Batcher,
    prelude::*,
};
use rand::{rngs::StdRng, SeedableRng};
use std::sync::{Arc, Mutex};

use crate::data::transform::ImageTransform;
use crate::domain::image::LabeledImage;

// ─── ImageBatch ───────────────────────────────────────────────────────────────
#[derive(Debug, Clone)]
pub struct ImageBatch<B: Backend> {
    /// Shape: [batch_size, channels, height, width]
    pub images: Tensor<B, 4>,

    /// Shape: [batch_size]
    pub targets: Tensor<B, 1, Int>,
}

// ─── ImageBatcher ─────────────────────────────────────────────────────────────
#[derive(Clone, Debug)]
pub struct ImageBatcher<B: Backend> {
    pub device: B::Device,
    transform:  ImageTransform,
    rng:        Arc<Mutex<StdRng>>,
}

impl<B: Backend> ImageBatcher<B> {
    pub fn new(device: B::Device, transform: ImageTransform, seed: u64) -> Self {
        Self {
            device,
            transform,
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    /// Transform one image into its normalised float buffer.
    ///
    /// Loaders only ever yield 1- or 3-channel images, so the
    /// transform cannot fail in practice; should it, the sample
    /// becomes all zeros rather than aborting the epoch.
    fn pixels(&self, item: &LabeledImage) -> Vec<f32> {
        let result = if self.transform.is_augmenting() {
            let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            self.transform.apply(&item.image, &mut *rng)
        } else {
            self.transform.apply_eval(&item.image)
        };
        result.unwrap_or_else(|e| {
            tracing::warn!("Transform failed, using blank image: {e:#}");
            vec![0.0; self.transform.output_len()]
        })
    }
}

// ─── Burn Batcher Trait Implementation ────────────────────────────────────────
impl<B: Backend> Batcher<LabeledImage, ImageBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<LabeledImage>) -> ImageBatch<B> {
        let batch_size = items.len();
        let (c, s)     = (self.transform.channels, self.transform.size);

        let flat: Vec<f32> = items.iter().flat_map(|item| self.pixels(item)).collect();
        let labels: Vec<i32> = items.iter().map(|item| item.label as i32).collect();

        let images = Tensor::<B, 1>::from_floats(flat.as_slice(), &self.device)
            .reshape([batch_size, c, s, s]);

        let targets = Tensor::<B, 1, Int>::from_ints(labels.as_slice(), &self.device);

        ImageBatch { images, targets }
    }
}
