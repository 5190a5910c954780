// ============================================================
// Layer 5 — Inferencer
// ============================================================
// Loads a checkpoint for prediction on the CPU backend:
//
//   models/simple_cnn_best.json  → CheckpointMeta
//                                   (architecture, classes, data
//                                    settings used in training)
//   models/simple_cnn_best.mpk   → weights for that architecture
//
// predict(image):
//   decode → resize to image_size → [0,1] → normalise
//   → forward → softmax → Prediction (probabilities ranked)
//
// The model sits behind a Mutex so one Predictor can be shared
// by every request handler.

use anyhow::{anyhow, Context, Result};
use burn::{
    backend::{ndarray::NdArrayDevice, NdArray},
    prelude::*,
    tensor::activation::softmax,
};
use std::{path::Path, sync::Mutex};

use crate::data::transform::ImageTransform;
use crate::domain::{
    image::RawImage,
    prediction::{ModelInfo, Prediction},
    traits::ImagePredictor,
};
use crate::infra::checkpoint::{checkpoint_stem, load_meta, load_weights, CheckpointMeta};
use crate::config::ModelName;
use crate::ml::model::{resnet_config, simple_cnn_config, AnyClassifier, ImageClassifier};

type InferBackend = NdArray;

pub struct Predictor {
    model:      Mutex<AnyClassifier<InferBackend>>,
    transform:  ImageTransform,
    meta:       CheckpointMeta,
    num_params: usize,
    device:     NdArrayDevice,
}

impl Predictor {
    /// Rebuild the architecture recorded in the checkpoint and load its weights.
    pub fn from_checkpoint(path: &Path) -> Result<Self> {
        let stem   = checkpoint_stem(path);
        let meta   = load_meta(&stem)?;
        let device = NdArrayDevice::default();
        let n      = meta.classes.len();

        let model = match meta.model_name {
            ModelName::SimpleCnn => AnyClassifier::SimpleCnn(load_weights(
                simple_cnn_config(&meta.config, n).init::<InferBackend>(&device),
                &stem,
                &device,
            )?),
            ModelName::Resnet => AnyClassifier::ResNet(load_weights(
                resnet_config(&meta.config, n).init::<InferBackend>(&device),
                &stem,
                &device,
            )?),
        };
        let num_params = model.num_params();

        tracing::info!(
            "Loaded {} from '{}' (epoch {}, val_acc={:.4}, {} classes)",
            meta.model_name.as_str(), stem.display(), meta.epoch, meta.val_acc, n
        );

        Ok(Self {
            model: Mutex::new(model),
            transform: ImageTransform::for_eval(&meta.config.data),
            meta,
            num_params,
            device,
        })
    }

    pub fn meta(&self) -> &CheckpointMeta {
        &self.meta
    }

    /// Softmax rows for a batch of images, one row per image.
    pub fn probabilities(&self, images: &[RawImage]) -> Result<Vec<Vec<f32>>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }
        let (c, s) = (self.meta.config.data.input_channels, self.meta.config.data.image_size);

        let mut flat = Vec::with_capacity(images.len() * self.transform.output_len());
        for img in images {
            flat.extend(self.transform.apply_eval(img)?);
        }
        let input = Tensor::<InferBackend, 1>::from_floats(flat.as_slice(), &self.device)
            .reshape([images.len(), c, s, s]);

        let logits = {
            let model = self.model.lock().map_err(|_| anyhow!("Model lock poisoned"))?;
            model.forward(input)
        };
        let n_classes = self.meta.classes.len().max(1);
        let probs = softmax(logits, 1)
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| anyhow!("Cannot read model output: {e:?}"))?;

        Ok(probs.chunks(n_classes).map(<[f32]>::to_vec).collect())
    }

    pub fn predict_batch(&self, images: &[RawImage]) -> Result<Vec<Prediction>> {
        self.probabilities(images)?
            .iter()
            .map(|row| {
                Prediction::from_probabilities(row, &self.meta.classes)
                    .context("Model output does not match the class list")
            })
            .collect()
    }
}

impl ImagePredictor for Predictor {
    fn predict(&self, image: &RawImage) -> Result<Prediction> {
        self.predict_batch(std::slice::from_ref(image))?
            .pop()
            .context("Model produced no output")
    }

    fn classes(&self) -> &[String] {
        &self.meta.classes
    }

    fn info(&self) -> ModelInfo {
        let data = &self.meta.config.data;
        ModelInfo {
            model_name:     self.meta.model_name.as_str().to_string(),
            dataset:        data.name.as_str().to_string(),
            classes:        self.meta.classes.clone(),
            num_classes:    self.meta.classes.len(),
            input_channels: data.input_channels,
            image_size:     data.image_size,
            num_params:     self.num_params,
            device:         "cpu".to_string(),
            epoch:          self.meta.epoch,
            val_acc:        self.meta.val_acc,
        }
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, DatasetName};
    use crate::infra::checkpoint::CheckpointManager;
    use crate::ml::model::SimpleCnn;

    fn saved_checkpoint(dir: &Path, model_name: ModelName) -> std::path::PathBuf {
        let mut cfg = AppConfig::with_presets(DatasetName::Cifar10, model_name);
        cfg.data.image_size = 16;
        let classes: Vec<String> = ["plane", "car", "bird"].iter().map(|s| s.to_string()).collect();
        let device  = NdArrayDevice::default();
        let manager = CheckpointManager::new(dir).unwrap();
        let stem    = manager.best_stem(model_name);
        let meta    = CheckpointMeta { model_name, epoch: 3, val_acc: 0.5, classes: classes.clone(), config: cfg.clone() };

        match model_name {
            ModelName::SimpleCnn => {
                let m: SimpleCnn<InferBackend> = simple_cnn_config(&cfg, 3).init(&device);
                manager.save::<InferBackend, _>(&m, &stem, &meta).unwrap()
            }
            ModelName::Resnet => {
                let m = resnet_config(&cfg, 3).init::<InferBackend>(&device);
                manager.save::<InferBackend, _>(&m, &stem, &meta).unwrap()
            }
        }
    }

    fn image(w: usize, h: usize) -> RawImage {
        RawImage::new(3, h, w, (0..3 * w * h).map(|i| (i % 251) as u8).collect()).unwrap()
    }

    #[test]
    fn test_predict_from_checkpoint() {
        let tmp  = tempfile::tempdir().unwrap();
        let path = saved_checkpoint(tmp.path(), ModelName::SimpleCnn);

        let predictor  = Predictor::from_checkpoint(&path).unwrap();
        // any input size is resized to the trained image size
        let prediction = predictor.predict(&image(40, 25)).unwrap();

        assert_eq!(prediction.all_probabilities.len(), 3);
        let total: f32 = prediction.all_probabilities.iter().map(|p| p.probability).sum();
        assert!((total - 1.0).abs() < 1e-4);
        assert_eq!(prediction.all_probabilities[0].class_name, prediction.predicted_class);
    }

    #[test]
    fn test_resnet_batch_and_info() {
        let tmp  = tempfile::tempdir().unwrap();
        let path = saved_checkpoint(tmp.path(), ModelName::Resnet);

        let predictor = Predictor::from_checkpoint(&path).unwrap();
        let preds     = predictor.predict_batch(&[image(16, 16), image(8, 8)]).unwrap();
        assert_eq!(preds.len(), 2);

        let info = predictor.info();
        assert_eq!(info.model_name, "resnet");
        assert_eq!(info.dataset, "cifar10");
        assert_eq!(info.epoch, 3);
        assert_eq!(info.image_size, 16);
        assert!(info.num_params > 0);
    }

    #[test]
    fn test_missing_checkpoint_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(Predictor::from_checkpoint(&tmp.path().join("nothing_best")).is_err());
    }
}
