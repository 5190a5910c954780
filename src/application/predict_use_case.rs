// ============================================================
// Layer 2 — Predict Use Case
// ============================================================
// Single-image inference from the command line:
//   1. Rebuild the model recorded in the checkpoint metadata
//   2. Decode the image with the checkpoint's channel count
//   3. Return the predicted class and every class probability

use anyhow::{Context, Result};
use std::{fs, path::Path};

use crate::data::transform::decode_image;
use crate::domain::{prediction::Prediction, traits::ImagePredictor};
use crate::ml::inferencer::Predictor;

pub struct PredictUseCase {
    predictor: Predictor,
}

impl PredictUseCase {
    pub fn new(checkpoint: &Path) -> Result<Self> {
        let predictor = Predictor::from_checkpoint(checkpoint)?;
        Ok(Self { predictor })
    }

    pub fn predict_file(&self, image_path: &Path) -> Result<Prediction> {
        let bytes = fs::read(image_path)
            .with_context(|| format!("Cannot read image '{}'", image_path.display()))?;
        self.predict_bytes(&bytes)
            .with_context(|| format!("Cannot classify '{}'", image_path.display()))
    }

    pub fn predict_bytes(&self, bytes: &[u8]) -> Result<Prediction> {
        let channels = self.predictor.meta().config.data.input_channels;
        let image    = decode_image(bytes, channels)?;
        self.predictor.predict(&image)
    }

    pub fn predictor(&self) -> &Predictor {
        &self.predictor
    }
}

/// Human-readable prediction, most likely class first.
pub fn format_prediction(p: &Prediction) -> String {
    let mut out = format!(
        "Predicted class: {} (index {})\nConfidence: {:.2}%\n\nAll probabilities:\n",
        p.predicted_class, p.class_index, p.confidence * 100.0
    );
    for c in &p.all_probabilities {
        out.push_str(&format!("  {:<16} {:.4}\n", c.class_name, c.probability));
    }
    out
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, DatasetName, ModelName};
    use crate::infra::checkpoint::{CheckpointManager, CheckpointMeta};
    use crate::ml::model::simple_cnn_config;
    use burn::backend::{ndarray::NdArrayDevice, NdArray};

    fn write_checkpoint(dir: &Path) -> std::path::PathBuf {
        let mut cfg = AppConfig::with_presets(DatasetName::ImageFolder, ModelName::SimpleCnn);
        cfg.data.image_size = 8;
        cfg.data.classes     = vec!["blue".into(), "green".into(), "red".into()];
        cfg.data.num_classes = 3;

        let device  = NdArrayDevice::default();
        let model   = simple_cnn_config(&cfg, 3).init::<NdArray>(&device);
        let manager = CheckpointManager::new(dir).unwrap();
        let stem    = manager.best_stem(ModelName::SimpleCnn);
        let meta    = CheckpointMeta {
            model_name: ModelName::SimpleCnn,
            epoch:      1,
            val_acc:    0.5,
            classes:    cfg.data.classes.clone(),
            config:     cfg,
        };
        manager.save::<NdArray, _>(&model, &stem, &meta).unwrap();
        stem
    }

    #[test]
    fn test_predict_file_returns_sorted_probabilities() {
        let tmp  = tempfile::tempdir().unwrap();
        let stem = write_checkpoint(tmp.path());

        let img_path = tmp.path().join("probe.png");
        image::RgbImage::from_pixel(20, 12, image::Rgb([10, 200, 30])).save(&img_path).unwrap();

        let use_case = PredictUseCase::new(&stem).unwrap();
        let p = use_case.predict_file(&img_path).unwrap();

        assert_eq!(p.all_probabilities.len(), 3);
        assert_eq!(p.all_probabilities[0].class_name, p.predicted_class);
        let total: f32 = p.all_probabilities.iter().map(|c| c.probability).sum();
        assert!((total - 1.0).abs() < 1e-4);
        assert!(format_prediction(&p).contains(&p.predicted_class));
    }

    #[test]
    fn test_non_image_bytes_are_an_error() {
        let tmp  = tempfile::tempdir().unwrap();
        let stem = write_checkpoint(tmp.path());
        let use_case = PredictUseCase::new(&stem).unwrap();
        assert!(use_case.predict_bytes(b"definitely not a png").is_err());
    }

    #[test]
    fn test_missing_image_file_is_an_error() {
        let tmp  = tempfile::tempdir().unwrap();
        let stem = write_checkpoint(tmp.path());
        let use_case = PredictUseCase::new(&stem).unwrap();
        assert!(use_case.predict_file(&tmp.path().join("nope.png")).is_err());
    }
}
