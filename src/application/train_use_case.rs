// ============================================================
// Layer 2 — TrainUseCase
// ============================================================
// Orchestrates the full training pipeline in order:
//
//   Step 1: Validate the config           (Layer 0 - config)
//   Step 2: Load train/val/test splits    (Layer 4 - data)
//   Step 3: Start experiment tracking     (Layer 7 - tracking)
//   Step 4: Prepare checkpoints + reports (Layer 6 - infra)
//   Step 5: Run training loop             (Layer 5 - ml)
//   Step 6: Evaluate on the test split    (Layer 6 - infra)
//   Step 7: Write reports and plots       (Layer 6 - infra)
//   Step 8: Send results to the trackers  (Layer 7 - tracking)
//
// The tracker run is closed FINISHED on success and FAILED when
// any step returns an error.
//
// Reference: Burn Book §5 (Training)

use anyhow::{Context, Result};
use serde::Serialize;
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::config::AppConfig;
use crate::data::dataset::{load_splits, DataSplits};
use crate::infra::{
    checkpoint::{checkpoint_stem, meta_path, CheckpointManager},
    evaluation::{calculate_metrics, classification_report, confusion_matrix, ClassificationMetrics},
    metrics::MetricsLogger,
    plots::{plot_confusion_matrix, plot_training_history},
};
use crate::ml::trainer::{run_training, TrainContext, TrainOutcome};
use crate::tracking::{ExperimentTracker, RunStatus};

/// Summary of a finished run, also written as test_metrics.json.
#[derive(Debug, Clone, Serialize)]
pub struct TrainReport {
    pub model:           String,
    pub dataset:         String,
    pub num_params:      usize,
    pub epochs_run:      usize,
    pub best_epoch:      usize,
    pub best_val_acc:    f64,
    pub stopped_early:   bool,
    pub test:            ClassificationMetrics,
    pub best_checkpoint: Option<PathBuf>,
    pub report_dir:      PathBuf,
}

// ─── TrainUseCase ─────────────────────────────────────────────────────────────
// Owns the config and runs the full training pipeline.
pub struct TrainUseCase {
    config: AppConfig,
}

impl TrainUseCase {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    /// Execute the full training pipeline end to end
    pub fn execute(&self) -> Result<TrainReport> {
        // ── Step 1: Validate ──────────────────────────────────────────────────
        self.config.validate()?;
        let mut cfg = self.config.clone();

        // ── Step 2: Load data ─────────────────────────────────────────────────
        tracing::info!("Loading dataset '{}' from '{}'", cfg.data.name.as_str(), cfg.data.data_dir);
        let splits = load_splits(&cfg.data, cfg.seed)?;
        // discovered classes (image_folder) become part of the snapshot
        cfg.data.classes     = splits.classes.clone();
        cfg.data.num_classes = splits.classes.len();

        // ── Step 3: Tracking ──────────────────────────────────────────────────
        let mut tracker = ExperimentTracker::from_config(&cfg);
        tracker.log_config(&cfg);

        // ── Steps 4-8 ─────────────────────────────────────────────────────────
        let result = train_and_report(&cfg, splits, &mut tracker);
        match &result {
            Ok(report) => {
                tracing::info!(
                    "Test accuracy {:.4}, macro F1 {:.4}",
                    report.test.accuracy, report.test.f1
                );
                tracker.finish(RunStatus::Finished);
            }
            Err(e) => {
                tracing::error!("Training failed: {e:#}");
                tracker.finish(RunStatus::Failed);
            }
        }
        result
    }
}

fn train_and_report(
    cfg:     &AppConfig,
    splits:  DataSplits,
    tracker: &mut ExperimentTracker,
) -> Result<TrainReport> {
    let classes = splits.classes.clone();

    // ── Step 4: Checkpoints and report directory ──────────────────────────────
    let checkpoints = CheckpointManager::new(&cfg.model_save_dir)?;
    let report_dir  = PathBuf::from(&cfg.report_dir);
    fs::create_dir_all(&report_dir)
        .with_context(|| format!("Cannot create report dir '{}'", report_dir.display()))?;
    let logger = MetricsLogger::new(&report_dir)?;

    // ── Step 5: Training loop (Layer 5) ───────────────────────────────────────
    let outcome = {
        let mut ctx = TrainContext { cfg, checkpoints: &checkpoints, logger: &logger, tracker };
        run_training(&mut ctx, splits)?
    };

    // ── Step 6: Test metrics ──────────────────────────────────────────────────
    let test = calculate_metrics(&outcome.y_true, &outcome.y_pred);
    tracker.log_metrics(&test.as_test_pairs(), None);

    // ── Step 7: Reports ───────────────────────────────────────────────────────
    let artifacts = write_reports(&report_dir, &outcome, &classes, &test, logger.csv_path())?;

    let report = TrainReport {
        model:           cfg.model.name.as_str().to_string(),
        dataset:         cfg.data.name.as_str().to_string(),
        num_params:      outcome.num_params,
        epochs_run:      outcome.history.len(),
        best_epoch:      outcome.best_epoch,
        best_val_acc:    outcome.best_val_acc,
        stopped_early:   outcome.stopped_early,
        test,
        best_checkpoint: outcome.best_checkpoint.clone(),
        report_dir:      report_dir.clone(),
    };
    let summary_path = report_dir.join("test_metrics.json");
    fs::write(&summary_path, serde_json::to_string_pretty(&report)?)
        .with_context(|| format!("Cannot write '{}'", summary_path.display()))?;

    // ── Step 8: Artifacts ─────────────────────────────────────────────────────
    for path in artifacts.iter().chain(std::iter::once(&summary_path)) {
        tracker.log_artifact(path, Some("reports"));
    }
    if let Some(ckpt) = &outcome.best_checkpoint {
        tracker.log_artifact(&meta_path(&checkpoint_stem(ckpt)), Some("model"));
    }

    Ok(report)
}

/// history.json, metrics.csv, plots and the text report. Returns their paths.
fn write_reports(
    dir:     &Path,
    outcome: &TrainOutcome,
    classes: &[String],
    test:    &ClassificationMetrics,
    csv:     &Path,
) -> Result<Vec<PathBuf>> {
    let history_json = dir.join("history.json");
    outcome.history.save(&history_json)?;

    let history_png = dir.join("training_history.png");
    plot_training_history(&outcome.history, &history_png)?;

    let matrix = confusion_matrix(&outcome.y_true, &outcome.y_pred, classes.len());
    let cm_png = dir.join("confusion_matrix.png");
    plot_confusion_matrix(&matrix, &cm_png)?;

    let report_txt = dir.join("classification_report.txt");
    let mut text = classification_report(&outcome.y_true, &outcome.y_pred, classes);
    text.push_str(&format!(
        "\naccuracy {:.4}  precision {:.4}  recall {:.4}  f1 {:.4}\n",
        test.accuracy, test.precision, test.recall, test.f1
    ));
    fs::write(&report_txt, text).with_context(|| format!("Cannot write '{}'", report_txt.display()))?;

    tracing::info!("Reports written to '{}'", dir.display());
    Ok(vec![history_json, csv.to_path_buf(), history_png, cm_png, report_txt])
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatasetName, DeviceKind, ModelName};
    use crate::tracking::mlflow_file::MlflowFileStore;

    /// train/ and test/ trees with two flat-colour classes.
    fn write_image_folder(root: &Path) {
        for split in ["train", "test"] {
            let count = if split == "train" { 8 } else { 3 };
            for (class, colour) in [("blue", [0u8, 0, 255]), ("red", [255u8, 0, 0])] {
                let dir = root.join(split).join(class);
                fs::create_dir_all(&dir).unwrap();
                for i in 0..count {
                    image::RgbImage::from_pixel(8, 8, image::Rgb(colour))
                        .save(dir.join(format!("{i}.png")))
                        .unwrap();
                }
            }
        }
    }

    fn test_config(root: &Path) -> AppConfig {
        let mut cfg = AppConfig::with_presets(DatasetName::ImageFolder, ModelName::SimpleCnn);
        cfg.device         = DeviceKind::Cpu;
        cfg.num_workers    = 1;
        cfg.model_save_dir = root.join("models").display().to_string();
        cfg.report_dir     = root.join("reports").display().to_string();
        cfg.data.data_dir   = root.join("images").display().to_string();
        cfg.data.image_size = 8;
        cfg.data.val_split  = 0.25;
        cfg.hyperparameters.batch_size = 4;
        cfg.hyperparameters.num_epochs = 2;
        cfg.tracking.tracking_uri = root.join("mlruns").display().to_string();
        cfg
    }

    #[test]
    fn test_end_to_end_on_image_folder() {
        let tmp = tempfile::tempdir().unwrap();
        write_image_folder(&tmp.path().join("images"));
        let cfg = test_config(tmp.path());

        let report = TrainUseCase::new(cfg.clone()).execute().unwrap();
        assert_eq!(report.epochs_run, 2);
        assert_eq!(report.dataset, "image_folder");

        let reports = tmp.path().join("reports");
        for name in [
            "history.json", "metrics.csv", "training_history.png",
            "confusion_matrix.png", "classification_report.txt", "test_metrics.json",
        ] {
            assert!(reports.join(name).exists(), "missing {name}");
        }

        let store = MlflowFileStore::new(&cfg.tracking.tracking_uri);
        let exp   = store.experiment_by_name("image-classifier").unwrap().unwrap();
        let runs  = store.runs(&exp.experiment_id).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, "FINISHED");
        assert!(runs[0].metrics.contains_key("val_acc"));
        assert!(runs[0].metrics.contains_key("test_accuracy"));
        assert_eq!(runs[0].params.get("data.num_classes").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_missing_data_marks_nothing_and_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_config(tmp.path());
        // no images written: loading fails before a run is opened
        assert!(TrainUseCase::new(cfg).execute().is_err());
        assert!(!tmp.path().join("mlruns").exists());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = test_config(tmp.path());
        cfg.hyperparameters.batch_size = 0;
        assert!(TrainUseCase::new(cfg).execute().is_err());
    }
}
