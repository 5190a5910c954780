// ============================================================
// Layer 6 — Training Metrics
// ============================================================
// Three pieces of bookkeeping live here:
//
//   AverageMeter    running weighted mean of a per-batch value
//                   (loss, accuracy). A batch of n samples
//                   contributes value·n, so the epoch average is
//                   exact even when the last batch is short.
//
//   TrainingHistory the four per-epoch curves
//                   (train_loss, train_acc, val_loss, val_acc),
//                   always the same length, saved as history.json
//
//   MetricsLogger   appends one CSV row per epoch:
//
//     epoch,train_loss,train_acc,val_loss,val_acc,learning_rate
//     1,1.654321,0.402000,1.401234,0.498000,0.001000
//
// Reference: Rust Book §9 (Error Handling)
//            Rust Book §12 (I/O and File Handling)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

// ─── AverageMeter ─────────────────────────────────────────────────────────────
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AverageMeter {
    /// Most recent value passed to update()
    pub val:   f64,
    pub sum:   f64,
    pub count: usize,
    pub avg:   f64,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `value` observed over `n` samples.
    pub fn update(&mut self, value: f64, n: usize) {
        self.val    = value;
        self.sum   += value * n as f64;
        self.count += n;
        self.avg    = if self.count > 0 { self.sum / self.count as f64 } else { 0.0 };
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ─── EpochMetrics ─────────────────────────────────────────────────────────────
/// One row of metrics data for a single training epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// The epoch number (starts at 1)
    pub epoch:         usize,
    pub train_loss:    f64,
    pub train_acc:     f64,
    pub val_loss:      f64,
    pub val_acc:       f64,
    pub learning_rate: f64,
}

impl EpochMetrics {
    /// Returns true if this epoch beat the best validation accuracy so far
    pub fn is_improvement(&self, best_val_acc: f64) -> bool {
        self.val_acc > best_val_acc
    }

    /// (name, value) pairs as sent to the trackers
    pub fn as_pairs(&self) -> Vec<(String, f64)> {
        vec![
            ("train_loss".to_string(),    self.train_loss),
            ("train_acc".to_string(),     self.train_acc),
            ("val_loss".to_string(),      self.val_loss),
            ("val_acc".to_string(),       self.val_acc),
            ("learning_rate".to_string(), self.learning_rate),
        ]
    }
}

// ─── TrainingHistory ──────────────────────────────────────────────────────────
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub train_loss: Vec<f64>,
    pub train_acc:  Vec<f64>,
    pub val_loss:   Vec<f64>,
    pub val_acc:    Vec<f64>,
}

impl TrainingHistory {
    /// Append one epoch to all four curves at once.
    pub fn push(&mut self, m: &EpochMetrics) {
        self.train_loss.push(m.train_loss);
        self.train_acc.push(m.train_acc);
        self.val_loss.push(m.val_loss);
        self.val_acc.push(m.val_acc);
    }

    pub fn len(&self) -> usize {
        self.train_loss.len()
    }

    pub fn is_empty(&self) -> bool {
        self.train_loss.is_empty()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Cannot write history to '{}'", path.display()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Cannot read history from '{}'", path.display()))?;
        Ok(serde_json::from_str(&json)?)
    }
}

// ─── MetricsLogger ────────────────────────────────────────────────────────────
const CSV_HEADER: &str = "epoch,train_loss,train_acc,val_loss,val_acc,learning_rate";

/// Logs epoch metrics to a CSV file for later analysis.
pub struct MetricsLogger {
    csv_path: PathBuf,
}

impl MetricsLogger {
    /// Create `<dir>/metrics.csv`, truncating any previous run's rows.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let csv_path = dir.join("metrics.csv");
        let mut f = fs::File::create(&csv_path)
            .with_context(|| format!("Cannot create '{}'", csv_path.display()))?;
        writeln!(f, "{CSV_HEADER}")?;
        tracing::debug!("Created metrics CSV: '{}'", csv_path.display());

        Ok(Self { csv_path })
    }

    /// Append one epoch's metrics as a new row in the CSV.
    pub fn log(&self, m: &EpochMetrics) -> Result<()> {
        let mut f = OpenOptions::new().append(true).open(&self.csv_path)?;
        writeln!(
            f,
            "{},{:.6},{:.6},{:.6},{:.6},{:.6}",
            m.epoch, m.train_loss, m.train_acc, m.val_loss, m.val_acc, m.learning_rate,
        )?;
        Ok(())
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    fn epoch(epoch: usize, val_acc: f64) -> EpochMetrics {
        EpochMetrics {
            epoch,
            train_loss:    1.0,
            train_acc:     0.5,
            val_loss:      0.9,
            val_acc,
            learning_rate: 1e-3,
        }
    }

    #[test]
    fn test_average_meter_weighted_mean() {
        let mut m = AverageMeter::new();
        m.update(10.0, 2);
        m.update(20.0, 3);
        assert_eq!(m.count, 5);
        assert_eq!(m.val, 20.0);
        assert!((m.avg - (10.0 * 2.0 + 20.0 * 3.0) / 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_average_meter_reset() {
        let mut m = AverageMeter::new();
        m.update(3.0, 4);
        m.reset();
        assert_eq!(m, AverageMeter::default());
        assert_eq!(m.avg, 0.0);
    }

    #[test]
    fn test_is_improvement() {
        let m = epoch(2, 0.7);
        assert!(m.is_improvement(0.6));
        assert!(!m.is_improvement(0.7));
    }

    #[test]
    fn test_history_stays_aligned() {
        let mut h = TrainingHistory::default();
        h.push(&epoch(1, 0.4));
        h.push(&epoch(2, 0.5));
        assert_eq!(h.len(), 2);
        assert_eq!(h.val_acc, vec![0.4, 0.5]);
        assert_eq!(h.train_loss.len(), h.val_loss.len());
    }

    #[test]
    fn test_history_json_file() {
        let tmp  = tempfile::tempdir().unwrap();
        let path = tmp.path().join("reports/history.json");
        let mut h = TrainingHistory::default();
        h.push(&epoch(1, 0.4));
        h.save(&path).unwrap();
        assert_eq!(TrainingHistory::load(&path).unwrap(), h);
    }

    #[test]
    fn test_csv_rows() {
        let tmp    = tempfile::tempdir().unwrap();
        let logger = MetricsLogger::new(tmp.path()).unwrap();
        logger.log(&epoch(1, 0.25)).unwrap();
        logger.log(&epoch(2, 0.5)).unwrap();

        let text: Vec<String> = fs::read_to_string(logger.csv_path())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect();
        assert_eq!(text.len(), 3);
        assert_eq!(text[0], CSV_HEADER);
        assert!(text[2].starts_with("2,1.000000,0.500000,0.900000,0.500000"));
    }
}
