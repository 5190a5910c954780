// ============================================================
// Layer 6 — Report Plots
// ============================================================
// Two PNGs are written after training:
//
//   training_history.png   left:  train / val loss per epoch
//                          right: train / val accuracy per epoch
//                          (blue = train, red = validation)
//
//   confusion_matrix.png   one cell per (true, predicted) pair,
//                          rows = true class, shaded by the
//                          row-normalised count (darker = more)
//
// The plots carry no text, so plotters is built without any
// font backend. Axis meaning comes from the fixed layout above
// and the numbers live in history.json and the text report.
//
// Reference: plotters crate documentation (BitMapBackend)

use anyhow::{anyhow, Result};
use plotters::prelude::*;
use std::{fs, path::Path};

use crate::infra::metrics::TrainingHistory;

const TRAIN_COLOR: RGBColor = RGBColor(31, 119, 180);
const VAL_COLOR:   RGBColor = RGBColor(214, 39, 40);

fn plot_err<E: std::fmt::Display>(e: E) -> anyhow::Error {
    anyhow!("plotting failed: {e}")
}

fn y_range(a: &[f64], b: &[f64]) -> std::ops::Range<f64> {
    let (lo, hi) = a
        .iter()
        .chain(b)
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if !lo.is_finite() {
        return 0.0..1.0;
    }
    let pad = ((hi - lo) * 0.05).max(1e-3);
    (lo - pad)..(hi + pad)
}

fn draw_curves<DB: DrawingBackend>(
    area:  &DrawingArea<DB, plotters::coord::Shift>,
    train: &[f64],
    val:   &[f64],
) -> Result<()> {
    let epochs = train.len().max(val.len()).max(2);
    let mut chart = ChartBuilder::on(area)
        .margin(15)
        .build_cartesian_2d(1f64..epochs as f64, y_range(train, val))
        .map_err(plot_err)?;

    chart
        .plotting_area()
        .draw(&Rectangle::new(
            [(1.0, chart.y_range().start), (epochs as f64, chart.y_range().end)],
            BLACK.stroke_width(1),
        ))
        .map_err(plot_err)?;

    for (series, color) in [(train, TRAIN_COLOR), (val, VAL_COLOR)] {
        chart
            .draw_series(LineSeries::new(
                series.iter().enumerate().map(|(i, v)| ((i + 1) as f64, *v)),
                color.stroke_width(2),
            ))
            .map_err(plot_err)?;
    }
    Ok(())
}

/// Loss and accuracy curves side by side.
pub fn plot_training_history(history: &TrainingHistory, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let root = BitMapBackend::new(path, (1200, 450)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;

    let (left, right) = root.split_horizontally(600);
    draw_curves(&left, &history.train_loss, &history.val_loss)?;
    draw_curves(&right, &history.train_acc, &history.val_acc)?;

    root.present().map_err(plot_err)?;
    tracing::debug!("Wrote '{}'", path.display());
    Ok(())
}

/// Heat-map of a confusion matrix.
pub fn plot_confusion_matrix(matrix: &[Vec<usize>], path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let n    = matrix.len().max(1);
    let cell = (600 / n).max(4) as i32;
    let side = cell as u32 * n as u32;

    let root = BitMapBackend::new(path, (side, side)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;

    for (row, counts) in matrix.iter().enumerate() {
        let total = counts.iter().sum::<usize>().max(1) as f64;
        for (col, &count) in counts.iter().enumerate() {
            let shade = (255.0 * (1.0 - count as f64 / total)).round() as u8;
            let (x, y) = (col as i32 * cell, row as i32 * cell);
            root.draw(&Rectangle::new(
                [(x, y), (x + cell, y + cell)],
                RGBColor(shade, shade, 255).filled(),
            ))
            .map_err(plot_err)?;
            root.draw(&Rectangle::new([(x, y), (x + cell, y + cell)], BLACK.stroke_width(1)))
                .map_err(plot_err)?;
        }
    }

    root.present().map_err(plot_err)?;
    tracing::debug!("Wrote '{}'", path.display());
    Ok(())
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_png_written() {
        let tmp  = tempfile::tempdir().unwrap();
        let path = tmp.path().join("training_history.png");
        let history = TrainingHistory {
            train_loss: vec![2.0, 1.5, 1.1],
            train_acc:  vec![0.3, 0.5, 0.6],
            val_loss:   vec![1.9, 1.6, 1.4],
            val_acc:    vec![0.35, 0.45, 0.5],
        };
        plot_training_history(&history, &path).unwrap();
        assert!(fs::metadata(&path).unwrap().len() > 0);
    }

    #[test]
    fn test_single_epoch_history_is_fine() {
        let tmp  = tempfile::tempdir().unwrap();
        let path = tmp.path().join("h.png");
        let history = TrainingHistory {
            train_loss: vec![1.0],
            train_acc:  vec![0.5],
            val_loss:   vec![1.0],
            val_acc:    vec![0.5],
        };
        assert!(plot_training_history(&history, &path).is_ok());
    }

    #[test]
    fn test_confusion_png_written() {
        let tmp  = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cm/confusion_matrix.png");
        plot_confusion_matrix(&[vec![3, 1], vec![0, 4]], &path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_y_range_handles_flat_and_empty() {
        let r = y_range(&[1.0, 1.0], &[]);
        assert!(r.start < 1.0 && r.end > 1.0);
        assert_eq!(y_range(&[], &[]), 0.0..1.0);
    }
}
