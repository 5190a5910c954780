// ============================================================
// Layer 6 — Evaluation Metrics
// ============================================================
// Test-set metrics computed from flat label vectors:
//
//   accuracy          correct / total
//   precision (macro) mean over labels of tp / (tp + fp)
//   recall    (macro) mean over labels of tp / (tp + fn)
//   f1        (macro) mean over labels of 2·p·r / (p + r)
//
// "Labels" are the classes that appear in either y_true or
// y_pred. A ratio with a zero denominator counts as 0, so a
// class that is never predicted drags precision down instead of
// producing NaN.
//
// Also builds the confusion matrix (rows = true class,
// columns = predicted class) and a plain-text per-class report.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Write as _;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationMetrics {
    pub accuracy:  f64,
    pub precision: f64,
    pub recall:    f64,
    pub f1:        f64,
}

impl ClassificationMetrics {
    /// (name, value) pairs with a `test_` prefix, as sent to trackers
    pub fn as_test_pairs(&self) -> Vec<(String, f64)> {
        vec![
            ("test_accuracy".to_string(),  self.accuracy),
            ("test_precision".to_string(), self.precision),
            ("test_recall".to_string(),    self.recall),
            ("test_f1".to_string(),        self.f1),
        ]
    }
}

/// Per-class counts used by every metric here.
#[derive(Debug, Clone, Copy, Default)]
struct ClassStats {
    tp:      usize,
    fp:      usize,
    fn_:     usize,
    support: usize,
}

impl ClassStats {
    fn precision(&self) -> f64 { ratio(self.tp, self.tp + self.fp) }
    fn recall(&self) -> f64 { ratio(self.tp, self.tp + self.fn_) }
    fn f1(&self) -> f64 {
        let (p, r) = (self.precision(), self.recall());
        if p + r == 0.0 { 0.0 } else { 2.0 * p * r / (p + r) }
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 { 0.0 } else { num as f64 / den as f64 }
}

fn stats_for(y_true: &[usize], y_pred: &[usize], label: usize) -> ClassStats {
    let mut s = ClassStats::default();
    for (&t, &p) in y_true.iter().zip(y_pred) {
        match (t == label, p == label) {
            (true, true)   => s.tp += 1,
            (false, true)  => s.fp += 1,
            (true, false)  => s.fn_ += 1,
            (false, false) => {}
        }
        if t == label {
            s.support += 1;
        }
    }
    s
}

/// Accuracy plus macro-averaged precision, recall and F1.
///
/// Only the common prefix is compared if lengths differ.
pub fn calculate_metrics(y_true: &[usize], y_pred: &[usize]) -> ClassificationMetrics {
    let n = y_true.len().min(y_pred.len());
    let (y_true, y_pred) = (&y_true[..n], &y_pred[..n]);

    if n == 0 {
        return ClassificationMetrics { accuracy: 0.0, precision: 0.0, recall: 0.0, f1: 0.0 };
    }

    let correct  = y_true.iter().zip(y_pred).filter(|(t, p)| t == p).count();
    let labels: BTreeSet<usize> = y_true.iter().chain(y_pred).copied().collect();
    let stats: Vec<ClassStats>  = labels.iter().map(|&l| stats_for(y_true, y_pred, l)).collect();
    let k = stats.len() as f64;

    ClassificationMetrics {
        accuracy:  correct as f64 / n as f64,
        precision: stats.iter().map(ClassStats::precision).sum::<f64>() / k,
        recall:    stats.iter().map(ClassStats::recall).sum::<f64>() / k,
        f1:        stats.iter().map(ClassStats::f1).sum::<f64>() / k,
    }
}

/// `matrix[true][pred]` counts; labels ≥ num_classes are ignored.
pub fn confusion_matrix(y_true: &[usize], y_pred: &[usize], num_classes: usize) -> Vec<Vec<usize>> {
    let mut m = vec![vec![0usize; num_classes]; num_classes];
    for (&t, &p) in y_true.iter().zip(y_pred) {
        if t < num_classes && p < num_classes {
            m[t][p] += 1;
        }
    }
    m
}

/// Per-class precision / recall / F1 / support table.
pub fn classification_report(y_true: &[usize], y_pred: &[usize], class_names: &[String]) -> String {
    let n = y_true.len().min(y_pred.len());
    let (y_true, y_pred) = (&y_true[..n], &y_pred[..n]);

    let width = class_names
        .iter()
        .map(|c| c.len())
        .chain(std::iter::once("weighted avg".len()))
        .max()
        .unwrap_or(12);

    let mut out = String::new();
    let _ = writeln!(out, "{:>width$} {:>10} {:>10} {:>10} {:>10}\n", "", "precision", "recall", "f1-score", "support");

    let stats: Vec<ClassStats> = (0..class_names.len()).map(|l| stats_for(y_true, y_pred, l)).collect();
    for (name, s) in class_names.iter().zip(&stats) {
        let _ = writeln!(
            out,
            "{:>width$} {:>10.4} {:>10.4} {:>10.4} {:>10}",
            name, s.precision(), s.recall(), s.f1(), s.support
        );
    }

    // macro avg covers the labels seen in y_true ∪ y_pred, as calculate_metrics does
    let present: BTreeSet<usize> = y_true.iter().chain(y_pred).copied().collect();
    let seen: Vec<&ClassStats>   = stats.iter().enumerate().filter(|(l, _)| present.contains(l)).map(|(_, s)| s).collect();

    let total    = n.max(1) as f64;
    let k        = seen.len().max(1) as f64;
    let correct  = y_true.iter().zip(y_pred).filter(|(t, p)| t == p).count();
    let weighted = |f: fn(&ClassStats) -> f64| {
        stats.iter().map(|s| f(s) * s.support as f64).sum::<f64>() / total
    };
    let macro_   = |f: fn(&ClassStats) -> f64| seen.iter().map(|s| f(s)).sum::<f64>() / k;

    let _ = writeln!(out);
    let _ = writeln!(out, "{:>width$} {:>10} {:>10} {:>10.4} {:>10}", "accuracy", "", "", correct as f64 / total, n);
    let _ = writeln!(
        out,
        "{:>width$} {:>10.4} {:>10.4} {:>10.4} {:>10}",
        "macro avg", macro_(ClassStats::precision), macro_(ClassStats::recall), macro_(ClassStats::f1), n
    );
    let _ = writeln!(
        out,
        "{:>width$} {:>10.4} {:>10.4} {:>10.4} {:>10}",
        "weighted avg", weighted(ClassStats::precision), weighted(ClassStats::recall), weighted(ClassStats::f1), n
    );
    out
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_predictions() {
        let y = [0, 1, 2, 0, 1, 2];
        let m = calculate_metrics(&y, &y);
        assert_eq!(m.accuracy, 1.0);
        assert_eq!(m.precision, 1.0);
        assert_eq!(m.recall, 1.0);
        assert_eq!(m.f1, 1.0);
    }

    #[test]
    fn test_all_wrong() {
        let m = calculate_metrics(&[0, 1, 0, 1, 0], &[1, 0, 1, 0, 1]);
        assert_eq!(m.accuracy, 0.0);
        assert_eq!(m.f1, 0.0);
    }

    #[test]
    fn test_partial() {
        let m = calculate_metrics(&[0, 1, 2, 0, 1], &[0, 2, 1, 0, 0]);
        assert!((m.accuracy - 0.4).abs() < 1e-12);
        // class 0: p = 2/3, r = 1; classes 1 and 2: 0
        assert!((m.precision - (2.0 / 3.0) / 3.0).abs() < 1e-12);
        assert!((m.recall - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(calculate_metrics(&[], &[]).accuracy, 0.0);
    }

    #[test]
    fn test_confusion_matrix_rows_are_truth() {
        let m = confusion_matrix(&[0, 0, 1, 2], &[0, 1, 1, 0], 3);
        assert_eq!(m, vec![vec![1, 1, 0], vec![0, 1, 0], vec![1, 0, 0]]);
        let total: usize = m.iter().flatten().sum();
        assert_eq!(total, 4);
    }

    #[test]
    fn test_report_lists_every_class() {
        let names  = vec!["cat".to_string(), "dog".to_string()];
        let report = classification_report(&[0, 1, 1], &[0, 1, 0], &names);
        assert!(report.contains("cat"));
        assert!(report.contains("dog"));
        assert!(report.contains("weighted avg"));
        assert!(report.contains("0.6667"));
    }

    #[test]
    fn test_report_macro_matches_metrics_when_a_class_is_absent() {
        let names  = vec!["cat".to_string(), "dog".to_string(), "bird".to_string()];
        let (y_true, y_pred) = ([0, 0, 1, 1], [0, 1, 1, 1]);
        let m      = calculate_metrics(&y_true, &y_pred);
        let report = classification_report(&y_true, &y_pred, &names);

        let macro_line = report.lines().find(|l| l.trim_start().starts_with("macro avg")).unwrap();
        let expected   = format!("{:>10.4} {:>10.4} {:>10.4}", m.precision, m.recall, m.f1);
        assert!(macro_line.contains(&expected), "{macro_line} vs {expected}");
    }
}
