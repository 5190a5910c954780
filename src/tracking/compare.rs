// ============================================================
// Layer 7 — Run Comparison
// ============================================================
// Read-side of MLflow tracking, used by the `runs` command:
//
//   list experiments
//   rank the runs of one experiment by a metric (descending),
//     runs lacking the metric go last
//   export every run of an experiment to CSV
//
// Works against the file store and the REST server alike
// through the RunStore trait.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Write as _,
    fs,
    path::Path,
};

use super::{mlflow_file::MlflowFileStore, mlflow_rest::MlflowRestClient, TrackingResult};

/// Parameters shown per run in the ranking table.
pub const SHOWN_PARAMS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentInfo {
    pub experiment_id:     String,
    pub name:              String,
    pub artifact_location: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id:     String,
    pub run_name:   String,
    pub status:     String,
    /// Milliseconds since the Unix epoch
    pub start_time: i64,
    pub metrics:    BTreeMap<String, f64>,
    pub params:     BTreeMap<String, String>,
}

impl RunSummary {
    pub fn start_time_string(&self) -> String {
        chrono::DateTime::from_timestamp_millis(self.start_time)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| self.start_time.to_string())
    }
}

/// Anything runs can be read back from.
pub trait RunStore {
    fn experiments(&self) -> TrackingResult<Vec<ExperimentInfo>>;

    fn runs(&self, experiment_id: &str) -> TrackingResult<Vec<RunSummary>>;
}

impl RunStore for MlflowFileStore {
    fn experiments(&self) -> TrackingResult<Vec<ExperimentInfo>> {
        MlflowFileStore::experiments(self)
    }

    fn runs(&self, experiment_id: &str) -> TrackingResult<Vec<RunSummary>> {
        MlflowFileStore::runs(self, experiment_id)
    }
}

impl RunStore for MlflowRestClient {
    fn experiments(&self) -> TrackingResult<Vec<ExperimentInfo>> {
        self.search_experiments()
    }

    fn runs(&self, experiment_id: &str) -> TrackingResult<Vec<RunSummary>> {
        self.search_runs(experiment_id)
    }
}

/// Open the right store for a tracking URI.
pub fn open_store(tracking_uri: &str) -> Result<Box<dyn RunStore>> {
    if tracking_uri.starts_with("http://") || tracking_uri.starts_with("https://") {
        Ok(Box::new(MlflowRestClient::new(tracking_uri)?))
    } else {
        Ok(Box::new(MlflowFileStore::new(tracking_uri)))
    }
}

/// Resolve an experiment by name; `None` means the Default experiment.
pub fn find_experiment(store: &dyn RunStore, name: Option<&str>) -> Result<Option<ExperimentInfo>> {
    let experiments = store.experiments()?;
    Ok(match name {
        Some(n) => experiments.into_iter().find(|e| e.name == n),
        None    => experiments.into_iter().find(|e| e.experiment_id == "0"),
    })
}

/// Sort by `metric` descending and keep the first `top_n`.
pub fn rank_runs(mut runs: Vec<RunSummary>, metric: &str, top_n: usize) -> Vec<RunSummary> {
    runs.sort_by(|a, b| match (a.metrics.get(metric), b.metrics.get(metric)) {
        (Some(x), Some(y)) => y.total_cmp(x),
        (Some(_), None)    => std::cmp::Ordering::Less,
        (None, Some(_))    => std::cmp::Ordering::Greater,
        (None, None)       => std::cmp::Ordering::Equal,
    });
    runs.truncate(top_n);
    runs
}

/// Fixed-width table: run, start time, status, all metrics, first params.
pub fn format_table(runs: &[RunSummary]) -> String {
    let metric_cols: BTreeSet<&str> = runs.iter().flat_map(|r| r.metrics.keys().map(String::as_str)).collect();
    let param_cols: Vec<&str> = runs
        .iter()
        .flat_map(|r| r.params.keys().map(String::as_str))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .take(SHOWN_PARAMS)
        .collect();

    let mut header = vec!["run_id".to_string(), "start_time".to_string(), "status".to_string()];
    header.extend(metric_cols.iter().map(|s| s.to_string()));
    header.extend(param_cols.iter().map(|s| s.to_string()));

    let rows: Vec<Vec<String>> = runs
        .iter()
        .map(|r| {
            let mut row = vec![r.run_id.clone(), r.start_time_string(), r.status.clone()];
            row.extend(metric_cols.iter().map(|m| r.metrics.get(*m).map(|v| format!("{v:.4}")).unwrap_or_default()));
            row.extend(param_cols.iter().map(|p| r.params.get(*p).cloned().unwrap_or_default()));
            row
        })
        .collect();

    let widths: Vec<usize> = (0..header.len())
        .map(|i| rows.iter().map(|r| r[i].len()).chain([header[i].len()]).max().unwrap_or(0))
        .collect();

    let mut out = String::new();
    for row in std::iter::once(&header).chain(rows.iter()) {
        let line: Vec<String> = row.iter().zip(&widths).map(|(c, w)| format!("{c:<w$}")).collect();
        let _ = writeln!(out, "{}", line.join("  ").trim_end());
    }
    out
}

fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

/// Write every run to CSV with `metrics.` / `params.` column prefixes.
pub fn export_csv(runs: &[RunSummary], path: &Path) -> Result<()> {
    let metric_cols: BTreeSet<&String> = runs.iter().flat_map(|r| r.metrics.keys()).collect();
    let param_cols: BTreeSet<&String>  = runs.iter().flat_map(|r| r.params.keys()).collect();

    let mut out = String::from("run_id,run_name,start_time,status");
    for m in &metric_cols {
        out.push_str(&format!(",{}", csv_field(&format!("metrics.{m}"))));
    }
    for p in &param_cols {
        out.push_str(&format!(",{}", csv_field(&format!("params.{p}"))));
    }
    out.push('\n');

    for r in runs {
        let mut fields = vec![
            csv_field(&r.run_id),
            csv_field(&r.run_name),
            r.start_time_string(),
            csv_field(&r.status),
        ];
        fields.extend(metric_cols.iter().map(|m| r.metrics.get(*m).map(|v| v.to_string()).unwrap_or_default()));
        fields.extend(param_cols.iter().map(|p| r.params.get(*p).map(|v| csv_field(v)).unwrap_or_default()));
        out.push_str(&fields.join(","));
        out.push('\n');
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, out).with_context(|| format!("Cannot write '{}'", path.display()))
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    fn run(id: &str, acc: Option<f64>) -> RunSummary {
        let mut metrics = BTreeMap::new();
        if let Some(a) = acc {
            metrics.insert("val_acc".to_string(), a);
        }
        let mut params = BTreeMap::new();
        params.insert("model.name".to_string(), "simple_cnn".to_string());
        RunSummary {
            run_id:     id.to_string(),
            run_name:   format!("name-{id}"),
            status:     "FINISHED".to_string(),
            start_time: 1_700_000_000_000,
            metrics,
            params,
        }
    }

    #[test]
    fn test_rank_descending_missing_last() {
        let runs   = vec![run("a", Some(0.5)), run("b", None), run("c", Some(0.9))];
        let ranked = rank_runs(runs, "val_acc", 10);
        let ids: Vec<&str> = ranked.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_rank_top_n() {
        let runs = vec![run("a", Some(0.1)), run("b", Some(0.2)), run("c", Some(0.3))];
        assert_eq!(rank_runs(runs, "val_acc", 2).len(), 2);
    }

    #[test]
    fn test_table_has_header_and_rows() {
        let table = format_table(&[run("a", Some(0.5))]);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("run_id"));
        assert!(lines[0].contains("val_acc"));
        assert!(lines[1].contains("0.5000"));
    }

    #[test]
    fn test_export_csv() {
        let tmp  = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out/comparison.csv");
        export_csv(&[run("a", Some(0.5)), run("b", None)], &path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "run_id,run_name,start_time,status,metrics.val_acc,params.model.name");
        assert_eq!(lines.len(), 3);
        assert!(lines[2].contains(",,simple_cnn"));
    }

    #[test]
    fn test_csv_quoting() {
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("plain"), "plain");
    }

    #[test]
    fn test_find_experiment_in_file_store() {
        let tmp   = tempfile::tempdir().unwrap();
        let store = MlflowFileStore::new(&tmp.path().display().to_string());
        store.get_or_create_experiment("exp").unwrap();

        let found = find_experiment(&store, Some("exp")).unwrap().unwrap();
        assert_eq!(found.experiment_id, "1");
        let default = find_experiment(&store, None).unwrap().unwrap();
        assert_eq!(default.name, "Default");
        assert!(find_experiment(&store, Some("missing")).unwrap().is_none());
    }
}
