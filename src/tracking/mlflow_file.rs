// ============================================================
// Layer 7 — MLflow File Store
// ============================================================
// Writes runs in the directory layout MLflow's own file store
// uses, so `mlflow ui --backend-store-uri ./mlruns` can browse
// them without a server:
//
//   mlruns/
//     0/meta.yaml                          ← "Default" experiment
//     1/meta.yaml                          ← experiment metadata
//     1/<run_id>/meta.yaml                 ← run metadata + status
//     1/<run_id>/metrics/val_acc           ← "<ts_ms> <value> <step>" lines
//     1/<run_id>/params/hyperparameters.learning_rate
//     1/<run_id>/tags/mlflow.runName
//     1/<run_id>/artifacts/...
//
// Run status codes in meta.yaml: RUNNING=1, FINISHED=3,
// FAILED=4, KILLED=5.

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use super::{
    compare::{ExperimentInfo, RunSummary},
    now_millis, param_to_string, FlatParams, RunStatus, TrackingBackend, TrackingError,
    TrackingResult,
};

const BACKEND: &str = "mlflow";
const DEFAULT_EXPERIMENT_ID: &str = "0";
const STATUS_RUNNING: i32 = 1;

fn status_code(status: RunStatus) -> i32 {
    match status {
        RunStatus::Finished => 3,
        RunStatus::Failed   => 4,
        RunStatus::Killed   => 5,
    }
}

pub(crate) fn status_name(code: i32) -> &'static str {
    match code {
        1 => "RUNNING",
        2 => "SCHEDULED",
        3 => "FINISHED",
        4 => "FAILED",
        5 => "KILLED",
        _ => "UNKNOWN",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExperimentMeta {
    artifact_location: String,
    #[serde(default)]
    creation_time:     Option<i64>,
    experiment_id:     String,
    #[serde(default)]
    last_update_time:  Option<i64>,
    lifecycle_stage:   String,
    name:              String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunMeta {
    artifact_uri:     String,
    end_time:         Option<i64>,
    #[serde(default)]
    entry_point_name: String,
    experiment_id:    String,
    lifecycle_stage:  String,
    run_id:           String,
    #[serde(default)]
    run_name:         String,
    run_uuid:         String,
    #[serde(default)]
    source_name:      String,
    #[serde(default)]
    source_type:      i32,
    #[serde(default)]
    source_version:   String,
    start_time:       i64,
    status:           i32,
    #[serde(default)]
    tags:             Vec<String>,
    #[serde(default)]
    user_id:          String,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> TrackingError + '_ {
    move |e| TrackingError::io(BACKEND, path, e)
}

fn write_yaml<T: Serialize>(path: &Path, value: &T) -> TrackingResult<()> {
    let text = serde_yaml::to_string(value)
        .map_err(|e| TrackingError::invalid(BACKEND, format!("yaml encode: {e}")))?;
    fs::write(path, text).map_err(io_err(path))
}

fn read_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> TrackingResult<T> {
    let text = fs::read_to_string(path).map_err(io_err(path))?;
    serde_yaml::from_str(&text)
        .map_err(|e| TrackingError::invalid(BACKEND, format!("'{}': {e}", path.display())))
}

fn file_uri(path: &Path) -> String {
    let abs = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    format!("file://{}", abs.display())
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

// ─── Store ────────────────────────────────────────────────────────────────────

pub struct MlflowFileStore {
    root: PathBuf,
}

impl MlflowFileStore {
    /// `uri` is a plain path or a `file://` URI.
    pub fn new(uri: &str) -> Self {
        let path = uri.strip_prefix("file://").unwrap_or(uri);
        Self { root: PathBuf::from(path) }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_default_experiment(&self) -> TrackingResult<()> {
        let dir = self.root.join(DEFAULT_EXPERIMENT_ID);
        if dir.join("meta.yaml").exists() {
            return Ok(());
        }
        self.write_experiment(DEFAULT_EXPERIMENT_ID, "Default").map(|_| ())
    }

    fn write_experiment(&self, id: &str, name: &str) -> TrackingResult<ExperimentInfo> {
        let dir = self.root.join(id);
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        let now  = now_millis();
        let meta = ExperimentMeta {
            artifact_location: file_uri(&dir),
            creation_time:     Some(now),
            experiment_id:     id.to_string(),
            last_update_time:  Some(now),
            lifecycle_stage:   "active".to_string(),
            name:              name.to_string(),
        };
        write_yaml(&dir.join("meta.yaml"), &meta)?;
        Ok(ExperimentInfo {
            experiment_id:     meta.experiment_id,
            name:              meta.name,
            artifact_location: meta.artifact_location,
        })
    }

    /// Every active experiment, ordered by id.
    pub fn experiments(&self) -> TrackingResult<Vec<ExperimentInfo>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(io_err(&self.root))?.flatten() {
            let meta_path = entry.path().join("meta.yaml");
            if !meta_path.is_file() {
                continue;
            }
            match read_yaml::<ExperimentMeta>(&meta_path) {
                Ok(m) if m.lifecycle_stage == "active" => out.push(ExperimentInfo {
                    experiment_id:     m.experiment_id,
                    name:              m.name,
                    artifact_location: m.artifact_location,
                }),
                Ok(_)  => {}
                Err(e) => tracing::debug!("Skipping unreadable experiment: {e}"),
            }
        }
        out.sort_by_key(|e| e.experiment_id.parse::<u64>().unwrap_or(u64::MAX));
        Ok(out)
    }

    pub fn experiment_by_name(&self, name: &str) -> TrackingResult<Option<ExperimentInfo>> {
        Ok(self.experiments()?.into_iter().find(|e| e.name == name))
    }

    pub fn get_or_create_experiment(&self, name: &str) -> TrackingResult<ExperimentInfo> {
        self.ensure_default_experiment()?;
        if let Some(exp) = self.experiment_by_name(name)? {
            return Ok(exp);
        }
        let next_id = self
            .experiments()?
            .iter()
            .filter_map(|e| e.experiment_id.parse::<u64>().ok())
            .max()
            .map_or(1, |id| id + 1);
        tracing::info!("Creating MLflow experiment '{}' (id {})", name, next_id);
        self.write_experiment(&next_id.to_string(), name)
    }

    /// Create a RUNNING run in `experiment`.
    pub fn start_run(&self, experiment: &str, run_name: Option<&str>) -> TrackingResult<MlflowFileRun> {
        let exp     = self.get_or_create_experiment(experiment)?;
        let run_id  = uuid::Uuid::new_v4().simple().to_string();
        let run_dir = self.root.join(&exp.experiment_id).join(&run_id);
        for sub in ["metrics", "params", "tags", "artifacts"] {
            let d = run_dir.join(sub);
            fs::create_dir_all(&d).map_err(io_err(&d))?;
        }

        let run_name = run_name.map(str::to_string).unwrap_or_else(|| format!("run-{}", &run_id[..8]));
        let meta = RunMeta {
            artifact_uri:     file_uri(&run_dir.join("artifacts")),
            end_time:         None,
            entry_point_name: String::new(),
            experiment_id:    exp.experiment_id.clone(),
            lifecycle_stage:  "active".to_string(),
            run_id:           run_id.clone(),
            run_name:         run_name.clone(),
            run_uuid:         run_id.clone(),
            source_name:      String::new(),
            source_type:      4,
            source_version:   String::new(),
            start_time:       now_millis(),
            status:           STATUS_RUNNING,
            tags:             Vec::new(),
            user_id:          current_user(),
        };
        write_yaml(&run_dir.join("meta.yaml"), &meta)?;

        let run = MlflowFileRun { run_dir, meta };
        run.write_tag("mlflow.runName", &run_name)?;
        run.write_tag("mlflow.user", &run.meta.user_id)?;
        run.write_tag("mlflow.source.type", "LOCAL")?;
        Ok(run)
    }

    /// Summaries of every run in an experiment.
    pub fn runs(&self, experiment_id: &str) -> TrackingResult<Vec<RunSummary>> {
        let exp_dir = self.root.join(experiment_id);
        let mut out = Vec::new();
        for entry in fs::read_dir(&exp_dir).map_err(io_err(&exp_dir))?.flatten() {
            let run_dir = entry.path();
            let meta_path = run_dir.join("meta.yaml");
            if !run_dir.is_dir() || !meta_path.is_file() {
                continue;
            }
            let meta: RunMeta = match read_yaml(&meta_path) {
                Ok(m)  => m,
                Err(e) => {
                    tracing::debug!("Skipping unreadable run: {e}");
                    continue;
                }
            };
            if meta.lifecycle_stage != "active" {
                continue;
            }
            out.push(RunSummary {
                run_id:     meta.run_id,
                run_name:   meta.run_name,
                status:     status_name(meta.status).to_string(),
                start_time: meta.start_time,
                metrics:    read_latest_metrics(&run_dir.join("metrics"))?,
                params:     read_params(&run_dir.join("params"))?,
            });
        }
        out.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(out)
    }
}

/// Latest value per metric: highest step, then latest timestamp.
fn read_latest_metrics(dir: &Path) -> TrackingResult<BTreeMap<String, f64>> {
    let mut out = BTreeMap::new();
    if !dir.is_dir() {
        return Ok(out);
    }
    for entry in fs::read_dir(dir).map_err(io_err(dir))?.flatten() {
        let path = entry.path();
        let Some(key) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        if !path.is_file() {
            continue;
        }
        let text = fs::read_to_string(&path).map_err(io_err(&path))?;
        let latest = text
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let ts:    i64 = parts.next()?.parse().ok()?;
                let value: f64 = parts.next()?.parse().ok()?;
                let step:  i64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
                Some((step, ts, value))
            })
            .max_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        if let Some((_, _, value)) = latest {
            out.insert(key, value);
        }
    }
    Ok(out)
}

fn read_params(dir: &Path) -> TrackingResult<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    if !dir.is_dir() {
        return Ok(out);
    }
    for entry in fs::read_dir(dir).map_err(io_err(dir))?.flatten() {
        let path = entry.path();
        if let (true, Some(key)) = (path.is_file(), path.file_name().and_then(|n| n.to_str())) {
            let value = fs::read_to_string(&path).map_err(io_err(&path))?;
            out.insert(key.to_string(), value);
        }
    }
    Ok(out)
}

fn copy_recursively(src: &Path, dst: &Path) -> TrackingResult<()> {
    if src.is_dir() {
        fs::create_dir_all(dst).map_err(io_err(dst))?;
        for entry in fs::read_dir(src).map_err(io_err(src))?.flatten() {
            copy_recursively(&entry.path(), &dst.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        fs::copy(src, dst).map(|_| ()).map_err(io_err(src))
    }
}

/// Keys become file names; refuse anything that escapes the run dir.
fn checked_key(key: &str) -> TrackingResult<&str> {
    if key.is_empty() || key.starts_with('/') || key.split('/').any(|p| p == ".." || p.is_empty()) {
        return Err(TrackingError::invalid(BACKEND, format!("invalid key '{key}'")));
    }
    Ok(key)
}

// ─── Run ──────────────────────────────────────────────────────────────────────

pub struct MlflowFileRun {
    run_dir: PathBuf,
    meta:    RunMeta,
}

impl MlflowFileRun {
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn write_tag(&self, key: &str, value: &str) -> TrackingResult<()> {
        let path = self.run_dir.join("tags").join(checked_key(key)?);
        fs::write(&path, value).map_err(io_err(&path))
    }
}

impl TrackingBackend for MlflowFileRun {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn run_id(&self) -> &str {
        &self.meta.run_id
    }

    fn log_params(&mut self, params: &FlatParams) -> TrackingResult<()> {
        for (key, value) in params {
            let path = self.run_dir.join("params").join(checked_key(key)?);
            fs::write(&path, param_to_string(value)).map_err(io_err(&path))?;
        }
        Ok(())
    }

    fn log_metrics(&mut self, metrics: &[(String, f64)], step: Option<u64>) -> TrackingResult<()> {
        let ts   = now_millis();
        let step = step.unwrap_or(0);
        for (key, value) in metrics {
            let path = self.run_dir.join("metrics").join(checked_key(key)?);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(io_err(parent))?;
            }
            let mut f = OpenOptions::new().create(true).append(true).open(&path).map_err(io_err(&path))?;
            writeln!(f, "{ts} {value} {step}").map_err(io_err(&path))?;
        }
        Ok(())
    }

    fn log_artifact(&mut self, local_path: &Path, artifact_path: Option<&str>) -> TrackingResult<()> {
        let mut dest = self.run_dir.join("artifacts");
        if let Some(sub) = artifact_path {
            dest = dest.join(checked_key(sub)?);
        }
        fs::create_dir_all(&dest).map_err(io_err(&dest))?;

        let name = local_path
            .file_name()
            .ok_or_else(|| TrackingError::invalid(BACKEND, format!("'{}' has no file name", local_path.display())))?;
        copy_recursively(local_path, &dest.join(name))
    }

    fn finish(&mut self, status: RunStatus) -> TrackingResult<()> {
        self.meta.status   = status_code(status);
        self.meta.end_time = Some(now_millis());
        write_yaml(&self.run_dir.join("meta.yaml"), &self.meta)
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, MlflowFileStore) {
        let tmp   = tempfile::tempdir().unwrap();
        let store = MlflowFileStore::new(&tmp.path().join("mlruns").display().to_string());
        (tmp, store)
    }

    #[test]
    fn test_experiments_get_ids_and_default() {
        let (_tmp, store) = store();
        let a = store.get_or_create_experiment("alpha").unwrap();
        let b = store.get_or_create_experiment("beta").unwrap();
        let again = store.get_or_create_experiment("alpha").unwrap();

        assert_eq!(a.experiment_id, "1");
        assert_eq!(b.experiment_id, "2");
        assert_eq!(again.experiment_id, "1");

        let names: Vec<String> = store.experiments().unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["Default", "alpha", "beta"]);
    }

    #[test]
    fn test_run_layout_and_finish() {
        let (_tmp, store) = store();
        let mut run = store.start_run("exp", Some("baseline")).unwrap();

        let mut params = FlatParams::new();
        params.insert("hyperparameters.learning_rate".into(), json!(0.001));
        params.insert("data.name".into(), json!("cifar10"));
        run.log_params(&params).unwrap();

        run.log_metrics(&[("val_acc".into(), 0.5)], Some(1)).unwrap();
        run.log_metrics(&[("val_acc".into(), 0.7)], Some(2)).unwrap();
        run.finish(RunStatus::Finished).unwrap();

        let dir = run.run_dir().to_path_buf();
        assert_eq!(fs::read_to_string(dir.join("params/data.name")).unwrap(), "cifar10");
        assert_eq!(fs::read_to_string(dir.join("tags/mlflow.runName")).unwrap(), "baseline");

        let lines: Vec<String> = fs::read_to_string(dir.join("metrics/val_acc"))
            .unwrap().lines().map(str::to_string).collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].ends_with(" 0.7 2"));

        let meta: RunMeta = read_yaml(&dir.join("meta.yaml")).unwrap();
        assert_eq!(meta.status, 3);
        assert!(meta.end_time.is_some());
    }

    #[test]
    fn test_runs_summary_reads_latest_metric() {
        let (_tmp, store) = store();
        let mut run = store.start_run("exp", None).unwrap();
        run.log_metrics(&[("val_acc".into(), 0.9)], Some(5)).unwrap();
        run.log_metrics(&[("val_acc".into(), 0.4)], Some(2)).unwrap();
        run.finish(RunStatus::Failed).unwrap();

        let exp  = store.experiment_by_name("exp").unwrap().unwrap();
        let runs = store.runs(&exp.experiment_id).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].metrics["val_acc"], 0.9);
        assert_eq!(runs[0].status, "FAILED");
        assert!(runs[0].run_name.starts_with("run-"));
    }

    #[test]
    fn test_artifact_copy() {
        let (tmp, store) = store();
        let file = tmp.path().join("report.txt");
        fs::write(&file, "hello").unwrap();

        let mut run = store.start_run("exp", None).unwrap();
        run.log_artifact(&file, Some("reports")).unwrap();
        let copied = run.run_dir().join("artifacts/reports/report.txt");
        assert_eq!(fs::read_to_string(copied).unwrap(), "hello");
    }

    #[test]
    fn test_bad_keys_rejected() {
        let (_tmp, store) = store();
        let mut run = store.start_run("exp", None).unwrap();
        assert!(run.log_metrics(&[("../escape".into(), 1.0)], None).is_err());
        assert!(run.log_metrics(&[("/abs".into(), 1.0)], None).is_err());
    }
}
