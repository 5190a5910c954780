// ============================================================
// Layer 7 — Experiment Tracking
// ============================================================
// One training run can report to zero, one or two telemetry
// backends at once:
//
//   MLflow  → REST server (tracking_uri = http://...)
//           → local file store (any other tracking_uri)
//   W&B     → online (HTTP), offline (files under wandb/),
//             or disabled
//
// Every backend implements TrackingBackend. ExperimentTracker
// owns the backends that initialised successfully and fans each
// call out to all of them:
//
//   init fails          → warn, drop that backend, keep going
//   a log call fails    → warn, keep the backend, keep going
//   zero backends left  → every call is a no-op
//
// Tracking never aborts training. Failures only ever surface as
// `tracing::warn!` lines naming the backend.
//
// The tracker finishes its runs exactly once: explicitly through
// finish(), or from Drop (status FAILED) when a training error
// unwinds past it.

pub mod compare;
pub mod mlflow_file;
pub mod mlflow_rest;
pub mod wandb;

use serde_json::Value;
use std::{collections::BTreeMap, path::Path};
use thiserror::Error;

use crate::config::{AppConfig, TrackingChoice, WandbMode};

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("{backend}: request failed: {source}")]
    Http {
        backend: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{backend}: server answered {status}: {body}")]
    Status {
        backend: &'static str,
        status:  u16,
        body:    String,
    },

    #[error("{backend}: I/O error on '{path}': {source}")]
    Io {
        backend: &'static str,
        path:    String,
        #[source]
        source:  std::io::Error,
    },

    #[error("{backend}: {message}")]
    Invalid {
        backend: &'static str,
        message: String,
    },
}

impl TrackingError {
    pub fn io(backend: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io { backend, path: path.display().to_string(), source }
    }

    pub fn invalid(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid { backend, message: message.into() }
    }
}

pub type TrackingResult<T> = Result<T, TrackingError>;

// ─── Run data ─────────────────────────────────────────────────────────────────

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Finished,
    Failed,
    Killed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Finished => "FINISHED",
            RunStatus::Failed   => "FAILED",
            RunStatus::Killed   => "KILLED",
        }
    }
}

/// Flattened `a.b.c → scalar` parameters.
pub type FlatParams = BTreeMap<String, Value>;

/// Flatten nested JSON objects into dotted keys.
///
/// Scalars are kept as they are; arrays become their JSON text.
pub fn flatten_params(value: &Value) -> FlatParams {
    fn walk(prefix: &str, value: &Value, out: &mut FlatParams) {
        match value {
            Value::Object(map) => {
                for (k, v) in map {
                    let key = if prefix.is_empty() { k.clone() } else { format!("{prefix}.{k}") };
                    walk(&key, v, out);
                }
            }
            Value::Array(_) => {
                out.insert(prefix.to_string(), Value::String(value.to_string()));
            }
            scalar => {
                out.insert(prefix.to_string(), scalar.clone());
            }
        }
    }

    let mut out = FlatParams::new();
    walk("", value, &mut out);
    out
}

/// Text form of a parameter value (strings unquoted, null → "None").
pub fn param_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null      => "None".to_string(),
        other            => other.to_string(),
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ─── Backend trait ────────────────────────────────────────────────────────────

/// One telemetry destination with an open run.
pub trait TrackingBackend: Send {
    /// Short name used in log lines, e.g. "mlflow"
    fn name(&self) -> &'static str;

    fn run_id(&self) -> &str;

    fn log_params(&mut self, params: &FlatParams) -> TrackingResult<()>;

    fn log_metrics(&mut self, metrics: &[(String, f64)], step: Option<u64>) -> TrackingResult<()>;

    /// Upload a file (or every file of a directory) under `artifact_path`.
    fn log_artifact(&mut self, local_path: &Path, artifact_path: Option<&str>) -> TrackingResult<()>;

    fn finish(&mut self, status: RunStatus) -> TrackingResult<()>;
}

/// Which kinds of data are forwarded to the backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSwitches {
    pub params:    bool,
    pub metrics:   bool,
    pub artifacts: bool,
    pub models:    bool,
}

impl Default for LogSwitches {
    fn default() -> Self {
        Self { params: true, metrics: true, artifacts: true, models: true }
    }
}

// ─── ExperimentTracker ────────────────────────────────────────────────────────

pub struct ExperimentTracker {
    backends: Vec<Box<dyn TrackingBackend>>,
    switches: LogSwitches,
    finished: bool,
}

impl ExperimentTracker {
    /// A tracker with no backends; every call is a no-op.
    pub fn disabled() -> Self {
        Self::with_backends(Vec::new(), LogSwitches::default())
    }

    pub fn with_backends(backends: Vec<Box<dyn TrackingBackend>>, switches: LogSwitches) -> Self {
        Self { backends, switches, finished: false }
    }

    /// Open a run on every configured backend that can be reached.
    ///
    /// Never fails: a backend that cannot start is logged and left out.
    pub fn from_config(cfg: &AppConfig) -> Self {
        let t = &cfg.tracking;
        let switches = LogSwitches {
            params:    t.log_params,
            metrics:   t.log_metrics,
            artifacts: t.log_artifacts,
            models:    t.log_models,
        };

        if !t.enabled || t.backend == TrackingChoice::None {
            tracing::info!("Experiment tracking is disabled");
            return Self::with_backends(Vec::new(), switches);
        }

        let mut backends: Vec<Box<dyn TrackingBackend>> = Vec::new();

        if t.backend.wants_mlflow() {
            match mlflow_backend(cfg) {
                Ok(b) => {
                    tracing::info!("MLflow tracking initialised (uri: {}, run: {})", t.tracking_uri, b.run_id());
                    backends.push(b);
                }
                Err(e) => tracing::warn!("Could not initialise MLflow, continuing without it: {e}"),
            }
        }

        if t.backend.wants_wandb() {
            if t.mode == WandbMode::Disabled {
                tracing::info!("W&B mode is 'disabled', skipping");
            } else {
                match wandb::WandbRun::init(cfg) {
                    Ok(b) => {
                        tracing::info!("W&B tracking initialised (project: {}, run: {})", t.project, b.run_id());
                        backends.push(Box::new(b));
                    }
                    Err(e) => tracing::warn!("Could not initialise W&B, continuing without it: {e}"),
                }
            }
        }

        if backends.is_empty() {
            tracing::warn!("No tracking backends initialised");
        }
        Self::with_backends(backends, switches)
    }

    pub fn active_backends(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    pub fn is_active(&self) -> bool {
        !self.backends.is_empty()
    }

    /// Run every backend through `f`; failures become warnings.
    fn fan_out<F>(&mut self, what: &str, mut f: F)
    where
        F: FnMut(&mut dyn TrackingBackend) -> TrackingResult<()>,
    {
        for backend in self.backends.iter_mut() {
            if let Err(e) = f(backend.as_mut()) {
                tracing::warn!("Could not {} to {}: {}", what, backend.name(), e);
            }
        }
    }

    pub fn log_params(&mut self, params: &FlatParams) {
        if !self.switches.params {
            return;
        }
        self.fan_out("log params", |b| b.log_params(params));
    }

    /// Flatten the whole config and log it as params.
    pub fn log_config(&mut self, cfg: &AppConfig) {
        match serde_json::to_value(cfg) {
            Ok(v)  => self.log_params(&flatten_params(&v)),
            Err(e) => tracing::warn!("Could not serialise config for tracking: {e}"),
        }
    }

    pub fn log_metrics(&mut self, metrics: &[(String, f64)], step: Option<u64>) {
        if !self.switches.metrics {
            return;
        }
        self.fan_out("log metrics", |b| b.log_metrics(metrics, step));
    }

    pub fn log_artifact(&mut self, local_path: &Path, artifact_path: Option<&str>) {
        if !self.switches.artifacts {
            return;
        }
        if !local_path.exists() {
            tracing::warn!("Artifact '{}' does not exist, not logging it", local_path.display());
            return;
        }
        self.fan_out("log artifact", |b| b.log_artifact(local_path, artifact_path));
    }

    /// Upload a checkpoint file under the "model" artifact path.
    pub fn log_model(&mut self, checkpoint: &Path) {
        if !self.switches.models {
            return;
        }
        if !checkpoint.exists() {
            tracing::warn!("Checkpoint '{}' does not exist, not logging it", checkpoint.display());
            return;
        }
        self.fan_out("log model", |b| b.log_artifact(checkpoint, Some("model")));
    }

    /// Close all runs with `status`. Later calls do nothing.
    pub fn finish(&mut self, status: RunStatus) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.fan_out("finish run", |b| b.finish(status));
        for b in &self.backends {
            tracing::info!("{} run {} ended ({})", b.name(), b.run_id(), status.as_str());
        }
    }
}

impl Drop for ExperimentTracker {
    fn drop(&mut self) {
        if !self.finished && self.is_active() {
            self.finish(RunStatus::Failed);
        }
    }
}

fn is_http_uri(uri: &str) -> bool {
    uri.starts_with("http://") || uri.starts_with("https://")
}

fn mlflow_backend(cfg: &AppConfig) -> TrackingResult<Box<dyn TrackingBackend>> {
    let uri        = &cfg.tracking.tracking_uri;
    let experiment = cfg.tracking_experiment();
    let run_name   = cfg.tracking_run_name();

    if is_http_uri(uri) {
        let client = mlflow_rest::MlflowRestClient::new(uri)?;
        Ok(Box::new(client.start_run(experiment, run_name)?))
    } else {
        let store = mlflow_file::MlflowFileStore::new(uri);
        Ok(Box::new(store.start_run(experiment, run_name)?))
    }
}
