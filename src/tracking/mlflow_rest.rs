// ============================================================
// Layer 7 — MLflow REST Client
// ============================================================
// Talks to an MLflow tracking server (tracking_uri = http(s)://)
// through its REST API:
//
//   GET  /api/2.0/mlflow/experiments/get-by-name   → experiment id
//   POST /api/2.0/mlflow/experiments/create        (when missing)
//   POST /api/2.0/mlflow/runs/create               → run id
//   POST /api/2.0/mlflow/runs/log-batch            params (≤100/batch)
//                                                  and metrics
//   POST /api/2.0/mlflow/runs/update               status + end_time
//   POST /api/2.0/mlflow/experiments/search        (runs command)
//   POST /api/2.0/mlflow/runs/search               (runs command)
//
// Artifacts go through the server's artifact proxy, which is
// available when the run's artifact_uri uses the
// `mlflow-artifacts:` scheme (server started with
// --serve-artifacts):
//
//   PUT  /api/2.0/mlflow-artifacts/artifacts/<exp>/<run>/artifacts/<path>
//
// Credentials come from MLFLOW_TRACKING_TOKEN (bearer) or
// MLFLOW_TRACKING_USERNAME / MLFLOW_TRACKING_PASSWORD (basic).

use reqwest::blocking::{Client, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use std::{collections::BTreeMap, fs, path::Path, time::Duration};

use super::{
    compare::{ExperimentInfo, RunSummary},
    now_millis, param_to_string, FlatParams, RunStatus, TrackingBackend, TrackingError,
    TrackingResult,
};

const BACKEND: &str = "mlflow";
const API: &str = "/api/2.0/mlflow";
const PARAMS_PER_BATCH:  usize = 100;
const METRICS_PER_BATCH: usize = 1000;
const MAX_PARAM_LEN:     usize = 6000;
const ARTIFACT_SCHEME:   &str  = "mlflow-artifacts:";

#[derive(Debug, Clone)]
enum Auth {
    None,
    Bearer(String),
    Basic(String, String),
}

impl Auth {
    fn from_env() -> Self {
        if let Ok(token) = std::env::var("MLFLOW_TRACKING_TOKEN") {
            return Auth::Bearer(token);
        }
        match (std::env::var("MLFLOW_TRACKING_USERNAME"), std::env::var("MLFLOW_TRACKING_PASSWORD")) {
            (Ok(u), Ok(p)) => Auth::Basic(u, p),
            _              => Auth::None,
        }
    }
}

// ─── Response shapes ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ExperimentDto {
    experiment_id: String,
    name:          String,
    #[serde(default)]
    artifact_location: String,
    #[serde(default)]
    lifecycle_stage:   String,
}

#[derive(Debug, Deserialize)]
struct GetExperimentResponse {
    experiment: ExperimentDto,
}

#[derive(Debug, Deserialize)]
struct CreateExperimentResponse {
    experiment_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct SearchExperimentsResponse {
    #[serde(default)]
    experiments:     Vec<ExperimentDto>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunInfoDto {
    run_id: String,
    #[serde(default)]
    run_name:     String,
    #[serde(default)]
    experiment_id: String,
    #[serde(default)]
    status:       String,
    #[serde(default, deserialize_with = "int_or_string")]
    start_time:   i64,
    #[serde(default)]
    artifact_uri: String,
}

#[derive(Debug, Deserialize)]
struct KeyValue<V> {
    key:   String,
    value: V,
}

#[derive(Debug, Default, Deserialize)]
struct RunDataDto {
    #[serde(default)]
    metrics: Vec<KeyValue<f64>>,
    #[serde(default)]
    params:  Vec<KeyValue<String>>,
}

#[derive(Debug, Deserialize)]
struct RunDto {
    info: RunInfoDto,
    #[serde(default)]
    data: RunDataDto,
}

#[derive(Debug, Deserialize)]
struct CreateRunResponse {
    run: RunDto,
}

#[derive(Debug, Default, Deserialize)]
struct SearchRunsResponse {
    #[serde(default)]
    runs:            Vec<RunDto>,
    next_page_token: Option<String>,
}

/// MLflow encodes int64 timestamps as JSON strings in some versions.
fn int_or_string<'de, D: serde::Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    match Value::deserialize(d)? {
        Value::Number(n) => Ok(n.as_i64().unwrap_or_default()),
        Value::String(s) => s.parse().map_err(serde::de::Error::custom),
        _                => Ok(0),
    }
}

impl From<RunDto> for RunSummary {
    fn from(run: RunDto) -> Self {
        RunSummary {
            run_id:     run.info.run_id,
            run_name:   run.info.run_name,
            status:     run.info.status,
            start_time: run.info.start_time,
            metrics:    run.data.metrics.into_iter().map(|kv| (kv.key, kv.value)).collect::<BTreeMap<_, _>>(),
            params:     run.data.params.into_iter().map(|kv| (kv.key, kv.value)).collect::<BTreeMap<_, _>>(),
        }
    }
}

// ─── Client ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MlflowRestClient {
    base: String,
    http: Client,
    auth: Auth,
}

impl MlflowRestClient {
    pub fn new(uri: &str) -> TrackingResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|source| TrackingError::Http { backend: BACKEND, source })?;
        Ok(Self {
            base: uri.trim_end_matches('/').to_string(),
            http,
            auth: Auth::from_env(),
        })
    }

    fn authed(&self, rb: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Auth::None         => rb,
            Auth::Bearer(t)    => rb.bearer_auth(t),
            Auth::Basic(u, p)  => rb.basic_auth(u, Some(p)),
        }
    }

    fn api(&self, path: &str) -> String {
        format!("{}{}{}", self.base, API, path)
    }

    /// Send and decode; non-2xx becomes TrackingError::Status.
    fn send<T: DeserializeOwned>(&self, rb: RequestBuilder) -> TrackingResult<T> {
        let resp = self
            .authed(rb)
            .send()
            .map_err(|source| TrackingError::Http { backend: BACKEND, source })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(TrackingError::Status { backend: BACKEND, status: status.as_u16(), body });
        }
        resp.json::<T>()
            .map_err(|source| TrackingError::Http { backend: BACKEND, source })
    }

    fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> TrackingResult<T> {
        self.send(self.http.post(self.api(path)).json(body))
    }

    fn experiment_id_by_name(&self, name: &str) -> TrackingResult<Option<String>> {
        let rb = self
            .http
            .get(self.api("/experiments/get-by-name"))
            .query(&[("experiment_name", name)]);
        match self.send::<GetExperimentResponse>(rb) {
            Ok(r) => Ok(Some(r.experiment.experiment_id)),
            Err(TrackingError::Status { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn get_or_create_experiment(&self, name: &str) -> TrackingResult<String> {
        if let Some(id) = self.experiment_id_by_name(name)? {
            return Ok(id);
        }
        tracing::info!("Creating MLflow experiment '{}'", name);
        let r: CreateExperimentResponse = self.post("/experiments/create", &json!({ "name": name }))?;
        Ok(r.experiment_id)
    }

    /// Create a RUNNING run and hand back its backend handle.
    pub fn start_run(self, experiment: &str, run_name: Option<&str>) -> TrackingResult<MlflowRestRun> {
        let experiment_id = self.get_or_create_experiment(experiment)?;

        let mut body = json!({
            "experiment_id": experiment_id,
            "start_time":    now_millis(),
            "tags":          [{ "key": "mlflow.source.type", "value": "LOCAL" }],
        });
        if let Some(name) = run_name {
            body["run_name"] = json!(name);
            if let Some(tags) = body["tags"].as_array_mut() {
                tags.push(json!({ "key": "mlflow.runName", "value": name }));
            }
        }

        let r: CreateRunResponse = self.post("/runs/create", &body)?;
        Ok(MlflowRestRun {
            run_id:        r.run.info.run_id,
            experiment_id,
            artifact_uri:  r.run.info.artifact_uri,
            client:        self,
        })
    }

    pub fn search_experiments(&self) -> TrackingResult<Vec<ExperimentInfo>> {
        let mut out   = Vec::new();
        let mut token = None::<String>;
        loop {
            let mut body = json!({ "max_results": 1000 });
            if let Some(t) = &token {
                body["page_token"] = json!(t);
            }
            let page: SearchExperimentsResponse = self.post("/experiments/search", &body)?;
            out.extend(
                page.experiments
                    .into_iter()
                    .filter(|e| e.lifecycle_stage.is_empty() || e.lifecycle_stage == "active")
                    .map(|e| ExperimentInfo {
                        experiment_id:     e.experiment_id,
                        name:              e.name,
                        artifact_location: e.artifact_location,
                    }),
            );
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(t) => token = Some(t),
                None    => return Ok(out),
            }
        }
    }

    pub fn search_runs(&self, experiment_id: &str) -> TrackingResult<Vec<RunSummary>> {
        let mut out   = Vec::new();
        let mut token = None::<String>;
        loop {
            let mut body = json!({ "experiment_ids": [experiment_id], "max_results": 1000 });
            if let Some(t) = &token {
                body["page_token"] = json!(t);
            }
            let page: SearchRunsResponse = self.post("/runs/search", &body)?;
            out.extend(page.runs.into_iter().map(RunSummary::from));
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(t) => token = Some(t),
                None    => return Ok(out),
            }
        }
    }
}

/// Artifact proxy URL for `rel` inside a run's artifact root, if the
/// run stores artifacts behind the tracking server.
fn artifact_url(base: &str, artifact_uri: &str, rel: &str) -> Option<String> {
    let root = artifact_uri.strip_prefix(ARTIFACT_SCHEME)?.trim_start_matches('/');
    Some(format!("{base}/api/2.0/mlflow-artifacts/artifacts/{root}/{rel}"))
}

fn collect_files(path: &Path, rel: String, out: &mut Vec<(std::path::PathBuf, String)>) -> TrackingResult<()> {
    if path.is_dir() {
        for entry in fs::read_dir(path).map_err(|e| TrackingError::io(BACKEND, path, e))?.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            collect_files(&entry.path(), format!("{rel}/{name}"), out)?;
        }
    } else {
        out.push((path.to_path_buf(), rel));
    }
    Ok(())
}

// ─── Run ──────────────────────────────────────────────────────────────────────

pub struct MlflowRestRun {
    client:        MlflowRestClient,
    run_id:        String,
    experiment_id: String,
    artifact_uri:  String,
}

impl MlflowRestRun {
    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    fn log_batch(&self, metrics: Vec<Value>, params: Vec<Value>) -> TrackingResult<()> {
        let body = json!({ "run_id": self.run_id, "metrics": metrics, "params": params, "tags": [] });
        self.client.post::<Value>("/runs/log-batch", &body).map(|_| ())
    }
}

impl TrackingBackend for MlflowRestRun {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn run_id(&self) -> &str {
        &self.run_id
    }

    fn log_params(&mut self, params: &FlatParams) -> TrackingResult<()> {
        let all: Vec<Value> = params
            .iter()
            .map(|(k, v)| {
                let value: String = param_to_string(v).chars().take(MAX_PARAM_LEN).collect();
                json!({ "key": k, "value": value })
            })
            .collect();
        for chunk in all.chunks(PARAMS_PER_BATCH) {
            self.log_batch(Vec::new(), chunk.to_vec())?;
        }
        Ok(())
    }

    fn log_metrics(&mut self, metrics: &[(String, f64)], step: Option<u64>) -> TrackingResult<()> {
        let ts = now_millis();
        let all: Vec<Value> = metrics
            .iter()
            .filter(|(_, v)| v.is_finite())
            .map(|(k, v)| json!({ "key": k, "value": v, "timestamp": ts, "step": step.unwrap_or(0) }))
            .collect();
        for chunk in all.chunks(METRICS_PER_BATCH) {
            self.log_batch(chunk.to_vec(), Vec::new())?;
        }
        Ok(())
    }

    fn log_artifact(&mut self, local_path: &Path, artifact_path: Option<&str>) -> TrackingResult<()> {
        let name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| TrackingError::invalid(BACKEND, format!("'{}' has no file name", local_path.display())))?;
        let rel = match artifact_path {
            Some(p) => format!("{}/{}", p.trim_matches('/'), name),
            None    => name,
        };

        let mut files = Vec::new();
        collect_files(local_path, rel, &mut files)?;

        for (file, rel) in files {
            let url = artifact_url(&self.client.base, &self.artifact_uri, &rel).ok_or_else(|| {
                TrackingError::invalid(
                    BACKEND,
                    format!("artifact root '{}' is not served by the tracking server", self.artifact_uri),
                )
            })?;
            let bytes = fs::read(&file).map_err(|e| TrackingError::io(BACKEND, &file, e))?;
            self.client.send::<Value>(self.client.http.put(url).body(bytes))?;
        }
        Ok(())
    }

    fn finish(&mut self, status: RunStatus) -> TrackingResult<()> {
        let body = json!({ "run_id": self.run_id, "status": status.as_str(), "end_time": now_millis() });
        self.client.post::<Value>("/runs/update", &body).map(|_| ())
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Bytes,
        extract::State,
        http::{StatusCode, Uri},
        routing::{get, post, put},
        Json, Router,
    };
    use std::sync::{mpsc, Arc, Mutex};

    type Log = Arc<Mutex<Vec<(String, String)>>>;

    /// Minimal MLflow stand-in on a background thread; records (path, body).
    fn fake_server() -> (String, Log) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let state    = log.clone();
        let (tx, rx) = mpsc::channel();

        std::thread::spawn(move || {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async move {
                async fn record(State(log): State<Log>, uri: Uri, body: Bytes) -> Json<Value> {
                    let path = uri.path().to_string();
                    log.lock().unwrap().push((path.clone(), String::from_utf8_lossy(&body).to_string()));
                    let reply = if path.ends_with("/experiments/create") {
                        json!({ "experiment_id": "7" })
                    } else if path.ends_with("/runs/create") {
                        json!({ "run": { "info": {
                            "run_id": "abc123", "experiment_id": "7",
                            "artifact_uri": "mlflow-artifacts:/7/abc123/artifacts"
                        }}})
                    } else if path.ends_with("/runs/search") {
                        json!({ "runs": [{
                            "info": { "run_id": "abc123", "run_name": "r", "status": "FINISHED", "start_time": "1700000000000" },
                            "data": { "metrics": [{ "key": "val_acc", "value": 0.8 }],
                                      "params":  [{ "key": "seed", "value": "42" }] }
                        }]})
                    } else {
                        json!({})
                    };
                    Json(reply)
                }

                async fn by_name(State(log): State<Log>, uri: Uri) -> (StatusCode, Json<Value>) {
                    log.lock().unwrap().push((uri.path().to_string(), String::new()));
                    if uri.query().unwrap_or_default().contains("known") {
                        (StatusCode::OK, Json(json!({ "experiment": { "experiment_id": "3", "name": "known" } })))
                    } else {
                        (StatusCode::NOT_FOUND, Json(json!({ "error_code": "RESOURCE_DOES_NOT_EXIST" })))
                    }
                }

                let app = Router::new()
                    .route("/api/2.0/mlflow/experiments/get-by-name", get(by_name))
                    .route("/api/2.0/mlflow/experiments/create", post(record))
                    .route("/api/2.0/mlflow/experiments/search", post(record))
                    .route("/api/2.0/mlflow/runs/create", post(record))
                    .route("/api/2.0/mlflow/runs/log-batch", post(record))
                    .route("/api/2.0/mlflow/runs/update", post(record))
                    .route("/api/2.0/mlflow/runs/search", post(record))
                    .route("/api/2.0/mlflow-artifacts/artifacts/{*rest}", put(record))
                    .with_state(state);

                let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
                tx.send(listener.local_addr().unwrap()).unwrap();
                axum::serve(listener, app).await.unwrap();
            });
        });

        let addr = rx.recv().unwrap();
        (format!("http://{addr}"), log)
    }

    fn paths(log: &Log) -> Vec<String> {
        log.lock().unwrap().iter().map(|(p, _)| p.clone()).collect()
    }

    #[test]
    fn test_artifact_url() {
        assert_eq!(
            artifact_url("http://h:5000", "mlflow-artifacts:/1/r/artifacts", "model/x.mpk").unwrap(),
            "http://h:5000/api/2.0/mlflow-artifacts/artifacts/1/r/artifacts/model/x.mpk"
        );
        assert!(artifact_url("http://h", "s3://bucket/1/r/artifacts", "x").is_none());
    }

    #[test]
    fn test_run_lifecycle_against_fake_server() {
        let (uri, log) = fake_server();
        let client = MlflowRestClient::new(&uri).unwrap();
        let mut run = client.start_run("new-exp", Some("baseline")).unwrap();
        assert_eq!(run.run_id(), "abc123");
        assert_eq!(run.experiment_id(), "7");

        let params: FlatParams = (0..150).map(|i| (format!("p{i:03}"), json!(i))).collect();
        run.log_params(&params).unwrap();
        run.log_metrics(&[("val_acc".into(), 0.5), ("bad".into(), f64::NAN)], Some(2)).unwrap();

        let tmp  = tempfile::tempdir().unwrap();
        let file = tmp.path().join("history.json");
        fs::write(&file, "{}").unwrap();
        run.log_artifact(&file, Some("reports")).unwrap();
        run.finish(RunStatus::Finished).unwrap();

        let p = paths(&log);
        assert_eq!(p[0], "/api/2.0/mlflow/experiments/get-by-name");
        assert_eq!(p[1], "/api/2.0/mlflow/experiments/create");
        assert_eq!(p[2], "/api/2.0/mlflow/runs/create");
        // 150 params → two batches, then one metrics batch
        assert_eq!(p.iter().filter(|x| x.ends_with("/runs/log-batch")).count(), 3);
        assert!(p.contains(&"/api/2.0/mlflow-artifacts/artifacts/7/abc123/artifacts/reports/history.json".to_string()));
        assert_eq!(p.last().unwrap(), "/api/2.0/mlflow/runs/update");

        let bodies = log.lock().unwrap();
        let create_run = &bodies[2].1;
        assert!(create_run.contains("mlflow.runName"));
        let metrics_batch = &bodies.iter().filter(|(p, _)| p.ends_with("/runs/log-batch")).last().unwrap().1;
        assert!(metrics_batch.contains("val_acc"));
        assert!(!metrics_batch.contains("\"bad\""));
        let update: Value = serde_json::from_str(&bodies.last().unwrap().1).unwrap();
        assert_eq!(update["status"], "FINISHED");
    }

    #[test]
    fn test_existing_experiment_is_reused() {
        let (uri, log) = fake_server();
        let client = MlflowRestClient::new(&uri).unwrap();
        assert_eq!(client.get_or_create_experiment("known").unwrap(), "3");
        assert!(!paths(&log).iter().any(|p| p.ends_with("/experiments/create")));
    }

    #[test]
    fn test_search_runs_parses_summaries() {
        let (uri, _log) = fake_server();
        let client = MlflowRestClient::new(&uri).unwrap();
        let runs = client.search_runs("7").unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].start_time, 1_700_000_000_000);
        assert_eq!(runs[0].metrics["val_acc"], 0.8);
        assert_eq!(runs[0].params["seed"], "42");
    }

    #[test]
    fn test_connection_refused_is_http_error() {
        let client = MlflowRestClient::new("http://127.0.0.1:9").unwrap();
        assert!(matches!(client.get_or_create_experiment("x"), Err(TrackingError::Http { .. })));
    }
}
