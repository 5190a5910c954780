// ============================================================
// Layer 7 — Weights & Biases
// ============================================================
// A W&B run in one of two modes:
//
//   online   GraphQL  POST {base}/graphql
//              viewer { entity }          (when no entity given)
//              upsertBucket               create run / update config
//              RunUploadUrls              signed URLs for run files
//            stream   POST {base}/files/{entity}/{project}/{run}/file_stream
//              wandb-history.jsonl        one JSON row per log call
//              wandb-summary.json         latest value of each metric
//              {"complete": true}         on finish
//
//   offline  {wandb_dir}/offline-run-<time>-<id>/files/
//              config.yaml
//              wandb-history.jsonl
//              wandb-summary.json
//              wandb-metadata.json        written on finish
//              <artifact_path>/<file>     copied artifacts
//            (can be pushed later with `wandb sync`)
//
// Each history row carries `_step` (monotonic per run),
// `_runtime` and `_timestamp`; when the caller passes a step it
// is stored as `epoch`.
//
// Online mode authenticates with HTTP basic auth "api:<key>".
// The key comes from `tracking.api_key` or WANDB_API_KEY.

use reqwest::blocking::{Client, RequestBuilder};
use serde_json::{json, Map, Value};
use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use super::{FlatParams, RunStatus, TrackingBackend, TrackingError, TrackingResult};
use crate::config::{AppConfig, WandbMode};

const BACKEND: &str = "wandb";
const HISTORY_FILE: &str = "wandb-history.jsonl";
const SUMMARY_FILE: &str = "wandb-summary.json";

const VIEWER_QUERY: &str = "query Viewer { viewer { entity } }";

const UPSERT_BUCKET: &str = r#"
mutation UpsertBucket($id: String, $name: String, $project: String, $entity: String,
                      $groupName: String, $jobType: String, $tags: [String!],
                      $notes: String, $displayName: String, $config: JSONString) {
  upsertBucket(input: {
    id: $id, name: $name, modelName: $project, entityName: $entity,
    groupName: $groupName, jobType: $jobType, tags: $tags, notes: $notes,
    displayName: $displayName, config: $config
  }) {
    bucket { id name displayName }
  }
}"#;

const RUN_UPLOAD_URLS: &str = r#"
query RunUploadUrls($name: String!, $files: [String]!, $entity: String, $project: String!) {
  model(name: $project, entityName: $entity) {
    bucket(name: $name) {
      id
      files(names: $files) { edges { node { name url } } }
    }
  }
}"#;

/// Config value from the run's settings, then the environment.
fn resolve_api_key(configured: Option<&str>, env: Option<String>) -> Option<String> {
    configured
        .map(str::to_string)
        .or(env)
        .filter(|k| !k.trim().is_empty())
}

/// Short lowercase run id in the style W&B generates.
fn new_run_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// W&B stores config entries as `{key: {"value": v}}`.
fn wandb_config(params: &Map<String, Value>) -> Map<String, Value> {
    params
        .iter()
        .map(|(k, v)| (k.clone(), json!({ "value": v })))
        .collect()
}

// ─── Online ───────────────────────────────────────────────────────────────────

struct OnlineApi {
    http:    Client,
    base:    String,
    api_key: String,
    entity:  String,
    project: String,
}

impl OnlineApi {
    fn authed(&self, rb: RequestBuilder) -> RequestBuilder {
        rb.basic_auth("api", Some(&self.api_key))
    }

    fn send(&self, rb: RequestBuilder) -> TrackingResult<Value> {
        let resp = self
            .authed(rb)
            .send()
            .map_err(|source| TrackingError::Http { backend: BACKEND, source })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(TrackingError::Status { backend: BACKEND, status: status.as_u16(), body });
        }
        let text = resp.text().map_err(|source| TrackingError::Http { backend: BACKEND, source })?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| TrackingError::invalid(BACKEND, format!("bad response: {e}")))
    }

    fn graphql(&self, query: &str, variables: Value) -> TrackingResult<Value> {
        let body = json!({ "query": query, "variables": variables });
        let resp = self.send(self.http.post(format!("{}/graphql", self.base)).json(&body))?;
        if let Some(errors) = resp.get("errors").and_then(Value::as_array).filter(|e| !e.is_empty()) {
            return Err(TrackingError::invalid(BACKEND, format!("graphql error: {}", Value::from(errors.clone()))));
        }
        Ok(resp.get("data").cloned().unwrap_or(Value::Null))
    }

    fn viewer_entity(&self) -> TrackingResult<String> {
        let data = self.graphql(VIEWER_QUERY, json!({}))?;
        data.pointer("/viewer/entity")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| TrackingError::invalid(BACKEND, "could not determine the default entity"))
    }

    fn upsert_run(&self, run_id: &str, extra: Value) -> TrackingResult<()> {
        let mut vars = json!({ "name": run_id, "project": self.project, "entity": self.entity });
        if let (Some(vars), Some(extra)) = (vars.as_object_mut(), extra.as_object()) {
            vars.extend(extra.clone());
        }
        let data = self.graphql(UPSERT_BUCKET, vars)?;
        if data.pointer("/upsertBucket/bucket").is_none() {
            return Err(TrackingError::invalid(BACKEND, "upsertBucket returned no run"));
        }
        Ok(())
    }

    fn stream(&self, run_id: &str, body: Value) -> TrackingResult<()> {
        let url = format!("{}/files/{}/{}/{}/file_stream", self.base, self.entity, self.project, run_id);
        self.send(self.http.post(url).json(&body)).map(|_| ())
    }

    fn upload(&self, run_id: &str, files: &[(PathBuf, String)]) -> TrackingResult<()> {
        let names: Vec<&str> = files.iter().map(|(_, n)| n.as_str()).collect();
        let data = self.graphql(
            RUN_UPLOAD_URLS,
            json!({ "name": run_id, "files": names, "entity": self.entity, "project": self.project }),
        )?;
        let edges = data
            .pointer("/model/bucket/files/edges")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for (path, name) in files {
            let url = edges
                .iter()
                .filter_map(|e| e.get("node"))
                .find(|n| n.get("name").and_then(Value::as_str) == Some(name.as_str()))
                .and_then(|n| n.get("url").and_then(Value::as_str))
                .ok_or_else(|| TrackingError::invalid(BACKEND, format!("no upload URL for '{name}'")))?;
            let bytes = fs::read(path).map_err(|e| TrackingError::io(BACKEND, path, e))?;
            // signed URLs carry their own credentials
            let resp = self
                .http
                .put(url)
                .body(bytes)
                .send()
                .map_err(|source| TrackingError::Http { backend: BACKEND, source })?;
            if !resp.status().is_success() {
                let status = resp.status().as_u16();
                return Err(TrackingError::Status { backend: BACKEND, status, body: resp.text().unwrap_or_default() });
            }
        }
        Ok(())
    }
}

// ─── Offline ──────────────────────────────────────────────────────────────────

struct OfflineDir {
    files: PathBuf,
}

impl OfflineDir {
    fn create(wandb_dir: &Path, run_id: &str) -> TrackingResult<Self> {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let files = wandb_dir.join(format!("offline-run-{stamp}-{run_id}")).join("files");
        fs::create_dir_all(&files).map_err(|e| TrackingError::io(BACKEND, &files, e))?;
        Ok(Self { files })
    }

    fn write(&self, name: &str, contents: &str) -> TrackingResult<()> {
        let path = self.files.join(name);
        fs::write(&path, contents).map_err(|e| TrackingError::io(BACKEND, &path, e))
    }

    fn append_line(&self, name: &str, line: &str) -> TrackingResult<()> {
        let path = self.files.join(name);
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| TrackingError::io(BACKEND, &path, e))?;
        writeln!(f, "{line}").map_err(|e| TrackingError::io(BACKEND, &path, e))
    }

    fn copy(&self, files: &[(PathBuf, String)]) -> TrackingResult<()> {
        for (src, name) in files {
            let dest = self.files.join(name);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| TrackingError::io(BACKEND, parent, e))?;
            }
            fs::copy(src, &dest).map_err(|e| TrackingError::io(BACKEND, src, e))?;
        }
        Ok(())
    }
}

enum Sink {
    Online(OnlineApi),
    Offline(OfflineDir),
}

// ─── Run ──────────────────────────────────────────────────────────────────────

pub struct WandbRun {
    run_id:        String,
    sink:          Sink,
    started:       Instant,
    step:          u64,
    history_lines: u64,
    config:        Map<String, Value>,
    summary:       Map<String, Value>,
}

impl WandbRun {
    /// Start a run according to `tracking.mode`.
    pub fn init(cfg: &AppConfig) -> TrackingResult<Self> {
        let t      = &cfg.tracking;
        let run_id = new_run_id();

        let sink = match t.mode {
            WandbMode::Disabled => return Err(TrackingError::invalid(BACKEND, "mode is 'disabled'")),
            WandbMode::Offline  => {
                let dir = OfflineDir::create(Path::new(&t.wandb_dir), &run_id)?;
                tracing::info!("W&B offline run stored in '{}'", dir.files.display());
                Sink::Offline(dir)
            }
            WandbMode::Online => {
                let api_key = resolve_api_key(t.api_key.as_deref(), std::env::var("WANDB_API_KEY").ok())
                    .ok_or_else(|| {
                        TrackingError::invalid(BACKEND, "no API key (set tracking.api_key or WANDB_API_KEY)")
                    })?;
                let http = Client::builder()
                    .timeout(Duration::from_secs(15))
                    .build()
                    .map_err(|source| TrackingError::Http { backend: BACKEND, source })?;
                let mut api = OnlineApi {
                    http,
                    base: t.base_url.trim_end_matches('/').to_string(),
                    api_key,
                    entity: t.entity.clone().unwrap_or_default(),
                    project: t.project.clone(),
                };
                if api.entity.is_empty() {
                    api.entity = api.viewer_entity()?;
                }
                api.upsert_run(
                    &run_id,
                    json!({
                        "displayName": cfg.tracking_run_name(),
                        "groupName":   t.group,
                        "jobType":     t.job_type,
                        "tags":        t.tags,
                        "notes":       t.notes,
                    }),
                )?;
                Sink::Online(api)
            }
        };

        Ok(Self {
            run_id,
            sink,
            started: Instant::now(),
            step: 0,
            history_lines: 0,
            config: Map::new(),
            summary: Map::new(),
        })
    }

    fn history_row(&self, metrics: &[(String, f64)], epoch: Option<u64>) -> Value {
        let mut row = Map::new();
        for (k, v) in metrics {
            row.insert(k.clone(), json!(v));
        }
        if let Some(e) = epoch {
            row.insert("epoch".into(), json!(e));
        }
        row.insert("_step".into(), json!(self.step));
        row.insert("_runtime".into(), json!(self.started.elapsed().as_secs_f64()));
        row.insert("_timestamp".into(), json!(chrono::Utc::now().timestamp_millis() as f64 / 1000.0));
        Value::Object(row)
    }

    #[cfg(test)]
    fn files_dir(&self) -> Option<&Path> {
        match &self.sink {
            Sink::Offline(d) => Some(&d.files),
            Sink::Online(_)  => None,
        }
    }
}

impl TrackingBackend for WandbRun {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn run_id(&self) -> &str {
        &self.run_id
    }

    fn log_params(&mut self, params: &FlatParams) -> TrackingResult<()> {
        self.config.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
        let config = wandb_config(&self.config);
        match &self.sink {
            Sink::Online(api) => {
                let config = Value::Object(config).to_string();
                api.upsert_run(&self.run_id, json!({ "config": config }))
            }
            Sink::Offline(dir) => {
                let yaml = serde_yaml::to_string(&config)
                    .map_err(|e| TrackingError::invalid(BACKEND, format!("config.yaml: {e}")))?;
                dir.write("config.yaml", &yaml)
            }
        }
    }

    fn log_metrics(&mut self, metrics: &[(String, f64)], step: Option<u64>) -> TrackingResult<()> {
        let metrics: Vec<(String, f64)> = metrics.iter().filter(|(_, v)| v.is_finite()).cloned().collect();
        if metrics.is_empty() {
            return Ok(());
        }
        let row = self.history_row(&metrics, step);
        if let Some(obj) = row.as_object() {
            self.summary.extend(obj.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        let summary = Value::Object(self.summary.clone()).to_string();

        match &self.sink {
            Sink::Online(api) => api.stream(
                &self.run_id,
                json!({ "files": {
                    HISTORY_FILE: { "offset": self.history_lines, "content": [row.to_string()] },
                    SUMMARY_FILE: { "offset": 0, "content": [summary] },
                }}),
            )?,
            Sink::Offline(dir) => {
                dir.append_line(HISTORY_FILE, &row.to_string())?;
                dir.write(SUMMARY_FILE, &summary)?;
            }
        }
        self.step += 1;
        self.history_lines += 1;
        Ok(())
    }

    fn log_artifact(&mut self, local_path: &Path, artifact_path: Option<&str>) -> TrackingResult<()> {
        let mut files = Vec::new();
        collect(local_path, artifact_path, &mut files)?;
        match &self.sink {
            Sink::Online(api)  => api.upload(&self.run_id, &files),
            Sink::Offline(dir) => dir.copy(&files),
        }
    }

    fn finish(&mut self, status: RunStatus) -> TrackingResult<()> {
        let exitcode = if status == RunStatus::Finished { 0 } else { 1 };
        match &self.sink {
            Sink::Online(api) => api.stream(&self.run_id, json!({ "complete": true, "exitcode": exitcode })),
            Sink::Offline(dir) => {
                let meta = json!({
                    "run_id":   self.run_id,
                    "state":    status.as_str().to_lowercase(),
                    "exitcode": exitcode,
                    "runtime":  self.started.elapsed().as_secs_f64(),
                });
                dir.write("wandb-metadata.json", &meta.to_string())
            }
        }
    }
}

/// Files under `path` paired with their run-relative names.
fn collect(path: &Path, prefix: Option<&str>, out: &mut Vec<(PathBuf, String)>) -> TrackingResult<()> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| TrackingError::invalid(BACKEND, format!("'{}' has no file name", path.display())))?;
    let rel = match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(p) => format!("{p}/{name}"),
        None    => name,
    };
    if path.is_dir() {
        for entry in fs::read_dir(path).map_err(|e| TrackingError::io(BACKEND, path, e))?.flatten() {
            collect(&entry.path(), Some(&rel), out)?;
        }
    } else {
        out.push((path.to_path_buf(), rel));
    }
    Ok(())
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Bytes,
        extract::State,
        http::{HeaderMap, Uri},
        routing::{post, put},
        Json, Router,
    };
    use std::sync::{mpsc, Arc, Mutex};

    fn offline_cfg(dir: &Path) -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.tracking.mode      = WandbMode::Offline;
        cfg.tracking.wandb_dir = dir.display().to_string();
        cfg
    }

    #[test]
    fn test_api_key_resolution() {
        assert_eq!(resolve_api_key(Some("abc"), Some("env".into())).as_deref(), Some("abc"));
        assert_eq!(resolve_api_key(None, Some("env".into())).as_deref(), Some("env"));
        assert_eq!(resolve_api_key(Some("  "), None), None);
        assert_eq!(resolve_api_key(None, None), None);
    }

    #[test]
    fn test_run_id_shape() {
        let id = new_run_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_disabled_mode_refuses_init() {
        let mut cfg = AppConfig::default();
        cfg.tracking.mode = WandbMode::Disabled;
        assert!(WandbRun::init(&cfg).is_err());
    }

    #[test]
    fn test_offline_run_writes_files() {
        let tmp = tempfile::tempdir().unwrap();
        let mut run = WandbRun::init(&offline_cfg(tmp.path())).unwrap();
        let files = run.files_dir().unwrap().to_path_buf();
        assert!(files.starts_with(tmp.path()));

        let params: FlatParams = [("hyperparameters.learning_rate".to_string(), json!(0.001))].into();
        run.log_params(&params).unwrap();
        run.log_metrics(&[("train_loss".into(), 1.5), ("val_acc".into(), 0.4)], Some(1)).unwrap();
        run.log_metrics(&[("train_loss".into(), 1.2), ("val_acc".into(), 0.5)], Some(2)).unwrap();

        let report = tmp.path().join("report.txt");
        fs::write(&report, "ok").unwrap();
        run.log_artifact(&report, Some("reports")).unwrap();
        run.finish(RunStatus::Finished).unwrap();

        let history = fs::read_to_string(files.join(HISTORY_FILE)).unwrap();
        let rows: Vec<Value> = history.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["_step"], 0);
        assert_eq!(rows[1]["_step"], 1);
        assert_eq!(rows[1]["epoch"], 2);

        let summary: Value = serde_json::from_str(&fs::read_to_string(files.join(SUMMARY_FILE)).unwrap()).unwrap();
        assert_eq!(summary["val_acc"], 0.5);

        let config = fs::read_to_string(files.join("config.yaml")).unwrap();
        assert!(config.contains("hyperparameters.learning_rate"));
        assert!(files.join("reports/report.txt").exists());

        let meta: Value = serde_json::from_str(&fs::read_to_string(files.join("wandb-metadata.json")).unwrap()).unwrap();
        assert_eq!(meta["exitcode"], 0);
    }

    #[test]
    fn test_non_finite_metrics_are_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let mut run = WandbRun::init(&offline_cfg(tmp.path())).unwrap();
        run.log_metrics(&[("loss".into(), f64::NAN)], Some(1)).unwrap();
        assert!(!run.files_dir().unwrap().join(HISTORY_FILE).exists());
    }

    type Log = Arc<Mutex<Vec<(String, String)>>>;

    /// W&B stand-in answering GraphQL, file_stream and uploads.
    fn fake_wandb() -> (String, Log) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let state    = log.clone();
        let (tx, rx) = mpsc::channel();

        std::thread::spawn(move || {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async move {
                async fn handle(State(log): State<Log>, headers: HeaderMap, uri: Uri, body: Bytes) -> Json<Value> {
                    let text = String::from_utf8_lossy(&body).to_string();
                    log.lock().unwrap().push((uri.path().to_string(), text.clone()));
                    if uri.path() != "/graphql" {
                        return Json(json!({}));
                    }
                    let host = headers.get("host").and_then(|h| h.to_str().ok()).unwrap_or_default().to_string();
                    if text.contains("RunUploadUrls") {
                        Json(json!({ "data": { "model": { "bucket": { "id": "b", "files": { "edges": [
                            { "node": { "name": "reports/r.txt", "url": format!("http://{host}/upload/r.txt") } }
                        ]}}}}}))
                    } else {
                        Json(json!({ "data": { "upsertBucket": { "bucket": { "id": "b", "name": "x" } } } }))
                    }
                }

                let app = Router::new()
                    .route("/graphql", post(handle))
                    .route("/files/{*rest}", post(handle))
                    .route("/upload/{*rest}", put(handle))
                    .with_state(state);
                let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
                tx.send(listener.local_addr().unwrap()).unwrap();
                axum::serve(listener, app).await.unwrap();
            });
        });

        (format!("http://{}", rx.recv().unwrap()), log)
    }

    #[test]
    fn test_online_run_against_fake_server() {
        let (base, log) = fake_wandb();
        let mut cfg = AppConfig::default();
        cfg.tracking.base_url = base;
        cfg.tracking.api_key  = Some("secret".into());
        cfg.tracking.entity   = Some("team".into());

        let mut run = WandbRun::init(&cfg).unwrap();
        let id = run.run_id().to_string();
        run.log_metrics(&[("val_acc".into(), 0.7)], Some(1)).unwrap();

        let tmp  = tempfile::tempdir().unwrap();
        let file = tmp.path().join("r.txt");
        fs::write(&file, "report").unwrap();
        run.log_artifact(&file, Some("reports")).unwrap();
        run.finish(RunStatus::Finished).unwrap();

        let calls = log.lock().unwrap();
        let stream_path = format!("/files/team/image-classifier/{id}/file_stream");
        assert_eq!(calls[0].0, "/graphql");
        assert!(calls[0].1.contains("UpsertBucket"));
        assert_eq!(calls[1].0, stream_path);
        assert!(calls[1].1.contains(HISTORY_FILE));
        assert!(calls.iter().any(|(p, b)| p == "/upload/r.txt" && b == "report"));
        let last: Value = serde_json::from_str(&calls.last().unwrap().1).unwrap();
        assert_eq!(last["complete"], true);
    }
}
