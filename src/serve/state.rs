// ============================================================
// Layer 8 — Server State
// ============================================================
// Shared by every handler (cheap Arc clone per request):
//
//   model     the loaded predictor, if any
//   loader    how to (re)load it from the configured checkpoint
//   dataset   / device   reported by /health before a model exists
//
// Loading is lazy: startup tries once, and any request that
// needs the model retries until a load succeeds. Loads run on
// the blocking pool because they read files and build tensors.

use anyhow::Result;
use std::sync::{Arc, RwLock};

use crate::domain::traits::ImagePredictor;
use crate::serve::error::ApiError;

pub type SharedPredictor = Arc<dyn ImagePredictor>;

/// Produces a predictor, e.g. by reading a checkpoint.
pub type ModelLoader = Arc<dyn Fn() -> Result<SharedPredictor> + Send + Sync>;

struct Shared {
    model:   RwLock<Option<SharedPredictor>>,
    loader:  ModelLoader,
    dataset: String,
    device:  String,
}

#[derive(Clone)]
pub struct AppState {
    inner: Arc<Shared>,
}

impl AppState {
    pub fn new(loader: ModelLoader, dataset: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Shared {
                model:   RwLock::new(None),
                loader,
                dataset: dataset.into(),
                device:  device.into(),
            }),
        }
    }

    /// State with an already-loaded predictor (and no way to reload it).
    pub fn with_predictor(predictor: SharedPredictor, dataset: &str) -> Self {
        let state = Self::new(
            Arc::new(|| -> Result<SharedPredictor> { anyhow::bail!("no checkpoint configured") }),
            dataset,
            "cpu",
        );
        state.store(predictor);
        state
    }

    fn store(&self, predictor: SharedPredictor) {
        let mut slot = self.inner.model.write().unwrap_or_else(|p| p.into_inner());
        *slot = Some(predictor);
    }

    /// Currently loaded model, without trying to load one.
    pub fn current(&self) -> Option<SharedPredictor> {
        self.inner.model.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.current().is_some()
    }

    /// Dataset of the loaded model, or the configured one.
    pub fn dataset(&self) -> String {
        self.current()
            .map(|m| m.info().dataset)
            .unwrap_or_else(|| self.inner.dataset.clone())
    }

    pub fn device(&self) -> &str {
        &self.inner.device
    }

    /// Run the loader synchronously and cache the result.
    pub fn load_now(&self) -> Result<SharedPredictor> {
        let predictor = (self.inner.loader)()?;
        self.store(predictor.clone());
        Ok(predictor)
    }

    /// The loaded model, loading it first if needed.
    pub async fn model(&self) -> Result<SharedPredictor, ApiError> {
        if let Some(m) = self.current() {
            return Ok(m);
        }
        let state = self.clone();
        match tokio::task::spawn_blocking(move || state.load_now()).await {
            Ok(Ok(m)) => Ok(m),
            Ok(Err(e)) => {
                tracing::warn!("Model load failed: {e:#}");
                Err(ApiError::ModelNotLoaded)
            }
            Err(e) => {
                tracing::warn!("Model load task failed: {e}");
                Err(ApiError::ModelNotLoaded)
            }
        }
    }
}
