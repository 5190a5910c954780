// ============================================================
// Layer 8 — HTTP Handlers
// ============================================================
//   GET  /               service name, version, endpoint list
//   GET  /health         status, model_loaded, device, dataset
//   GET  /classes        dataset + class names of the model
//   GET  /model-info     architecture, classes, input shape,
//                        checkpoint epoch and val_acc
//   POST /predict        multipart `file` → one prediction
//   POST /predict_batch  multipart `files` → one result per file;
//                        a bad file fails alone, never the batch
//
// Decoding and the forward pass run on the blocking pool.

use axum::{
    body::Bytes,
    extract::{Multipart, State},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};

use crate::data::transform::decode_image;
use crate::domain::prediction::{ModelInfo, Prediction};
use crate::serve::{
    error::ApiError,
    state::{AppState, SharedPredictor},
};

/// One uploaded multipart part.
#[derive(Debug, Clone)]
pub struct Upload {
    pub field:        String,
    pub filename:     Option<String>,
    pub content_type: Option<String>,
    pub bytes:        Bytes,
}

impl Upload {
    fn is_image(&self) -> bool {
        self.content_type.as_deref().is_some_and(|ct| ct.starts_with("image/"))
    }

    fn check_image(&self) -> Result<(), ApiError> {
        if self.is_image() {
            Ok(())
        } else {
            Err(ApiError::BadRequest("File must be an image".to_string()))
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    pub success:    bool,
    pub filename:   Option<String>,
    #[serde(flatten)]
    pub prediction: Prediction,
}

#[derive(Debug, Serialize)]
pub struct BatchItem {
    pub filename:   Option<String>,
    pub success:    bool,
    #[serde(flatten)]
    pub prediction: Option<Prediction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error:      Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub success: bool,
    pub count:   usize,
    pub results: Vec<BatchItem>,
}

async fn read_uploads(multipart: &mut Multipart) -> Result<Vec<Upload>, ApiError> {
    let mut uploads = Vec::new();
    while let Some(field) = multipart.next_field().await? {
        let field_name   = field.name().unwrap_or_default().to_string();
        let filename     = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let bytes        = field.bytes().await?;
        uploads.push(Upload { field: field_name, filename, content_type, bytes });
    }
    Ok(uploads)
}

/// Decode and classify on the blocking pool.
async fn classify(model: SharedPredictor, bytes: Bytes) -> Result<Prediction, ApiError> {
    let channels = model.info().input_channels;
    tokio::task::spawn_blocking(move || {
        let image = decode_image(&bytes, channels)?;
        model.predict(&image)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("Prediction task failed: {e}")))?
    .map_err(ApiError::from)
}

// ─── Handlers ─────────────────────────────────────────────────────────────────

pub async fn root() -> Json<Value> {
    Json(json!({
        "message": "Image Classification API",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "/health":        "Health check",
            "/classes":       "Class names of the loaded model",
            "/model-info":    "Model details",
            "/predict":       "Classify one image (multipart field `file`)",
            "/predict_batch": "Classify many images (multipart field `files`)",
        }
    }))
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status":       "healthy",
        "model_loaded": state.is_loaded(),
        "device":       state.device(),
        "dataset":      state.dataset(),
    }))
}

pub async fn classes(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let model = state.model().await?;
    let info  = model.info();
    Ok(Json(json!({ "dataset": info.dataset, "classes": model.classes() })))
}

pub async fn model_info(State(state): State<AppState>) -> Result<Json<ModelInfo>, ApiError> {
    Ok(Json(state.model().await?.info()))
}

pub async fn predict(
    State(state):  State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<PredictResponse>, ApiError> {
    let model   = state.model().await?;
    let uploads = read_uploads(&mut multipart).await?;
    let upload  = uploads
        .iter()
        .find(|u| u.field == "file")
        .or_else(|| uploads.iter().find(|u| u.filename.is_some()))
        .cloned()
        .ok_or_else(|| ApiError::BadRequest("No file uploaded".to_string()))?;

    upload.check_image()?;
    let prediction = classify(model, upload.bytes).await?;

    tracing::debug!(
        "Predicted '{}' ({:.3}) for {:?}",
        prediction.predicted_class, prediction.confidence, upload.filename
    );
    Ok(Json(PredictResponse { success: true, filename: upload.filename, prediction }))
}

pub async fn predict_batch(
    State(state):  State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<BatchResponse>, ApiError> {
    let model   = state.model().await?;
    let uploads = read_uploads(&mut multipart).await?;
    if uploads.is_empty() {
        return Err(ApiError::BadRequest("No files uploaded".to_string()));
    }

    let mut results = Vec::with_capacity(uploads.len());
    for upload in uploads {
        let outcome = match upload.check_image() {
            Ok(()) => classify(model.clone(), upload.bytes).await,
            Err(e) => Err(e),
        };
        results.push(match outcome {
            Ok(p) => BatchItem { filename: upload.filename, success: true, prediction: Some(p), error: None },
            Err(e) => {
                tracing::warn!("Batch item {:?} failed: {}", upload.filename, e);
                BatchItem { filename: upload.filename, success: false, prediction: None, error: Some(e.to_string()) }
            }
        });
    }

    Ok(Json(BatchResponse { success: true, count: results.len(), results }))
}
