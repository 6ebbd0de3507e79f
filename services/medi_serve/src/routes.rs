//! HTTP surface

use std::sync::Arc;

use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::Method;
use axum::routing::{get, post};
use axum::{Json, Router};
use log::debug;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;

use crate::error::ServeError;
use crate::service::{
    chest_placeholder, skin_placeholder, PlaceholderResult, PredictionResult, PredictionService,
    Upload,
};

pub type AppState = Arc<PredictionService>;

pub fn app(service: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);
    let uploads = ServeDir::new(service.uploads().dir());
    let body_limit = service.config().body_limit;

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/predict/brain", post(predict_brain))
        .route("/predict/chest", post(predict_chest))
        .route("/predict/skin", post(predict_skin))
        .nest_service("/uploads", uploads)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(service)
}

async fn root(State(service): State<AppState>) -> Json<Value> {
    Json(json!({
        "message": "Federated Healthcare AI API",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "predict_brain": "/predict/brain (POST)",
            "predict_chest": "/predict/chest (POST)",
            "predict_skin": "/predict/skin (POST)",
            "uploads": "/uploads (Static files)",
        },
        "model_loaded": service.model_loaded(),
        "status": "running",
    }))
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Default)]
struct PredictForm {
    image: Option<Upload>,
    deep_scan: Option<String>,
}

impl PredictForm {
    fn require_image(&mut self) -> Result<Upload, ServeError> {
        self.image
            .take()
            .ok_or_else(|| ServeError::BadRequest("multipart field 'image' is required".into()))
    }

    /// `"true"` in any case enables the deep scan; absent means enabled.
    fn deep_scan(&self) -> bool {
        self.deep_scan
            .as_deref()
            .map_or(true, |v| v.trim().eq_ignore_ascii_case("true"))
    }
}

async fn read_form(
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<PredictForm, ServeError> {
    let bad = |e: &dyn std::fmt::Display| ServeError::BadRequest(format!("invalid form: {e}"));
    let mut multipart = multipart.map_err(|e| bad(&e))?;
    let mut form = PredictForm::default();
    while let Some(field) = multipart.next_field().await.map_err(|e| bad(&e))? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("image") => {
                let filename = field.file_name().unwrap_or("upload").to_string();
                let bytes = field.bytes().await.map_err(|e| bad(&e))?.to_vec();
                form.image = Some(Upload { filename, bytes });
            }
            Some("deep_scan") => {
                form.deep_scan = Some(field.text().await.map_err(|e| bad(&e))?);
            }
            other => debug!("ignoring form field {other:?}"),
        }
    }
    Ok(form)
}

async fn predict_brain(
    State(service): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictionResult>, ServeError> {
    let mut form = read_form(multipart).await?;
    let upload = form.require_image()?;
    let deep_scan = form.deep_scan();
    let result = tokio::task::spawn_blocking(move || service.predict_brain(upload, deep_scan))
        .await
        .map_err(|e| ServeError::Worker(e.to_string()))??;
    Ok(Json(result))
}

async fn predict_chest(
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PlaceholderResult>, ServeError> {
    read_form(multipart).await?.require_image()?;
    Ok(Json(chest_placeholder()))
}

async fn predict_skin(
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PlaceholderResult>, ServeError> {
    read_form(multipart).await?.require_image()?;
    Ok(Json(skin_placeholder()))
}
