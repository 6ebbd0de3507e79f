use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use medi_model::BackendError;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServeError {
    #[error("Brain model not loaded")]
    ModelUnavailable,
    #[error("cannot read image: {0}")]
    Preprocess(String),
    #[error("inference failed: {0}")]
    Inference(#[from] BackendError),
    #[error("cannot store upload: {0}")]
    Upload(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("prediction worker failed: {0}")]
    Worker(String),
}

impl ServeError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServeError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServeError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("{self}");
        }
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}
