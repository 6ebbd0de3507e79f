//! Brain MRI prediction service
//!
//! [`PredictionService`] runs preprocessing, inference, Grad-CAM and SHAP for
//! one upload; [`app`] exposes it over HTTP together with the placeholder
//! chest and skin endpoints and the uploads directory.

pub mod config;
pub mod error;
pub mod preprocess;
pub mod routes;
pub mod service;
pub mod uploads;

pub use config::{ServeArgs, ServeConfig, BRAIN_CLASSES};
pub use error::ServeError;
pub use routes::{app, AppState};
pub use service::{PredictionResult, PredictionService, Upload};
pub use uploads::UploadStore;
