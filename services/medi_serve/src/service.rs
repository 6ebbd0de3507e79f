//! Brain MRI prediction with best-effort explanation artifacts
//!
//! Only a missing model, an unreadable upload or a failed forward pass fail a
//! request. Grad-CAM and SHAP degrade to `null` independently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use ndarray::Ix2;
use serde::Serialize;

use medi_explain::{
    compose_shap_figure, compute_shap, grad_cam, render_heatmap_overlay, two_column, SourceImage,
};
use medi_model::{argmax, BackendError, Model, Tensor};

use crate::config::ServeConfig;
use crate::error::ServeError;
use crate::preprocess::{decode, to_input};
use crate::uploads::{stem, UploadStore};

/// Label reported when the top output index has no configured label.
pub const UNKNOWN_LABEL: &str = "Unknown";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
    pub labels: Vec<String>,
    /// Percentages rounded to two decimals, in label order.
    pub values: Vec<f64>,
    pub prediction: String,
    pub heatmap: Option<String>,
    pub shap: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

pub struct PredictionService {
    model: Option<Arc<Model>>,
    store: UploadStore,
    config: ServeConfig,
    requests: AtomicU64,
}

impl PredictionService {
    pub fn new(model: Option<Model>, config: ServeConfig) -> Result<Self, ServeError> {
        let store = UploadStore::new(&config.uploads_dir)?;
        Ok(Self {
            model: model.map(Arc::new),
            store,
            config,
            requests: AtomicU64::new(0),
        })
    }

    /// Load the configured model; a missing or broken file leaves the
    /// service running without one.
    pub fn from_config(config: ServeConfig) -> Result<Self, ServeError> {
        let model = match Model::load(&config.model_path) {
            Ok(model) => Some(model),
            Err(e) => {
                error!("model {} not loaded: {e}", config.model_path.display());
                None
            }
        };
        Self::new(model, config)
    }

    pub fn model_loaded(&self) -> bool {
        self.model.is_some()
    }

    pub fn config(&self) -> &ServeConfig {
        &self.config
    }

    pub fn uploads(&self) -> &UploadStore {
        &self.store
    }

    pub fn predict_brain(
        &self,
        upload: Upload,
        deep_scan: bool,
    ) -> Result<PredictionResult, ServeError> {
        let req = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        let model = self.model.as_deref().ok_or(ServeError::ModelUnavailable)?;
        info!(
            "[req {req}] predict {} ({} bytes, deep_scan={deep_scan})",
            upload.filename,
            upload.bytes.len()
        );

        let name = self.store.save(&upload.filename, &upload.bytes)?;
        let decoded = decode(&upload.bytes)?;
        let input = to_input(&decoded, self.config.input_size)?;

        let probs = model.predict(&input)?;
        let probs = probs
            .into_dimensionality::<Ix2>()
            .map_err(|e| BackendError::InferenceError(e.to_string()))?;
        let row: Vec<f32> = two_column(probs).row(0).to_vec();
        let top = argmax(row.iter().copied())
            .ok_or_else(|| BackendError::InferenceError("model produced no outputs".into()))?;
        let prediction = self
            .config
            .labels
            .get(top)
            .cloned()
            .unwrap_or_else(|| UNKNOWN_LABEL.to_string());
        info!("[req {req}] prediction {prediction} ({:.4})", row[top]);

        let source = SourceImage::rgb(decoded.to_rgb8());
        let base = stem(&name);
        let heatmap = self.heatmap(req, model, &input, &source, base);
        let shap = if deep_scan {
            self.shap(req, model, &input, &source, top, base)
        } else {
            None
        };

        Ok(PredictionResult {
            labels: self.config.labels.iter().take(row.len()).cloned().collect(),
            values: row.iter().map(|&p| percent(p)).collect(),
            prediction,
            heatmap,
            shap,
        })
    }

    fn heatmap(
        &self,
        req: u64,
        model: &Model,
        input: &Tensor,
        source: &SourceImage,
        base: &str,
    ) -> Option<String> {
        let Some(layer) = model.last_conv_layer() else {
            warn!("[req {req}] no convolutional layer found for Grad-CAM");
            return None;
        };
        debug!("[req {req}] grad-cam target {layer}");
        let map = grad_cam(model, input, layer)?;
        let name = format!("{base}_heatmap.jpg");
        match render_heatmap_overlay(&map.values, source, &self.store.path_for(&name)) {
            Ok(()) => {
                info!("[req {req}] heatmap {name} ({:?})", map.method);
                Some(UploadStore::url_for(&name))
            }
            Err(e) => {
                warn!("[req {req}] heatmap not written: {e}");
                None
            }
        }
    }

    fn shap(
        &self,
        req: u64,
        model: &Model,
        input: &Tensor,
        source: &SourceImage,
        class: usize,
        base: &str,
    ) -> Option<String> {
        let attribution = compute_shap(model, input, &self.config.shap)?;
        let name = format!("{base}_shap.png");
        let label = self.config.labels.get(class).map(String::as_str);
        match compose_shap_figure(
            &attribution.values,
            source,
            class,
            label,
            &self.store.path_for(&name),
            &self.config.figure,
        ) {
            Ok(()) => {
                info!("[req {req}] shap figure {name}");
                Some(UploadStore::url_for(&name))
            }
            Err(e) => {
                warn!("[req {req}] shap figure not written: {e}");
                None
            }
        }
    }
}

/// Probability as a percentage rounded to two decimals.
pub fn percent(p: f32) -> f64 {
    (p as f64 * 10_000.0).round() / 100.0
}

/// Fixed response for endpoints whose models are still being trained.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaceholderResult {
    pub labels: Vec<&'static str>,
    pub values: Vec<f64>,
    pub prediction: &'static str,
    pub heatmap: Option<String>,
    pub status: &'static str,
}

const TRAINING_STATUS: &str = "Federated global model training in progress";

pub fn chest_placeholder() -> PlaceholderResult {
    PlaceholderResult {
        labels: vec!["Normal", "Pneumonia", "COVID"],
        values: vec![80.1, 12.4, 7.5],
        prediction: "Normal",
        heatmap: None,
        status: TRAINING_STATUS,
    }
}

pub fn skin_placeholder() -> PlaceholderResult {
    PlaceholderResult {
        labels: vec!["Benign", "Malignant"],
        values: vec![85.2, 14.8],
        prediction: "Benign",
        heatmap: None,
        status: TRAINING_STATUS,
    }
}
