//! Explanations for Medi imaging models
//!
//! - [`grad_cam`]: gradient-weighted class activation maps with a flat and a
//!   nested strategy and an activation-mean fallback.
//! - [`compute_shap`]: blur-masked partition attribution.
//! - [`viz`]: the Grad-CAM overlay and the three-panel attribution figure.

pub mod colormap;
pub mod error;
pub mod grad_cam;
pub mod shap;
pub mod viz;

#[cfg(test)]
mod fixtures;

pub use colormap::Colormap;
pub use error::ExplainError;
pub use grad_cam::{
    compute_map, grad_cam, ActivationModel, Attempt, AttributionMap, AttributionMethod, Strategy,
};
pub use shap::{
    compute_shap, two_column, AttributionValues, Explanation, FeatureAttribution, ImageMasker,
    PartitionExplainer, Predict, ProbabilityView, ShapConfig,
};
pub use viz::{
    compose_shap_figure, render_heatmap_overlay, ChannelOrder, FigureOptions, SourceImage,
    VizError,
};
