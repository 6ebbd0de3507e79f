//! Command-line and environment configuration

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::{ArgAction, Parser};
use medi_explain::{FigureOptions, ShapConfig};

use crate::error::ServeError;

pub const BRAIN_CLASSES: [&str; 4] = ["Glioma", "Meningioma", "Pituitary", "No Tumor"];

#[derive(Debug, Clone, Parser)]
#[command(
    name = "medi_serve",
    version,
    author = "MediLang Team",
    about = "Brain MRI classification service with Grad-CAM and SHAP explanations",
    after_help = "Every option can also be set through its MEDI_SERVE_* environment variable."
)]
pub struct ServeArgs {
    /// Increase verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Address to listen on
    #[arg(long, env = "MEDI_SERVE_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    #[arg(long, env = "MEDI_SERVE_PORT", default_value_t = 5000)]
    pub port: u16,

    /// JSON model file; the service still starts when it cannot be loaded
    #[arg(long, env = "MEDI_SERVE_MODEL", default_value = "models/global_Brain_model.json")]
    pub model: PathBuf,

    /// Directory for uploads and generated artifacts, served under /uploads
    #[arg(long, env = "MEDI_SERVE_UPLOADS", default_value = "uploads")]
    pub uploads: PathBuf,

    /// Comma-separated class labels in model output order
    #[arg(
        long,
        env = "MEDI_SERVE_LABELS",
        value_delimiter = ',',
        default_value = "Glioma,Meningioma,Pituitary,No Tumor"
    )]
    pub labels: Vec<String>,

    /// Maximum request body size in MiB
    #[arg(long, env = "MEDI_SERVE_MAX_UPLOAD_MB", default_value_t = 20)]
    pub max_upload_mb: usize,

    /// Side length images are resized to before inference
    #[arg(long, env = "MEDI_SERVE_INPUT_SIZE", default_value_t = 224)]
    pub input_size: u32,

    /// Model evaluations allowed per SHAP explanation
    #[arg(long, env = "MEDI_SERVE_SHAP_MAX_EVALS", default_value_t = 50)]
    pub shap_max_evals: usize,

    /// Images per forward pass during SHAP explanation
    #[arg(long, env = "MEDI_SERVE_SHAP_BATCH_SIZE", default_value_t = 100)]
    pub shap_batch_size: usize,

    /// Blur kernel used to mask pixels, as ROWSxCOLS
    #[arg(long, env = "MEDI_SERVE_SHAP_BLUR", default_value = "10x10", value_parser = parse_kernel)]
    pub shap_blur: [usize; 2],

    /// TTF/OTF font for figure titles instead of the bundled DejaVu Sans
    #[arg(long, env = "MEDI_SERVE_FONT")]
    pub font: Option<PathBuf>,
}

fn parse_kernel(s: &str) -> Result<[usize; 2], String> {
    let (h, w) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected ROWSxCOLS, got '{s}'"))?;
    let dim = |v: &str| -> Result<usize, String> {
        match v.trim().parse::<usize>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(format!("invalid kernel dimension '{v}'")),
        }
    };
    Ok([dim(h)?, dim(w)?])
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub addr: SocketAddr,
    pub model_path: PathBuf,
    pub uploads_dir: PathBuf,
    pub labels: Vec<String>,
    pub body_limit: usize,
    pub input_size: u32,
    pub shap: ShapConfig,
    pub figure: FigureOptions,
}

impl ServeConfig {
    /// Defaults with uploads under `uploads_dir` and no model path.
    pub fn with_uploads(uploads_dir: impl Into<PathBuf>) -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            model_path: PathBuf::new(),
            uploads_dir: uploads_dir.into(),
            labels: BRAIN_CLASSES.iter().map(|s| s.to_string()).collect(),
            body_limit: 20 * 1024 * 1024,
            input_size: 224,
            shap: ShapConfig::default(),
            figure: FigureOptions::default(),
        }
    }
}

impl TryFrom<ServeArgs> for ServeConfig {
    type Error = ServeError;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let labels: Vec<String> = args
            .labels
            .iter()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        if labels.is_empty() {
            return Err(ServeError::Config("at least one class label is required".into()));
        }
        if args.input_size == 0 {
            return Err(ServeError::Config("input size must be positive".into()));
        }
        if args.max_upload_mb == 0 {
            return Err(ServeError::Config("upload limit must be positive".into()));
        }
        if args.shap_max_evals < 2 || args.shap_batch_size < 2 {
            return Err(ServeError::Config(
                "SHAP max evals and batch size must be at least 2".into(),
            ));
        }
        Ok(Self {
            addr: SocketAddr::new(args.host, args.port),
            model_path: args.model,
            uploads_dir: args.uploads,
            labels,
            body_limit: args.max_upload_mb * 1024 * 1024,
            input_size: args.input_size,
            shap: ShapConfig {
                max_evals: args.shap_max_evals,
                batch_size: args.shap_batch_size,
                blur: args.shap_blur,
            },
            figure: FigureOptions { font: args.font },
        })
    }
}
