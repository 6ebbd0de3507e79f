use std::sync::Arc;

use clap::Parser;
use log::{error, info, LevelFilter};

use medi_serve::{app, PredictionService, ServeArgs, ServeConfig, ServeError};

#[tokio::main]
async fn main() {
    let args = ServeArgs::parse();
    let level = match args.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_env("RUST_LOG")
        .init();

    if let Err(e) = run(args).await {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run(args: ServeArgs) -> Result<(), ServeError> {
    let config = ServeConfig::try_from(args)?;
    let addr = config.addr;
    let service = PredictionService::from_config(config)?;
    if !service.model_loaded() {
        info!("starting without a model; /predict/brain will answer 500");
    }
    let app = app(Arc::new(service));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ServeError::Config(format!("bind {addr}: {e}")))?;
    info!("medi_serve listening on http://{addr}");
    axum::serve(listener, app)
        .await
        .map_err(|e| ServeError::Worker(e.to_string()))
}
