use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use emotion_gradcam::config::ServerConfig;
use emotion_gradcam::emotion::load_model;
use emotion_gradcam::handler::EmotionService;
use emotion_gradcam::{init_tracing, server};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();
    let config = ServerConfig::parse();

    let kind = config.model.model_kind()?;
    let model = tokio::task::spawn_blocking(move || load_model(&kind))
        .await
        .context("model loading task panicked")??;
    let options = config.explain.service_options()?;
    match &options.gradcam_layer {
        Some(layer) => info!("Grad-CAM layer: {layer}"),
        None => info!(
            "No Grad-CAM layer configured; candidates: {}",
            model.explainable_layers().join(", ")
        ),
    }
    let service = Arc::new(EmotionService::new(model, options)?);

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    server::serve(listener, server::router(service, config.max_upload_bytes)).await?;
    Ok(())
}
