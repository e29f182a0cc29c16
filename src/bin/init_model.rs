use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use emotion_gradcam::emotion::network::{write_weights, Architecture, Network};
use emotion_gradcam::init_tracing;

/// Write the baseline architecture with randomly initialised weights, for smoke-testing the
/// server without a trained model.
#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "model")]
    out_dir: PathBuf,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    fs::create_dir_all(&cli.out_dir).with_context(|| format!("failed to create {}", cli.out_dir.display()))?;

    let architecture = Architecture::baseline();
    let weights = architecture.random_weights(cli.seed)?;
    let architecture_path = cli.out_dir.join("architecture.json");
    let weights_path = cli.out_dir.join("weights.npz");
    architecture.save(&architecture_path)?;
    write_weights(&weights_path, &weights)?;

    // reload to make sure the pair is consistent
    let network = Network::load(&architecture_path, &weights_path)?;
    info!(
        "Wrote {} and {}; layers: {}",
        architecture_path.display(),
        weights_path.display(),
        network.layer_names().join(" -> ")
    );
    info!("Grad-CAM candidates: {}", network.spatial_layers().join(", "));
    Ok(())
}
