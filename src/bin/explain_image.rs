use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::json;
use tracing::{info, warn};

use emotion_gradcam::config::{ExplainArgs, ModelArgs};
use emotion_gradcam::emotion::load_model;
use emotion_gradcam::gradcam::GradCam;
use emotion_gradcam::init_tracing;
use emotion_gradcam::preprocess::{decode_image, prepare_face, FaceRegion};
use emotion_gradcam::visualize::Composer;

/// Classify one image and write its Grad-CAM heatmap and overlay next to it.
#[derive(Parser, Debug)]
struct Cli {
    image: PathBuf,

    /// Face rectangle as x,y,width,height; the whole image when omitted.
    #[arg(long, value_delimiter = ',', num_args = 4)]
    face: Option<Vec<u32>>,

    /// Directory for `<stem>_heatmap.png` and `<stem>_superimposed.png`.
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,

    #[command(flatten)]
    model: ModelArgs,

    #[command(flatten)]
    explain: ExplainArgs,
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let face = match cli.face.as_deref() {
        None => None,
        Some(&[x, y, width, height]) => Some(FaceRegion { x, y, width, height }),
        Some(other) => bail!("--face takes four values, got {}", other.len()),
    };
    let options = cli.explain.service_options()?;
    let model = load_model(&cli.model.model_kind()?)?;

    let bytes = fs::read(&cli.image).with_context(|| format!("failed to read {}", cli.image.display()))?;
    let image = decode_image(&bytes)?;
    let (crop, region) = prepare_face(&image, face, model.input_spec())?;

    let now = Instant::now();
    let scores = model.classify(&crop)?;
    let emotion = scores.predicted();
    info!("Predicted {emotion} in {:?}", now.elapsed());
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({"predictions": scores.to_json_map(), "emotion": emotion}))?
    );

    let Some(layer) = options.gradcam_layer else {
        warn!(
            "No --gradcam-layer given, skipping heatmap (candidates: {})",
            model.explainable_layers().join(", ")
        );
        return Ok(());
    };
    let map = GradCam::new(layer).generate_map(model.as_ref(), &crop, emotion.index())?;
    let visualization = Composer::new(options.alpha)?.compose_region(&image, &map, region);

    fs::create_dir_all(&cli.out_dir)?;
    let stem = cli
        .image
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let heatmap_path = cli.out_dir.join(format!("{stem}_heatmap.png"));
    let superimposed_path = cli.out_dir.join(format!("{stem}_superimposed.png"));
    visualization.heatmap.save(&heatmap_path)?;
    visualization.composite.save(&superimposed_path)?;
    info!("Wrote {} and {}", heatmap_path.display(), superimposed_path.display());
    Ok(())
}
