//! Command-line and environment configuration. `.env` files are loaded before parsing, so every
//! option can also come from the environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser};

use crate::emotion::ModelKind;
use crate::error::{Error, Result};
use crate::handler::ServiceOptions;
use crate::visualize::DEFAULT_ALPHA;

#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    /// Network architecture JSON.
    #[arg(long, env = "EMOTION_ARCHITECTURE")]
    pub architecture: Option<PathBuf>,

    /// `.npz` weights matching the architecture.
    #[arg(long, env = "EMOTION_WEIGHTS")]
    pub weights: Option<PathBuf>,

    /// ONNX classifier (NHWC input); used instead of the native network. Cannot explain.
    #[cfg(feature = "onnx")]
    #[arg(long, env = "EMOTION_ONNX", conflicts_with_all = ["architecture", "weights"])]
    pub onnx: Option<PathBuf>,

    /// Input height, width and channels of the ONNX model.
    #[cfg(feature = "onnx")]
    #[arg(long, env = "EMOTION_ONNX_INPUT", value_delimiter = ',', num_args = 3, default_values_t = [48, 48, 1])]
    pub onnx_input: Vec<usize>,
}

impl ModelArgs {
    pub fn model_kind(&self) -> Result<ModelKind> {
        #[cfg(feature = "onnx")]
        if let Some(model) = &self.onnx {
            let [height, width, channels] = <[usize; 3]>::try_from(self.onnx_input.as_slice())
                .map_err(|_| Error::Config("--onnx-input takes height,width,channels".to_string()))?;
            return Ok(ModelKind::Onnx {
                model: model.clone(),
                input: crate::emotion::InputSpec { height, width, channels },
            });
        }
        match (&self.architecture, &self.weights) {
            (Some(architecture), Some(weights)) => Ok(ModelKind::native(architecture, weights)),
            _ => Err(Error::Config(
                "both --architecture and --weights (or EMOTION_ARCHITECTURE / EMOTION_WEIGHTS) are required".to_string(),
            )),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ExplainArgs {
    /// Layer whose activations Grad-CAM explains; must have a spatial output.
    #[arg(long, env = "EMOTION_GRADCAM_LAYER")]
    pub gradcam_layer: Option<String>,

    /// Heatmap weight when blending over the original image.
    #[arg(long, env = "EMOTION_ALPHA", default_value_t = DEFAULT_ALPHA)]
    pub alpha: f32,

    /// Wall-clock budget for a single inference call, in milliseconds.
    #[arg(long, env = "EMOTION_INFERENCE_TIMEOUT_MS", default_value_t = 10_000)]
    pub inference_timeout_ms: u64,
}

impl ExplainArgs {
    pub fn service_options(&self) -> Result<ServiceOptions> {
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(Error::Config(format!("--alpha must be within [0, 1], got {}", self.alpha)));
        }
        if self.inference_timeout_ms == 0 {
            return Err(Error::Config("--inference-timeout-ms must be positive".to_string()));
        }
        Ok(ServiceOptions {
            gradcam_layer: self.gradcam_layer.clone(),
            alpha: self.alpha,
            inference_timeout: Duration::from_millis(self.inference_timeout_ms),
        })
    }
}

/// Facial emotion classification server with Grad-CAM explanations.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct ServerConfig {
    #[arg(long, env = "EMOTION_BIND", default_value = "0.0.0.0:8000")]
    pub bind: SocketAddr,

    /// Largest accepted upload or WebSocket message, in bytes.
    #[arg(long, env = "EMOTION_MAX_UPLOAD_BYTES", default_value_t = 16 * 1024 * 1024)]
    pub max_upload_bytes: usize,

    #[command(flatten)]
    pub model: ModelArgs,

    #[command(flatten)]
    pub explain: ExplainArgs,
}
