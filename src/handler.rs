//! Per-request pipeline: decode, classify, explain, respond.
//!
//! Decode and classification failures end the request with `{"error": ...}`. Anything that goes
//! wrong while explaining only costs the heatmap: the prediction is still returned.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::RgbImage;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::emotion::{ClassScores, Emotion, EmotionModel, FaceCrop};
use crate::error::{Error, Result};
use crate::gradcam::GradCam;
use crate::preprocess::{decode_data_url, decode_image, prepare_face, FaceRegion};
use crate::visualize::{Composer, DEFAULT_ALPHA, PNG_DATA_URL_PREFIX};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Decoded,
    Classified,
    Explained,
    Responded,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Received => "received",
            Stage::Decoded => "decoded",
            Stage::Classified => "classified",
            Stage::Explained => "explained",
            Stage::Responded => "responded",
        };
        f.write_str(name)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Envelope {
    pub data: ImagePayload,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ImagePayload {
    /// `data:<mime>;base64,<payload>`
    pub image: String,
    /// Overrides the configured Grad-CAM layer for this request.
    #[serde(default)]
    pub layer: Option<String>,
    #[serde(default)]
    pub face: Option<FaceRegion>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GradCamPayload {
    pub heatmap: String,
    pub superimposed: String,
    pub explainability: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExplainedPrediction {
    pub predictions: Map<String, Value>,
    pub emotion: Emotion,
    pub gradcam: GradCamPayload,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum WsResponse {
    Explained(ExplainedPrediction),
    Error(ErrorResponse),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct PredictResponse {
    pub emotion: Emotion,
}

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Layer explained by Grad-CAM; without one every explanation degrades.
    pub gradcam_layer: Option<String>,
    pub alpha: f32,
    pub inference_timeout: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        ServiceOptions {
            gradcam_layer: None,
            alpha: DEFAULT_ALPHA,
            inference_timeout: Duration::from_secs(10),
        }
    }
}

fn explanation_text(emotion: Emotion) -> String {
    format!(
        "The model detected {emotion} emotion by focusing on the highlighted facial regions. {}",
        emotion.cues()
    )
}

fn degraded(emotion: Emotion, reason: &Error) -> GradCamPayload {
    GradCamPayload {
        heatmap: PNG_DATA_URL_PREFIX.to_string(),
        superimposed: PNG_DATA_URL_PREFIX.to_string(),
        explainability: format!("Detected {emotion} but could not generate a heatmap. Reason: {reason}"),
    }
}

pub struct EmotionService {
    model: Arc<dyn EmotionModel>,
    composer: Composer,
    gradcam_layer: Option<String>,
    inference_timeout: Duration,
    requests: AtomicU64,
}

impl EmotionService {
    pub fn new(model: Arc<dyn EmotionModel>, options: ServiceOptions) -> Result<EmotionService> {
        let composer = Composer::new(options.alpha)?;
        if let Some(layer) = &options.gradcam_layer {
            let layers = model.explainable_layers();
            if !layers.iter().any(|l| l == layer) {
                warn!(
                    "Grad-CAM layer '{layer}' is not a spatial layer of '{}' (candidates: {}); explanations will be skipped",
                    model.name(),
                    layers.join(", ")
                );
            }
        }
        Ok(EmotionService {
            model,
            composer,
            gradcam_layer: options.gradcam_layer,
            inference_timeout: options.inference_timeout,
            requests: AtomicU64::new(0),
        })
    }

    pub fn model(&self) -> &Arc<dyn EmotionModel> {
        &self.model
    }

    pub fn gradcam_layer(&self) -> Option<&str> {
        self.gradcam_layer.as_deref()
    }

    /// Runs `job` on the blocking pool under the inference budget. A job that overruns keeps
    /// running to completion; only its result is dropped.
    async fn run_blocking<T, F>(&self, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn EmotionModel) -> Result<T> + Send + 'static,
    {
        let model = Arc::clone(&self.model);
        let task = tokio::task::spawn_blocking(move || job(model.as_ref()));
        match tokio::time::timeout(self.inference_timeout, task).await {
            Err(_) => Err(Error::InferenceTimeout(self.inference_timeout)),
            Ok(Err(join)) => Err(Error::Inference(format!("inference task failed: {join}"))),
            Ok(Ok(result)) => result,
        }
    }

    /// Returns the model input, the image rectangle it was cut from and the scores.
    pub async fn classify(
        &self,
        image: Arc<RgbImage>,
        face: Option<FaceRegion>,
    ) -> Result<(FaceCrop, FaceRegion, ClassScores)> {
        self.run_blocking(move |model| {
            let (crop, region) = prepare_face(&image, face, model.input_spec())?;
            let scores = model.classify(&crop)?;
            Ok((crop, region, scores))
        })
        .await
    }

    /// Multipart upload path: raw image bytes in, predicted label out.
    pub async fn predict_bytes(&self, bytes: &[u8]) -> Result<PredictResponse> {
        let image = decode_image(bytes)?;
        let (_, _, scores) = self.classify(Arc::new(image), None).await?;
        Ok(PredictResponse {
            emotion: scores.predicted(),
        })
    }

    pub async fn explain(&self, image: RgbImage, layer: Option<&str>, face: Option<FaceRegion>) -> Result<ExplainedPrediction> {
        let image = Arc::new(image);
        let (crop, region, scores) = self.classify(Arc::clone(&image), face).await?;
        let emotion = scores.predicted();
        debug!(stage = %Stage::Classified, %emotion);

        let gradcam = match self.visualize(image, crop, region, emotion, layer).await {
            Ok((heatmap, superimposed)) => {
                debug!(stage = %Stage::Explained);
                GradCamPayload {
                    heatmap,
                    superimposed,
                    explainability: explanation_text(emotion),
                }
            }
            Err(err) if err.is_explanation_failure() => {
                warn!("Grad-CAM failed: {err}");
                degraded(emotion, &err)
            }
            Err(err) => return Err(err),
        };

        Ok(ExplainedPrediction {
            predictions: scores.to_json_map(),
            emotion,
            gradcam,
        })
    }

    async fn visualize(
        &self,
        image: Arc<RgbImage>,
        crop: FaceCrop,
        region: FaceRegion,
        emotion: Emotion,
        layer: Option<&str>,
    ) -> Result<(String, String)> {
        let layer = layer
            .or(self.gradcam_layer.as_deref())
            .ok_or(Error::LayerNotConfigured)?;
        let gradcam = GradCam::new(layer);
        let composer = self.composer;
        self.run_blocking(move |model| {
            let map = gradcam.generate_map(model, &crop, emotion.index())?;
            composer.compose_region(&image, &map, region).to_data_urls()
        })
        .await
    }

    /// One WebSocket text frame in, one JSON reply out.
    pub async fn handle_message(&self, text: &str) -> WsResponse {
        let id = self.requests.fetch_add(1, Ordering::Relaxed);
        debug!(id, stage = %Stage::Received, bytes = text.len());

        let response = match self.handle_envelope(text).await {
            Ok(explained) => WsResponse::Explained(explained),
            Err(err) => {
                error!(id, "Request failed: {err}");
                WsResponse::Error(ErrorResponse { error: err.to_string() })
            }
        };
        debug!(id, stage = %Stage::Responded);
        response
    }

    async fn handle_envelope(&self, text: &str) -> Result<ExplainedPrediction> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let image = decode_data_url(&envelope.data.image)?;
        debug!(stage = %Stage::Decoded, width = image.width(), height = image.height());
        self.explain(image, envelope.data.layer.as_deref(), envelope.data.face).await
    }
}
