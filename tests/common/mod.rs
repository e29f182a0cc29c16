#![allow(dead_code)]

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::{ImageFormat, Rgb, RgbImage};

use emotion_gradcam::emotion::{Architecture, ClassScores, EmotionModel, FaceCrop, InputSpec, LayerGradients, NativeClassifier, Network};
use emotion_gradcam::handler::{EmotionService, ServiceOptions};
use emotion_gradcam::{Error, Result};
use ndarray::Array3;

pub const LAYER: &str = "conv3";

pub fn baseline_classifier() -> NativeClassifier {
    let architecture = Architecture::baseline();
    let weights = architecture.random_weights(2024).expect("random weights");
    NativeClassifier::new(Network::from_parts(architecture, weights).expect("baseline network"))
}

/// Wraps the baseline network and counts classifier calls.
pub struct CountingModel {
    inner: NativeClassifier,
    pub classify_calls: AtomicUsize,
    pub delay: Duration,
    pub gradient_delay: Duration,
}

impl CountingModel {
    pub fn new() -> CountingModel {
        CountingModel {
            inner: baseline_classifier(),
            classify_calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            gradient_delay: Duration::ZERO,
        }
    }

    pub fn slow(delay: Duration) -> CountingModel {
        CountingModel { delay, ..CountingModel::new() }
    }

    /// Classifies at full speed but stalls while computing gradients.
    pub fn slow_gradients(gradient_delay: Duration) -> CountingModel {
        CountingModel { gradient_delay, ..CountingModel::new() }
    }

    pub fn calls(&self) -> usize {
        self.classify_calls.load(Ordering::SeqCst)
    }
}

impl EmotionModel for CountingModel {
    fn name(&self) -> &str {
        "counting"
    }

    fn input_spec(&self) -> InputSpec {
        self.inner.input_spec()
    }

    fn classify(&self, crop: &FaceCrop) -> Result<ClassScores> {
        self.classify_calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.inner.classify(crop)
    }

    fn layer_gradients(&self, crop: &FaceCrop, layer: &str, target: usize) -> Result<LayerGradients> {
        std::thread::sleep(self.gradient_delay);
        self.inner.layer_gradients(crop, layer, target)
    }

    fn explainable_layers(&self) -> Vec<String> {
        self.inner.explainable_layers()
    }
}

/// Classifies like the baseline network but reports a 2x2 layer that only fires in its
/// top-left cell, so the heatmap is hot in the top-left corner of the face crop.
pub struct HotCornerModel {
    inner: NativeClassifier,
}

impl HotCornerModel {
    pub fn new() -> HotCornerModel {
        HotCornerModel { inner: baseline_classifier() }
    }
}

impl EmotionModel for HotCornerModel {
    fn name(&self) -> &str {
        "hot-corner"
    }

    fn input_spec(&self) -> InputSpec {
        self.inner.input_spec()
    }

    fn classify(&self, crop: &FaceCrop) -> Result<ClassScores> {
        self.inner.classify(crop)
    }

    fn layer_gradients(&self, crop: &FaceCrop, _layer: &str, _target: usize) -> Result<LayerGradients> {
        let scores = self.inner.network().forward(crop.tensor())?;
        let mut activations = Array3::zeros((2, 2, 1));
        activations[[0, 0, 0]] = 1.0;
        Ok(LayerGradients {
            activations,
            gradients: Array3::ones((2, 2, 1)),
            scores,
        })
    }

    fn explainable_layers(&self) -> Vec<String> {
        vec![LAYER.to_string()]
    }
}

/// Always fails to classify.
pub struct BrokenModel;

impl EmotionModel for BrokenModel {
    fn name(&self) -> &str {
        "broken"
    }

    fn input_spec(&self) -> InputSpec {
        InputSpec::default()
    }

    fn classify(&self, _crop: &FaceCrop) -> Result<ClassScores> {
        Err(Error::Inference("runtime exploded".to_string()))
    }

    fn layer_gradients(&self, _crop: &FaceCrop, _layer: &str, _target: usize) -> Result<LayerGradients> {
        Err(Error::GradientComputation("runtime exploded".to_string()))
    }

    fn explainable_layers(&self) -> Vec<String> {
        Vec::new()
    }
}

pub fn service_with(model: Arc<dyn EmotionModel>, layer: Option<&str>) -> Arc<EmotionService> {
    let options = ServiceOptions {
        gradcam_layer: layer.map(str::to_string),
        ..ServiceOptions::default()
    };
    Arc::new(EmotionService::new(model, options).expect("service"))
}

pub fn gray_image(width: u32, height: u32) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb([128, 128, 128]))
}

pub fn png_bytes(image: &RgbImage) -> Vec<u8> {
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png).expect("png encode");
    buffer.into_inner()
}

pub fn data_url(bytes: &[u8]) -> String {
    format!("data:image/png;base64,{}", BASE64.encode(bytes))
}

pub fn envelope(image_url: &str) -> String {
    serde_json::json!({"data": {"image": image_url}}).to_string()
}

/// Decodes a `data:image/png;base64,` URL, panicking if it is not a PNG.
pub fn decode_png_url(url: &str) -> RgbImage {
    let payload = url.strip_prefix("data:image/png;base64,").expect("png data url prefix");
    let bytes = BASE64.decode(payload).expect("valid base64");
    assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
    image::load_from_memory(&bytes).expect("decodable png").to_rgb8()
}
