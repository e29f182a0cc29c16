use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use ndarray::{Array1, Array3};
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::labels::{Emotion, LABELS, NUM_EMOTIONS};
use super::network::{InputSpec, LayerGradients, Network};
use crate::error::{Error, Result};

/// Normalized classifier input, `[height, width, channels]` with values in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct FaceCrop(pub Array3<f32>);

impl FaceCrop {
    pub fn tensor(&self) -> &Array3<f32> {
        &self.0
    }

    pub fn shape(&self) -> &[usize] {
        self.0.shape()
    }
}

/// One score per label, in [`LABELS`] order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassScores([f32; NUM_EMOTIONS]);

impl ClassScores {
    pub fn new(values: [f32; NUM_EMOTIONS]) -> ClassScores {
        ClassScores(values)
    }

    pub fn from_array(scores: &Array1<f32>) -> Result<ClassScores> {
        let values: [f32; NUM_EMOTIONS] = scores.to_vec().try_into().map_err(|v: Vec<f32>| Error::ShapeMismatch {
            expected: vec![NUM_EMOTIONS],
            actual: vec![v.len()],
        })?;
        Ok(ClassScores(values))
    }

    pub fn values(&self) -> &[f32; NUM_EMOTIONS] {
        &self.0
    }

    /// Index of the highest score; the lowest index wins ties.
    pub fn predicted_index(&self) -> usize {
        let mut best = 0;
        for (i, &score) in self.0.iter().enumerate().skip(1) {
            if score > self.0[best] {
                best = i;
            }
        }
        best
    }

    pub fn predicted(&self) -> Emotion {
        Emotion::ALL[self.predicted_index()]
    }

    /// `{"angry": 0.1, ...}` in label order.
    pub fn to_json_map(&self) -> Map<String, Value> {
        LABELS
            .iter()
            .zip(self.0.iter())
            .map(|(label, &score)| (label.to_string(), Value::from(score as f64)))
            .collect()
    }
}

/// A loaded emotion classifier shared read-only by every request.
pub trait EmotionModel: Send + Sync {
    fn name(&self) -> &str;

    fn input_spec(&self) -> InputSpec;

    fn classify(&self, crop: &FaceCrop) -> Result<ClassScores>;

    /// Activations of `layer` and the gradient of class `target` with respect to them.
    fn layer_gradients(&self, crop: &FaceCrop, layer: &str, target: usize) -> Result<LayerGradients>;

    /// Names of layers with a spatial output.
    fn explainable_layers(&self) -> Vec<String>;
}

/// Pure-Rust classifier; the only backend that can be differentiated.
#[derive(Debug, Clone)]
pub struct NativeClassifier {
    network: Network,
}

impl NativeClassifier {
    pub fn new(network: Network) -> NativeClassifier {
        NativeClassifier { network }
    }

    pub fn network(&self) -> &Network {
        &self.network
    }
}

impl EmotionModel for NativeClassifier {
    fn name(&self) -> &str {
        self.network.name()
    }

    fn input_spec(&self) -> InputSpec {
        self.network.input_spec()
    }

    fn classify(&self, crop: &FaceCrop) -> Result<ClassScores> {
        let now = Instant::now();
        let scores = self.network.forward(crop.tensor())?;
        debug!("Inferred time: {:?}", now.elapsed());
        ClassScores::from_array(&scores)
    }

    fn layer_gradients(&self, crop: &FaceCrop, layer: &str, target: usize) -> Result<LayerGradients> {
        let now = Instant::now();
        let gradients = self.network.gradients_at(crop.tensor(), layer, target)?;
        debug!("Gradient time: {:?}", now.elapsed());
        Ok(gradients)
    }

    fn explainable_layers(&self) -> Vec<String> {
        self.network.spatial_layers().into_iter().map(String::from).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelKind {
    /// Architecture JSON plus `.npz` weights.
    Native { architecture: PathBuf, weights: PathBuf },
    /// ONNX graph run through ONNX Runtime; classification only.
    #[cfg(feature = "onnx")]
    Onnx { model: PathBuf, input: InputSpec },
}

impl ModelKind {
    pub fn native(architecture: impl AsRef<Path>, weights: impl AsRef<Path>) -> ModelKind {
        ModelKind::Native {
            architecture: architecture.as_ref().to_path_buf(),
            weights: weights.as_ref().to_path_buf(),
        }
    }
}

pub fn load_model(kind: &ModelKind) -> Result<Arc<dyn EmotionModel>> {
    let now = Instant::now();
    let model: Arc<dyn EmotionModel> = match kind {
        ModelKind::Native { architecture, weights } => {
            Arc::new(NativeClassifier::new(Network::load(architecture, weights)?))
        }
        #[cfg(feature = "onnx")]
        ModelKind::Onnx { model, input } => Arc::new(super::onnx::OnnxClassifier::new(model, *input)?),
    };
    info!(
        "Loaded model '{}' ({:?} input) in {:?}",
        model.name(),
        model.input_spec().shape(),
        now.elapsed()
    );
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emotion::network::tests::tiny_network;

    #[test]
    fn ties_resolve_to_lowest_index() {
        let scores = ClassScores::new([0.1, 0.3, 0.3, 0.1, 0.1, 0.05, 0.05]);
        assert_eq!(scores.predicted_index(), 1);
        assert_eq!(scores.predicted(), Emotion::Disgust);
        assert_eq!(ClassScores::new([0.0; NUM_EMOTIONS]).predicted_index(), 0);
    }

    #[test]
    fn json_map_keeps_label_order() {
        let scores = ClassScores::new([0.0, 0.1, 0.2, 0.3, 0.4, 0.5, 0.6]);
        let keys: Vec<String> = scores.to_json_map().keys().cloned().collect();
        assert_eq!(keys, LABELS.to_vec());
    }

    #[test]
    fn wrong_score_count_is_an_inference_error() {
        let err = ClassScores::from_array(&Array1::zeros(5)).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn native_classifier_checks_input_shape() {
        let model = NativeClassifier::new(tiny_network());
        let crop = FaceCrop(Array3::zeros((48, 48, 3)));
        match model.classify(&crop) {
            Err(Error::ShapeMismatch { expected, actual }) => {
                assert_eq!(expected, vec![6, 6, 1]);
                assert_eq!(actual, vec![48, 48, 3]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn explainable_layers_are_spatial_only() {
        let model = NativeClassifier::new(tiny_network());
        assert_eq!(model.explainable_layers(), vec!["conv".to_string(), "pool".to_string()]);
        assert_eq!(model.network().layer_names(), vec!["conv", "pool", "flatten", "predictions"]);
    }
}
