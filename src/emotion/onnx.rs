use std::path::Path;
use std::time::Instant;

use ndarray::{Array1, Axis};
use ort::inputs;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use parking_lot::Mutex;
use tracing::debug;

use super::classifier::{ClassScores, EmotionModel, FaceCrop};
use super::network::{InputSpec, LayerGradients};
use crate::error::{Error, Result};

/// Classifier exported to ONNX (NHWC input, softmax output). ONNX Runtime exposes no
/// gradients, so this backend answers every explanation request with an error.
pub struct OnnxClassifier {
    session: Mutex<Session>,
    name: String,
    input: InputSpec,
}

impl OnnxClassifier {
    pub fn new(model: &Path, input: InputSpec) -> Result<OnnxClassifier> {
        let load_error = |e: ort::Error| Error::ModelLoad(format!("{}: {e}", model.display()));
        let session = Session::builder()
            .map_err(load_error)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(load_error)?
            .with_intra_threads(4)
            .map_err(load_error)?
            .commit_from_file(model)
            .map_err(load_error)?;
        let name = model
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "onnx".to_string());
        Ok(OnnxClassifier {
            session: Mutex::new(session),
            name,
            input,
        })
    }
}

impl EmotionModel for OnnxClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_spec(&self) -> InputSpec {
        self.input
    }

    fn classify(&self, crop: &FaceCrop) -> Result<ClassScores> {
        let expected = self.input.shape();
        if crop.shape() != expected {
            return Err(Error::ShapeMismatch {
                expected: expected.to_vec(),
                actual: crop.shape().to_vec(),
            });
        }
        let runtime_error = |e: ort::Error| Error::Inference(e.to_string());
        let batch = crop.tensor().clone().insert_axis(Axis(0));
        let tensor = Tensor::from_array(batch).map_err(runtime_error)?;

        let now = Instant::now();
        let mut session = self.session.lock();
        let outputs = session.run(inputs![tensor]).map_err(runtime_error)?;
        debug!("Inferred time: {:?}", now.elapsed());

        let scores: Array1<f32> = outputs[0]
            .try_extract_array::<f32>()
            .map_err(runtime_error)?
            .iter()
            .copied()
            .collect();
        ClassScores::from_array(&scores)
    }

    fn layer_gradients(&self, _crop: &FaceCrop, _layer: &str, _target: usize) -> Result<LayerGradients> {
        Err(Error::GradientComputation(
            "the ONNX backend cannot differentiate; load a native model for heatmaps".to_string(),
        ))
    }

    fn explainable_layers(&self) -> Vec<String> {
        Vec::new()
    }
}
