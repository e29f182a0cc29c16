pub mod classifier;
pub mod labels;
pub mod layers;
pub mod network;
#[cfg(feature = "onnx")]
pub mod onnx;

pub use classifier::{load_model, ClassScores, EmotionModel, FaceCrop, ModelKind, NativeClassifier};
pub use labels::{Emotion, LABELS, NUM_EMOTIONS};
pub use network::{Architecture, InputSpec, LayerGradients, Network};
