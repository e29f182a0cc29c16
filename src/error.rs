use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to decode image: {0}")]
    Decode(String),

    #[error("inference failed: expected input shape {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("inference exceeded its {0:?} budget")]
    InferenceTimeout(Duration),

    #[error("layer '{layer}' not found in model (available: {available})")]
    LayerNotFound { layer: String, available: String },

    #[error("no Grad-CAM layer configured")]
    LayerNotConfigured,

    #[error("gradient computation failed: {0}")]
    GradientComputation(String),

    #[error("failed to encode visualization: {0}")]
    Encode(String),

    #[error("failed to load model: {0}")]
    ModelLoad(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Errors the request handler answers with a prediction minus its heatmap.
    pub fn is_explanation_failure(&self) -> bool {
        matches!(
            self,
            Error::LayerNotFound { .. }
                | Error::LayerNotConfigured
                | Error::GradientComputation(_)
                | Error::Encode(_)
                | Error::InferenceTimeout(_)
        )
    }

    /// Whether the error was caused by the client's payload.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::Decode(_))
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::Encoding(e) => Error::Encode(e.to_string()),
            other => Error::Decode(other.to_string()),
        }
    }
}

impl From<ndarray::ShapeError> for Error {
    fn from(err: ndarray::ShapeError) -> Self {
        Error::Inference(format!("tensor shape error: {err}"))
    }
}

impl From<base64::DecodeError> for Error {
    fn from(err: base64::DecodeError) -> Self {
        Error::Decode(format!("invalid base64 payload: {err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decode(format!("invalid JSON envelope: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
