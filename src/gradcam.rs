//! Gradient-weighted class activation mapping.

use ndarray::{Array2, Axis};
use tracing::debug;

use crate::emotion::{EmotionModel, FaceCrop};
use crate::error::{Error, Result};

/// Non-negative importance grid at the explained layer's resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationMap(Array2<f32>);

impl ActivationMap {
    pub fn new(values: Array2<f32>) -> ActivationMap {
        ActivationMap(values)
    }

    pub fn values(&self) -> &Array2<f32> {
        &self.0
    }

    /// `(height, width)`
    pub fn dim(&self) -> (usize, usize) {
        self.0.dim()
    }

    pub fn max(&self) -> f32 {
        self.0.iter().copied().fold(0.0, f32::max)
    }

    /// True when no position contributed positively to the target class.
    pub fn is_degenerate(&self) -> bool {
        self.0.iter().all(|&v| v == 0.0)
    }
}

#[derive(Debug, Clone)]
pub struct GradCam {
    layer: String,
}

impl GradCam {
    pub fn new(layer: impl Into<String>) -> GradCam {
        GradCam { layer: layer.into() }
    }

    pub fn layer(&self) -> &str {
        &self.layer
    }

    pub fn generate_map(&self, model: &dyn EmotionModel, input: &FaceCrop, target: usize) -> Result<ActivationMap> {
        let grads = model.layer_gradients(input, &self.layer, target)?;
        let score = grads.scores.get(target).copied().unwrap_or(f32::NAN);
        if !score.is_finite() {
            return Err(Error::GradientComputation(format!(
                "class {target} has no finite score to explain"
            )));
        }
        debug!("Explaining class {target} (score {score:.4}) at '{}'", self.layer);
        let (height, width, channels) = grads.activations.dim();

        let weights = grads
            .gradients
            .mean_axis(Axis(0))
            .and_then(|g| g.mean_axis(Axis(0)))
            .ok_or_else(|| Error::GradientComputation(format!("layer '{}' has an empty output", self.layer)))?;

        let flat = grads
            .activations
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((height * width, channels))
            .map_err(|e| Error::GradientComputation(e.to_string()))?;
        let mut map = flat
            .dot(&weights)
            .into_shape_with_order((height, width))
            .map_err(|e| Error::GradientComputation(e.to_string()))?;

        if map.iter().any(|v| !v.is_finite()) {
            return Err(Error::GradientComputation(format!(
                "non-finite activation map at layer '{}'",
                self.layer
            )));
        }
        map.mapv_inplace(|v| v.max(0.0));
        let max = map.iter().copied().fold(0.0, f32::max);
        if max > 0.0 {
            map.mapv_inplace(|v| v / max);
        } else {
            debug!("Grad-CAM map for class {target} at '{}' is flat", self.layer);
        }
        Ok(ActivationMap(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emotion::network::tests::tiny_network;
    use crate::emotion::network::LayerGradients;
    use crate::emotion::{ClassScores, InputSpec, NativeClassifier, NUM_EMOTIONS};
    use ndarray::{Array1, Array3};

    /// Returns fixed activations and gradients so the reduction steps can be checked by hand.
    struct FixedGradients {
        activations: Array3<f32>,
        gradients: Array3<f32>,
        scores: Array1<f32>,
    }

    impl EmotionModel for FixedGradients {
        fn name(&self) -> &str {
            "fixed"
        }

        fn input_spec(&self) -> InputSpec {
            InputSpec { height: 2, width: 2, channels: 1 }
        }

        fn classify(&self, _crop: &FaceCrop) -> Result<ClassScores> {
            Ok(ClassScores::new([1.0 / NUM_EMOTIONS as f32; NUM_EMOTIONS]))
        }

        fn layer_gradients(&self, _crop: &FaceCrop, layer: &str, _target: usize) -> Result<LayerGradients> {
            if layer != "features" {
                return Err(Error::LayerNotFound {
                    layer: layer.to_string(),
                    available: "features".to_string(),
                });
            }
            Ok(LayerGradients {
                activations: self.activations.clone(),
                gradients: self.gradients.clone(),
                scores: self.scores.clone(),
            })
        }

        fn explainable_layers(&self) -> Vec<String> {
            vec!["features".to_string()]
        }
    }

    fn crop() -> FaceCrop {
        FaceCrop(Array3::zeros((2, 2, 1)))
    }

    #[test]
    fn weights_channels_by_mean_gradient() {
        // channel 0 has mean gradient 1, channel 1 has mean gradient -1
        let activations = Array3::from_shape_vec((2, 2, 2), vec![4.0, 0.0, 2.0, 1.0, 0.0, 3.0, 1.0, 0.0]).unwrap();
        let gradients = Array3::from_shape_fn((2, 2, 2), |(_, _, c)| if c == 0 { 1.0 } else { -1.0 });
        let model = FixedGradients { activations, gradients, scores: Array1::from_elem(NUM_EMOTIONS, 0.1) };

        let map = GradCam::new("features").generate_map(&model, &crop(), 0).unwrap();
        // raw: [4, 1, -3, 1] -> relu -> [4, 1, 0, 1] -> / 4
        assert_eq!(map.values().as_slice().unwrap(), &[1.0, 0.25, 0.0, 0.25]);
        assert_eq!(map.max(), 1.0);
    }

    #[test]
    fn all_negative_map_is_zero_not_nan() {
        let activations = Array3::from_elem((2, 2, 1), 1.0);
        let gradients = Array3::from_elem((2, 2, 1), -0.5);
        let model = FixedGradients { activations, gradients, scores: Array1::from_elem(NUM_EMOTIONS, 0.1) };
        let map = GradCam::new("features").generate_map(&model, &crop(), 2).unwrap();
        assert!(map.is_degenerate());
        assert!(map.values().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn nan_gradients_are_reported() {
        let activations = Array3::from_elem((2, 2, 1), 1.0);
        let gradients = Array3::from_elem((2, 2, 1), f32::NAN);
        let model = FixedGradients { activations, gradients, scores: Array1::from_elem(NUM_EMOTIONS, 0.1) };
        let err = GradCam::new("features").generate_map(&model, &crop(), 0).unwrap_err();
        assert!(matches!(err, Error::GradientComputation(_)));
    }

    #[test]
    fn nan_scores_are_reported() {
        let model = FixedGradients {
            activations: Array3::from_elem((2, 2, 1), 1.0),
            gradients: Array3::from_elem((2, 2, 1), 1.0),
            scores: Array1::from_elem(NUM_EMOTIONS, f32::NAN),
        };
        let err = GradCam::new("features").generate_map(&model, &crop(), 4).unwrap_err();
        assert!(matches!(err, Error::GradientComputation(_)));
    }

    #[test]
    fn missing_layer_propagates() {
        let model = FixedGradients {
            activations: Array3::zeros((2, 2, 1)),
            gradients: Array3::zeros((2, 2, 1)),
            scores: Array1::from_elem(NUM_EMOTIONS, 0.1),
        };
        let err = GradCam::new("conv5_4").generate_map(&model, &crop(), 0).unwrap_err();
        assert!(matches!(err, Error::LayerNotFound { .. }));
    }

    #[test]
    fn real_network_map_is_normalized() {
        let model = NativeClassifier::new(tiny_network());
        for target in 0..NUM_EMOTIONS {
            let input = FaceCrop(Array3::from_shape_fn((6, 6, 1), |(y, x, _)| ((y + 2 * x) % 5) as f32 / 4.0));
            let map = GradCam::new("conv").generate_map(&model, &input, target).unwrap();
            assert_eq!(map.dim(), (6, 6));
            assert!(map.values().iter().all(|&v| (0.0..=1.0).contains(&v)));
            assert!(map.is_degenerate() || (map.max() - 1.0).abs() < 1e-6);
        }
    }
}
