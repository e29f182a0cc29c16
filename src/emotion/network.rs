//! In-memory convolutional classifier loaded from an architecture JSON plus an `.npz` of weights.
//!
//! The layout follows Keras (`channels_last`, kernels `[kh, kw, cin, cout]`, dense `[in, out]`)
//! so trained weights can be exported with a few lines of numpy.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::time::Instant;

use ndarray::{Array, Array1, Array3, ArrayD, Ix1, Ix2, Ix3, Ix4, IxDyn};
use ndarray_npy::{NpzReader, NpzWriter};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::labels::NUM_EMOTIONS;
use super::layers::{Activation, Conv2d, Dense, Layer, Padding};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSpec {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl InputSpec {
    pub fn shape(&self) -> [usize; 3] {
        [self.height, self.width, self.channels]
    }
}

impl Default for InputSpec {
    fn default() -> Self {
        InputSpec {
            height: 48,
            width: 48,
            channels: 1,
        }
    }
}

fn default_epsilon() -> f32 {
    1e-3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerKind {
    Conv2d {
        filters: usize,
        kernel_size: usize,
        #[serde(default)]
        padding: Padding,
        #[serde(default)]
        activation: Activation,
    },
    MaxPool2d {
        pool_size: usize,
    },
    BatchNorm {
        #[serde(default = "default_epsilon")]
        epsilon: f32,
    },
    Dropout {
        #[serde(default)]
        rate: f32,
    },
    Flatten,
    GlobalAveragePool,
    Dense {
        units: usize,
        #[serde(default)]
        activation: Activation,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: LayerKind,
}

impl LayerSpec {
    pub fn new(name: &str, kind: LayerKind) -> LayerSpec {
        LayerSpec {
            name: name.to_string(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Architecture {
    #[serde(default)]
    pub name: Option<String>,
    pub input: InputSpec,
    pub layers: Vec<LayerSpec>,
}

impl Architecture {
    /// Small FER-2013 style network: three conv blocks and a softmax head.
    pub fn baseline() -> Architecture {
        let conv = |filters| LayerKind::Conv2d {
            filters,
            kernel_size: 3,
            padding: Padding::Same,
            activation: Activation::Relu,
        };
        Architecture {
            name: Some("baseline-fer".to_string()),
            input: InputSpec::default(),
            layers: vec![
                LayerSpec::new("conv1", conv(16)),
                LayerSpec::new("pool1", LayerKind::MaxPool2d { pool_size: 2 }),
                LayerSpec::new("conv2", conv(32)),
                LayerSpec::new("bn2", LayerKind::BatchNorm { epsilon: 1e-3 }),
                LayerSpec::new("pool2", LayerKind::MaxPool2d { pool_size: 2 }),
                LayerSpec::new("conv3", conv(64)),
                LayerSpec::new("pool3", LayerKind::MaxPool2d { pool_size: 2 }),
                LayerSpec::new("flatten", LayerKind::Flatten),
                LayerSpec::new("fc1", LayerKind::Dense { units: 64, activation: Activation::Relu }),
                LayerSpec::new("dropout", LayerKind::Dropout { rate: 0.5 }),
                LayerSpec::new(
                    "predictions",
                    LayerKind::Dense { units: NUM_EMOTIONS, activation: Activation::Softmax },
                ),
            ],
        }
    }

    pub fn load(path: &Path) -> Result<Architecture> {
        let reader = BufReader::new(File::open(path)?);
        serde_json::from_reader(reader)
            .map_err(|e| Error::ModelLoad(format!("invalid architecture {}: {e}", path.display())))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)
            .map_err(|e| Error::ModelLoad(format!("failed to write {}: {e}", path.display())))
    }

    /// Glorot-uniform kernels, zero biases, identity batch norm.
    pub fn random_weights(&self, seed: u64) -> Result<HashMap<String, ArrayD<f32>>> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut weights = HashMap::new();
        let mut shape = self.input.shape().to_vec();
        let mut glorot = |dims: &[usize], fan_in: usize, fan_out: usize| {
            let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
            Array::from_shape_fn(IxDyn(dims), |_| rng.random_range(-limit..limit))
        };
        for spec in &self.layers {
            let channels = shape.last().copied().unwrap_or(0);
            match &spec.kind {
                LayerKind::Conv2d { filters, kernel_size, .. } => {
                    let k = *kernel_size;
                    weights.insert(
                        format!("{}/kernel", spec.name),
                        glorot(&[k, k, channels, *filters], k * k * channels, k * k * filters),
                    );
                    weights.insert(format!("{}/bias", spec.name), ArrayD::zeros(IxDyn(&[*filters])));
                }
                LayerKind::Dense { units, .. } => {
                    let inputs: usize = shape.iter().product();
                    weights.insert(format!("{}/kernel", spec.name), glorot(&[inputs, *units], inputs, *units));
                    weights.insert(format!("{}/bias", spec.name), ArrayD::zeros(IxDyn(&[*units])));
                }
                LayerKind::BatchNorm { .. } => {
                    for (param, value) in [("gamma", 1.0), ("beta", 0.0), ("moving_mean", 0.0), ("moving_variance", 1.0)] {
                        weights.insert(format!("{}/{param}", spec.name), ArrayD::from_elem(IxDyn(&[channels]), value));
                    }
                }
                _ => {}
            }
            let layer = build_layer(spec, &mut weights.clone())?;
            shape = layer
                .output_shape(&shape)
                .map_err(|e| Error::ModelLoad(format!("layer '{}' {e}", spec.name)))?;
        }
        Ok(weights)
    }
}

fn take_weight(weights: &mut HashMap<String, ArrayD<f32>>, layer: &str, param: &str) -> Result<ArrayD<f32>> {
    weights
        .remove(&format!("{layer}/{param}"))
        .ok_or_else(|| Error::ModelLoad(format!("missing weight '{layer}/{param}'")))
}

fn dim_error(layer: &str, param: &str, err: ndarray::ShapeError) -> Error {
    Error::ModelLoad(format!("weight '{layer}/{param}' has the wrong rank: {err}"))
}

fn build_layer(spec: &LayerSpec, weights: &mut HashMap<String, ArrayD<f32>>) -> Result<Layer> {
    let name = spec.name.as_str();
    let layer = match &spec.kind {
        LayerKind::Conv2d { filters, kernel_size, padding, activation } => {
            if *kernel_size == 0 {
                return Err(Error::ModelLoad(format!("layer '{name}' has a zero kernel size")));
            }
            let kernel = take_weight(weights, name, "kernel")?
                .into_dimensionality::<Ix4>()
                .map_err(|e| dim_error(name, "kernel", e))?;
            let (kh, kw, _, cout) = kernel.dim();
            if kh != *kernel_size || kw != *kernel_size || cout != *filters {
                return Err(Error::ModelLoad(format!(
                    "layer '{name}' declares {filters} {kernel_size}x{kernel_size} filters but its kernel is {:?}",
                    kernel.shape()
                )));
            }
            let bias = take_weight(weights, name, "bias")?
                .into_dimensionality::<Ix1>()
                .map_err(|e| dim_error(name, "bias", e))?;
            Layer::Conv2d(Conv2d {
                kernel,
                bias,
                padding: *padding,
                activation: *activation,
            })
        }
        LayerKind::Dense { units, activation } => {
            let kernel = take_weight(weights, name, "kernel")?
                .into_dimensionality::<Ix2>()
                .map_err(|e| dim_error(name, "kernel", e))?;
            if kernel.dim().1 != *units {
                return Err(Error::ModelLoad(format!(
                    "layer '{name}' declares {units} units but its kernel is {:?}",
                    kernel.shape()
                )));
            }
            let bias = take_weight(weights, name, "bias")?
                .into_dimensionality::<Ix1>()
                .map_err(|e| dim_error(name, "bias", e))?;
            Layer::Dense(Dense {
                kernel,
                bias,
                activation: *activation,
            })
        }
        LayerKind::BatchNorm { epsilon } => {
            let mut param = |p: &str| -> Result<Array1<f32>> {
                take_weight(weights, name, p)?
                    .into_dimensionality::<Ix1>()
                    .map_err(|e| dim_error(name, p, e))
            };
            let gamma = param("gamma")?;
            let beta = param("beta")?;
            let mean = param("moving_mean")?;
            let variance = param("moving_variance")?;
            if [beta.len(), mean.len(), variance.len()].iter().any(|&n| n != gamma.len()) {
                return Err(Error::ModelLoad(format!("layer '{name}' has inconsistent batch norm parameters")));
            }
            let scale = gamma / variance.mapv(|v| (v + epsilon).sqrt());
            let shift = beta - &mean * &scale;
            Layer::BatchNorm { scale, shift }
        }
        LayerKind::MaxPool2d { pool_size } => Layer::MaxPool2d { pool_size: *pool_size },
        LayerKind::Dropout { .. } => Layer::Dropout,
        LayerKind::Flatten => Layer::Flatten,
        LayerKind::GlobalAveragePool => Layer::GlobalAveragePool,
    };
    Ok(layer)
}

/// Read every array of an `.npz` archive, keyed by name without the `.npy` suffix.
pub fn read_weights(path: &Path) -> Result<HashMap<String, ArrayD<f32>>> {
    let npz_error = |e: ndarray_npy::ReadNpzError| Error::ModelLoad(format!("{}: {e}", path.display()));
    let mut npz = NpzReader::new(File::open(path)?).map_err(npz_error)?;
    let mut weights = HashMap::new();
    for entry in npz.names().map_err(npz_error)? {
        let array: ArrayD<f32> = npz.by_name(&entry).map_err(npz_error)?;
        let key = entry.strip_suffix(".npy").unwrap_or(&entry).to_string();
        weights.insert(key, array);
    }
    Ok(weights)
}

pub fn write_weights(path: &Path, weights: &HashMap<String, ArrayD<f32>>) -> Result<()> {
    let npz_error = |e: ndarray_npy::WriteNpzError| Error::ModelLoad(format!("{}: {e}", path.display()));
    let mut npz = NpzWriter::new(File::create(path)?);
    let mut names: Vec<&String> = weights.keys().collect();
    names.sort();
    for name in names {
        npz.add_array(name.as_str(), &weights[name]).map_err(npz_error)?;
    }
    npz.finish().map_err(npz_error)?;
    Ok(())
}

#[derive(Debug, Clone)]
struct NamedLayer {
    name: String,
    layer: Layer,
    output_shape: Vec<usize>,
}

/// Activations of one layer together with d score\[target\] / d activations.
#[derive(Debug, Clone)]
pub struct LayerGradients {
    pub activations: Array3<f32>,
    pub gradients: Array3<f32>,
    pub scores: Array1<f32>,
}

#[derive(Debug, Clone)]
pub struct Network {
    name: String,
    input: InputSpec,
    layers: Vec<NamedLayer>,
}

impl Network {
    pub fn from_parts(architecture: Architecture, mut weights: HashMap<String, ArrayD<f32>>) -> Result<Network> {
        let mut shape = architecture.input.shape().to_vec();
        let mut layers: Vec<NamedLayer> = Vec::with_capacity(architecture.layers.len());
        for spec in &architecture.layers {
            if layers.iter().any(|l| l.name == spec.name) {
                return Err(Error::ModelLoad(format!("duplicate layer name '{}'", spec.name)));
            }
            let layer = build_layer(spec, &mut weights)?;
            shape = layer
                .output_shape(&shape)
                .map_err(|e| Error::ModelLoad(format!("layer '{}' {e}", spec.name)))?;
            layers.push(NamedLayer {
                name: spec.name.clone(),
                layer,
                output_shape: shape.clone(),
            });
        }
        if shape != [NUM_EMOTIONS] {
            return Err(Error::ModelLoad(format!(
                "model must end in {NUM_EMOTIONS} class scores, produces {shape:?}"
            )));
        }
        if !weights.is_empty() {
            debug!("ignoring {} unused weight arrays", weights.len());
        }
        Ok(Network {
            name: architecture.name.unwrap_or_else(|| "unnamed".to_string()),
            input: architecture.input,
            layers,
        })
    }

    pub fn load(architecture: &Path, weights: &Path) -> Result<Network> {
        let started = Instant::now();
        let network = Network::from_parts(Architecture::load(architecture)?, read_weights(weights)?)?;
        debug!(
            "Loaded network '{}' ({}) in {:?}",
            network.name,
            network.layer_names().join(" -> "),
            started.elapsed()
        );
        Ok(network)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_spec(&self) -> InputSpec {
        self.input
    }

    pub fn layer_names(&self) -> Vec<&str> {
        self.layers.iter().map(|l| l.name.as_str()).collect()
    }

    /// Layers whose output still has a `[h, w, c]` layout, i.e. Grad-CAM candidates.
    pub fn spatial_layers(&self) -> Vec<&str> {
        self.layers
            .iter()
            .filter(|l| l.output_shape.len() == 3)
            .map(|l| l.name.as_str())
            .collect()
    }

    fn check_input(&self, input: &Array3<f32>) -> Result<()> {
        let expected = self.input.shape();
        if input.shape() != expected {
            return Err(Error::ShapeMismatch {
                expected: expected.to_vec(),
                actual: input.shape().to_vec(),
            });
        }
        Ok(())
    }

    /// Forward pass keeping every intermediate; `outputs[0]` is the input.
    fn forward_cached(&self, input: &Array3<f32>) -> Result<Vec<ArrayD<f32>>> {
        self.check_input(input)?;
        let mut outputs = Vec::with_capacity(self.layers.len() + 1);
        outputs.push(input.clone().into_dyn());
        for named in &self.layers {
            let next = named.layer.forward(&outputs[outputs.len() - 1])?;
            outputs.push(next);
        }
        Ok(outputs)
    }

    pub fn forward(&self, input: &Array3<f32>) -> Result<Array1<f32>> {
        let scores = self
            .forward_cached(input)?
            .pop()
            .ok_or_else(|| Error::Inference("network produced no output".to_string()))?;
        Ok(scores.into_dimensionality::<Ix1>()?)
    }

    pub fn gradients_at(&self, input: &Array3<f32>, layer: &str, target: usize) -> Result<LayerGradients> {
        let index = self
            .layers
            .iter()
            .position(|l| l.name == layer)
            .ok_or_else(|| Error::LayerNotFound {
                layer: layer.to_string(),
                available: self.spatial_layers().join(", "),
            })?;
        if self.layers[index].output_shape.len() != 3 {
            return Err(Error::GradientComputation(format!(
                "layer '{layer}' has no spatial output (shape {:?})",
                self.layers[index].output_shape
            )));
        }
        if target >= NUM_EMOTIONS {
            return Err(Error::GradientComputation(format!("class index {target} is out of range")));
        }

        let outputs = self.forward_cached(input)?;
        let scores = outputs[outputs.len() - 1].clone().into_dimensionality::<Ix1>()?;

        let mut grad = ArrayD::<f32>::zeros(IxDyn(&[NUM_EMOTIONS]));
        grad[[target]] = 1.0;
        for i in (index + 1..self.layers.len()).rev() {
            grad = self.layers[i]
                .layer
                .backward(&outputs[i], &outputs[i + 1], &grad)
                .map_err(|e| Error::GradientComputation(format!("layer '{}': {e}", self.layers[i].name)))?;
        }
        if grad.iter().any(|g| !g.is_finite()) {
            return Err(Error::GradientComputation(format!("non-finite gradients at layer '{layer}'")));
        }

        let to_spatial = |t: ArrayD<f32>| {
            t.into_dimensionality::<Ix3>()
                .map_err(|e| Error::GradientComputation(e.to_string()))
        };
        Ok(LayerGradients {
            activations: to_spatial(outputs[index + 1].clone())?,
            gradients: to_spatial(grad)?,
            scores,
        })
    }
}
