//! Channels-last layer kernels with their reverse-mode derivatives.
//!
//! Spatial tensors are `[height, width, channels]`, flat tensors are `[features]`. Every layer
//! can propagate a gradient from its output back to its input, which is all Grad-CAM needs:
//! weight gradients are never computed.

use itertools::iproduct;
use ndarray::{Array1, Array2, Array3, Array4, ArrayD, ArrayView3, Axis, Ix1, Ix3, IxDyn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Linear,
    Relu,
    Softmax,
}

impl Activation {
    fn apply(self, z: ArrayD<f32>) -> ArrayD<f32> {
        match self {
            Activation::Linear => z,
            Activation::Relu => z.mapv_into(|v| v.max(0.0)),
            Activation::Softmax => {
                let max = z.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let exp = z.mapv_into(|v| (v - max).exp());
                let sum = exp.sum();
                exp / sum
            }
        }
    }

    /// Gradient with respect to the pre-activation, given the activated output.
    fn backward(self, output: &ArrayD<f32>, grad: &ArrayD<f32>) -> ArrayD<f32> {
        match self {
            Activation::Linear => grad.clone(),
            Activation::Relu => {
                let mut g = grad.clone();
                g.zip_mut_with(output, |g, &y| {
                    if y <= 0.0 {
                        *g = 0.0;
                    }
                });
                g
            }
            Activation::Softmax => {
                let dot: f32 = grad.iter().zip(output.iter()).map(|(g, y)| g * y).sum();
                let mut g = grad.mapv(|v| v - dot);
                g *= output;
                g
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Padding {
    #[default]
    Same,
    Valid,
}

#[derive(Debug, Clone)]
pub struct Conv2d {
    /// `[kh, kw, in_channels, filters]`
    pub kernel: Array4<f32>,
    pub bias: Array1<f32>,
    pub padding: Padding,
    pub activation: Activation,
}

#[derive(Debug, Clone, Copy)]
struct ConvGeometry {
    pad_top: usize,
    pad_left: usize,
    out_h: usize,
    out_w: usize,
}

impl Conv2d {
    fn geometry(&self, height: usize, width: usize) -> Result<ConvGeometry> {
        let (kh, kw, _, _) = self.kernel.dim();
        match self.padding {
            Padding::Same => Ok(ConvGeometry {
                pad_top: (kh - 1) / 2,
                pad_left: (kw - 1) / 2,
                out_h: height,
                out_w: width,
            }),
            Padding::Valid => {
                if height < kh || width < kw {
                    return Err(Error::Inference(format!(
                        "{height}x{width} input is smaller than the {kh}x{kw} kernel"
                    )));
                }
                Ok(ConvGeometry {
                    pad_top: 0,
                    pad_left: 0,
                    out_h: height - kh + 1,
                    out_w: width - kw + 1,
                })
            }
        }
    }

    fn flat_kernel(&self) -> Result<Array2<f32>> {
        let (kh, kw, cin, cout) = self.kernel.dim();
        Ok(self
            .kernel
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((kh * kw * cin, cout))?)
    }

    /// Unrolls receptive fields into rows of `[kh * kw * cin]`, zero-padded.
    fn im2col(&self, input: ArrayView3<f32>, geo: ConvGeometry) -> Array2<f32> {
        let (height, width, cin) = input.dim();
        let (kh, kw, _, _) = self.kernel.dim();
        let mut cols = Array2::<f32>::zeros((geo.out_h * geo.out_w, kh * kw * cin));
        for (oy, ox, dy, dx) in iproduct!(0..geo.out_h, 0..geo.out_w, 0..kh, 0..kw) {
            let (iy, ix) = (oy + dy, ox + dx);
            if iy < geo.pad_top || ix < geo.pad_left {
                continue;
            }
            let (iy, ix) = (iy - geo.pad_top, ix - geo.pad_left);
            if iy >= height || ix >= width {
                continue;
            }
            let row = oy * geo.out_w + ox;
            let base = (dy * kw + dx) * cin;
            for c in 0..cin {
                cols[[row, base + c]] = input[[iy, ix, c]];
            }
        }
        cols
    }

    fn forward(&self, input: ArrayView3<f32>) -> Result<ArrayD<f32>> {
        let (height, width, _) = input.dim();
        let geo = self.geometry(height, width)?;
        let cols = self.im2col(input, geo);
        let z = cols.dot(&self.flat_kernel()?) + &self.bias;
        let z = z.into_shape_with_order((geo.out_h, geo.out_w, self.bias.len()))?;
        Ok(self.activation.apply(z.into_dyn()))
    }

    fn backward(&self, input: ArrayView3<f32>, output: &ArrayD<f32>, grad: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let (height, width, cin) = input.dim();
        let (kh, kw, _, cout) = self.kernel.dim();
        let geo = self.geometry(height, width)?;
        let dz = self
            .activation
            .backward(output, grad)
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((geo.out_h * geo.out_w, cout))?;
        let dcols = dz.dot(&self.flat_kernel()?.t());

        let mut dx = Array3::<f32>::zeros((height, width, cin));
        for (oy, ox, dy, dxk) in iproduct!(0..geo.out_h, 0..geo.out_w, 0..kh, 0..kw) {
            let (iy, ix) = (oy + dy, ox + dxk);
            if iy < geo.pad_top || ix < geo.pad_left {
                continue;
            }
            let (iy, ix) = (iy - geo.pad_top, ix - geo.pad_left);
            if iy >= height || ix >= width {
                continue;
            }
            let row = oy * geo.out_w + ox;
            let base = (dy * kw + dxk) * cin;
            for c in 0..cin {
                dx[[iy, ix, c]] += dcols[[row, base + c]];
            }
        }
        Ok(dx.into_dyn())
    }
}

#[derive(Debug, Clone)]
pub struct Dense {
    /// `[in_features, units]`
    pub kernel: Array2<f32>,
    pub bias: Array1<f32>,
    pub activation: Activation,
}

#[derive(Debug, Clone)]
pub enum Layer {
    Conv2d(Conv2d),
    MaxPool2d { pool_size: usize },
    /// Inference-mode batch norm folded into a per-channel affine transform.
    BatchNorm { scale: Array1<f32>, shift: Array1<f32> },
    Dropout,
    Flatten,
    GlobalAveragePool,
    Dense(Dense),
}

fn spatial(tensor: &ArrayD<f32>) -> Result<ArrayView3<'_, f32>> {
    Ok(tensor.view().into_dimensionality::<Ix3>()?)
}

impl Layer {
    /// Shape this layer produces for `input`, or why it cannot accept it.
    pub fn output_shape(&self, input: &[usize]) -> std::result::Result<Vec<usize>, String> {
        match (self, input) {
            (Layer::Conv2d(conv), &[h, w, c]) => {
                let (_, _, cin, cout) = conv.kernel.dim();
                if c != cin {
                    return Err(format!("expects {cin} input channels, got {c}"));
                }
                if conv.bias.len() != cout {
                    return Err(format!("bias has {} entries for {cout} filters", conv.bias.len()));
                }
                let geo = conv.geometry(h, w).map_err(|e| e.to_string())?;
                Ok(vec![geo.out_h, geo.out_w, cout])
            }
            (Layer::MaxPool2d { pool_size }, &[h, w, c]) => {
                if *pool_size == 0 || h < *pool_size || w < *pool_size {
                    return Err(format!("cannot pool {h}x{w} with size {pool_size}"));
                }
                Ok(vec![h / pool_size, w / pool_size, c])
            }
            (Layer::BatchNorm { scale, .. }, shape) => {
                let channels = shape.last().copied().unwrap_or(0);
                if scale.len() != channels {
                    return Err(format!("has {} channels, input has {channels}", scale.len()));
                }
                Ok(shape.to_vec())
            }
            (Layer::Dropout, shape) => Ok(shape.to_vec()),
            (Layer::Flatten, shape) => Ok(vec![shape.iter().product()]),
            (Layer::GlobalAveragePool, &[_, _, c]) => Ok(vec![c]),
            (Layer::Dense(dense), &[n]) => {
                let (rows, units) = dense.kernel.dim();
                if rows != n {
                    return Err(format!("expects {rows} input features, got {n}"));
                }
                if dense.bias.len() != units {
                    return Err(format!("bias has {} entries for {units} units", dense.bias.len()));
                }
                Ok(vec![units])
            }
            (_, shape) => Err(format!("cannot accept input of shape {shape:?}")),
        }
    }

    pub fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        match self {
            Layer::Conv2d(conv) => conv.forward(spatial(input)?),
            Layer::MaxPool2d { pool_size } => {
                let x = spatial(input)?;
                let p = *pool_size;
                let (h, w, c) = x.dim();
                let out = Array3::from_shape_fn((h / p, w / p, c), |(oy, ox, ch)| {
                    iproduct!(0..p, 0..p)
                        .map(|(dy, dx)| x[[oy * p + dy, ox * p + dx, ch]])
                        .fold(f32::NEG_INFINITY, f32::max)
                });
                Ok(out.into_dyn())
            }
            Layer::BatchNorm { scale, shift } => Ok(input * scale + shift),
            Layer::Dropout => Ok(input.clone()),
            Layer::Flatten => Ok(Array1::from_iter(input.iter().copied()).into_dyn()),
            Layer::GlobalAveragePool => {
                let x = spatial(input)?;
                let (h, w, c) = x.dim();
                let sum = x.sum_axis(Axis(0)).sum_axis(Axis(0));
                let mean = if h * w == 0 { Array1::zeros(c) } else { sum / (h * w) as f32 };
                Ok(mean.into_dyn())
            }
            Layer::Dense(dense) => {
                let x = input.view().into_dimensionality::<Ix1>()?;
                let z = x.dot(&dense.kernel) + &dense.bias;
                Ok(dense.activation.apply(z.into_dyn()))
            }
        }
    }

    /// Propagates `grad` (d score / d output) to d score / d input.
    pub fn backward(&self, input: &ArrayD<f32>, output: &ArrayD<f32>, grad: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        match self {
            Layer::Conv2d(conv) => conv.backward(spatial(input)?, output, grad),
            Layer::MaxPool2d { pool_size } => {
                let x = spatial(input)?;
                let g = spatial(grad)?;
                let p = *pool_size;
                let mut dx = Array3::<f32>::zeros(x.dim());
                for ((oy, ox, ch), &gv) in g.indexed_iter() {
                    let mut best = (oy * p, ox * p);
                    for (dy, dxk) in iproduct!(0..p, 0..p) {
                        let (iy, ix) = (oy * p + dy, ox * p + dxk);
                        if x[[iy, ix, ch]] > x[[best.0, best.1, ch]] {
                            best = (iy, ix);
                        }
                    }
                    dx[[best.0, best.1, ch]] += gv;
                }
                Ok(dx.into_dyn())
            }
            Layer::BatchNorm { scale, .. } => Ok(grad * scale),
            Layer::Dropout => Ok(grad.clone()),
            Layer::Flatten => Ok(grad
                .as_standard_layout()
                .into_owned()
                .into_shape_with_order(IxDyn(input.shape()))?),
            Layer::GlobalAveragePool => {
                let (h, w, c) = spatial(input)?.dim();
                let g = grad.view().into_dimensionality::<Ix1>()?;
                let area = (h * w).max(1) as f32;
                Ok(Array3::from_shape_fn((h, w, c), |(_, _, ch)| g[ch] / area).into_dyn())
            }
            Layer::Dense(dense) => {
                let dz = dense.activation.backward(output, grad);
                let dz = dz.view().into_dimensionality::<Ix1>()?;
                Ok(dense.kernel.dot(&dz).into_dyn())
            }
        }
    }
}
