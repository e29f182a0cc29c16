//! Image decoding and the single preprocessing path shared by classification and explanation.
//!
//! Decoded images are always RGB. Grayscale models get ITU-R BT.601 luma, which is what
//! OpenCV's `BGR2GRAY` produces for the FER-style training sets these models come from.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array3;
use serde::{Deserialize, Serialize};

use crate::emotion::{FaceCrop, InputSpec};
use crate::error::{Error, Result};

/// Face rectangle reported by an external detector, in source pixel coordinates.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

pub fn decode_image(bytes: &[u8]) -> Result<RgbImage> {
    if bytes.is_empty() {
        return Err(Error::Decode("empty image payload".to_string()));
    }
    let image = image::load_from_memory(bytes)?.to_rgb8();
    if image.width() == 0 || image.height() == 0 {
        return Err(Error::Decode("image dimensions are zero".to_string()));
    }
    Ok(image)
}

/// Accepts `data:<mime>;base64,<payload>` or a bare base64 payload.
pub fn decode_data_url(url: &str) -> Result<RgbImage> {
    let payload = match url.strip_prefix("data:") {
        Some(rest) => {
            let (header, payload) = rest
                .split_once(',')
                .ok_or_else(|| Error::Decode("data URL has no payload".to_string()))?;
            if !header.ends_with(";base64") {
                return Err(Error::Decode(format!("data URL is not base64 encoded ({header})")));
            }
            payload
        }
        None => url,
    };
    let bytes = BASE64.decode(payload.trim())?;
    decode_image(&bytes)
}

impl FaceRegion {
    pub fn full(image: &RgbImage) -> FaceRegion {
        FaceRegion {
            x: 0,
            y: 0,
            width: image.width(),
            height: image.height(),
        }
    }

    /// The part of the region inside a `width`x`height` image, if any.
    pub fn clamp_to(self, width: u32, height: u32) -> Option<FaceRegion> {
        let x_end = self.x.saturating_add(self.width).min(width);
        let y_end = self.y.saturating_add(self.height).min(height);
        (self.x < x_end && self.y < y_end).then(|| FaceRegion {
            x: self.x,
            y: self.y,
            width: x_end - self.x,
            height: y_end - self.y,
        })
    }
}

/// Crop `region` (whole image if `None`), hard-resize to the model input and normalize to `[0, 1]`.
///
/// Also returns the rectangle actually cropped, clamped to the image, so the explanation can be
/// drawn back where the model looked.
pub fn prepare_face(image: &RgbImage, region: Option<FaceRegion>, spec: InputSpec) -> Result<(FaceCrop, FaceRegion)> {
    let region = match region {
        Some(r) => r.clamp_to(image.width(), image.height()).ok_or_else(|| {
            Error::Decode(format!(
                "face region {r:?} lies outside the {}x{} image",
                image.width(),
                image.height()
            ))
        })?,
        None => FaceRegion::full(image),
    };
    let face = imageops::crop_imm(image, region.x, region.y, region.width, region.height).to_image();
    let resized = imageops::resize(&face, spec.width as u32, spec.height as u32, FilterType::Triangle);

    let tensor = match spec.channels {
        1 => Array3::from_shape_fn((spec.height, spec.width, 1), |(y, x, _)| {
            let [r, g, b] = resized.get_pixel(x as u32, y as u32).0;
            let luma = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
            luma.round().min(255.0) / 255.0
        }),
        3 => Array3::from_shape_fn((spec.height, spec.width, 3), |(y, x, c)| {
            resized.get_pixel(x as u32, y as u32).0[c] as f32 / 255.0
        }),
        other => {
            return Err(Error::Inference(format!(
                "models with {other} input channels are not supported"
            )))
        }
    };
    Ok((FaceCrop(tensor), region))
}
