use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::codecs::png::PngEncoder;
use image::imageops::{self, FilterType};
use image::{ExtendedColorType, ImageBuffer, ImageEncoder, Luma, Rgb, RgbImage};

use crate::error::{Error, Result};
use crate::gradcam::ActivationMap;
use crate::preprocess::FaceRegion;

pub const DEFAULT_ALPHA: f32 = 0.4;

/// Prefix of every image we hand back; sent on its own when there is no image.
pub const PNG_DATA_URL_PREFIX: &str = "data:image/png;base64,";

/// Blue-to-red "jet" palette, as in OpenCV's `COLORMAP_JET`.
pub fn jet(value: u8) -> Rgb<u8> {
    let t = value as f32 / 255.0;
    let channel = |centre: f32| ((1.5 - (4.0 * t - centre).abs()).clamp(0.0, 1.0) * 255.0).round() as u8;
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

#[derive(Debug, Clone)]
pub struct Visualization {
    pub heatmap: RgbImage,
    pub composite: RgbImage,
}

impl Visualization {
    /// `(heatmap, superimposed)` as PNG data URLs.
    pub fn to_data_urls(&self) -> Result<(String, String)> {
        Ok((png_data_url(&self.heatmap)?, png_data_url(&self.composite)?))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Composer {
    alpha: f32,
}

impl Default for Composer {
    fn default() -> Self {
        Composer { alpha: DEFAULT_ALPHA }
    }
}

impl Composer {
    /// `alpha` is the heatmap weight in the blend and must lie in `[0, 1]`.
    pub fn new(alpha: f32) -> Result<Composer> {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(Error::Config(format!("alpha must be within [0, 1], got {alpha}")));
        }
        Ok(Composer { alpha })
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    pub fn compose(&self, original: &RgbImage, map: &ActivationMap) -> Visualization {
        self.compose_region(original, map, FaceRegion::full(original))
    }

    /// Like [`Composer::compose`], but the map only covers `region` of `original`; everything
    /// outside it is drawn as zero activation.
    pub fn compose_region(&self, original: &RgbImage, map: &ActivationMap, region: FaceRegion) -> Visualization {
        let (width, height) = original.dimensions();
        let (map_h, map_w) = map.dim();
        let values = map.values();
        let mut resized = ImageBuffer::<Luma<f32>, Vec<f32>>::new(width, height);
        if let Some(region) = region.clamp_to(width, height).filter(|_| map_h > 0 && map_w > 0) {
            let native = ImageBuffer::from_fn(map_w as u32, map_h as u32, |x, y| {
                Luma([values[[y as usize, x as usize]]])
            });
            let scaled = imageops::resize(&native, region.width, region.height, FilterType::Triangle);
            imageops::replace(&mut resized, &scaled, region.x as i64, region.y as i64);
        }

        let heatmap = RgbImage::from_fn(width, height, |x, y| {
            let v = resized.get_pixel(x, y).0[0].clamp(0.0, 1.0);
            jet((v * 255.0) as u8)
        });

        let alpha = self.alpha;
        let composite = RgbImage::from_fn(width, height, |x, y| {
            let h = heatmap.get_pixel(x, y).0;
            let o = original.get_pixel(x, y).0;
            Rgb(std::array::from_fn(|c| {
                (alpha * h[c] as f32 + (1.0 - alpha) * o[c] as f32).round().clamp(0.0, 255.0) as u8
            }))
        });

        Visualization { heatmap, composite }
    }
}

pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    PngEncoder::new(&mut buffer)
        .write_image(image.as_raw(), image.width(), image.height(), ExtendedColorType::Rgb8)
        .map_err(|e| Error::Encode(e.to_string()))?;
    Ok(buffer)
}

pub fn png_data_url(image: &RgbImage) -> Result<String> {
    Ok(format!("{PNG_DATA_URL_PREFIX}{}", BASE64.encode(encode_png(image)?)))
}
