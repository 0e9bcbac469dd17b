use image::{DynamicImage, GrayImage, Rgb32FImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::ConfigError;
use crate::types::{EdgeInsets, Orientation, RawImage};

/// Tesseract works best at 300 DPI / ~2000 px; larger pages are scaled down before recognition.
pub const DEFAULT_MAX_DIMENSION: u32 = 2800;

/// Parameters of the thermal-paper filter chain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub contrast: f32,
    pub brightness: f32,
    /// Zero produces a fully desaturated page.
    pub saturation: f32,
    pub sharpen_radius: f32,
    pub sharpen_intensity: f32,
    pub exposure_ev: f32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            contrast: 1.5,
            brightness: 0.05,
            saturation: 0.0,
            sharpen_radius: 2.5,
            sharpen_intensity: 0.5,
            exposure_ev: 0.3,
        }
    }
}

impl FilterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("contrast", self.contrast),
            ("brightness", self.brightness),
            ("saturation", self.saturation),
            ("sharpen_radius", self.sharpen_radius),
            ("sharpen_intensity", self.sharpen_intensity),
            ("exposure_ev", self.exposure_ev),
        ];
        match fields.iter().find(|(_, v)| !v.is_finite()) {
            Some(&(field, value)) => Err(ConfigError::NonFinite { field, value }),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Error)]
enum StageError {
    #[error("image has no pixels")]
    Empty,
    #[error("invalid {name}: {value}")]
    Parameter { name: &'static str, value: f32 },
}

type Stage = fn(&Rgb32FImage, &FilterConfig) -> Result<Rgb32FImage, StageError>;

const STAGES: [(&str, Stage); 3] = [
    ("color_controls", color_controls),
    ("unsharp_mask", unsharp_mask),
    ("exposure", exposure),
];

/// Output of [`preprocess_with_report`].
#[derive(Debug, Clone)]
pub struct Preprocessed {
    pub image: RawImage,
    /// 0 means the input came back untouched.
    pub stages_applied: usize,
}

/// Run the high-contrast chain for crumpled thermal paper. Never fails: a stage that cannot run
/// ends the chain and the last good output (or the input itself) is returned.
pub fn preprocess(image: &RawImage, config: &FilterConfig) -> RawImage {
    preprocess_with_report(image, config).image
}

pub fn preprocess_with_report(image: &RawImage, config: &FilterConfig) -> Preprocessed {
    let untouched = || Preprocessed { image: image.clone(), stages_applied: 0 };

    if image.is_empty() {
        debug!("filter chain skipped: {}", StageError::Empty);
        return untouched();
    }

    let mut current = image.bitmap().to_rgb32f();
    let mut applied = 0;
    for (name, stage) in STAGES {
        match stage(&current, config) {
            Ok(next) => {
                current = next;
                applied += 1;
            }
            Err(e) => {
                debug!(stage = name, "filter chain stopped: {e}");
                break;
            }
        }
    }

    if applied == 0 {
        return untouched();
    }

    let rendered = DynamicImage::ImageRgb32F(current).to_rgb8();
    Preprocessed {
        image: image.derive(DynamicImage::ImageRgb8(rendered)),
        stages_applied: applied,
    }
}

fn require(name: &'static str, value: f32, valid: bool) -> Result<(), StageError> {
    if value.is_finite() && valid {
        Ok(())
    } else {
        Err(StageError::Parameter { name, value })
    }
}

/// Desaturate toward Rec.601 luma, lift by `brightness`, then stretch around mid-grey by `contrast`.
fn color_controls(img: &Rgb32FImage, cfg: &FilterConfig) -> Result<Rgb32FImage, StageError> {
    require("contrast", cfg.contrast, true)?;
    require("brightness", cfg.brightness, true)?;
    require("saturation", cfg.saturation, true)?;

    let mut out = img.clone();
    for px in out.pixels_mut() {
        let [r, g, b] = px.0;
        let luma = 0.299 * r + 0.587 * g + 0.114 * b;
        for c in px.0.iter_mut() {
            let v = luma + cfg.saturation * (*c - luma) + cfg.brightness;
            *c = ((v - 0.5) * cfg.contrast + 0.5).clamp(0.0, 1.0);
        }
    }
    Ok(out)
}

fn unsharp_mask(img: &Rgb32FImage, cfg: &FilterConfig) -> Result<Rgb32FImage, StageError> {
    require("sharpen_radius", cfg.sharpen_radius, cfg.sharpen_radius > 0.0)?;
    require("sharpen_intensity", cfg.sharpen_intensity, true)?;

    let blurred = image::imageops::blur(img, cfg.sharpen_radius);
    let mut out = img.clone();
    for (px, soft) in out.pixels_mut().zip(blurred.pixels()) {
        for (c, s) in px.0.iter_mut().zip(soft.0) {
            *c = (*c + cfg.sharpen_intensity * (*c - s)).clamp(0.0, 1.0);
        }
    }
    Ok(out)
}

fn exposure(img: &Rgb32FImage, cfg: &FilterConfig) -> Result<Rgb32FImage, StageError> {
    require("exposure_ev", cfg.exposure_ev, true)?;

    let gain = 2f32.powf(cfg.exposure_ev);
    let mut out = img.clone();
    for px in out.pixels_mut() {
        for c in px.0.iter_mut() {
            *c = (*c * gain).clamp(0.0, 1.0);
        }
    }
    Ok(out)
}

/// Trim margins (e.g. document-camera borders). `None` when nothing would remain.
pub fn crop(image: &RawImage, insets: EdgeInsets) -> Option<RawImage> {
    let (w, h) = image.dimensions();
    let width = w.checked_sub(insets.left)?.checked_sub(insets.right)?;
    let height = h.checked_sub(insets.top)?.checked_sub(insets.bottom)?;
    if width == 0 || height == 0 {
        return None;
    }
    Some(image.derive(image.bitmap().crop_imm(insets.left, insets.top, width, height)))
}

/// Re-render into an upright frame. Pages that are already upright (or have no pixels)
/// come back as the same value.
pub fn normalize_orientation(image: &RawImage) -> RawImage {
    let orientation = image.orientation();
    if orientation == Orientation::Up || image.is_empty() {
        return image.clone();
    }

    let img = image.bitmap();
    let upright = match orientation {
        Orientation::Up => return image.clone(),
        Orientation::Down => img.rotate180(),
        Orientation::Left => img.rotate270(),
        Orientation::Right => img.rotate90(),
        Orientation::UpMirrored => img.fliph(),
        Orientation::DownMirrored => img.flipv(),
        Orientation::LeftMirrored => img.rotate90().fliph(),
        Orientation::RightMirrored => img.rotate270().fliph(),
    };
    RawImage::from_parts(upright, Orientation::Up, image.scale())
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConversionError {
    #[error("image has no pixels ({width}x{height})")]
    Empty { width: u32, height: u32 },
    #[error("maximum dimension must be positive")]
    ZeroLimit,
}

/// 8-bit grayscale page handed to the recognition engine.
#[derive(Debug, Clone)]
pub struct Bitmap {
    pixels: GrayImage,
}

impl Bitmap {
    pub fn pixels(&self) -> &GrayImage {
        &self.pixels
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn encode_png(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut buf = Vec::new();
        self.pixels
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)?;
        Ok(buf)
    }
}

impl From<GrayImage> for Bitmap {
    fn from(pixels: GrayImage) -> Self {
        Self { pixels }
    }
}

/// Grayscale, upright and no larger than `max_dimension` on either side.
pub fn to_engine_bitmap(image: &RawImage, max_dimension: u32) -> Result<Bitmap, ConversionError> {
    if max_dimension == 0 {
        return Err(ConversionError::ZeroLimit);
    }
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(ConversionError::Empty { width, height });
    }

    let upright = normalize_orientation(image);
    let img = upright.bitmap();
    let gray = if img.width() > max_dimension || img.height() > max_dimension {
        img.resize(max_dimension, max_dimension, image::imageops::FilterType::Lanczos3)
            .to_luma8()
    } else {
        img.to_luma8()
    };

    if gray.width() == 0 || gray.height() == 0 {
        return Err(ConversionError::Empty { width: gray.width(), height: gray.height() });
    }
    Ok(Bitmap { pixels: gray })
}
