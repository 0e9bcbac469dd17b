use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// How the stored pixels must be transformed to appear upright.
/// Variants follow the EXIF orientation tags 1–8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    #[default]
    Up,
    Down,
    /// Stored rotated 90° clockwise; displaying needs a 90° counter-clockwise turn.
    Left,
    /// Stored rotated 90° counter-clockwise; displaying needs a 90° clockwise turn.
    Right,
    UpMirrored,
    DownMirrored,
    LeftMirrored,
    RightMirrored,
}

impl Orientation {
    pub fn from_exif(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Orientation::Up),
            2 => Some(Orientation::UpMirrored),
            3 => Some(Orientation::Down),
            4 => Some(Orientation::DownMirrored),
            5 => Some(Orientation::LeftMirrored),
            6 => Some(Orientation::Right),
            7 => Some(Orientation::RightMirrored),
            8 => Some(Orientation::Left),
            _ => None,
        }
    }

    /// Whether the upright frame swaps width and height.
    pub fn is_transposed(self) -> bool {
        matches!(
            self,
            Orientation::Left
                | Orientation::Right
                | Orientation::LeftMirrored
                | Orientation::RightMirrored
        )
    }
}

/// A captured page. Pixels are shared, so clones are cheap and never copy the bitmap.
#[derive(Clone)]
pub struct RawImage {
    bitmap: Arc<DynamicImage>,
    orientation: Orientation,
    scale: f32,
}

impl RawImage {
    pub fn new(bitmap: DynamicImage) -> Self {
        Self::from_parts(bitmap, Orientation::Up, 1.0)
    }

    pub fn from_parts(bitmap: DynamicImage, orientation: Orientation, scale: f32) -> Self {
        Self { bitmap: Arc::new(bitmap), orientation, scale }
    }

    pub fn with_orientation(mut self, orientation: Orientation) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    /// Decode JPEG / PNG / WEBP / … bytes as an upright page.
    pub fn from_bytes(data: &[u8]) -> Result<Self, image::ImageError> {
        Ok(Self::new(image::load_from_memory(data)?))
    }

    pub fn open(path: &Path) -> Result<Self, image::ImageError> {
        Ok(Self::new(image::open(path)?))
    }

    pub fn bitmap(&self) -> &DynamicImage {
        &self.bitmap
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn width(&self) -> u32 {
        self.bitmap.width()
    }

    pub fn height(&self) -> u32 {
        self.bitmap.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width(), self.height())
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// True when both values share the same pixel buffer.
    pub fn shares_bitmap_with(&self, other: &RawImage) -> bool {
        Arc::ptr_eq(&self.bitmap, &other.bitmap)
    }

    /// New pixels in this image's frame (orientation and scale carried over).
    pub(crate) fn derive(&self, bitmap: DynamicImage) -> RawImage {
        Self::from_parts(bitmap, self.orientation, self.scale)
    }

    pub fn encode_png(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut buf = Vec::new();
        self.bitmap.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
        Ok(buf)
    }
}

impl fmt::Debug for RawImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawImage")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("color", &self.bitmap.color())
            .field("orientation", &self.orientation)
            .field("scale", &self.scale)
            .finish()
    }
}

/// Pixel margins trimmed by [`crate::preprocess::crop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EdgeInsets {
    pub top: u32,
    pub left: u32,
    pub bottom: u32,
    pub right: u32,
}

impl EdgeInsets {
    pub fn uniform(inset: u32) -> Self {
        Self { top: inset, left: inset, bottom: inset, right: inset }
    }
}

/// A rectangle in normalized page coordinates: origin top-left, both axes in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// Clamps the rectangle into the unit square. Non-finite inputs collapse to zero.
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        let unit = |v: f32| if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 };
        let x = unit(x);
        let y = unit(y);
        Self {
            x,
            y,
            width: unit(width).min(1.0 - x),
            height: unit(height).min(1.0 - y),
        }
    }

    pub fn from_pixels(left: u32, top: u32, width: u32, height: u32, page: (u32, u32)) -> Self {
        let (page_w, page_h) = page;
        if page_w == 0 || page_h == 0 {
            return Self::default();
        }
        let (pw, ph) = (page_w as f32, page_h as f32);
        Self::new(left as f32 / pw, top as f32 / ph, width as f32 / pw, height as f32 / ph)
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = (self.x + self.width).max(other.x + other.width);
        let bottom = (self.y + self.height).max(other.y + other.height);
        BoundingBox::new(x, y, right - x, bottom - y)
    }
}

/// One line of text as reported by the recognition engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognizedLine {
    text: String,
    confidence: f32,
    bounding_box: BoundingBox,
}

impl RecognizedLine {
    pub fn new(text: impl Into<String>, confidence: f32, bounding_box: BoundingBox) -> Self {
        let confidence = if confidence.is_finite() { confidence.clamp(0.0, 1.0) } else { 0.0 };
        Self { text: text.into(), confidence, bounding_box }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Confidence in this line (0.0 = guessed, 1.0 = certain).
    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn bounding_box(&self) -> BoundingBox {
        self.bounding_box
    }
}

/// Outcome of one successful recognition call. Always holds at least one line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionResult {
    lines: Vec<RecognizedLine>,
    raw_text: String,
    processing_time_seconds: f64,
}

impl RecognitionResult {
    /// `None` when `lines` is empty.
    pub fn new(lines: Vec<RecognizedLine>, processing_time: Duration) -> Option<Self> {
        if lines.is_empty() {
            return None;
        }
        let raw_text = lines
            .iter()
            .map(RecognizedLine::text)
            .collect::<Vec<_>>()
            .join("\n");
        Some(Self {
            lines,
            raw_text,
            processing_time_seconds: processing_time.as_secs_f64(),
        })
    }

    pub fn lines(&self) -> &[RecognizedLine] {
        &self.lines
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    pub fn processing_time_seconds(&self) -> f64 {
        self.processing_time_seconds
    }

    pub fn mean_confidence(&self) -> f32 {
        self.lines.iter().map(RecognizedLine::confidence).sum::<f32>() / self.lines.len() as f32
    }
}
