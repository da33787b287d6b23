use image::DynamicImage;

pub const NO_PLATE_DETECTED: &str = "No license plate detected in the image.";
pub const NO_TEXT_FOUND: &str = "No text found on the license plate.";
pub const REMOTE_NOT_FOUND: &str = "Not found";

/// Pixel-space box, corners inclusive of `min` and exclusive of `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub xmin: i32,
    pub ymin: i32,
    pub xmax: i32,
    pub ymax: i32,
}

impl BoundingBox {
    /// Truncates toward zero; a pixel or two of slack is fine for OCR.
    pub fn from_corners(xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> Self {
        BoundingBox {
            xmin: xmin as i32,
            ymin: ymin as i32,
            xmax: xmax as i32,
            ymax: ymax as i32,
        }
    }

    /// Crops `image` to this box, clamped to the image bounds. A box that lies
    /// outside the image or is inverted yields an empty image.
    pub fn crop(&self, image: &DynamicImage) -> DynamicImage {
        let (width, height) = (image.width() as i64, image.height() as i64);
        let x0 = (self.xmin as i64).clamp(0, width);
        let y0 = (self.ymin as i64).clamp(0, height);
        let x1 = (self.xmax as i64).clamp(x0, width);
        let y1 = (self.ymax as i64).clamp(y0, height);
        image.crop_imm(x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub score: f32,
    pub label: String,
}

/// What a locator found in the image.
#[derive(Debug)]
pub enum Located {
    /// A region still to be cropped and read.
    Region {
        image: DynamicImage,
        detection: Detection,
    },
    /// Text already read by the locator itself.
    Text(String),
}

/// Highest-scoring detection; on ties the earliest one wins. NaN scores are
/// never selected.
pub fn select_best(detections: &[Detection]) -> Option<&Detection> {
    detections
        .iter()
        .filter(|d| !d.score.is_nan())
        .fold(None, |best, d| match best {
            Some(b) if d.score <= b.score => Some(b),
            _ => Some(d),
        })
}
