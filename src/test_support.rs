//! Fakes and helpers shared by the unit tests.

use crate::detector::ZeroShotDetector;
use crate::error::PlateError;
use crate::ocr::TextExtractor;
use crate::types::Detection;
use image::{DynamicImage, ImageFormat, RgbImage};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Serves a warp filter on an ephemeral localhost port and returns its address.
macro_rules! serve {
    ($filter:expr) => {{
        let (addr, server) = warp::serve($filter).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        addr
    }};
}
pub(crate) use serve;

pub fn png_bytes() -> Vec<u8> {
    let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 32, image::Rgb([200, 200, 40])));
    let mut out = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .unwrap();
    out
}

/// Returns canned detections and counts cache releases.
#[derive(Default)]
pub struct FakeDetector {
    pub detections: Vec<Detection>,
    pub fail: bool,
    pub releases: AtomicUsize,
}

impl ZeroShotDetector for FakeDetector {
    fn detect(
        &self,
        _image: &DynamicImage,
        _labels: &[&str],
    ) -> Result<Vec<Detection>, PlateError> {
        if self.fail {
            return Err(PlateError::Detection("model exploded".to_string()));
        }
        Ok(self.detections.clone())
    }

    fn release_cache(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Returns a fixed string and remembers the size of each region it was shown.
pub struct FakeOcr {
    pub text: String,
    pub seen: Mutex<Vec<(u32, u32)>>,
}

impl FakeOcr {
    pub fn reading(text: &str) -> Self {
        FakeOcr {
            text: text.to_string(),
            seen: Mutex::new(Vec::new()),
        }
    }
}

impl TextExtractor for FakeOcr {
    fn extract_text(&self, image: &DynamicImage) -> Result<String, PlateError> {
        self.seen
            .lock()
            .unwrap()
            .push((image.width(), image.height()));
        Ok(self.text.trim().to_string())
    }
}
