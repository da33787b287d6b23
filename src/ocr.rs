use crate::error::PlateError;
use image::{DynamicImage, ImageFormat};
use log::{debug, info};
use rusty_tesseract::Args;
use std::path::PathBuf;

/// Reads the text in an image region. Only ever called with the cropped plate.
pub trait TextExtractor: Send + Sync {
    /// Returns the trimmed text, or an empty string when nothing is legible.
    fn extract_text(&self, image: &DynamicImage) -> Result<String, PlateError>;
}

pub struct TesseractExtractor {
    args: Args,
    temp_dir: PathBuf,
}

impl TesseractExtractor {
    pub fn new(lang: &str, psm: i32, oem: i32, temp_dir: PathBuf) -> Self {
        let args = Args {
            lang: lang.to_string(),
            psm: Some(psm),
            oem: Some(oem),
            ..Args::default()
        };
        TesseractExtractor { args, temp_dir }
    }
}

impl TextExtractor for TesseractExtractor {
    fn extract_text(&self, image: &DynamicImage) -> Result<String, PlateError> {
        if image.width() == 0 || image.height() == 0 {
            debug!("Empty region, skipping OCR");
            return Ok(String::new());
        }

        // Tesseract reads from disk; the region lives only as long as this call.
        let region = tempfile::Builder::new()
            .prefix("plate-region-")
            .suffix(".png")
            .tempfile_in(&self.temp_dir)
            .map_err(|e| PlateError::Ocr(e.to_string()))?;
        image
            .save_with_format(region.path(), ImageFormat::Png)
            .map_err(|e| PlateError::Ocr(format!("Failed to write region: {}", e)))?;

        let region_path = region.path().to_string_lossy().into_owned();
        let input = rusty_tesseract::Image::from_path(region_path)
            .map_err(|e| PlateError::Ocr(e.to_string()))?;
        let raw = rusty_tesseract::image_to_string(&input, &self.args)
            .map_err(|e| PlateError::Ocr(e.to_string()))?;

        let text = clean(&raw);
        info!("OCR extracted: {}", text);
        Ok(text)
    }
}

fn clean(raw: &str) -> String {
    raw.trim().to_string()
}
