use crate::detector::{ZeroShotDetector, CANDIDATE_LABELS};
use crate::error::PlateError;
use crate::types::{select_best, Located};
use async_trait::async_trait;
use image::ImageReader;
use log::info;
use std::path::Path;
use std::sync::Arc;

/// Finds the plate in a downloaded image.
#[async_trait]
pub trait PlateLocator: Send + Sync {
    /// `Ok(None)` means the image has no recognisable plate.
    async fn locate(&self, image: &Path) -> Result<Option<Located>, PlateError>;

    /// Called once after every extraction, whatever its outcome.
    fn release_cache(&self) {}
}

/// Locates plates with a local zero-shot detector; reading is left to OCR.
pub struct DetectorLocator {
    detector: Arc<dyn ZeroShotDetector>,
}

impl DetectorLocator {
    pub fn new(detector: Arc<dyn ZeroShotDetector>) -> Self {
        DetectorLocator { detector }
    }
}

#[async_trait]
impl PlateLocator for DetectorLocator {
    async fn locate(&self, image: &Path) -> Result<Option<Located>, PlateError> {
        let path = image.to_path_buf();
        let detector = self.detector.clone();
        tokio::task::spawn_blocking(move || {
            let image = ImageReader::open(&path)
                .and_then(|r| r.with_guessed_format())
                .map_err(|e| PlateError::Decode(e.to_string()))?
                .decode()
                .map_err(|e| PlateError::Decode(e.to_string()))?;
            let detections = detector.detect(&image, &CANDIDATE_LABELS)?;
            let detection = match select_best(&detections) {
                Some(best) => best.clone(),
                None => {
                    info!("No plate detected");
                    return Ok(None);
                }
            };
            info!(
                "Detected {} with {:.2} confidence at {:?}",
                detection.label, detection.score, detection.bbox
            );
            Ok(Some(Located::Region { image, detection }))
        })
        .await?
    }

    fn release_cache(&self) {
        self.detector.release_cache();
    }
}
