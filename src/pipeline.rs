use crate::error::PlateError;
use crate::fetch::ImageFetcher;
use crate::locator::PlateLocator;
use crate::ocr::TextExtractor;
use crate::types::{Located, NO_PLATE_DETECTED, NO_TEXT_FOUND};
use log::{debug, error, info};
use std::sync::Arc;
use uuid::Uuid;

/// Releases the locator's cached accelerator memory when dropped.
struct CacheGuard<'a>(&'a dyn PlateLocator);

impl Drop for CacheGuard<'_> {
    fn drop(&mut self) {
        self.0.release_cache();
        debug!("Locator cache released");
    }
}

/// fetch -> locate -> (crop -> OCR) -> cleanup, one request at a time.
pub struct Pipeline {
    fetcher: ImageFetcher,
    locator: Arc<dyn PlateLocator>,
    ocr: Arc<dyn TextExtractor>,
}

impl Pipeline {
    pub fn new(
        fetcher: ImageFetcher,
        locator: Arc<dyn PlateLocator>,
        ocr: Arc<dyn TextExtractor>,
    ) -> Self {
        Pipeline {
            fetcher,
            locator,
            ocr,
        }
    }

    /// Returns the plate text or one of the "not found" sentinels. The
    /// downloaded file and the locator cache are released on every path.
    pub async fn process(&self, url: &str) -> Result<String, PlateError> {
        let request_id = Uuid::new_v4();
        info!("[{}] Extracting plate from {}", request_id, url);
        let result = self.run(url, request_id).await;
        match &result {
            Ok(text) => info!("[{}] Result: {}", request_id, text),
            Err(e) => error!("[{}] Extraction failed: {}", request_id, e),
        }
        result
    }

    async fn run(&self, url: &str, request_id: Uuid) -> Result<String, PlateError> {
        let _cache = CacheGuard(self.locator.as_ref());
        let image = self.fetcher.fetch(url, request_id).await?;

        match self.locator.locate(image.path()).await? {
            None => Ok(NO_PLATE_DETECTED.to_string()),
            Some(Located::Text(text)) => Ok(text),
            Some(Located::Region { image, detection }) => {
                let ocr = self.ocr.clone();
                let text = tokio::task::spawn_blocking(move || {
                    let region = detection.bbox.crop(&image);
                    debug!("Cropped region {}x{}", region.width(), region.height());
                    ocr.extract_text(&region)
                })
                .await??;
                if text.is_empty() {
                    Ok(NO_TEXT_FOUND.to_string())
                } else {
                    Ok(text)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::DetectorLocator;
    use crate::test_support::{png_bytes, serve, FakeDetector, FakeOcr};
    use crate::types::{BoundingBox, Detection};
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;
    use warp::Filter;

    fn detection(score: f32, bbox: BoundingBox) -> Detection {
        Detection {
            bbox,
            score,
            label: "license plate".to_string(),
        }
    }

    /// Wraps a locator and remembers which file it was shown.
    struct Spy<L> {
        inner: L,
        seen: Mutex<Option<PathBuf>>,
    }

    #[async_trait]
    impl<L: PlateLocator> PlateLocator for Spy<L> {
        async fn locate(&self, image: &Path) -> Result<Option<Located>, PlateError> {
            *self.seen.lock().unwrap() = Some(image.to_path_buf());
            self.inner.locate(image).await
        }

        fn release_cache(&self) {
            self.inner.release_cache();
        }
    }

    struct Fixture {
        pipeline: Pipeline,
        detector: Arc<FakeDetector>,
        ocr: Arc<FakeOcr>,
        spy: Arc<Spy<DetectorLocator>>,
        url: String,
        _dir: tempfile::TempDir,
    }

    impl Fixture {
        fn seen_path(&self) -> PathBuf {
            self.spy.seen.lock().unwrap().clone().unwrap()
        }

        fn releases(&self) -> usize {
            self.detector.releases.load(Ordering::SeqCst)
        }
    }

    async fn fixture(detector: FakeDetector, ocr_text: &str) -> Fixture {
        let body = png_bytes();
        let addr = serve!(warp::path!("car.png").map(move || body.clone()));
        let dir = tempfile::tempdir().unwrap();
        let detector = Arc::new(detector);
        let ocr = Arc::new(FakeOcr::reading(ocr_text));
        let spy = Arc::new(Spy {
            inner: DetectorLocator::new(detector.clone()),
            seen: Mutex::new(None),
        });
        let pipeline = Pipeline::new(
            ImageFetcher::new(dir.path().to_path_buf()).unwrap(),
            spy.clone(),
            ocr.clone(),
        );
        Fixture {
            pipeline,
            detector,
            ocr,
            spy,
            url: format!("http://{}/car.png", addr),
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn reads_text_from_best_region() {
        let small = BoundingBox {
            xmin: 0,
            ymin: 0,
            xmax: 4,
            ymax: 4,
        };
        let plate = BoundingBox {
            xmin: 10,
            ymin: 5,
            xmax: 50,
            ymax: 25,
        };
        let f = fixture(
            FakeDetector {
                detections: vec![
                    detection(0.4, small),
                    detection(0.9, plate),
                    detection(0.6, small),
                ],
                ..Default::default()
            },
            "AB12CDE",
        )
        .await;

        assert_eq!(f.pipeline.process(&f.url).await.unwrap(), "AB12CDE");
        assert_eq!(*f.ocr.seen.lock().unwrap(), vec![(40, 20)]);
        assert!(!f.seen_path().exists());
        assert_eq!(f.releases(), 1);
    }

    #[tokio::test]
    async fn no_detection_returns_sentinel_and_cleans_up() {
        let f = fixture(FakeDetector::default(), "unused").await;

        assert_eq!(f.pipeline.process(&f.url).await.unwrap(), NO_PLATE_DETECTED);
        assert!(f.ocr.seen.lock().unwrap().is_empty());
        assert!(!f.seen_path().exists());
        assert_eq!(f.releases(), 1);
    }

    #[tokio::test]
    async fn blank_plate_returns_sentinel() {
        let bbox = BoundingBox {
            xmin: 0,
            ymin: 0,
            xmax: 20,
            ymax: 10,
        };
        let f = fixture(
            FakeDetector {
                detections: vec![detection(0.8, bbox)],
                ..Default::default()
            },
            "  \n",
        )
        .await;

        assert_eq!(f.pipeline.process(&f.url).await.unwrap(), NO_TEXT_FOUND);
        assert!(!f.seen_path().exists());
    }

    #[tokio::test]
    async fn detector_failure_still_cleans_up() {
        let f = fixture(
            FakeDetector {
                fail: true,
                ..Default::default()
            },
            "unused",
        )
        .await;

        let err = f.pipeline.process(&f.url).await.unwrap_err();
        assert!(matches!(err, PlateError::Detection(_)));
        assert!(!f.seen_path().exists());
        assert_eq!(f.releases(), 1);
    }

    #[tokio::test]
    async fn download_failure_releases_cache() {
        let f = fixture(FakeDetector::default(), "unused").await;

        let err = f
            .pipeline
            .process("http://127.0.0.1:1/car.png")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to download"));
        assert!(f.spy.seen.lock().unwrap().is_none());
        assert_eq!(f.releases(), 1);
    }
}
