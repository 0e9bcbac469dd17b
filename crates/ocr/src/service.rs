use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::{ConfigError, ScannerConfig};
use crate::preprocess::{self, Bitmap, FilterConfig};
use crate::recognizer::{Completion, EngineError, EngineOutcome, EngineRequest, OcrEngine};
use crate::types::{RawImage, RecognitionResult};

/// Everything `recognize_text` can fail with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OcrError {
    #[error("Failed to convert image for text recognition")]
    ImageConversionFailed,
    #[error("Text recognition failed: {0}")]
    RecognitionFailed(#[source] EngineError),
    #[error("No text found in image")]
    NoTextFound,
    /// The batch was dropped before this page finished.
    #[error("OCR operation was cancelled")]
    Cancelled,
}

impl OcrError {
    /// Whether resubmitting the same page may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OcrError::RecognitionFailed(_))
    }
}

/// Preprocessing + recognition over one engine handle.
///
/// Requests on one service run one at a time, in arrival order: the engine handle is not
/// safe for concurrent use. Separate services never wait on each other.
pub struct RecognitionService<E> {
    engine: E,
    request: EngineRequest,
    filter: FilterConfig,
    max_dimension: u32,
    turn: Mutex<()>,
}

impl<E: OcrEngine> RecognitionService<E> {
    pub fn new(engine: E) -> Result<Self, ConfigError> {
        Self::with_config(engine, ScannerConfig::default())
    }

    pub fn with_config(engine: E, config: ScannerConfig) -> Result<Self, ConfigError> {
        config.validate(&engine.supported_languages())?;
        Ok(Self {
            request: config.engine_request(),
            filter: config.filter,
            max_dimension: config.recognition.max_dimension,
            engine,
            turn: Mutex::new(()),
        })
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn languages(&self) -> &[String] {
        &self.request.languages
    }

    pub fn filter(&self) -> &FilterConfig {
        &self.filter
    }

    /// Recognize the text lines on one page.
    pub async fn recognize_text(
        &self,
        image: &RawImage,
        preprocess: bool,
    ) -> Result<RecognitionResult, OcrError> {
        let _turn = self.turn.lock().await;
        let started = Instant::now();

        let input = if preprocess {
            self.preprocess(image).await
        } else {
            image.clone()
        };

        let bitmap = preprocess::to_engine_bitmap(&input, self.max_dimension).map_err(|e| {
            debug!("image conversion failed: {e}");
            OcrError::ImageConversionFailed
        })?;

        let lines = self
            .run_engine(bitmap)
            .await
            .map_err(OcrError::RecognitionFailed)?;
        let elapsed = started.elapsed();

        let result = RecognitionResult::new(lines, elapsed).ok_or(OcrError::NoTextFound)?;
        debug!(
            lines = result.lines().len(),
            seconds = result.processing_time_seconds(),
            "page recognized"
        );
        Ok(result)
    }

    /// Quick probe for any text at all. Skips preprocessing and never fails.
    pub async fn contains_text(&self, image: &RawImage) -> bool {
        let _turn = self.turn.lock().await;
        let Ok(bitmap) = preprocess::to_engine_bitmap(image, self.max_dimension) else {
            return false;
        };
        matches!(self.run_engine(bitmap).await, Ok(lines) if !lines.is_empty())
    }

    /// Filters run on the blocking pool; if that worker dies the original page is used.
    async fn preprocess(&self, image: &RawImage) -> RawImage {
        let source = image.clone();
        let config = self.filter;
        match tokio::task::spawn_blocking(move || preprocess::preprocess_with_report(&source, &config))
            .await
        {
            Ok(done) => {
                debug!(stages = done.stages_applied, "page preprocessed");
                done.image
            }
            Err(e) => {
                warn!("preprocessing worker failed, using original page: {e}");
                image.clone()
            }
        }
    }

    async fn run_engine(&self, bitmap: Bitmap) -> EngineOutcome {
        let (completion, pending) = Completion::channel();
        self.engine.recognize(bitmap, &self.request, completion);
        pending.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognizer::{MockRecognizer, MockResponse};
    use image::{DynamicImage, GrayImage, ImageBuffer, Luma};
    use std::sync::Arc;
    use std::time::Duration;

    fn page() -> RawImage {
        let img: GrayImage = ImageBuffer::from_fn(16, 16, |x, _| Luma([if x % 4 == 0 { 20 } else { 230 }]));
        RawImage::new(DynamicImage::ImageLuma8(img))
    }

    fn empty_page() -> RawImage {
        RawImage::new(DynamicImage::ImageLuma8(GrayImage::new(0, 0)))
    }

    fn service(mock: MockRecognizer) -> (Arc<MockRecognizer>, RecognitionService<Arc<MockRecognizer>>) {
        let mock = Arc::new(mock);
        let svc = RecognitionService::new(Arc::clone(&mock)).unwrap();
        (mock, svc)
    }

    #[tokio::test]
    async fn recognizes_lines_with_mixed_scripts() {
        let (mock, svc) = service(MockRecognizer::new("T&T SUPERMARKET\n白菜 Bok Choy 3.99\n豆腐 Tofu 2.49"));
        let result = svc.recognize_text(&page(), true).await.unwrap();
        assert_eq!(result.lines().len(), 3);
        assert_eq!(result.raw_text(), "T&T SUPERMARKET\n白菜 Bok Choy 3.99\n豆腐 Tofu 2.49");
        assert!(result.processing_time_seconds() >= 0.0);
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn zero_lines_is_no_text_found() {
        let (_, svc) = service(MockRecognizer::scripted([MockResponse::empty()]));
        assert_eq!(svc.recognize_text(&page(), true).await, Err(OcrError::NoTextFound));
    }

    #[tokio::test]
    async fn engine_error_is_wrapped() {
        let (_, svc) = service(MockRecognizer::scripted([MockResponse::error("smudged")]));
        let err = svc.recognize_text(&page(), false).await.unwrap_err();
        assert_eq!(err, OcrError::RecognitionFailed(EngineError::Engine("smudged".into())));
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "Text recognition failed: smudged");
    }

    #[tokio::test]
    async fn unconvertible_image_never_reaches_engine() {
        let (mock, svc) = service(MockRecognizer::new("never"));
        for preprocess in [true, false] {
            assert_eq!(
                svc.recognize_text(&empty_page(), preprocess).await,
                Err(OcrError::ImageConversionFailed)
            );
        }
        assert_eq!(mock.calls(), 0);
        assert!(!OcrError::ImageConversionFailed.is_retryable());
    }

    #[tokio::test]
    async fn degraded_preprocessing_still_recognizes() {
        let config = ScannerConfig {
            filter: FilterConfig { sharpen_radius: -1.0, ..FilterConfig::default() },
            ..ScannerConfig::default()
        };
        let mock = Arc::new(MockRecognizer::new("TOTAL 12.00"));
        let svc = RecognitionService::with_config(Arc::clone(&mock), config).unwrap();
        let result = svc.recognize_text(&page(), true).await.unwrap();
        assert_eq!(result.raw_text(), "TOTAL 12.00");
    }

    #[tokio::test]
    async fn processing_time_covers_engine_call() {
        let (_, svc) = service(MockRecognizer::scripted([
            MockResponse::text("slow").after(Duration::from_millis(30)),
        ]));
        let result = svc.recognize_text(&page(), false).await.unwrap();
        assert!(result.processing_time_seconds() >= 0.03);
    }

    #[tokio::test]
    async fn concurrent_calls_complete_in_submission_order() {
        // A is slow and B is instant: only serialization keeps A ahead of B.
        let (mock, svc) = service(MockRecognizer::scripted([
            MockResponse::text("A").after(Duration::from_millis(200)),
            MockResponse::text("B"),
        ]));
        let svc = Arc::new(svc);
        let finished = Arc::new(std::sync::Mutex::new(Vec::new()));

        let a = tokio::spawn({
            let (svc, finished) = (Arc::clone(&svc), Arc::clone(&finished));
            async move {
                let r = svc.recognize_text(&page(), false).await.unwrap();
                finished.lock().unwrap().push(r.raw_text().to_string());
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let b = tokio::spawn({
            let (svc, finished) = (Arc::clone(&svc), Arc::clone(&finished));
            async move {
                let r = svc.recognize_text(&page(), false).await.unwrap();
                finished.lock().unwrap().push(r.raw_text().to_string());
            }
        });

        a.await.unwrap();
        b.await.unwrap();
        assert_eq!(*finished.lock().unwrap(), ["A", "B"]);
        assert_eq!(mock.calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn separate_services_do_not_wait_on_each_other() {
        let (_, slow) = service(MockRecognizer::scripted([
            MockResponse::text("slow").after(Duration::from_millis(300)),
        ]));
        let (_, fast) = service(MockRecognizer::new("fast"));
        let slow = Arc::new(slow);

        let pending = tokio::spawn({
            let slow = Arc::clone(&slow);
            async move { slow.recognize_text(&page(), false).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = Instant::now();
        fast.recognize_text(&page(), false).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(250));
        assert!(pending.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn contains_text_reports_lines() {
        let (_, svc) = service(MockRecognizer::new("hello"));
        assert!(svc.contains_text(&page()).await);
    }

    #[tokio::test]
    async fn contains_text_swallows_every_failure() {
        let (_, svc) = service(MockRecognizer::scripted([
            MockResponse::empty(),
            MockResponse::error("engine crashed"),
        ]));
        assert!(!svc.contains_text(&page()).await);
        assert!(!svc.contains_text(&page()).await);
        assert!(!svc.contains_text(&empty_page()).await);
    }

    #[test]
    fn construction_validates_languages() {
        let mut config = ScannerConfig::default();
        config.recognition.languages = vec!["ja-JP".into()];
        let err = RecognitionService::with_config(MockRecognizer::new("x"), config.clone()).err();
        assert!(matches!(err, Some(ConfigError::UnsupportedLanguage(_))));

        let engine = MockRecognizer::new("x").with_languages(["ja-JP"]);
        let svc = RecognitionService::with_config(engine, config).unwrap();
        assert_eq!(svc.languages(), ["ja-JP"]);
    }

    #[test]
    fn error_descriptions() {
        assert_eq!(OcrError::NoTextFound.to_string(), "No text found in image");
        assert_eq!(OcrError::Cancelled.to_string(), "OCR operation was cancelled");
        assert_eq!(
            OcrError::ImageConversionFailed.to_string(),
            "Failed to convert image for text recognition"
        );
    }
}
