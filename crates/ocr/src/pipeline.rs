use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{info, instrument, warn};

use crate::recognizer::OcrEngine;
use crate::service::{OcrError, RecognitionService};
use crate::session::ScanSession;
use crate::types::RawImage;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    #[error("A scan is already being processed")]
    AlreadyProcessing,
    #[error("No pages to scan")]
    EmptyBatch,
    #[error("The scan was reset before it finished")]
    Superseded,
}

/// Drives multi-page scans: pages go through the recognition service one at a time, in order,
/// and the first failing page ends the batch.
///
/// Every state change replaces the [`ScanSession`] snapshot; observers get it via [`subscribe`].
///
/// [`subscribe`]: ScanOrchestrator::subscribe
pub struct ScanOrchestrator<E> {
    service: Arc<RecognitionService<E>>,
    session: watch::Sender<ScanSession>,
    preprocess: bool,
}

impl<E: OcrEngine> ScanOrchestrator<E> {
    pub fn new(service: Arc<RecognitionService<E>>) -> Self {
        let (session, _) = watch::channel(ScanSession::default());
        Self { service, session, preprocess: true }
    }

    /// Whether pages run through the filter chain before recognition (default: yes).
    pub fn with_preprocessing(mut self, enabled: bool) -> Self {
        self.preprocess = enabled;
        self
    }

    pub fn service(&self) -> &Arc<RecognitionService<E>> {
        &self.service
    }

    pub fn subscribe(&self) -> watch::Receiver<ScanSession> {
        self.session.subscribe()
    }

    pub fn snapshot(&self) -> ScanSession {
        self.session.borrow().clone()
    }

    /// Discard pages and results and go back to idle. A page still being recognized for the
    /// discarded run finishes, but its result is dropped.
    pub fn reset(&self) {
        self.session.send_modify(ScanSession::reset);
        info!("scan session reset");
    }

    /// Scan `pages` in order and return the final session.
    ///
    /// Stops at the first failing page: the session ends `Failed` with that error, results of
    /// earlier pages stay, later pages are never submitted.
    #[instrument(skip_all, fields(pages = pages.len()))]
    pub async fn process_batch(&self, pages: Vec<RawImage>) -> Result<ScanSession, ScanError> {
        if pages.is_empty() {
            return Err(ScanError::EmptyBatch);
        }
        let pages: Arc<[RawImage]> = pages.into();

        let mut generation = None;
        self.session.send_if_modified(|s| {
            if s.is_processing() {
                return false;
            }
            generation = Some(s.begin(Arc::clone(&pages)));
            true
        });
        let Some(generation) = generation else {
            return Err(ScanError::AlreadyProcessing);
        };
        info!(generation, "scan started");
        let _abandon = AbandonGuard { session: &self.session, generation };

        for (index, page) in pages.iter().enumerate() {
            match self.service.recognize_text(page, self.preprocess).await {
                Ok(result) => {
                    self.commit(generation, |s| s.push_result(result))?;
                }
                Err(error) => {
                    warn!(page = index + 1, "scan stopped: {error}");
                    return self.commit(generation, |s| s.fail(error));
                }
            }
        }

        let done = self.commit(generation, ScanSession::complete)?;
        info!(lines = done.total_lines_recognized(), "scan completed");
        Ok(done)
    }

    /// Apply `change` if the session still belongs to `generation`; returns the new snapshot.
    fn commit(
        &self,
        generation: u64,
        change: impl FnOnce(&mut ScanSession),
    ) -> Result<ScanSession, ScanError> {
        let mut snapshot = None;
        self.session.send_if_modified(|s| {
            if s.generation() != generation {
                return false;
            }
            change(s);
            snapshot = Some(s.clone());
            true
        });
        snapshot.ok_or_else(|| {
            warn!(generation, "result dropped: scan was reset");
            ScanError::Superseded
        })
    }
}

/// Ends a run as `Failed(Cancelled)` when its `process_batch` future is dropped mid-batch.
/// A run that already finished, or was reset, is left alone.
struct AbandonGuard<'a> {
    session: &'a watch::Sender<ScanSession>,
    generation: u64,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        let generation = self.generation;
        let abandoned = self.session.send_if_modified(|s| {
            if s.generation() != generation || !s.is_processing() {
                return false;
            }
            s.fail(OcrError::Cancelled);
            true
        });
        if abandoned {
            warn!(generation, "scan dropped before it finished");
        }
    }
}

// ── Watch-folder integration ──────────────────────────────────────────────────

const IMAGE_EXTENSIONS: [&str; 7] = ["jpg", "jpeg", "png", "webp", "tif", "tiff", "bmp"];

pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Spawn a notify watcher on `watch_dir` that sends newly created image paths to `tx`.
/// Returns the watcher — it must be kept alive for watching to continue.
pub fn spawn_intake_watcher(
    watch_dir: &Path,
    tx: mpsc::Sender<PathBuf>,
) -> notify::Result<impl notify::Watcher> {
    use notify::{EventKind, RecursiveMode, Watcher};

    let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        match event {
            Ok(ev) if matches!(ev.kind, EventKind::Create(_)) => {
                for path in ev.paths.into_iter().filter(|p| is_supported_image(p)) {
                    if tx.try_send(path).is_err() {
                        warn!("intake queue full or closed; dropping file event");
                    }
                }
            }
            Ok(_) => {}
            Err(e) => warn!("intake watcher error: {e}"),
        }
    })?;

    watcher.watch(watch_dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognizer::{MockRecognizer, MockResponse};
    use crate::session::ScanState;
    use image::{DynamicImage, GrayImage, ImageBuffer, Luma};
    use std::time::Duration;

    fn page() -> RawImage {
        let img: GrayImage = ImageBuffer::from_fn(8, 8, |_, y| Luma([if y % 3 == 0 { 30 } else { 220 }]));
        RawImage::new(DynamicImage::ImageLuma8(img))
    }

    fn orchestrator(mock: MockRecognizer) -> (Arc<MockRecognizer>, Arc<ScanOrchestrator<Arc<MockRecognizer>>>) {
        let mock = Arc::new(mock);
        let service = Arc::new(RecognitionService::new(Arc::clone(&mock)).unwrap());
        (mock, Arc::new(ScanOrchestrator::new(service)))
    }

    #[tokio::test]
    async fn all_pages_succeed() {
        let (mock, scans) = orchestrator(MockRecognizer::scripted([
            MockResponse::text("COSTCO WHOLESALE\nMILK 6.99"),
            MockResponse::text("SUBTOTAL 6.99\nTOTAL 6.99"),
        ]));
        let session = scans.process_batch(vec![page(), page()]).await.unwrap();

        assert_eq!(session.state(), &ScanState::Completed);
        assert_eq!(session.results().len(), 2);
        assert_eq!(session.results()[0].raw_text(), "COSTCO WHOLESALE\nMILK 6.99");
        assert_eq!(session.results()[1].raw_text(), "SUBTOTAL 6.99\nTOTAL 6.99");
        assert_eq!(session.total_lines_recognized(), 4);
        assert_eq!(mock.calls(), 2);
    }

    /// Pins today's policy: one bad page ends the whole batch.
    #[tokio::test]
    async fn first_failure_stops_the_batch() {
        let (mock, scans) = orchestrator(MockRecognizer::scripted([
            MockResponse::text("page one"),
            MockResponse::error("engine fault"),
            MockResponse::text("page three"),
        ]));
        let session = scans.process_batch(vec![page(), page(), page()]).await.unwrap();

        assert_eq!(
            session.state(),
            &ScanState::Failed(OcrError::RecognitionFailed(crate::recognizer::EngineError::Engine(
                "engine fault".into()
            )))
        );
        assert_eq!(session.results().len(), 1);
        assert_eq!(session.results()[0].raw_text(), "page one");
        assert_eq!(session.pages().len(), 3);
        assert_eq!(mock.calls(), 2);
        assert_eq!(scans.snapshot().results().len(), 1);
    }

    #[tokio::test]
    async fn blank_page_fails_with_no_text_found() {
        let (_, scans) = orchestrator(MockRecognizer::scripted([MockResponse::empty()]));
        let session = scans.process_batch(vec![page()]).await.unwrap();
        assert_eq!(session.error(), Some(&OcrError::NoTextFound));
        assert!(session.results().is_empty());
    }

    #[tokio::test]
    async fn empty_batch_leaves_session_idle() {
        let (mock, scans) = orchestrator(MockRecognizer::new("x"));
        assert_eq!(scans.process_batch(vec![]).await.unwrap_err(), ScanError::EmptyBatch);
        assert_eq!(scans.snapshot().state(), &ScanState::Idle);
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test]
    async fn second_batch_is_rejected_while_processing() {
        let (_, scans) = orchestrator(MockRecognizer::scripted([
            MockResponse::text("slow").after(Duration::from_millis(100)),
        ]));
        let running = tokio::spawn({
            let scans = Arc::clone(&scans);
            async move { scans.process_batch(vec![page()]).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(scans.snapshot().is_processing());
        assert_eq!(scans.process_batch(vec![page()]).await.unwrap_err(), ScanError::AlreadyProcessing);

        let done = running.await.unwrap().unwrap();
        assert_eq!(done.state(), &ScanState::Completed);
        assert_eq!(done.results().len(), 1);
    }

    #[tokio::test]
    async fn dropped_batch_is_cancelled_and_next_one_runs() {
        let mock = Arc::new(MockRecognizer::scripted([
            MockResponse::text("slow").after(Duration::from_millis(200)),
            MockResponse::text("next"),
        ]));
        let service = Arc::new(RecognitionService::new(Arc::clone(&mock)).unwrap());
        let scans = ScanOrchestrator::new(service).with_preprocessing(false);

        let timed_out =
            tokio::time::timeout(Duration::from_millis(20), scans.process_batch(vec![page(), page()])).await;
        assert!(timed_out.is_err());

        let abandoned = scans.snapshot();
        assert_eq!(abandoned.error(), Some(&OcrError::Cancelled));
        assert_eq!(abandoned.pages().len(), 2);
        assert!(abandoned.results().is_empty());

        let session = scans.process_batch(vec![page()]).await.unwrap();
        assert_eq!(session.state(), &ScanState::Completed);
        assert_eq!(session.results()[0].raw_text(), "next");
        assert_eq!(mock.calls(), 2);
    }

    #[tokio::test]
    async fn guard_leaves_finished_runs_alone() {
        let (_, scans) = orchestrator(MockRecognizer::new("done"));
        let session = scans.process_batch(vec![page()]).await.unwrap();
        assert_eq!(session.state(), &ScanState::Completed);
        assert_eq!(scans.snapshot().state(), &ScanState::Completed);
    }

    #[tokio::test]
    async fn new_batch_after_completion_starts_fresh() {
        let (_, scans) = orchestrator(MockRecognizer::new("line"));
        scans.process_batch(vec![page(), page()]).await.unwrap();
        let session = scans.process_batch(vec![page()]).await.unwrap();
        assert_eq!(session.results().len(), 1);
        assert_eq!(session.pages().len(), 1);
    }

    #[tokio::test]
    async fn reset_returns_to_idle_from_any_state() {
        let (_, scans) = orchestrator(MockRecognizer::scripted([
            MockResponse::text("ok"),
            MockResponse::error("boom"),
        ]));
        let assert_idle = |s: ScanSession| {
            assert_eq!(s.state(), &ScanState::Idle);
            assert!(s.pages().is_empty());
            assert!(s.results().is_empty());
        };

        scans.reset();
        assert_idle(scans.snapshot());

        scans.process_batch(vec![page()]).await.unwrap();
        scans.reset();
        assert_idle(scans.snapshot());

        let failed = scans.process_batch(vec![page()]).await.unwrap();
        assert!(failed.error().is_some());
        scans.reset();
        assert_idle(scans.snapshot());
    }

    #[tokio::test]
    async fn late_result_after_reset_is_discarded() {
        let (mock, scans) = orchestrator(MockRecognizer::scripted([
            MockResponse::text("late").after(Duration::from_millis(100)),
            MockResponse::text("never"),
        ]));
        let running = tokio::spawn({
            let scans = Arc::clone(&scans);
            async move { scans.process_batch(vec![page(), page()]).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        scans.reset();

        assert_eq!(running.await.unwrap().unwrap_err(), ScanError::Superseded);
        let session = scans.snapshot();
        assert_eq!(session.state(), &ScanState::Idle);
        assert!(session.results().is_empty());
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn subscribers_see_the_final_snapshot() {
        let (_, scans) = orchestrator(MockRecognizer::new("hello"));
        let mut rx = scans.subscribe();
        assert_eq!(rx.borrow_and_update().state(), &ScanState::Idle);

        scans.process_batch(vec![page()]).await.unwrap();
        assert!(rx.has_changed().unwrap());
        let seen = rx.borrow_and_update().clone();
        assert_eq!(seen.state(), &ScanState::Completed);
        assert_eq!(seen.results().len(), 1);
    }

    #[tokio::test]
    async fn preprocessing_can_be_disabled() {
        let mock = Arc::new(MockRecognizer::new("raw"));
        let service = Arc::new(RecognitionService::new(Arc::clone(&mock)).unwrap());
        let scans = ScanOrchestrator::new(service).with_preprocessing(false);
        let session = scans.process_batch(vec![page()]).await.unwrap();
        assert_eq!(session.results()[0].raw_text(), "raw");
    }

    #[test]
    fn only_images_are_picked_up() {
        assert!(is_supported_image(Path::new("/intake/receipt.JPG")));
        assert!(is_supported_image(Path::new("scan.png")));
        assert!(!is_supported_image(Path::new("notes.txt")));
        assert!(!is_supported_image(Path::new("no_extension")));
    }

    #[tokio::test]
    #[ignore = "relies on the host delivering filesystem notifications"]
    async fn watcher_reports_new_images() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let _watcher = spawn_intake_watcher(dir.path(), tx).unwrap();

        std::fs::write(dir.path().join("ignored.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("receipt.png"), page().encode_png().unwrap()).unwrap();

        let path = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(path.file_name().unwrap(), "receipt.png");
    }
}
