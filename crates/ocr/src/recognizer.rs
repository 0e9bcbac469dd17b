use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::preprocess::Bitmap;
use crate::types::{BoundingBox, RecognizedLine};

/// Language hints used when none are configured: one Latin-script, one CJK-script.
pub const DEFAULT_LANGUAGES: [&str; 2] = ["en-US", "zh-Hans"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("{0}")]
    Engine(String),
    #[error("recognition engine not available: {0}")]
    Unavailable(String),
    #[error("recognition engine dropped the request without answering")]
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityMode {
    Fast,
    /// Slower, but what crumpled thermal paper needs.
    #[default]
    Accurate,
}

/// Fixed per-service recognition settings passed with every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineRequest {
    pub languages: Vec<String>,
    pub quality: QualityMode,
    pub language_correction: bool,
}

impl Default for EngineRequest {
    fn default() -> Self {
        Self {
            languages: DEFAULT_LANGUAGES.iter().map(|l| l.to_string()).collect(),
            quality: QualityMode::Accurate,
            language_correction: true,
        }
    }
}

pub type EngineOutcome = Result<Vec<RecognizedLine>, EngineError>;

/// The callback handed to an engine for one request. `resolve` consumes it, so a request
/// can be answered at most once; dropping it unanswered surfaces as [`EngineError::Dropped`].
#[derive(Debug)]
pub struct Completion {
    tx: oneshot::Sender<EngineOutcome>,
}

impl Completion {
    pub(crate) fn channel() -> (Completion, PendingRecognition) {
        let (tx, rx) = oneshot::channel();
        (Completion { tx }, PendingRecognition { rx })
    }

    pub fn resolve(self, outcome: EngineOutcome) {
        // The caller may have gone away; nothing is waiting for the answer then.
        let _ = self.tx.send(outcome);
    }

    /// Run a blocking recognizer on the blocking pool and resolve with its outcome.
    /// Outside a tokio runtime it runs inline.
    pub fn resolve_blocking<F>(self, work: F)
    where
        F: FnOnce() -> EngineOutcome + Send + 'static,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || self.resolve(work()));
            }
            Err(_) => self.resolve(work()),
        }
    }
}

/// The awaitable side of a [`Completion`].
#[derive(Debug)]
pub struct PendingRecognition {
    rx: oneshot::Receiver<EngineOutcome>,
}

impl PendingRecognition {
    pub async fn wait(self) -> EngineOutcome {
        self.rx.await.unwrap_or(Err(EngineError::Dropped))
    }
}

/// Abstraction over a text-recognition engine.
///
/// Engines are callback-driven: `recognize` starts work and returns; the result arrives
/// through `completion`. Engines must report every line they find, and must answer with an
/// error rather than an empty success when the input cannot be processed at all.
pub trait OcrEngine: Send + Sync {
    fn recognize(&self, bitmap: Bitmap, request: &EngineRequest, completion: Completion);

    /// Language hints this engine accepts.
    fn supported_languages(&self) -> Vec<String> {
        DEFAULT_LANGUAGES.iter().map(|l| l.to_string()).collect()
    }
}

impl<E: OcrEngine + ?Sized> OcrEngine for Arc<E> {
    fn recognize(&self, bitmap: Bitmap, request: &EngineRequest, completion: Completion) {
        (**self).recognize(bitmap, request, completion)
    }

    fn supported_languages(&self) -> Vec<String> {
        (**self).supported_languages()
    }
}

impl<E: OcrEngine + ?Sized> OcrEngine for Box<E> {
    fn recognize(&self, bitmap: Bitmap, request: &EngineRequest, completion: Completion) {
        (**self).recognize(bitmap, request, completion)
    }

    fn supported_languages(&self) -> Vec<String> {
        (**self).supported_languages()
    }
}

// ── Unavailable backend (builds without a native engine) ──────────────────────

/// Fails every request. Used when no native engine was compiled in.
#[derive(Debug, Clone)]
pub struct UnavailableEngine {
    reason: String,
}

impl UnavailableEngine {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

impl OcrEngine for UnavailableEngine {
    fn recognize(&self, _bitmap: Bitmap, _request: &EngineRequest, completion: Completion) {
        completion.resolve(Err(EngineError::Unavailable(self.reason.clone())));
    }
}

// ── Mock backend (always available, used for tests) ───────────────────────────

/// One scripted answer of [`MockRecognizer`].
#[derive(Debug, Clone)]
pub struct MockResponse {
    outcome: EngineOutcome,
    delay: Duration,
}

impl MockResponse {
    /// Lines stacked top to bottom, each spanning the page width.
    pub fn lines<S: AsRef<str>>(texts: &[S]) -> Self {
        let n = texts.len().max(1) as f32;
        let lines = texts
            .iter()
            .enumerate()
            .map(|(i, t)| {
                RecognizedLine::new(t.as_ref(), 0.9, BoundingBox::new(0.0, i as f32 / n, 1.0, 1.0 / n))
            })
            .collect();
        Self { outcome: Ok(lines), delay: Duration::ZERO }
    }

    /// One line per `\n`-separated row; blank rows are skipped.
    pub fn text(text: &str) -> Self {
        let rows: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        Self::lines(&rows)
    }

    /// The engine ran but saw nothing.
    pub fn empty() -> Self {
        Self { outcome: Ok(Vec::new()), delay: Duration::ZERO }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { outcome: Err(EngineError::Engine(message.into())), delay: Duration::ZERO }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Answers from a script, falling back to a fixed response once the script runs out.
/// Useful for exercising the service and scan workflow without a native engine.
#[derive(Debug)]
pub struct MockRecognizer {
    script: Mutex<VecDeque<MockResponse>>,
    fallback: MockResponse,
    languages: Vec<String>,
    calls: AtomicUsize,
}

impl MockRecognizer {
    /// Always answers with `text`, one line per row.
    pub fn new(text: impl Into<String>) -> Self {
        Self::with_fallback(MockResponse::text(&text.into()))
    }

    pub fn with_fallback(fallback: MockResponse) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            languages: DEFAULT_LANGUAGES.iter().map(|l| l.to_string()).collect(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Answers in order; after the script runs out every call gets an empty answer.
    pub fn scripted(responses: impl IntoIterator<Item = MockResponse>) -> Self {
        let mock = Self::with_fallback(MockResponse::empty());
        mock.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(responses);
        mock
    }

    pub fn with_languages<S: Into<String>>(mut self, languages: impl IntoIterator<Item = S>) -> Self {
        self.languages = languages.into_iter().map(Into::into).collect();
        self
    }

    /// Number of `recognize` invocations so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_response(&self) -> MockResponse {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

impl OcrEngine for MockRecognizer {
    fn recognize(&self, _bitmap: Bitmap, _request: &EngineRequest, completion: Completion) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let MockResponse { outcome, delay } = self.next_response();
        if delay.is_zero() {
            completion.resolve(outcome);
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    completion.resolve(outcome);
                });
            }
            Err(_) => {
                std::thread::sleep(delay);
                completion.resolve(outcome);
            }
        }
    }

    fn supported_languages(&self) -> Vec<String> {
        self.languages.clone()
    }
}
