use std::fmt;
use std::sync::Arc;

use crate::service::OcrError;
use crate::types::{RawImage, RecognitionResult};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ScanState {
    #[default]
    Idle,
    Processing,
    Completed,
    /// Carries the error of the page that stopped the batch.
    Failed(OcrError),
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanState::Idle => write!(f, "idle"),
            ScanState::Processing => write!(f, "processing"),
            ScanState::Completed => write!(f, "completed"),
            ScanState::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

/// Snapshot of one scan run: the pages handed in, the results so far and where the run stands.
///
/// `generation` changes whenever a run starts or the session is reset, so work started
/// for an older run can tell that its session is gone.
#[derive(Debug, Clone)]
pub struct ScanSession {
    generation: u64,
    pages: Arc<[RawImage]>,
    results: Vec<RecognitionResult>,
    state: ScanState,
}

impl Default for ScanSession {
    fn default() -> Self {
        Self {
            generation: 0,
            pages: Arc::from(Vec::new()),
            results: Vec::new(),
            state: ScanState::Idle,
        }
    }
}

impl ScanSession {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pages(&self) -> &[RawImage] {
        &self.pages
    }

    /// One entry per successfully recognized page, in page order.
    pub fn results(&self) -> &[RecognitionResult] {
        &self.results
    }

    pub fn state(&self) -> &ScanState {
        &self.state
    }

    pub fn is_processing(&self) -> bool {
        self.state == ScanState::Processing
    }

    pub fn error(&self) -> Option<&OcrError> {
        match &self.state {
            ScanState::Failed(e) => Some(e),
            _ => None,
        }
    }

    pub fn has_pages(&self) -> bool {
        !self.pages.is_empty()
    }

    pub fn total_lines_recognized(&self) -> usize {
        self.results.iter().map(|r| r.lines().len()).sum()
    }

    /// Recognized text of every finished page, pages separated by a blank line.
    pub fn combined_text(&self) -> String {
        self.results
            .iter()
            .map(RecognitionResult::raw_text)
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub(crate) fn begin(&mut self, pages: Arc<[RawImage]>) -> u64 {
        self.generation += 1;
        self.pages = pages;
        self.results.clear();
        self.state = ScanState::Processing;
        self.generation
    }

    pub(crate) fn push_result(&mut self, result: RecognitionResult) {
        self.results.push(result);
    }

    pub(crate) fn complete(&mut self) {
        self.state = ScanState::Completed;
    }

    pub(crate) fn fail(&mut self, error: OcrError) {
        self.state = ScanState::Failed(error);
    }

    pub(crate) fn reset(&mut self) {
        self.generation += 1;
        self.pages = Arc::from(Vec::new());
        self.results.clear();
        self.state = ScanState::Idle;
    }
}
