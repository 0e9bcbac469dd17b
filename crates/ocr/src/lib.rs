pub mod config;
pub mod hash;
pub mod pipeline;
pub mod preprocess;
pub mod recognizer;
pub mod service;
pub mod session;
pub mod tesseract;
pub mod types;

pub use config::{ConfigError, RecognitionConfig, ScannerConfig};
pub use hash::ContentHash;
pub use pipeline::{spawn_intake_watcher, ScanError, ScanOrchestrator};
pub use preprocess::{
    crop, normalize_orientation, preprocess, preprocess_with_report, Bitmap, FilterConfig,
};
pub use recognizer::{
    Completion, EngineError, EngineRequest, MockRecognizer, MockResponse, OcrEngine, QualityMode,
    UnavailableEngine,
};
pub use service::{OcrError, RecognitionService};
pub use session::{ScanSession, ScanState};
pub use types::{BoundingBox, EdgeInsets, Orientation, RawImage, RecognitionResult, RecognizedLine};

#[cfg(feature = "tesseract")]
pub use tesseract::tesseract_backend::TesseractRecognizer;
