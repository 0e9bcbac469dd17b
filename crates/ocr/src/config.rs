use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::preprocess::{FilterConfig, DEFAULT_MAX_DIMENSION};
use crate::recognizer::{EngineRequest, QualityMode, DEFAULT_LANGUAGES};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Filter parameter `{field}` must be finite (got {value})")]
    NonFinite { field: &'static str, value: f32 },
    #[error("At least one recognition language is required")]
    NoLanguages,
    #[error("Recognition language '{0}' is not supported by the engine")]
    UnsupportedLanguage(String),
    #[error("max_dimension must be greater than zero")]
    ZeroMaxDimension,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    pub languages: Vec<String>,
    pub quality: QualityMode,
    pub language_correction: bool,
    /// Longest side, in pixels, of the bitmap handed to the engine.
    pub max_dimension: u32,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            languages: DEFAULT_LANGUAGES.iter().map(|l| l.to_string()).collect(),
            quality: QualityMode::Accurate,
            language_correction: true,
            max_dimension: DEFAULT_MAX_DIMENSION,
        }
    }
}

/// Everything a recognition service is built from. Loaded from `receiptscan.toml`:
///
/// ```toml
/// [filter]
/// contrast = 1.5
///
/// [recognition]
/// languages = ["en-US", "zh-Hans"]
/// quality = "accurate"
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub filter: FilterConfig,
    pub recognition: RecognitionConfig,
}

impl ScannerConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    /// Like [`ScannerConfig::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml_str(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Check the configuration against the engine's supported language hints.
    pub fn validate(&self, supported: &[String]) -> Result<(), ConfigError> {
        self.filter.validate()?;
        if self.recognition.max_dimension == 0 {
            return Err(ConfigError::ZeroMaxDimension);
        }
        if self.recognition.languages.is_empty() {
            return Err(ConfigError::NoLanguages);
        }
        if let Some(lang) = self
            .recognition
            .languages
            .iter()
            .find(|l| !supported.iter().any(|s| s.eq_ignore_ascii_case(l)))
        {
            return Err(ConfigError::UnsupportedLanguage(lang.clone()));
        }
        Ok(())
    }

    pub fn engine_request(&self) -> EngineRequest {
        EngineRequest {
            languages: self.recognition.languages.clone(),
            quality: self.recognition.quality,
            language_correction: self.recognition.language_correction,
        }
    }
}
