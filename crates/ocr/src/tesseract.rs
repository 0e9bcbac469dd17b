//! Tesseract support: language-hint mapping and TSV parsing are always compiled; the engine
//! itself needs the `tesseract` feature (system libtesseract + libleptonica).

use crate::types::{BoundingBox, RecognizedLine};

/// Language hints understood by the Tesseract backend, with their traineddata names.
pub const LANGUAGE_CODES: &[(&str, &str)] = &[
    ("en-US", "eng"),
    ("en-GB", "eng"),
    ("fr-FR", "fra"),
    ("fr-CA", "fra"),
    ("es-ES", "spa"),
    ("de-DE", "deu"),
    ("zh-Hans", "chi_sim"),
    ("zh-Hant", "chi_tra"),
    ("ja-JP", "jpn"),
    ("ko-KR", "kor"),
    ("vi-VN", "vie"),
];

pub fn tesseract_code(hint: &str) -> Option<&'static str> {
    LANGUAGE_CODES
        .iter()
        .find(|(h, _)| h.eq_ignore_ascii_case(hint))
        .map(|(_, code)| *code)
}

/// `eng+chi_sim` style language string, de-duplicated, in hint order.
/// Unknown hints are skipped; an empty result falls back to `eng`.
pub fn language_string(hints: &[String]) -> String {
    let mut codes: Vec<&str> = Vec::new();
    for code in hints.iter().filter_map(|h| tesseract_code(h)) {
        if !codes.contains(&code) {
            codes.push(code);
        }
    }
    if codes.is_empty() {
        codes.push("eng");
    }
    codes.join("+")
}

const LEVEL_LINE: u32 = 4;
const LEVEL_WORD: u32 = 5;

struct Row<'a> {
    level: u32,
    key: (u32, u32, u32, u32),
    left: u32,
    top: u32,
    width: u32,
    height: u32,
    conf: f32,
    text: &'a str,
}

fn parse_row(line: &str) -> Option<Row<'_>> {
    let cols: Vec<&str> = line.splitn(12, '\t').collect();
    if cols.len() < 11 {
        return None;
    }
    let num = |i: usize| cols[i].trim().parse::<u32>().ok();
    Some(Row {
        level: num(0)?,
        key: (num(1)?, num(2)?, num(3)?, num(4)?),
        left: num(6)?,
        top: num(7)?,
        width: num(8)?,
        height: num(9)?,
        conf: cols[10].trim().parse::<f32>().ok()?,
        text: cols.get(11).map(|t| t.trim()).unwrap_or(""),
    })
}

struct PendingLine {
    key: (u32, u32, u32, u32),
    line_box: Option<BoundingBox>,
    words: Vec<String>,
    word_box: Option<BoundingBox>,
    conf_sum: f32,
}

impl PendingLine {
    fn finish(self) -> Option<RecognizedLine> {
        if self.words.is_empty() {
            return None;
        }
        let confidence = self.conf_sum / self.words.len() as f32 / 100.0;
        let bbox = self.line_box.or(self.word_box).unwrap_or_default();
        Some(RecognizedLine::new(self.words.join(" "), confidence, bbox))
    }
}

/// Collapse Tesseract's word-level TSV output into text lines, in reading order.
/// Line confidence is the mean of its word confidences.
pub fn parse_tsv(tsv: &str, page: (u32, u32)) -> Vec<RecognizedLine> {
    let mut lines = Vec::new();
    let mut current: Option<PendingLine> = None;

    for row in tsv.lines().filter_map(parse_row) {
        if row.level != LEVEL_LINE && row.level != LEVEL_WORD {
            continue;
        }
        let rect = BoundingBox::from_pixels(row.left, row.top, row.width, row.height, page);

        if current.as_ref().map(|c| c.key) != Some(row.key) {
            if let Some(done) = current.take().and_then(PendingLine::finish) {
                lines.push(done);
            }
            current = Some(PendingLine {
                key: row.key,
                line_box: None,
                words: Vec::new(),
                word_box: None,
                conf_sum: 0.0,
            });
        }
        let Some(line) = current.as_mut() else { continue };

        if row.level == LEVEL_LINE {
            line.line_box = Some(rect);
        } else if !row.text.is_empty() && row.conf >= 0.0 {
            line.words.push(row.text.to_string());
            line.conf_sum += row.conf;
            line.word_box = Some(match line.word_box {
                Some(b) => b.union(&rect),
                None => rect,
            });
        }
    }

    if let Some(done) = current.and_then(PendingLine::finish) {
        lines.push(done);
    }
    lines
}

#[cfg(feature = "tesseract")]
pub mod tesseract_backend {
    use super::{language_string, parse_tsv, LANGUAGE_CODES};
    use crate::preprocess::Bitmap;
    use crate::recognizer::{Completion, EngineError, EngineRequest, OcrEngine, QualityMode};
    use leptess::LepTess;

    pub struct TesseractRecognizer {
        data_path: Option<String>,
    }

    impl TesseractRecognizer {
        pub fn new(data_path: Option<String>) -> Self {
            Self { data_path }
        }
    }

    impl OcrEngine for TesseractRecognizer {
        fn recognize(&self, bitmap: Bitmap, request: &EngineRequest, completion: Completion) {
            let data_path = self.data_path.clone();
            let lang = language_string(&request.languages);
            let dpi = match request.quality {
                QualityMode::Accurate => 300,
                QualityMode::Fast => 150,
            };

            completion.resolve_blocking(move || {
                let png = bitmap
                    .encode_png()
                    .map_err(|e| EngineError::Engine(e.to_string()))?;
                let mut lt = LepTess::new(data_path.as_deref(), &lang)
                    .map_err(|e| EngineError::Unavailable(e.to_string()))?;
                lt.set_image_from_mem(&png)
                    .map_err(|e| EngineError::Engine(e.to_string()))?;
                lt.set_source_resolution(dpi);
                let tsv = lt
                    .get_tsv_text(0)
                    .map_err(|e| EngineError::Engine(e.to_string()))?;
                Ok(parse_tsv(&tsv, (bitmap.width(), bitmap.height())))
            });
        }

        fn supported_languages(&self) -> Vec<String> {
            LANGUAGE_CODES.iter().map(|(hint, _)| hint.to_string()).collect()
        }
    }
}
