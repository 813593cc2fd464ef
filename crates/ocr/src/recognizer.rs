use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

use crate::types::{clamp_confidence, BoundingRegion, TextObservation};

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("OCR engine error: {0}")]
    Engine(String),
    #[error("Failed to hand image to engine: {0}")]
    ImageEncode(String),
    #[error("Tesseract not available: build with the `tesseract` feature")]
    NotAvailable,
    #[error("OCR backend already initialized")]
    AlreadyInitialized,
}

/// Per-call recognition settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecognitionConfig {
    pub languages: Vec<String>,
    /// Tesseract-style page segmentation mode; `None` leaves the engine default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_segmentation: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dpi: Option<u32>,
    pub use_gpu: bool,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self { languages: vec!["eng".to_string()], page_segmentation: None, dpi: None, use_gpu: false }
    }
}

impl RecognitionConfig {
    pub fn with_page_segmentation(mut self, psm: u8) -> Self {
        self.page_segmentation = Some(psm);
        self
    }

    /// Languages in Tesseract's `eng+fra` form.
    pub fn language_spec(&self) -> String {
        self.languages.join("+")
    }
}

impl fmt::Display for RecognitionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.page_segmentation {
            Some(psm) => write!(f, "psm {psm}"),
            None => write!(f, "auto"),
        }
    }
}

/// Abstraction over an OCR backend.
/// Implementations take a decoded image and return observations in the
/// engine's own reading order.
pub trait OcrBackend: Send + Sync {
    fn name(&self) -> &str;

    fn recognize(&self, image: &DynamicImage, config: &RecognitionConfig) -> Result<Vec<TextObservation>, OcrError>;
}

// ── Native output normalization ───────────────────────────────────────────────

/// A pre-grouped line as reported by line-level engines (confidence 0–1).
#[derive(Debug, Clone, PartialEq)]
pub struct RawLine {
    pub text: String,
    pub confidence: f32,
    pub region: Option<BoundingRegion>,
}

impl RawLine {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self { text: text.into(), confidence, region: None }
    }
}

/// Position of a word's line within the page layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LineKey {
    pub block: u32,
    pub paragraph: u32,
    pub line: u32,
}

impl LineKey {
    /// Key for engines that only number lines.
    pub fn line(line: u32) -> Self {
        Self { block: 0, paragraph: 0, line }
    }
}

/// A single word as reported by word-level engines (confidence 0–100).
#[derive(Debug, Clone, PartialEq)]
pub struct RawWord {
    pub text: String,
    pub confidence: f32,
    pub line: LineKey,
    pub region: Option<BoundingRegion>,
}

impl RawWord {
    pub fn new(text: impl Into<String>, confidence: f32, line: LineKey) -> Self {
        Self { text: text.into(), confidence, line, region: None }
    }
}

/// Trim, drop blank lines, clamp confidence. Order is kept.
pub fn normalize_lines(lines: Vec<RawLine>) -> Vec<TextObservation> {
    lines
        .into_iter()
        .filter_map(|l| {
            let text = l.text.trim();
            if text.is_empty() {
                return None;
            }
            Some(TextObservation::new(text, l.confidence, l.region))
        })
        .collect()
}

/// Merge consecutive words that share a line key into one observation.
///
/// Every word, kept or not, advances the current line key. Words with
/// non-positive confidence or blank text are then skipped, so a dropped word
/// from another line still closes the open group.
pub fn group_words(words: Vec<RawWord>) -> Vec<TextObservation> {
    struct Group {
        words: Vec<String>,
        confidences: Vec<f32>,
        region: Option<BoundingRegion>,
    }

    let mut groups: Vec<Group> = Vec::new();
    let mut current: Option<LineKey> = None;
    let mut open = false;
    for word in words {
        if current != Some(word.line) {
            current = Some(word.line);
            open = false;
        }
        let text = word.text.trim();
        if word.confidence <= 0.0 || word.confidence.is_nan() || text.is_empty() {
            continue;
        }
        let confidence = word.confidence / 100.0;
        match groups.last_mut() {
            Some(g) if open => {
                g.words.push(text.to_string());
                g.confidences.push(confidence);
                g.region = union_region(g.region, word.region);
            }
            _ => {
                groups.push(Group {
                    words: vec![text.to_string()],
                    confidences: vec![confidence],
                    region: word.region,
                });
                open = true;
            }
        }
    }

    groups
        .into_iter()
        .map(|g| {
            let confidence = crate::types::mean(g.confidences.into_iter());
            TextObservation::new(g.words.join(" "), confidence, g.region)
        })
        .collect()
}

fn union_region(a: Option<BoundingRegion>, b: Option<BoundingRegion>) -> Option<BoundingRegion> {
    match (a, b) {
        (
            Some(BoundingRegion::Rect { left: l1, top: t1, width: w1, height: h1 }),
            Some(BoundingRegion::Rect { left: l2, top: t2, width: w2, height: h2 }),
        ) => {
            let left = l1.min(l2);
            let top = t1.min(t2);
            let right = (l1 + w1 as i32).max(l2 + w2 as i32);
            let bottom = (t1 + h1 as i32).max(t2 + h2 as i32);
            Some(BoundingRegion::Rect {
                left,
                top,
                width: (right - left) as u32,
                height: (bottom - top) as u32,
            })
        }
        (Some(a), _) => Some(a),
        (None, b) => b,
    }
}

// ── Mock backend (always available, used for tests) ───────────────────────────

/// Scripted native output for a [`MockRecognizer`].
#[derive(Debug, Clone)]
pub enum MockOutput {
    Lines(Vec<RawLine>),
    Words(Vec<RawWord>),
    Fail(String),
}

impl MockOutput {
    fn render(&self) -> Result<Vec<TextObservation>, OcrError> {
        match self {
            MockOutput::Lines(lines) => Ok(normalize_lines(lines.clone())),
            MockOutput::Words(words) => Ok(group_words(words.clone())),
            MockOutput::Fail(msg) => Err(OcrError::Engine(msg.clone())),
        }
    }
}

/// Returns pre-set observations, so the pipeline can be exercised without
/// Tesseract installed.
pub struct MockRecognizer {
    name: String,
    output: MockOutput,
    by_mode: Vec<(u8, MockOutput)>,
    fail_on_calls: Vec<usize>,
    calls: AtomicUsize,
}

pub const MOCK_LINE_CONFIDENCE: f32 = 0.9;

impl MockRecognizer {
    /// One observation per line of `text`, each at [`MOCK_LINE_CONFIDENCE`].
    pub fn new(text: impl Into<String>) -> Self {
        let lines = text
            .into()
            .lines()
            .map(|l| RawLine::new(l, MOCK_LINE_CONFIDENCE))
            .collect();
        Self::with_output(MockOutput::Lines(lines))
    }

    pub fn from_lines(lines: Vec<RawLine>) -> Self {
        Self::with_output(MockOutput::Lines(lines))
    }

    pub fn from_words(words: Vec<RawWord>) -> Self {
        Self::with_output(MockOutput::Words(words))
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_output(MockOutput::Fail(message.into()))
    }

    pub fn with_output(output: MockOutput) -> Self {
        Self {
            name: "mock".to_string(),
            output,
            by_mode: Vec::new(),
            fail_on_calls: Vec::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Output used when the config asks for page segmentation mode `psm`.
    pub fn on_mode(mut self, psm: u8, output: MockOutput) -> Self {
        self.by_mode.push((psm, output));
        self
    }

    /// Make the `call`-th invocation (0-based) fail.
    pub fn fail_on_call(mut self, call: usize) -> Self {
        self.fail_on_calls.push(call);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl OcrBackend for MockRecognizer {
    fn name(&self) -> &str {
        &self.name
    }

    fn recognize(&self, _image: &DynamicImage, config: &RecognitionConfig) -> Result<Vec<TextObservation>, OcrError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on_calls.contains(&call) {
            return Err(OcrError::Engine(format!("scripted failure on call {call}")));
        }
        let output = config
            .page_segmentation
            .and_then(|psm| self.by_mode.iter().find(|(m, _)| *m == psm))
            .map(|(_, out)| out)
            .unwrap_or(&self.output);
        output.render()
    }
}

// ── Tesseract TSV parsing ─────────────────────────────────────────────────────

/// Parse Tesseract TSV output into raw words.
/// Columns: level page block par line word left top width height conf text.
/// Only level 5 (word) rows are kept.
pub fn parse_tsv_words(tsv: &str) -> Vec<RawWord> {
    let mut words = Vec::new();
    for row in tsv.lines() {
        let fields: Vec<&str> = row.split('\t').collect();
        if fields.len() < 12 || fields[0].trim() != "5" {
            continue;
        }
        let (Ok(block), Ok(paragraph), Ok(line)) =
            (fields[2].parse(), fields[3].parse(), fields[4].parse())
        else {
            continue;
        };
        let Ok(confidence) = fields[10].trim().parse::<f32>() else {
            continue;
        };
        let region = match (fields[6].parse(), fields[7].parse(), fields[8].parse(), fields[9].parse()) {
            (Ok(left), Ok(top), Ok(width), Ok(height)) => Some(BoundingRegion::Rect { left, top, width, height }),
            _ => None,
        };
        words.push(RawWord {
            text: fields[11].to_string(),
            confidence,
            line: LineKey { block, paragraph, line },
            region,
        });
    }
    words
}

// ── Tesseract backend (optional, gated behind `tesseract` feature) ─────────────

#[cfg(feature = "tesseract")]
pub mod tesseract_backend {
    use super::{group_words, parse_tsv_words, OcrBackend, OcrError, RecognitionConfig};
    use crate::preprocess::encode_png;
    use crate::types::TextObservation;
    use image::DynamicImage;
    use leptess::{LepTess, Variable};

    pub struct TesseractRecognizer {
        data_path: Option<String>,
    }

    impl TesseractRecognizer {
        pub fn new(data_path: Option<String>) -> Self {
            Self { data_path }
        }
    }

    impl OcrBackend for TesseractRecognizer {
        fn name(&self) -> &str {
            "tesseract"
        }

        fn recognize(&self, image: &DynamicImage, config: &RecognitionConfig) -> Result<Vec<TextObservation>, OcrError> {
            let png = encode_png(image).map_err(|e| OcrError::ImageEncode(e.to_string()))?;

            let mut lt = LepTess::new(self.data_path.as_deref(), &config.language_spec())
                .map_err(|e| OcrError::Engine(e.to_string()))?;
            if let Some(psm) = config.page_segmentation {
                lt.set_variable(Variable::TesseditPagesegMode, &psm.to_string())
                    .map_err(|e| OcrError::Engine(e.to_string()))?;
            }
            lt.set_variable(Variable::PreserveInterwordSpaces, "1")
                .map_err(|e| OcrError::Engine(e.to_string()))?;
            lt.set_image_from_mem(&png)
                .map_err(|e| OcrError::ImageEncode(e.to_string()))?;
            if let Some(dpi) = config.dpi {
                lt.set_source_resolution(dpi as i32);
            }

            let tsv = lt.get_tsv_text(0).map_err(|e| OcrError::Engine(e.to_string()))?;
            Ok(group_words(parse_tsv_words(&tsv)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;

    fn blank() -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::new(4, 4))
    }

    fn rect(left: i32, top: i32, width: u32, height: u32) -> Option<BoundingRegion> {
        Some(BoundingRegion::Rect { left, top, width, height })
    }

    #[test]
    fn mock_returns_preset_lines() {
        let r = MockRecognizer::new("STARBUCKS\n$5.50\nVISA");
        let obs = r.recognize(&blank(), &RecognitionConfig::default()).unwrap();
        let texts: Vec<_> = obs.iter().map(|o| o.text.as_str()).collect();
        assert_eq!(texts, ["STARBUCKS", "$5.50", "VISA"]);
        assert!(obs.iter().all(|o| o.confidence == MOCK_LINE_CONFIDENCE));
    }

    #[test]
    fn mock_follows_mode_script() {
        let r = MockRecognizer::new("default")
            .on_mode(4, MockOutput::Lines(vec![RawLine::new("psm four", 0.4)]));
        let cfg = RecognitionConfig::default().with_page_segmentation(4);
        assert_eq!(r.recognize(&blank(), &cfg).unwrap()[0].text, "psm four");
        let cfg = RecognitionConfig::default().with_page_segmentation(6);
        assert_eq!(r.recognize(&blank(), &cfg).unwrap()[0].text, "default");
        assert_eq!(r.calls(), 2);
    }

    #[test]
    fn mock_fails_on_scripted_call() {
        let r = MockRecognizer::new("x").fail_on_call(1);
        let cfg = RecognitionConfig::default();
        assert!(r.recognize(&blank(), &cfg).is_ok());
        assert!(matches!(r.recognize(&blank(), &cfg), Err(OcrError::Engine(_))));
        assert!(r.recognize(&blank(), &cfg).is_ok());
    }

    #[test]
    fn lines_are_trimmed_and_blank_dropped() {
        let obs = normalize_lines(vec![
            RawLine::new("  TOTAL 4.00 ", 0.7),
            RawLine::new("   ", 0.99),
            RawLine::new("tail", 1.3),
        ]);
        assert_eq!(obs.len(), 2);
        assert_eq!(obs[0].text, "TOTAL 4.00");
        assert_eq!(obs[1].confidence, 1.0);
    }

    #[test]
    fn words_group_by_consecutive_line_key() {
        let words = vec![
            RawWord::new("ACME", 90.0, LineKey::line(1)),
            RawWord::new("MARKET", 80.0, LineKey::line(1)),
            RawWord::new("noise", -1.0, LineKey::line(1)),
            RawWord::new("TOTAL", 70.0, LineKey::line(2)),
            RawWord::new("AGAIN", 50.0, LineKey::line(1)),
        ];
        let obs = group_words(words);
        let texts: Vec<_> = obs.iter().map(|o| o.text.as_str()).collect();
        assert_eq!(texts, ["ACME MARKET", "TOTAL", "AGAIN"]);
        assert!((obs[0].confidence - 0.85).abs() < 1e-6);
        assert!((obs[2].confidence - 0.5).abs() < 1e-6);
    }

    #[test]
    fn dropped_word_on_other_line_splits_group() {
        let obs = group_words(vec![
            RawWord::new("A", 90.0, LineKey::line(1)),
            RawWord::new("noise", 0.0, LineKey::line(2)),
            RawWord::new("B", 90.0, LineKey::line(1)),
        ]);
        let texts: Vec<_> = obs.iter().map(|o| o.text.as_str()).collect();
        assert_eq!(texts, ["A", "B"]);
    }

    #[test]
    fn zero_confidence_and_blank_words_are_dropped() {
        let obs = group_words(vec![
            RawWord::new("ghost", 0.0, LineKey::line(1)),
            RawWord::new("  ", 95.0, LineKey::line(1)),
        ]);
        assert!(obs.is_empty());
    }

    #[test]
    fn grouped_words_stay_within_unit_interval() {
        let obs = group_words(vec![RawWord::new("over", 250.0, LineKey::line(0))]);
        assert_eq!(obs[0].confidence, 1.0);
    }

    #[test]
    fn grouped_regions_are_unioned() {
        let mut a = RawWord::new("A", 90.0, LineKey::line(1));
        a.region = rect(10, 5, 20, 10);
        let mut b = RawWord::new("B", 90.0, LineKey::line(1));
        b.region = rect(40, 3, 10, 10);
        let obs = group_words(vec![a, b]);
        assert_eq!(obs[0].region, rect(10, 3, 40, 12));
    }

    #[test]
    fn tsv_rows_become_words() {
        let tsv = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext\n\
                   1\t1\t0\t0\t0\t0\t0\t0\t640\t480\t-1\t\n\
                   5\t1\t1\t1\t1\t1\t10\t12\t50\t20\t96.5\tACME\n\
                   5\t1\t1\t1\t1\t2\t70\t12\t80\t20\t91\tMARKET\n\
                   5\t1\t2\t1\t1\t1\t10\t60\t40\t20\t88\tTOTAL\n";
        let words = parse_tsv_words(tsv);
        assert_eq!(words.len(), 3);
        assert_eq!(words[2].line, LineKey { block: 2, paragraph: 1, line: 1 });

        let obs = group_words(words);
        assert_eq!(obs.len(), 2);
        assert_eq!(obs[0].text, "ACME MARKET");
        assert_eq!(obs[0].region, rect(10, 12, 140, 20));
    }

    #[test]
    fn config_display_and_language_spec() {
        let cfg = RecognitionConfig {
            languages: vec!["eng".into(), "fra".into()],
            ..RecognitionConfig::default()
        }
        .with_page_segmentation(6);
        assert_eq!(cfg.to_string(), "psm 6");
        assert_eq!(cfg.language_spec(), "eng+fra");
        assert_eq!(RecognitionConfig::default().to_string(), "auto");
    }
}
