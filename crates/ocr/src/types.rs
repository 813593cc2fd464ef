use serde::{Deserialize, Serialize};
use tally_core::{ExpenseCategory, Money};

use crate::preprocess::NormalizationReport;
use crate::recognizer::RecognitionConfig;

/// Where on the page an observation was found.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundingRegion {
    Rect {
        left: i32,
        top: i32,
        width: u32,
        height: u32,
    },
    /// Four corner points, clockwise from top-left.
    Quad([[f32; 2]; 4]),
}

/// One unit of recognized text (a line or a word, depending on the backend).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextObservation {
    pub text: String,
    /// Always within 0.0–1.0.
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<BoundingRegion>,
}

impl TextObservation {
    pub fn new(text: impl Into<String>, confidence: f32, region: Option<BoundingRegion>) -> Self {
        Self { text: text.into(), confidence: clamp_confidence(confidence), region }
    }
}

/// Clamp into [0, 1]; NaN collapses to 0.
pub fn clamp_confidence(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Unweighted mean of observation confidences, 0.0 when empty.
pub fn mean_confidence(observations: &[TextObservation]) -> f32 {
    mean(observations.iter().map(|o| o.confidence))
}

pub(crate) fn mean(values: impl Iterator<Item = f32>) -> f32 {
    let (sum, count) = values.fold((0.0f64, 0usize), |(s, n), v| (s + v as f64, n + 1));
    if count == 0 {
        0.0
    } else {
        clamp_confidence((sum / count as f64) as f32)
    }
}

/// Recognition outcome for a single page, in backend reading order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResult {
    /// 1-indexed.
    pub page: usize,
    pub text: String,
    pub confidence: f32,
    pub lines: Vec<TextObservation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalization: Option<NormalizationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<RecognitionConfig>,
}

impl PageResult {
    pub fn from_observations(page: usize, lines: Vec<TextObservation>) -> Self {
        let text = join_lines(&lines);
        let confidence = mean_confidence(&lines);
        Self { page, text, confidence, lines, error: None, normalization: None, config: None }
    }

    /// Placeholder for a page whose recognition raised.
    pub fn failed(page: usize, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::from_observations(page, Vec::new())
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

pub fn join_lines(lines: &[TextObservation]) -> String {
    lines.iter().map(|o| o.text.as_str()).collect::<Vec<_>>().join("\n")
}

/// Merged result of a multi-page document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentResult {
    pub pages: Vec<PageResult>,
    pub text: String,
    pub confidence: f32,
}

impl DocumentResult {
    /// Pages must already be in input order. Empty pages are left out of both
    /// the merged text and the confidence mean.
    pub fn from_pages(pages: Vec<PageResult>) -> Self {
        let text = pages
            .iter()
            .filter(|p| !p.is_empty())
            .flat_map(|p| [format!("--- Page {} ---", p.page), p.text.clone()])
            .collect::<Vec<_>>()
            .join("\n\n");
        let confidence = mean(pages.iter().filter(|p| !p.is_empty()).map(|p| p.confidence));
        Self { pages, text, confidence }
    }

    /// Page texts in order without the page headers, for field extraction.
    pub fn content_text(&self) -> String {
        self.pages
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn failed_pages(&self) -> impl Iterator<Item = &PageResult> {
        self.pages.iter().filter(|p| p.error.is_some())
    }
}

/// Best-effort semantic fields recovered from receipt text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredFields {
    pub merchant: Option<String>,
    pub total: Option<Money>,
    /// Matched substring, verbatim.
    pub date: Option<String>,
    pub category: Option<ExpenseCategory>,
    /// No rule populates this yet.
    pub location: Option<String>,
}

impl StructuredFields {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}
