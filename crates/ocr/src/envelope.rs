use serde::{Deserialize, Serialize};

use crate::preprocess::NormalizationReport;
use crate::recognizer::RecognitionConfig;
use crate::types::{DocumentResult, PageResult, StructuredFields, TextObservation};

/// Diagnostics attached to successful envelopes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
    /// Single images only; document pages carry their own.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalization: Option<NormalizationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<RecognitionConfig>,
    pub languages: Vec<String>,
    pub target_dpi: u32,
    pub processing_ms: u64,
}

/// The one shape every public entry point returns.
///
/// `text`, `confidence`, `lines` and `line_count` are always present, so a
/// failed envelope reads as empty rather than missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub success: bool,
    pub text: String,
    pub confidence: f32,
    pub lines: Vec<TextObservation>,
    pub line_count: usize,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured: Option<StructuredFields>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pages: Option<Vec<PageResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EnvelopeMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Four decimal places, as reported to callers.
fn round_confidence(value: f32) -> f32 {
    ((value as f64 * 10_000.0).round() / 10_000.0) as f32
}

impl ResultEnvelope {
    /// Single-image success.
    pub fn from_observations(
        provider: impl Into<String>,
        lines: Vec<TextObservation>,
        text: String,
        confidence: f32,
        structured: StructuredFields,
        metadata: EnvelopeMetadata,
    ) -> Self {
        Self {
            success: true,
            text,
            confidence: round_confidence(confidence),
            line_count: lines.len(),
            lines,
            provider: provider.into(),
            structured: Some(structured),
            pages: None,
            page_count: None,
            metadata: Some(metadata),
            error: None,
        }
    }

    /// Multi-page success. `lines` are every page's observations in page order.
    pub fn from_document(
        provider: impl Into<String>,
        document: DocumentResult,
        structured: StructuredFields,
        metadata: EnvelopeMetadata,
    ) -> Self {
        let lines: Vec<TextObservation> = document
            .pages
            .iter()
            .flat_map(|p| p.lines.iter().cloned())
            .collect();
        Self {
            success: true,
            text: document.text,
            confidence: round_confidence(document.confidence),
            line_count: lines.len(),
            lines,
            provider: provider.into(),
            structured: Some(structured),
            page_count: Some(document.pages.len()),
            pages: Some(document.pages),
            metadata: Some(metadata),
            error: None,
        }
    }

    pub fn failure(provider: impl Into<String>, error: impl ToString) -> Self {
        Self {
            success: false,
            text: String::new(),
            confidence: 0.0,
            lines: Vec::new(),
            line_count: 0,
            provider: provider.into(),
            structured: None,
            pages: None,
            page_count: None,
            metadata: None,
            error: Some(error.to_string()),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
