use image::DynamicImage;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::document::{DocumentError, DocumentRasterizer, PageAggregator};
use crate::envelope::{EnvelopeMetadata, ResultEnvelope};
use crate::extract::Extractor;
use crate::mode::{BestRun, RecognitionMode};
use crate::preprocess::{self, NormalizationReport, PreprocessError};
use crate::recognizer::{OcrBackend, OcrError, RecognitionConfig};
use crate::types::join_lines;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Image preprocessing failed: {0}")]
    Preprocess(#[from] PreprocessError),
    #[error("OCR recognition failed: {0}")]
    Ocr(#[from] OcrError),
    #[error("Document processing failed: {0}")]
    Document(#[from] DocumentError),
}

/// Orchestrates: decode → normalize → recognize (→ fallback) → extract → envelope.
///
/// Every entry point returns a [`ResultEnvelope`]; errors end up in its
/// `error` field.
pub struct ReceiptPipeline {
    primary: Arc<dyn OcrBackend>,
    fallback: Option<Arc<dyn OcrBackend>>,
    config: PipelineConfig,
}

impl ReceiptPipeline {
    pub fn new(backend: Arc<dyn OcrBackend>, config: PipelineConfig) -> Self {
        Self { primary: backend, fallback: None, config }
    }

    /// Second backend tried when the primary's confidence is below
    /// `fallback_threshold`. Single images only.
    pub fn with_fallback(mut self, backend: Arc<dyn OcrBackend>) -> Self {
        self.fallback = Some(backend);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    // ── Single image ──────────────────────────────────────────────────────────

    /// Process an already-decoded image.
    pub fn process_image(&self, image: DynamicImage) -> ResultEnvelope {
        let started = Instant::now();
        self.run_image(image, started).unwrap_or_else(|e| self.fail(e))
    }

    /// Process raw bytes (JPEG / PNG / WEBP / …).
    pub fn process_image_bytes(&self, data: &[u8]) -> ResultEnvelope {
        let started = Instant::now();
        preprocess::decode_image(data)
            .map_err(PipelineError::from)
            .and_then(|image| self.run_image(image, started))
            .unwrap_or_else(|e| self.fail(e))
    }

    /// Process an image file on disk.
    pub async fn process_file(&self, path: &Path) -> ResultEnvelope {
        let started = Instant::now();
        let source = path.display().to_string();
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return self.fail(PreprocessError::Load { path: source, reason: e.to_string() }.into());
            }
        };
        preprocess::decode_image_from(&bytes, &source)
            .map_err(PipelineError::from)
            .and_then(|image| self.run_image(image, started))
            .unwrap_or_else(|e| self.fail(e))
    }

    fn run_image(&self, image: DynamicImage, started: Instant) -> Result<ResultEnvelope, PipelineError> {
        let options = self.config.normalize_options();
        let (normalized, report) = preprocess::normalize(image, &options);

        let mode = self.config.recognition_mode();
        let (provider, run) = self.recognize_with_fallback(&normalized, &mode)?;

        let text = join_lines(&run.observations);
        let structured = Extractor::extract(&text);
        let metadata = self.metadata(Some(report), Some(run.config.clone()), started);
        info!(
            provider = %provider,
            lines = run.observations.len(),
            confidence = run.confidence,
            elapsed_ms = metadata.processing_ms,
            "receipt image processed"
        );
        Ok(ResultEnvelope::from_observations(
            provider,
            run.observations,
            text,
            run.confidence,
            structured,
            metadata,
        ))
    }

    /// Run the primary; consult the fallback only below the threshold and keep
    /// its result only if strictly more confident.
    fn recognize_with_fallback(
        &self,
        image: &DynamicImage,
        mode: &RecognitionMode,
    ) -> Result<(String, BestRun), PipelineError> {
        let primary = mode.run(image, self.primary.as_ref())?;
        let primary_name = self.primary.name().to_string();

        let Some(fallback) = &self.fallback else {
            return Ok((primary_name, primary));
        };
        if primary.confidence >= self.config.fallback_threshold {
            return Ok((primary_name, primary));
        }

        warn!(
            primary = %primary_name,
            fallback = fallback.name(),
            confidence = primary.confidence,
            threshold = self.config.fallback_threshold,
            "primary confidence below threshold, trying fallback"
        );
        match mode.run(image, fallback.as_ref()) {
            Ok(run) if run.confidence > primary.confidence => Ok((fallback.name().to_string(), run)),
            Ok(_) => Ok((primary_name, primary)),
            Err(e) => {
                warn!(fallback = fallback.name(), error = %e, "fallback backend failed");
                Ok((primary_name, primary))
            }
        }
    }

    // ── Documents ─────────────────────────────────────────────────────────────

    /// Process pre-rasterized pages, in page order.
    pub fn process_document(&self, pages: Vec<DynamicImage>) -> ResultEnvelope {
        let started = Instant::now();
        self.run_document(pages, started).unwrap_or_else(|e| self.fail(e))
    }

    /// Rasterize document bytes at `target_dpi`, then process the pages.
    pub fn process_document_bytes(&self, data: &[u8], rasterizer: &dyn DocumentRasterizer) -> ResultEnvelope {
        let started = Instant::now();
        rasterizer
            .rasterize(data, self.config.target_dpi)
            .map_err(PipelineError::from)
            .and_then(|pages| self.run_document(pages, started))
            .unwrap_or_else(|e| self.fail(e))
    }

    fn run_document(&self, pages: Vec<DynamicImage>, started: Instant) -> Result<ResultEnvelope, PipelineError> {
        let options = self.config.normalize_options();
        let mode = self.config.recognition_mode();
        let document = PageAggregator::new(self.primary.as_ref(), &options, &mode)
            .with_parallelism(self.config.page_parallelism())
            .process(pages)?;

        let structured = Extractor::extract(&document.content_text());
        let config = match &mode {
            RecognitionMode::Single(config) => Some(config.clone()),
            RecognitionMode::Best(_) => None,
        };
        let metadata = self.metadata(None, config, started);
        Ok(ResultEnvelope::from_document(self.primary.name(), document, structured, metadata))
    }

    // ── Envelope helpers ──────────────────────────────────────────────────────

    fn metadata(
        &self,
        normalization: Option<NormalizationReport>,
        config: Option<RecognitionConfig>,
        started: Instant,
    ) -> EnvelopeMetadata {
        EnvelopeMetadata {
            normalization,
            config,
            languages: self.config.languages.clone(),
            target_dpi: self.config.target_dpi,
            processing_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn fail(&self, error: PipelineError) -> ResultEnvelope {
        warn!(provider = self.primary.name(), error = %error, "receipt processing failed");
        ResultEnvelope::failure(self.primary.name(), error)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::{encode_png, NormalizeOptions};
    use crate::recognizer::{MockOutput, MockRecognizer, RawLine};
    use image::{GrayImage, ImageBuffer, Luma};

    fn plain_config() -> PipelineConfig {
        PipelineConfig { normalize: NormalizeOptions::none(), ..PipelineConfig::default() }
    }

    fn tiny_image() -> DynamicImage {
        let img: GrayImage = ImageBuffer::from_fn(4, 4, |_, _| Luma([200u8]));
        DynamicImage::ImageLuma8(img)
    }

    fn mock(text: &str) -> Arc<dyn OcrBackend> {
        Arc::new(MockRecognizer::new(text))
    }

    fn scored(name: &str, confidence: f32) -> Arc<dyn OcrBackend> {
        Arc::new(
            MockRecognizer::from_lines(vec![RawLine::new(format!("{name} text"), confidence)]).named(name),
        )
    }

    #[test]
    fn image_bytes_produce_envelope() {
        let pipeline = ReceiptPipeline::new(mock("STARBUCKS\n2024-01-15\nTotal $5.50\nVISA"), plain_config());
        let env = pipeline.process_image_bytes(&encode_png(&tiny_image()).unwrap());

        assert!(env.success);
        assert_eq!(env.line_count, 4);
        assert_eq!(env.provider, "mock");
        let fields = env.structured.unwrap();
        assert_eq!(fields.total.map(|m| m.to_string()).as_deref(), Some("$5.50"));
        assert_eq!(fields.date.as_deref(), Some("2024-01-15"));
        assert_eq!(fields.merchant.as_deref(), Some("STARBUCKS"));
        let meta = env.metadata.unwrap();
        assert_eq!(meta.languages, ["eng"]);
        assert!(meta.normalization.is_some());
    }

    #[test]
    fn undecodable_bytes_fail_cleanly() {
        let pipeline = ReceiptPipeline::new(mock("x"), plain_config());
        let env = pipeline.process_image_bytes(b"definitely not an image");
        assert!(!env.success);
        assert_eq!(env.text, "");
        assert!(env.error.unwrap().contains("<memory>"));
    }

    #[test]
    fn recognition_error_becomes_failed_envelope() {
        let pipeline = ReceiptPipeline::new(Arc::new(MockRecognizer::failing("engine crashed")), plain_config());
        let env = pipeline.process_image(tiny_image());
        assert!(!env.success);
        assert!(env.error.unwrap().contains("engine crashed"));
    }

    #[test]
    fn fallback_used_when_more_confident() {
        let pipeline = ReceiptPipeline::new(scored("primary", 0.3), plain_config())
            .with_fallback(scored("backup", 0.8));
        let env = pipeline.process_image(tiny_image());
        assert_eq!(env.provider, "backup");
        assert_eq!(env.text, "backup text");
    }

    #[test]
    fn fallback_ignored_when_not_better() {
        let pipeline = ReceiptPipeline::new(scored("primary", 0.3), plain_config())
            .with_fallback(scored("backup", 0.3));
        assert_eq!(pipeline.process_image(tiny_image()).provider, "primary");
    }

    #[test]
    fn fallback_skipped_above_threshold() {
        let backup = Arc::new(MockRecognizer::new("never"));
        let pipeline = ReceiptPipeline::new(scored("primary", 0.95), plain_config())
            .with_fallback(backup.clone());
        assert_eq!(pipeline.process_image(tiny_image()).provider, "primary");
        assert_eq!(backup.calls(), 0);
    }

    #[test]
    fn failing_fallback_keeps_primary() {
        let pipeline = ReceiptPipeline::new(scored("primary", 0.2), plain_config())
            .with_fallback(Arc::new(MockRecognizer::failing("down")));
        let env = pipeline.process_image(tiny_image());
        assert!(env.success);
        assert_eq!(env.provider, "primary");
    }

    #[test]
    fn mode_selection_reports_chosen_config() {
        let backend = MockRecognizer::new("")
            .on_mode(6, MockOutput::Lines(vec![RawLine::new("six", 0.5)]))
            .on_mode(4, MockOutput::Lines(vec![RawLine::new("four", 0.9)]));
        let config = PipelineConfig { try_all_modes: true, ..plain_config() };
        let env = ReceiptPipeline::new(Arc::new(backend), config).process_image(tiny_image());
        assert_eq!(env.text, "four");
        assert_eq!(env.metadata.unwrap().config.unwrap().page_segmentation, Some(4));
    }

    #[tokio::test]
    async fn missing_file_names_path() {
        let pipeline = ReceiptPipeline::new(mock("x"), plain_config());
        let env = pipeline.process_file(Path::new("/no/such/receipt.png")).await;
        assert!(!env.success);
        assert!(env.error.unwrap().contains("/no/such/receipt.png"));
    }

    #[test]
    fn document_pages_are_merged() {
        let pipeline = ReceiptPipeline::new(mock("HOTEL"), plain_config());
        let env = pipeline.process_document(vec![tiny_image(), tiny_image()]);
        assert!(env.success);
        assert_eq!(env.page_count, Some(2));
        assert_eq!(env.text, "--- Page 1 ---\n\nHOTEL\n\n--- Page 2 ---\n\nHOTEL");
    }

    #[test]
    fn empty_document_is_failure() {
        let env = ReceiptPipeline::new(mock("x"), plain_config()).process_document(vec![]);
        assert!(!env.success);
        assert!(env.error.unwrap().contains("no pages"));
    }
}
