use image::DynamicImage;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::mode::RecognitionMode;
use crate::preprocess::{normalize, NormalizeOptions};
use crate::recognizer::OcrBackend;
use crate::types::{DocumentResult, PageResult};

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Document rasterization failed: {0}")]
    Rasterization(String),
    #[error("Document produced no pages")]
    NoPages,
}

/// Turns document bytes (PDF and the like) into page images, in page order.
pub trait DocumentRasterizer: Send + Sync {
    fn rasterize(&self, bytes: &[u8], dpi: u32) -> Result<Vec<DynamicImage>, DocumentError>;
}

/// When pages may be recognized on the rayon pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageParallelism {
    pub enabled: bool,
    /// Documents shorter than this stay sequential.
    pub min_pages: usize,
}

impl PageParallelism {
    pub fn sequential() -> Self {
        Self { enabled: false, min_pages: usize::MAX }
    }

    fn applies(&self, page_count: usize) -> bool {
        self.enabled && page_count >= self.min_pages
    }
}

impl Default for PageParallelism {
    fn default() -> Self {
        Self::sequential()
    }
}

/// Runs normalize → recognize on every page and merges the results.
pub struct PageAggregator<'a> {
    backend: &'a dyn OcrBackend,
    normalize: &'a NormalizeOptions,
    mode: &'a RecognitionMode,
    parallelism: PageParallelism,
}

impl<'a> PageAggregator<'a> {
    pub fn new(backend: &'a dyn OcrBackend, normalize: &'a NormalizeOptions, mode: &'a RecognitionMode) -> Self {
        Self { backend, normalize, mode, parallelism: PageParallelism::sequential() }
    }

    pub fn with_parallelism(mut self, parallelism: PageParallelism) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Recognize one page. A recognition failure becomes an empty page
    /// carrying the error instead of an `Err`.
    pub fn recognize_page(&self, page: usize, image: DynamicImage) -> PageResult {
        let (normalized, report) = normalize(image, self.normalize);
        let mut result = match self.mode.run(&normalized, self.backend) {
            Ok(run) => {
                debug!(page, lines = run.observations.len(), confidence = run.confidence, "page recognized");
                let mut result = PageResult::from_observations(page, run.observations);
                if self.mode.is_selecting() {
                    result.config = Some(run.config);
                }
                result
            }
            Err(e) => {
                warn!(page, error = %e, "page recognition failed");
                PageResult::failed(page, e.to_string())
            }
        };
        result.normalization = Some(report);
        result
    }

    /// Pages come back numbered from 1 in input order, parallel or not.
    pub fn process(&self, pages: Vec<DynamicImage>) -> Result<DocumentResult, DocumentError> {
        if pages.is_empty() {
            return Err(DocumentError::NoPages);
        }
        let page_count = pages.len();

        let results: Vec<PageResult> = if self.parallelism.applies(page_count) {
            debug!(page_count, "recognizing pages in parallel");
            pages
                .into_par_iter()
                .enumerate()
                .map(|(i, image)| self.recognize_page(i + 1, image))
                .collect()
        } else {
            pages
                .into_iter()
                .enumerate()
                .map(|(i, image)| self.recognize_page(i + 1, image))
                .collect()
        };

        let document = DocumentResult::from_pages(results);
        info!(
            pages = page_count,
            failed = document.failed_pages().count(),
            confidence = document.confidence,
            "document processed"
        );
        Ok(document)
    }
}
