use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::document::PageParallelism;
use crate::mode::RecognitionMode;
use crate::preprocess::{Binarization, NormalizeOptions};
use crate::recognizer::RecognitionConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse config: {0}")]
    Parse(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Everything a [`crate::ReceiptPipeline`] needs besides its backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub languages: Vec<String>,
    pub use_gpu: bool,
    pub target_dpi: u32,
    pub try_all_modes: bool,
    pub page_segmentation: u8,
    /// Most receipt-friendly first; ties go to the earlier mode.
    pub candidate_modes: Vec<u8>,
    pub fallback_threshold: f32,
    pub parallel_pages: bool,
    pub parallel_page_threshold: usize,
    pub normalize: NormalizeOptions,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            languages: vec!["eng".to_string()],
            use_gpu: false,
            target_dpi: 300,
            try_all_modes: false,
            page_segmentation: 6,
            candidate_modes: vec![6, 4, 3],
            fallback_threshold: 0.6,
            parallel_pages: false,
            parallel_page_threshold: 2,
            normalize: NormalizeOptions::default(),
        }
    }
}

impl PipelineConfig {
    /// Parse and validate a TOML document. Missing keys take their defaults.
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;
        Self::from_toml(&s)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.languages.iter().all(|l| l.trim().is_empty()) {
            return invalid("at least one recognition language is required");
        }
        if self.candidate_modes.is_empty() {
            return invalid("candidate_modes must not be empty");
        }
        if self.target_dpi == 0 {
            return invalid("target_dpi must be positive");
        }
        if !(0.0..=1.0).contains(&self.fallback_threshold) {
            return invalid("fallback_threshold must be within 0.0..=1.0");
        }

        let n = &self.normalize;
        if n.max_edge == Some(0) {
            return invalid("normalize.max_edge must be positive");
        }
        if n.source_dpi == Some(0) {
            return invalid("normalize.source_dpi must be positive");
        }
        if n.denoise && n.denoise_radius == 0 {
            return invalid("normalize.denoise_radius must be positive");
        }
        if n.enhance_contrast && n.clahe_tiles == 0 {
            return invalid("normalize.clahe_tiles must be positive");
        }
        if let Some(Binarization::AdaptiveGaussian { block_size, .. }) = n.binarize {
            if block_size < 3 || block_size % 2 == 0 {
                return invalid("normalize.binarize.block_size must be odd and at least 3");
            }
        }
        Ok(())
    }

    /// Settings for a single recognition call.
    pub fn recognition_config(&self) -> RecognitionConfig {
        RecognitionConfig {
            languages: self.languages.clone(),
            page_segmentation: Some(self.page_segmentation),
            dpi: Some(self.target_dpi),
            use_gpu: self.use_gpu,
        }
    }

    pub fn recognition_mode(&self) -> RecognitionMode {
        let base = self.recognition_config();
        if self.try_all_modes {
            RecognitionMode::Best(
                self.candidate_modes
                    .iter()
                    .map(|psm| base.clone().with_page_segmentation(*psm))
                    .collect(),
            )
        } else {
            RecognitionMode::Single(base)
        }
    }

    /// Normalization options with the pipeline's target DPI applied.
    pub fn normalize_options(&self) -> NormalizeOptions {
        NormalizeOptions { target_dpi: self.target_dpi, ..self.normalize.clone() }
    }

    pub fn page_parallelism(&self) -> PageParallelism {
        PageParallelism { enabled: self.parallel_pages, min_pages: self.parallel_page_threshold }
    }
}
