use image::DynamicImage;
use tracing::{debug, info, warn};

use crate::recognizer::{OcrBackend, OcrError, RecognitionConfig};
use crate::types::{mean_confidence, TextObservation};

/// The winning run of [`recognize_best`].
#[derive(Debug, Clone)]
pub struct BestRun {
    pub observations: Vec<TextObservation>,
    pub config: RecognitionConfig,
    pub confidence: f32,
}

/// How a page gets recognized: one fixed config, or the best of several.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionMode {
    Single(RecognitionConfig),
    Best(Vec<RecognitionConfig>),
}

impl RecognitionMode {
    pub fn run(&self, image: &DynamicImage, backend: &dyn OcrBackend) -> Result<BestRun, OcrError> {
        match self {
            RecognitionMode::Single(config) => {
                let observations = backend.recognize(image, config)?;
                let confidence = mean_confidence(&observations);
                Ok(BestRun { observations, config: config.clone(), confidence })
            }
            RecognitionMode::Best(candidates) => recognize_best(image, backend, candidates),
        }
    }

    /// Whether more than one config may be tried.
    pub fn is_selecting(&self) -> bool {
        matches!(self, RecognitionMode::Best(_))
    }
}

/// Try each candidate config in order and keep the most confident run.
///
/// Ties keep the earlier candidate. When every run comes back empty the last
/// candidate's empty run is returned. A candidate that errors is skipped; the
/// call only fails if every candidate errors (or none were given).
pub fn recognize_best(
    image: &DynamicImage,
    backend: &dyn OcrBackend,
    candidates: &[RecognitionConfig],
) -> Result<BestRun, OcrError> {
    let mut best: Option<BestRun> = None;
    let mut last_empty: Option<BestRun> = None;
    let mut last_error: Option<OcrError> = None;

    for config in candidates {
        let observations = match backend.recognize(image, config) {
            Ok(obs) => obs,
            Err(e) => {
                warn!(backend = backend.name(), mode = %config, error = %e, "candidate mode failed");
                last_error = Some(e);
                continue;
            }
        };
        let confidence = mean_confidence(&observations);
        debug!(mode = %config, lines = observations.len(), confidence, "candidate mode");

        let run = BestRun { observations, config: config.clone(), confidence };
        if run.observations.is_empty() {
            last_empty = Some(run);
            continue;
        }
        if best.as_ref().map_or(true, |b| run.confidence > b.confidence) {
            best = Some(run);
        }
    }

    match best.or(last_empty) {
        Some(run) => {
            info!(mode = %run.config, confidence = run.confidence, "selected recognition mode");
            Ok(run)
        }
        None => Err(last_error.unwrap_or_else(|| OcrError::Engine("no candidate modes configured".to_string()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognizer::{MockOutput, MockRecognizer, RawLine};
    use image::GrayImage;

    fn blank() -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::new(4, 4))
    }

    fn modes(psms: &[u8]) -> Vec<RecognitionConfig> {
        psms.iter().map(|p| RecognitionConfig::default().with_page_segmentation(*p)).collect()
    }

    fn line(text: &str, confidence: f32) -> MockOutput {
        MockOutput::Lines(vec![RawLine::new(text, confidence)])
    }

    #[test]
    fn first_of_tied_maxima_wins() {
        let backend = MockRecognizer::new("")
            .on_mode(6, line("a", 0.5))
            .on_mode(4, line("b", 0.9))
            .on_mode(3, line("c", 0.9));
        let run = recognize_best(&blank(), &backend, &modes(&[6, 4, 3])).unwrap();
        assert_eq!(run.config.page_segmentation, Some(4));
        assert_eq!(run.observations[0].text, "b");
        assert_eq!(backend.calls(), 3);
    }

    #[test]
    fn all_empty_returns_last_candidate() {
        let backend = MockRecognizer::new("");
        let run = recognize_best(&blank(), &backend, &modes(&[6, 4, 3])).unwrap();
        assert!(run.observations.is_empty());
        assert_eq!(run.confidence, 0.0);
        assert_eq!(run.config.page_segmentation, Some(3));
    }

    #[test]
    fn non_empty_beats_empty_even_at_low_confidence() {
        let backend = MockRecognizer::new("").on_mode(3, line("faint", 0.05));
        let run = recognize_best(&blank(), &backend, &modes(&[6, 4, 3])).unwrap();
        assert_eq!(run.config.page_segmentation, Some(3));
    }

    #[test]
    fn failing_candidate_is_skipped() {
        let backend = MockRecognizer::new("")
            .on_mode(6, MockOutput::Fail("boom".into()))
            .on_mode(4, line("ok", 0.7));
        let run = recognize_best(&blank(), &backend, &modes(&[6, 4])).unwrap();
        assert_eq!(run.config.page_segmentation, Some(4));
    }

    #[test]
    fn single_mode_runs_once() {
        let backend = MockRecognizer::new("A\nB");
        let mode = RecognitionMode::Single(RecognitionConfig::default().with_page_segmentation(6));
        let run = mode.run(&blank(), &backend).unwrap();
        assert_eq!(run.observations.len(), 2);
        assert_eq!(backend.calls(), 1);
        assert!(!mode.is_selecting());
    }

    #[test]
    fn all_failing_propagates() {
        let backend = MockRecognizer::failing("engine down");
        assert!(recognize_best(&blank(), &backend, &modes(&[6, 4])).is_err());
        assert!(recognize_best(&blank(), &backend, &[]).is_err());
    }
}
