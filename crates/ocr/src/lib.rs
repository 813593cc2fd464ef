//! Receipt understanding core: image normalization, recognition backends,
//! page aggregation and field extraction behind a single envelope-returning
//! pipeline.

pub mod config;
pub mod document;
pub mod engine;
pub mod envelope;
pub mod extract;
pub mod filters;
pub mod mode;
pub mod pipeline;
pub mod preprocess;
pub mod recognizer;
pub mod types;

pub use config::{ConfigError, PipelineConfig};
pub use document::{DocumentError, DocumentRasterizer, PageAggregator, PageParallelism};
pub use envelope::{EnvelopeMetadata, ResultEnvelope};
pub use extract::Extractor;
pub use mode::{recognize_best, BestRun, RecognitionMode};
pub use pipeline::{PipelineError, ReceiptPipeline};
pub use preprocess::{
    decode_image, encode_png, load_image, normalize, Binarization, NormalizationReport, NormalizeOptions,
    PreprocessError, Step,
};
pub use recognizer::{
    group_words, normalize_lines, LineKey, MockOutput, MockRecognizer, OcrBackend, OcrError, RawLine, RawWord,
    RecognitionConfig,
};
pub use types::{BoundingRegion, DocumentResult, PageResult, StructuredFields, TextObservation};
