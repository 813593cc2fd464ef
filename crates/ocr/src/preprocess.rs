use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::edges::canny;
use imageproc::hough::{detect_lines, LineDetectionOptions, PolarLine};
use imageproc::region_labelling::{connected_components, Connectivity};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::Cursor;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

use crate::filters;

/// Source label used when an image did not come from a file.
pub const MEMORY_SOURCE: &str = "<memory>";

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("Failed to load image {path}: {reason}")]
    Load { path: String, reason: String },
    #[error("Failed to encode processed image: {0}")]
    Encode(String),
}

/// Decode an image file (JPEG / PNG / WEBP / …).
pub fn load_image(path: &Path) -> Result<DynamicImage, PreprocessError> {
    image::open(path).map_err(|e| PreprocessError::Load {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Decode raw image bytes.
pub fn decode_image(data: &[u8]) -> Result<DynamicImage, PreprocessError> {
    decode_image_from(data, MEMORY_SOURCE)
}

pub(crate) fn decode_image_from(data: &[u8], source: &str) -> Result<DynamicImage, PreprocessError> {
    image::load_from_memory(data).map_err(|e| PreprocessError::Load {
        path: source.to_string(),
        reason: e.to_string(),
    })
}

/// Lossless hand-off format for backends that consume encoded bytes.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, PreprocessError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(|e| PreprocessError::Encode(e.to_string()))?;
    Ok(buf)
}

// ── Options ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Binarization {
    /// Single global threshold chosen by Otsu's method.
    #[default]
    Otsu,
    /// Local threshold against a Gaussian-weighted neighborhood mean.
    AdaptiveGaussian { block_size: u32, offset: i32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeOptions {
    /// Longest edge allowed in the output; `None` disables the oversize guard.
    pub max_edge: Option<u32>,
    /// Scan resolution of the input, when known.
    pub source_dpi: Option<u32>,
    pub target_dpi: u32,
    pub grayscale: bool,
    pub crop_borders: bool,
    pub crop_margin: u32,
    pub denoise: bool,
    pub denoise_radius: u32,
    pub denoise_sigma_color: f32,
    pub denoise_sigma_space: f32,
    pub close_radius: u8,
    pub deskew: bool,
    /// Detected angles smaller than this (degrees) are not corrected.
    pub skew_threshold_deg: f32,
    pub hough_vote_threshold: u32,
    pub enhance_contrast: bool,
    pub clahe_clip_limit: f32,
    pub clahe_tiles: u32,
    pub sharpen: bool,
    pub binarize: Option<Binarization>,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            max_edge: Some(2000),
            source_dpi: None,
            target_dpi: 300,
            grayscale: true,
            crop_borders: true,
            crop_margin: 10,
            denoise: true,
            denoise_radius: 4,
            denoise_sigma_color: 75.0,
            denoise_sigma_space: 75.0,
            close_radius: 1,
            deskew: true,
            skew_threshold_deg: 0.5,
            hough_vote_threshold: 200,
            enhance_contrast: true,
            clahe_clip_limit: 2.0,
            clahe_tiles: 8,
            sharpen: true,
            binarize: Some(Binarization::Otsu),
        }
    }
}

impl NormalizeOptions {
    /// Every stage off; useful as a base for enabling single stages.
    pub fn none() -> Self {
        Self {
            max_edge: None,
            grayscale: false,
            crop_borders: false,
            denoise: false,
            deskew: false,
            enhance_contrast: false,
            sharpen: false,
            binarize: None,
            ..Self::default()
        }
    }

    fn needs_luminance(&self) -> bool {
        self.crop_borders
            || self.denoise
            || self.deskew
            || self.enhance_contrast
            || self.sharpen
            || self.binarize.is_some()
    }
}

// ── Report ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    DpiNormalization,
    Resize,
    GrayscaleConversion,
    BorderCropping,
    Denoising,
    Deskewing,
    PostRotationResize,
    ContrastEnhancement,
    Sharpening,
    OtsuThreshold,
    AdaptiveThreshold,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Step::DpiNormalization => "dpi_normalization",
            Step::Resize => "resize",
            Step::GrayscaleConversion => "grayscale_conversion",
            Step::BorderCropping => "border_cropping",
            Step::Denoising => "denoising",
            Step::Deskewing => "deskewing",
            Step::PostRotationResize => "post_rotation_resize",
            Step::ContrastEnhancement => "contrast_enhancement",
            Step::Sharpening => "sharpening",
            Step::OtsuThreshold => "otsu_threshold",
            Step::AdaptiveThreshold => "adaptive_threshold",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn of(img: &DynamicImage) -> Self {
        Self { width: img.width(), height: img.height() }
    }

    pub fn longer_edge(self) -> u32 {
        self.width.max(self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// What the normalizer did to an image. Only the normalizer appends to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationReport {
    steps_applied: Vec<Step>,
    original_size: Dimensions,
    final_size: Dimensions,
    skew_angle: f32,
    dpi_scale: f32,
    scale_factor: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    crop_box: Option<CropBox>,
    #[serde(skip_serializing_if = "Option::is_none")]
    threshold: Option<u8>,
}

impl NormalizationReport {
    fn new(original_size: Dimensions) -> Self {
        Self {
            steps_applied: Vec::new(),
            original_size,
            final_size: original_size,
            skew_angle: 0.0,
            dpi_scale: 1.0,
            scale_factor: 1.0,
            crop_box: None,
            threshold: None,
        }
    }

    fn push(&mut self, step: Step) {
        self.steps_applied.push(step);
    }

    pub fn steps_applied(&self) -> &[Step] {
        &self.steps_applied
    }

    pub fn has_step(&self, step: Step) -> bool {
        self.steps_applied.contains(&step)
    }

    pub fn original_size(&self) -> Dimensions {
        self.original_size
    }

    pub fn final_size(&self) -> Dimensions {
        self.final_size
    }

    /// Median detected skew in degrees; recorded even when not corrected.
    pub fn skew_angle(&self) -> f32 {
        self.skew_angle
    }

    pub fn dpi_scale(&self) -> f32 {
        self.dpi_scale
    }

    /// Product of every downscale applied by the oversize guards.
    pub fn scale_factor(&self) -> f32 {
        self.scale_factor
    }

    pub fn crop_box(&self) -> Option<CropBox> {
        self.crop_box
    }

    /// Global threshold picked by Otsu binarization.
    pub fn threshold(&self) -> Option<u8> {
        self.threshold
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

/// Run every enabled stage in fixed order. Deterministic for a given input.
pub fn normalize(image: DynamicImage, options: &NormalizeOptions) -> (DynamicImage, NormalizationReport) {
    let mut report = NormalizationReport::new(Dimensions::of(&image));
    let mut image = image;

    if let Some(source_dpi) = options.source_dpi {
        let (scaled, scale) = rescale_dpi(image, source_dpi, options.target_dpi, options.max_edge);
        image = scaled;
        if let Some((factor, cap)) = scale {
            debug!(source_dpi, target_dpi = options.target_dpi, factor, ?cap, "dpi normalization");
            report.dpi_scale = factor;
            report.push(Step::DpiNormalization);
            if let Some(cap) = cap {
                report.scale_factor *= cap;
                report.push(Step::Resize);
            }
        }
    }

    if let Some(max_edge) = options.max_edge {
        let (resized, factor) = resize_if_oversized(image, max_edge);
        image = resized;
        if let Some(factor) = factor {
            debug!(max_edge, factor, "resized oversized image");
            report.scale_factor *= factor;
            report.push(Step::Resize);
        }
    }

    if options.grayscale {
        image = to_grayscale(image);
        report.push(Step::GrayscaleConversion);
    }

    if !options.needs_luminance() {
        report.final_size = Dimensions::of(&image);
        return (image, report);
    }

    let mut gray = image.into_luma8();

    if options.crop_borders {
        let (cropped, crop_box) = crop_borders(gray, options.crop_margin);
        gray = cropped;
        debug!(?crop_box, "border cropping");
        report.crop_box = crop_box;
        report.push(Step::BorderCropping);
    }

    if options.denoise {
        gray = denoise(
            gray,
            options.denoise_radius,
            options.denoise_sigma_color,
            options.denoise_sigma_space,
            options.close_radius,
        );
        report.push(Step::Denoising);
    }

    if options.deskew {
        let (rotated, angle) = deskew(gray, options.skew_threshold_deg, options.hough_vote_threshold);
        gray = rotated;
        debug!(angle, "deskew");
        report.skew_angle = angle;
        report.push(Step::Deskewing);

        if let Some(max_edge) = options.max_edge {
            let (resized, factor) = resize_if_oversized(DynamicImage::ImageLuma8(gray), max_edge);
            gray = resized.into_luma8();
            if let Some(factor) = factor {
                debug!(max_edge, factor, "resized after rotation");
                report.scale_factor *= factor;
                report.push(Step::PostRotationResize);
            }
        }
    }

    if options.enhance_contrast {
        gray = filters::clahe(&gray, options.clahe_clip_limit, options.clahe_tiles);
        report.push(Step::ContrastEnhancement);
    }

    if options.sharpen {
        gray = sharpen(&gray);
        report.push(Step::Sharpening);
    }

    if let Some(method) = options.binarize {
        let (binary, threshold) = binarize(gray, method);
        gray = binary;
        report.threshold = threshold;
        report.push(match method {
            Binarization::Otsu => Step::OtsuThreshold,
            Binarization::AdaptiveGaussian { .. } => Step::AdaptiveThreshold,
        });
    }

    let image = DynamicImage::ImageLuma8(gray);
    report.final_size = Dimensions::of(&image);
    (image, report)
}

// ── Stages ────────────────────────────────────────────────────────────────────

/// Rescale to `target_dpi` in a single resize that never exceeds `max_edge`.
///
/// Returns the requested DPI factor and, when the edge cap cut it short, the
/// additional factor the cap applied on top of it.
pub fn rescale_dpi(
    image: DynamicImage,
    source_dpi: u32,
    target_dpi: u32,
    max_edge: Option<u32>,
) -> (DynamicImage, Option<(f32, Option<f32>)>) {
    if source_dpi == 0 || source_dpi == target_dpi {
        return (image, None);
    }
    let factor = target_dpi as f32 / source_dpi as f32;
    let longer = image.width().max(image.height()).max(1);
    let applied = match max_edge {
        Some(edge) if edge > 0 => factor.min(edge as f32 / longer as f32),
        _ => factor,
    };
    let limit = max_edge.filter(|e| *e > 0).unwrap_or(u32::MAX);
    let w = ((image.width() as f32 * applied) as u32).clamp(1, limit);
    let h = ((image.height() as f32 * applied) as u32).clamp(1, limit);
    let cap = (applied < factor).then(|| applied / factor);
    (image.resize_exact(w, h, FilterType::CatmullRom), Some((factor, cap)))
}

/// Shrink so the longer edge fits `max_edge`. Returns the factor when shrunk.
pub fn resize_if_oversized(image: DynamicImage, max_edge: u32) -> (DynamicImage, Option<f32>) {
    let longer = image.width().max(image.height());
    if longer <= max_edge || max_edge == 0 {
        return (image, None);
    }
    let factor = max_edge as f32 / longer as f32;
    let w = ((image.width() as f32 * factor) as u32).clamp(1, max_edge);
    let h = ((image.height() as f32 * factor) as u32).clamp(1, max_edge);
    // Triangle averages every covered source pixel when shrinking.
    (image.resize_exact(w, h, FilterType::Triangle), Some(factor))
}

pub fn to_grayscale(image: DynamicImage) -> DynamicImage {
    match image {
        DynamicImage::ImageLuma8(_) => image,
        other => DynamicImage::ImageLuma8(other.to_luma8()),
    }
}

/// Crop to the largest non-black connected region plus `margin`, clamped.
pub fn crop_borders(gray: GrayImage, margin: u32) -> (GrayImage, Option<CropBox>) {
    let (w, h) = gray.dimensions();
    if w == 0 || h == 0 {
        return (gray, None);
    }

    let mask = GrayImage::from_fn(w, h, |x, y| {
        Luma([if gray.get_pixel(x, y)[0] > 1 { 255 } else { 0 }])
    });
    let labels = connected_components(&mask, Connectivity::Eight, Luma([0u8]));

    let label_count = labels.pixels().map(|p| p[0]).max().unwrap_or(0) as usize;
    if label_count == 0 {
        return (gray, None);
    }

    // (pixel count, min x, min y, max x, max y) per label.
    let mut regions = vec![(0u64, u32::MAX, u32::MAX, 0u32, 0u32); label_count + 1];
    for (x, y, label) in labels.enumerate_pixels() {
        let l = label[0] as usize;
        if l == 0 {
            continue;
        }
        let r = &mut regions[l];
        r.0 += 1;
        r.1 = r.1.min(x);
        r.2 = r.2.min(y);
        r.3 = r.3.max(x);
        r.4 = r.4.max(y);
    }

    let mut best = 1;
    for l in 2..=label_count {
        if regions[l].0 > regions[best].0 {
            best = l;
        }
    }
    let (_, min_x, min_y, max_x, max_y) = regions[best];

    let x0 = min_x.saturating_sub(margin);
    let y0 = min_y.saturating_sub(margin);
    let x1 = max_x.saturating_add(margin).min(w - 1);
    let y1 = max_y.saturating_add(margin).min(h - 1);
    let crop = CropBox { x: x0, y: y0, width: x1 - x0 + 1, height: y1 - y0 + 1 };

    let cropped = image::imageops::crop_imm(&gray, crop.x, crop.y, crop.width, crop.height).to_image();
    (cropped, Some(crop))
}

/// Bilateral smoothing followed by a small morphological closing.
pub fn denoise(gray: GrayImage, radius: u32, sigma_color: f32, sigma_space: f32, close_radius: u8) -> GrayImage {
    let smoothed = filters::bilateral(&gray, radius, sigma_color, sigma_space);
    if close_radius == 0 {
        smoothed
    } else {
        imageproc::morphology::close(&smoothed, Norm::LInf, close_radius)
    }
}

pub const SHARPEN_KERNEL: [i32; 9] = [-1, -1, -1, -1, 9, -1, -1, -1, -1];

/// 3×3 sharpening; borders pad by continuity and results saturate to `u8`.
pub fn sharpen(gray: &GrayImage) -> GrayImage {
    imageproc::filter::filter3x3::<_, i32, u8>(gray, &SHARPEN_KERNEL)
}

const MAX_SKEW_LINES: usize = 50;

/// Median tilt in degrees of the dominant near-horizontal lines; positive means
/// lines descend to the right. 0.0 when nothing usable is found.
///
/// Only lines within 45° of horizontal are considered, strongest first, capped
/// at [`MAX_SKEW_LINES`].
pub fn detect_skew(gray: &GrayImage, vote_threshold: u32) -> f32 {
    let edges = canny(gray, 50.0, 150.0);
    let lines: Vec<PolarLine> = detect_lines(
        &edges,
        LineDetectionOptions { vote_threshold, suppression_radius: 8 },
    )
    .into_iter()
    .filter(|l| {
        let a = l.angle_in_degrees as f32 - 90.0;
        a > -45.0 && a < 45.0
    })
    .collect();

    let votes = line_votes(&edges, &lines);
    let mut ranked: Vec<(u32, f32)> = votes
        .into_iter()
        .zip(&lines)
        .map(|(v, l)| (v, l.angle_in_degrees as f32 - 90.0))
        .collect();
    // Stable, so equal votes keep detector order.
    ranked.sort_by(|a, b| b.0.cmp(&a.0));

    let mut angles: Vec<f32> = ranked.into_iter().take(MAX_SKEW_LINES).map(|(_, a)| a).collect();
    debug!(candidates = lines.len(), used = angles.len(), "skew lines");
    median(&mut angles).unwrap_or(0.0)
}

/// Accumulator votes for each detected line, recounted from the edge map with
/// the same binning `detect_lines` uses (1° angle buckets, truncated radius).
fn line_votes(edges: &GrayImage, lines: &[PolarLine]) -> Vec<u32> {
    let mut index: HashMap<(u32, i32), usize> = HashMap::with_capacity(lines.len());
    for (i, l) in lines.iter().enumerate() {
        index.insert((l.angle_in_degrees, l.r as i32), i);
    }
    let mut angles: Vec<u32> = lines.iter().map(|l| l.angle_in_degrees).collect();
    angles.sort_unstable();
    angles.dedup();
    let trig: Vec<(u32, f32, f32)> = angles
        .into_iter()
        .map(|m| {
            let (sin, cos) = (m as f32).to_radians().sin_cos();
            (m, sin, cos)
        })
        .collect();

    let mut votes = vec![0u32; lines.len()];
    if trig.is_empty() {
        return votes;
    }
    for (x, y, p) in edges.enumerate_pixels() {
        if p[0] == 0 {
            continue;
        }
        for &(m, sin, cos) in &trig {
            let r = (x as f32) * cos + (y as f32) * sin;
            if let Some(&i) = index.get(&(m, r as i32)) {
                votes[i] += 1;
            }
        }
    }
    votes
}

fn median(values: &mut [f32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

/// Detect and undo skew. Returns the detected angle whether or not it was
/// large enough to correct.
pub fn deskew(gray: GrayImage, threshold_deg: f32, vote_threshold: u32) -> (GrayImage, f32) {
    let angle = detect_skew(&gray, vote_threshold);
    if angle.abs() < threshold_deg {
        return (gray, angle);
    }
    (filters::rotate_expand(&gray, -(angle as f64)), angle)
}

/// Binarize, then invert if dark pixels outnumber light ones. Returns the
/// global threshold when one was used.
pub fn binarize(gray: GrayImage, method: Binarization) -> (GrayImage, Option<u8>) {
    let (mut binary, threshold) = match method {
        Binarization::Otsu => {
            let level = imageproc::contrast::otsu_level(&gray);
            let out = GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
                Luma([if gray.get_pixel(x, y)[0] > level { 255 } else { 0 }])
            });
            (out, Some(level))
        }
        Binarization::AdaptiveGaussian { block_size, offset } => {
            (adaptive_gaussian(&gray, block_size, offset), None)
        }
    };

    let black = binary.pixels().filter(|p| p[0] == 0).count();
    let white = binary.pixels().filter(|p| p[0] == 255).count();
    if black > white {
        debug!(black, white, "inverting binarized image");
        image::imageops::invert(&mut binary);
    }
    debug!(?method, ?threshold, "binarized");
    (binary, threshold)
}

fn adaptive_gaussian(gray: &GrayImage, block_size: u32, offset: i32) -> GrayImage {
    let block = block_size.max(3) as f32;
    let sigma = (0.3 * ((block - 1.0) * 0.5 - 1.0) + 0.8).max(0.1);
    let local = imageproc::filter::gaussian_blur_f32(gray, sigma);
    GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        let v = gray.get_pixel(x, y)[0] as i32;
        let mean = local.get_pixel(x, y)[0] as i32;
        Luma([if v > mean - offset { 255 } else { 0 }])
    })
}
