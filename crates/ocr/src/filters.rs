//! Pixel filters used by the normalization stages that `imageproc` does not
//! provide: bilateral smoothing, CLAHE and a canvas-growing rotation.

use image::{GrayImage, Luma};

// ── Bilateral smoothing ───────────────────────────────────────────────────────

/// Edge-preserving smoothing over a `(2 * radius + 1)²` window.
///
/// Neighbors are weighted by spatial distance (`sigma_space`) and by intensity
/// difference (`sigma_color`), so flat regions blur while strokes keep their
/// edges. Out-of-bounds neighbors are skipped.
pub fn bilateral(img: &GrayImage, radius: u32, sigma_color: f32, sigma_space: f32) -> GrayImage {
    let (w, h) = img.dimensions();
    if radius == 0 || w == 0 || h == 0 {
        return img.clone();
    }

    let r = radius as i64;
    let side = (2 * r + 1) as usize;
    let space_coeff = -0.5 / (sigma_space * sigma_space).max(f32::EPSILON);
    let color_coeff = -0.5 / (sigma_color * sigma_color).max(f32::EPSILON);

    let mut spatial = Vec::with_capacity(side * side);
    for dy in -r..=r {
        for dx in -r..=r {
            spatial.push((((dx * dx + dy * dy) as f32) * space_coeff).exp());
        }
    }
    let range: Vec<f32> = (0..256)
        .map(|d| ((d * d) as f32 * color_coeff).exp())
        .collect();

    GrayImage::from_fn(w, h, |x, y| {
        let center = img.get_pixel(x, y)[0];
        let mut sum = 0.0f32;
        let mut weight_sum = 0.0f32;
        for dy in -r..=r {
            let ny = y as i64 + dy;
            if ny < 0 || ny >= h as i64 {
                continue;
            }
            for dx in -r..=r {
                let nx = x as i64 + dx;
                if nx < 0 || nx >= w as i64 {
                    continue;
                }
                let v = img.get_pixel(nx as u32, ny as u32)[0];
                let k = ((dy + r) as usize) * side + (dx + r) as usize;
                let weight = spatial[k] * range[center.abs_diff(v) as usize];
                sum += v as f32 * weight;
                weight_sum += weight;
            }
        }
        if weight_sum > 0.0 {
            Luma([(sum / weight_sum).round().clamp(0.0, 255.0) as u8])
        } else {
            Luma([center])
        }
    })
}

// ── CLAHE ─────────────────────────────────────────────────────────────────────

/// Contrast-limited adaptive histogram equalization.
///
/// The image is split into a `tiles × tiles` grid; each tile gets its own
/// clipped equalization table and pixels blend the tables of the four nearest
/// tile centers bilinearly.
pub fn clahe(img: &GrayImage, clip_limit: f32, tiles: u32) -> GrayImage {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return img.clone();
    }

    let tile_w = w.div_ceil(tiles.clamp(1, w));
    let tile_h = h.div_ceil(tiles.clamp(1, h));
    let tiles_x = w.div_ceil(tile_w);
    let tiles_y = h.div_ceil(tile_h);

    let mut luts = Vec::with_capacity((tiles_x * tiles_y) as usize);
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(w);
            let y1 = (y0 + tile_h).min(h);
            luts.push(tile_lut(img, (x0, y0, x1, y1), clip_limit));
        }
    }

    GrayImage::from_fn(w, h, |x, y| {
        let v = img.get_pixel(x, y)[0] as usize;

        let txf = x as f32 / tile_w as f32 - 0.5;
        let tyf = y as f32 / tile_h as f32 - 0.5;
        let tx1 = txf.floor();
        let ty1 = tyf.floor();
        let xa = txf - tx1;
        let ya = tyf - ty1;

        let clamp_x = |t: f32| t.clamp(0.0, (tiles_x - 1) as f32) as u32;
        let clamp_y = |t: f32| t.clamp(0.0, (tiles_y - 1) as f32) as u32;
        let (ax, bx) = (clamp_x(tx1), clamp_x(tx1 + 1.0));
        let (ay, by) = (clamp_y(ty1), clamp_y(ty1 + 1.0));
        let lut = |tx: u32, ty: u32| luts[(ty * tiles_x + tx) as usize][v];

        let top = lut(ax, ay) * (1.0 - xa) + lut(bx, ay) * xa;
        let bottom = lut(ax, by) * (1.0 - xa) + lut(bx, by) * xa;
        Luma([(top * (1.0 - ya) + bottom * ya).round().clamp(0.0, 255.0) as u8])
    })
}

fn tile_lut(img: &GrayImage, (x0, y0, x1, y1): (u32, u32, u32, u32), clip_limit: f32) -> [f32; 256] {
    let mut hist = [0u32; 256];
    for y in y0..y1 {
        for x in x0..x1 {
            hist[img.get_pixel(x, y)[0] as usize] += 1;
        }
    }
    let area = ((x1 - x0) * (y1 - y0)).max(1);

    if clip_limit > 0.0 {
        let clip = ((clip_limit * area as f32 / 256.0) as u32).max(1);
        let mut excess = 0u32;
        for bin in hist.iter_mut() {
            if *bin > clip {
                excess += *bin - clip;
                *bin = clip;
            }
        }
        let batch = excess / 256;
        let mut residual = excess % 256;
        for bin in hist.iter_mut() {
            *bin += batch;
        }
        if residual > 0 {
            let step = (256 / residual).max(1) as usize;
            let mut i = 0;
            while i < 256 && residual > 0 {
                hist[i] += 1;
                residual -= 1;
                i += step;
            }
        }
    }

    let scale = 255.0 / area as f32;
    let mut lut = [0.0f32; 256];
    let mut cumulative = 0u32;
    for (value, count) in hist.iter().enumerate() {
        cumulative += count;
        lut[value] = (cumulative as f32 * scale).round().min(255.0);
    }
    lut
}

// ── Rotation ──────────────────────────────────────────────────────────────────

/// Rotate clockwise by `degrees` about the image center with bicubic sampling.
///
/// The canvas grows to the rotated bounding box so no content is clipped, and
/// samples falling outside the source replicate the nearest edge pixel.
pub fn rotate_expand(img: &GrayImage, degrees: f64) -> GrayImage {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return img.clone();
    }

    let theta = degrees.to_radians();
    let (sin, cos) = theta.sin_cos();
    let new_w = ((h as f64 * sin.abs()) + (w as f64 * cos.abs())) as u32;
    let new_h = ((h as f64 * cos.abs()) + (w as f64 * sin.abs())) as u32;
    let (new_w, new_h) = (new_w.max(1), new_h.max(1));

    let (scx, scy) = (w as f64 / 2.0, h as f64 / 2.0);
    let (dcx, dcy) = (new_w as f64 / 2.0, new_h as f64 / 2.0);

    GrayImage::from_fn(new_w, new_h, |x, y| {
        let dx = x as f64 - dcx;
        let dy = y as f64 - dcy;
        let sx = dx * cos + dy * sin + scx;
        let sy = -dx * sin + dy * cos + scy;
        Luma([sample_bicubic(img, sx, sy)])
    })
}

fn cubic_weight(t: f64) -> f64 {
    const A: f64 = -0.75;
    let t = t.abs();
    if t <= 1.0 {
        ((A + 2.0) * t - (A + 3.0)) * t * t + 1.0
    } else if t < 2.0 {
        ((A * t - 5.0 * A) * t + 8.0 * A) * t - 4.0 * A
    } else {
        0.0
    }
}

fn sample_bicubic(img: &GrayImage, sx: f64, sy: f64) -> u8 {
    let (w, h) = img.dimensions();
    let x0 = sx.floor();
    let y0 = sy.floor();
    let fx = sx - x0;
    let fy = sy - y0;

    let mut acc = 0.0f64;
    for j in -1i64..=2 {
        let wy = cubic_weight(fy - j as f64);
        let py = (y0 as i64 + j).clamp(0, h as i64 - 1) as u32;
        for i in -1i64..=2 {
            let wx = cubic_weight(fx - i as f64);
            let px = (x0 as i64 + i).clamp(0, w as i64 - 1) as u32;
            acc += img.get_pixel(px, py)[0] as f64 * wx * wy;
        }
    }
    acc.round().clamp(0.0, 255.0) as u8
}
