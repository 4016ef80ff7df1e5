//! PNG renderings of stamps, the field overview and profile comparisons.
//!
//! Images are drawn with row 0 at the bottom, the usual orientation for
//! astronomical data.

use std::path::Path;

use image::{imageops, GrayImage, ImageBuffer, Luma, Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_circle_mut, draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;
use ndarray::ArrayView2;
use tracing::info;

use crate::cutout::PixelPos;
use crate::error::Result;

const TARGET_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const PSF_COLOR: Rgb<u8> = Rgb([0, 255, 255]);
const AXIS_COLOR: Rgb<u8> = Rgb([90, 90, 90]);
const PROFILE_COLORS: [Rgb<u8>; 6] = [
    Rgb([255, 0, 0]),
    Rgb([0, 160, 255]),
    Rgb([0, 200, 0]),
    Rgb([255, 170, 0]),
    Rgb([200, 0, 255]),
    Rgb([255, 255, 0]),
];

/// Logarithmic stretch to 8 bits: log(1 + k·x) over the finite range.
/// Non-finite pixels render black.
pub fn log_stretch(data: ArrayView2<f64>) -> GrayImage {
    let (rows, cols) = data.dim();
    let (min_val, max_val) = data
        .iter()
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = if max_val > min_val { max_val - min_val } else { 1.0 };
    let log_max = 1000.0_f64.ln_1p();

    ImageBuffer::from_fn(cols as u32, rows as u32, |x, y| {
        let v = data[[rows - 1 - y as usize, x as usize]];
        if !v.is_finite() {
            return Luma([0u8]);
        }
        let normalized = ((v - min_val) / range).clamp(0.0, 1.0);
        let scaled = ((1000.0 * normalized).ln_1p() / log_max * 255.0) as u8;
        Luma([scaled])
    })
}

/// Integer zoom so small stamps stay readable
fn zoom_factor(rows: usize, cols: usize) -> u32 {
    (300 / rows.max(cols).max(1)).max(1) as u32
}

fn zoomed(img: &GrayImage, factor: u32) -> GrayImage {
    if factor == 1 {
        return img.clone();
    }
    imageops::resize(
        img,
        img.width() * factor,
        img.height() * factor,
        imageops::FilterType::Nearest,
    )
}

pub fn save_stamp_png(path: &Path, stamp: ArrayView2<f64>) -> Result<()> {
    let (rows, cols) = stamp.dim();
    let img = zoomed(&log_stretch(stamp), zoom_factor(rows, cols));
    img.save(path)?;
    info!("Saved stamp to {}", path.display());
    Ok(())
}

/// Stamps side by side, each stretched on its own range
pub fn save_panels_png(path: &Path, panels: &[ArrayView2<f64>]) -> Result<()> {
    let rows = panels.iter().map(|p| p.nrows()).max().unwrap_or(1);
    let cols = panels.iter().map(|p| p.ncols()).max().unwrap_or(1);
    let factor = zoom_factor(rows, cols);
    let gap = 8u32;

    let tile_w = cols as u32 * factor;
    let tile_h = rows as u32 * factor;
    let n = panels.len() as u32;
    let mut canvas = GrayImage::new(n * tile_w + n.saturating_sub(1) * gap, tile_h);
    for (i, panel) in panels.iter().enumerate() {
        let tile = zoomed(&log_stretch(*panel), factor);
        imageops::overlay(&mut canvas, &tile, (i as u32 * (tile_w + gap)) as i64, 0);
    }

    canvas.save(path)?;
    info!("Saved {} panels to {}", panels.len(), path.display());
    Ok(())
}

/// Field overview with the target box and PSF circles
pub fn save_overview_png(
    path: &Path,
    fov: ArrayView2<f64>,
    target: PixelPos,
    target_radius: usize,
    psf_positions: &[PixelPos],
    psf_radius: usize,
) -> Result<()> {
    let rows = fov.nrows() as i32;
    let gray = log_stretch(fov);
    let mut rgb: RgbImage = ImageBuffer::new(gray.width(), gray.height());
    for (x, y, pixel) in rgb.enumerate_pixels_mut() {
        let value = gray.get_pixel(x, y)[0];
        *pixel = Rgb([value, value, value]);
    }

    // Flip to the bottom-up display orientation
    let flip = |p: PixelPos| (p.x as i32, rows - 1 - p.y as i32);

    let side = 2 * target_radius as u32 + 1;
    let (tx, ty) = flip(target);
    draw_hollow_rect_mut(
        &mut rgb,
        Rect::at(tx - target_radius as i32, ty - target_radius as i32).of_size(side, side),
        TARGET_COLOR,
    );

    for &psf in psf_positions {
        draw_hollow_circle_mut(&mut rgb, flip(psf), psf_radius.max(3) as i32, PSF_COLOR);
    }

    rgb.save(path)?;
    info!(
        "Saved overview with target {} and {} PSF(s) to {}",
        target,
        psf_positions.len(),
        path.display()
    );
    Ok(())
}

/// log10 profile curves against radius; the first curve is the target
pub fn save_profiles_png(path: &Path, profiles: &[Vec<f64>]) -> Result<()> {
    let (width, height, pad) = (640u32, 480u32, 40.0f32);
    let mut rgb: RgbImage = ImageBuffer::from_pixel(width, height, Rgb([0, 0, 0]));

    let logs: Vec<Vec<Option<f32>>> = profiles
        .iter()
        .map(|p| {
            p.iter()
                .map(|&v| (v.is_finite() && v > 0.0).then(|| v.log10() as f32))
                .collect()
        })
        .collect();
    let n_max = profiles.iter().map(|p| p.len()).max().unwrap_or(0);
    let (lo, hi) = logs
        .iter()
        .flatten()
        .flatten()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));

    let plot_w = width as f32 - 2.0 * pad;
    let plot_h = height as f32 - 2.0 * pad;
    let bottom = height as f32 - pad;
    draw_line_segment_mut(&mut rgb, (pad, bottom), (pad + plot_w, bottom), AXIS_COLOR);
    draw_line_segment_mut(&mut rgb, (pad, bottom), (pad, pad), AXIS_COLOR);

    if n_max >= 2 && lo.is_finite() && hi > lo {
        let to_screen = |i: usize, v: f32| {
            let x = pad + plot_w * i as f32 / (n_max - 1) as f32;
            let y = bottom - plot_h * (v - lo) / (hi - lo);
            (x, y)
        };
        for (k, curve) in logs.iter().enumerate() {
            let color = PROFILE_COLORS[k % PROFILE_COLORS.len()];
            for (i, pair) in curve.windows(2).enumerate() {
                if let (Some(a), Some(b)) = (pair[0], pair[1]) {
                    draw_line_segment_mut(&mut rgb, to_screen(i, a), to_screen(i + 1, b), color);
                }
            }
        }
    }

    rgb.save(path)?;
    info!("Saved {} profiles to {}", profiles.len(), path.display());
    Ok(())
}
