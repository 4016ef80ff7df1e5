//! Background estimation
//!
//! A mesh estimator in the SExtractor style: the image is split into
//! `box_size` cells, each cell's sigma-clipped level is estimated, the
//! mesh is median filtered and then interpolated back to full resolution.

use bumpalo::Bump;
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::detection::label_components;
use crate::error::{PrepError, Result};
use crate::stats::{median_arena, sigma_clipped_stats};

/// Parameters for the mesh background estimator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundParams {
    /// Side of one mesh cell in pixels
    pub box_size: usize,
    /// Median filter width over the mesh, in cells
    pub filter_size: usize,
    /// Clipping threshold for per-cell statistics
    pub clip_sigma: f64,
}

impl Default for BackgroundParams {
    fn default() -> Self {
        Self {
            box_size: 50,
            filter_size: 3,
            clip_sigma: 3.0,
        }
    }
}

/// Full-resolution background level and rms
#[derive(Debug, Clone)]
pub struct BackgroundMap {
    pub level: Array2<f64>,
    pub rms: Array2<f64>,
    /// Median of the mesh levels
    pub global_level: f64,
    /// Median of the mesh rms values
    pub global_rms: f64,
}

/// SExtractor mode estimate; falls back to the median for crowded cells
fn mode_estimate(mean: f64, median: f64, std_dev: f64) -> f64 {
    if std_dev > 0.0 && (mean - median).abs() / std_dev > 0.3 {
        median
    } else {
        2.5 * median - 1.5 * mean
    }
}

/// Median filter over a small mesh, ignoring NaN cells
fn median_filter(mesh: &Array2<f64>, size: usize, arena: &Bump) -> Array2<f64> {
    if size <= 1 {
        return mesh.clone();
    }
    let half = (size / 2) as isize;
    let (ny, nx) = mesh.dim();
    let mut window = Vec::with_capacity(size * size);

    Array2::from_shape_fn((ny, nx), |(i, j)| {
        window.clear();
        for di in -half..=half {
            for dj in -half..=half {
                let ii = i as isize + di;
                let jj = j as isize + dj;
                if ii >= 0 && jj >= 0 && (ii as usize) < ny && (jj as usize) < nx {
                    window.push(mesh[[ii as usize, jj as usize]]);
                }
            }
        }
        median_arena(arena, &window)
    })
}

/// Fractional mesh coordinate of a pixel, clamped to the mesh
fn mesh_coord(pixel: usize, box_size: usize, cells: usize) -> (usize, usize, f64) {
    let f = ((pixel as f64 + 0.5) / box_size as f64 - 0.5).clamp(0.0, (cells - 1) as f64);
    let i0 = f.floor() as usize;
    let i1 = (i0 + 1).min(cells - 1);
    (i0, i1, f - i0 as f64)
}

fn interpolate(mesh: &Array2<f64>, dim: (usize, usize), box_size: usize) -> Array2<f64> {
    let (ny, nx) = mesh.dim();
    Array2::from_shape_fn(dim, |(r, c)| {
        let (r0, r1, tr) = mesh_coord(r, box_size, ny);
        let (c0, c1, tc) = mesh_coord(c, box_size, nx);
        let top = mesh[[r0, c0]] * (1.0 - tc) + mesh[[r0, c1]] * tc;
        let bottom = mesh[[r1, c0]] * (1.0 - tc) + mesh[[r1, c1]] * tc;
        top * (1.0 - tr) + bottom * tr
    })
}

/// Estimate the 2D background of an image
pub fn measure_bkg(image: ArrayView2<f64>, params: &BackgroundParams) -> Result<BackgroundMap> {
    let (rows, cols) = image.dim();
    if rows == 0 || cols == 0 {
        return Err(PrepError::invalid_argument(
            "cannot measure the background of an empty image",
        ));
    }

    let box_size = params.box_size.max(1).min(rows.max(cols));
    let ny = rows.div_ceil(box_size);
    let nx = cols.div_ceil(box_size);

    let mut levels = Array2::from_elem((ny, nx), f64::NAN);
    let mut rms = Array2::from_elem((ny, nx), f64::NAN);
    let mut cell = Vec::with_capacity(box_size * box_size);

    for i in 0..ny {
        for j in 0..nx {
            cell.clear();
            let r_end = ((i + 1) * box_size).min(rows);
            let c_end = ((j + 1) * box_size).min(cols);
            for r in i * box_size..r_end {
                for c in j * box_size..c_end {
                    let v = image[[r, c]];
                    if v.is_finite() {
                        cell.push(v);
                    }
                }
            }
            if cell.is_empty() {
                continue;
            }
            let stats = sigma_clipped_stats(&cell, params.clip_sigma, 5);
            levels[[i, j]] = mode_estimate(stats.mean, stats.median, stats.std_dev);
            rms[[i, j]] = stats.std_dev;
        }
    }

    let arena = Bump::new();
    let global_level = median_arena(&arena, levels.as_slice().unwrap_or(&[]));
    let global_rms = median_arena(&arena, rms.as_slice().unwrap_or(&[]));
    levels.mapv_inplace(|v| if v.is_finite() { v } else { global_level });
    rms.mapv_inplace(|v| if v.is_finite() { v } else { global_rms });

    let levels = median_filter(&levels, params.filter_size, &arena);
    let rms = median_filter(&rms, params.filter_size, &arena);

    debug!(
        "Background mesh {}x{} (box {}): level {:.4}, rms {:.4}",
        nx, ny, box_size, global_level, global_rms
    );

    Ok(BackgroundMap {
        level: interpolate(&levels, (rows, cols), box_size),
        rms: interpolate(&rms, (rows, cols), box_size),
        global_level,
        global_rms,
    })
}

/// Standard deviation of the background in a stamp.
///
/// Sources brighter than the clipped median + 2σ (at least 5 connected
/// pixels, grown by two pixels) are excluded before the final clipped
/// statistics are taken.
pub fn estimate_background_std(stamp: ArrayView2<f64>) -> f64 {
    let values: Vec<f64> = stamp.iter().copied().filter(|v| v.is_finite()).collect();
    let first = sigma_clipped_stats(&values, 3.0, 5);
    let threshold = first.median + 2.0 * first.std_dev;

    let above = stamp.mapv(|v| v.is_finite() && v > threshold);
    let (rows, cols) = stamp.dim();
    let mut source = Array2::from_elem((rows, cols), false);
    for component in label_components(above.view(), 5) {
        for (r, c) in component {
            let (r0, r1) = (r.saturating_sub(2), (r + 2).min(rows - 1));
            let (c0, c1) = (c.saturating_sub(2), (c + 2).min(cols - 1));
            for rr in r0..=r1 {
                for cc in c0..=c1 {
                    source[[rr, cc]] = true;
                }
            }
        }
    }

    let background: Vec<f64> = stamp
        .iter()
        .zip(source.iter())
        .filter(|(v, masked)| !**masked && v.is_finite())
        .map(|(v, _)| *v)
        .collect();
    if background.len() < 10 {
        return first.std_dev;
    }
    sigma_clipped_stats(&background, 3.0, 5).std_dev
}
