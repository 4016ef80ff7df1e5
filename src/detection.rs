//! Source detection on stamps and fields
//!
//! Objects are found by thresholding above the sigma-clipped background and
//! grouping the surviving pixels into 8-connected components. Each component
//! is described by the ellipse of its flux-weighted second moments.

use std::collections::VecDeque;

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cutout::PixelPos;
use crate::stats::sigma_clipped_stats;

/// Parameters for object detection in a stamp
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionParams {
    /// Detection threshold above the background, in background sigmas
    pub nsigma: f64,
    /// Minimum number of connected pixels for an object
    pub npixels: usize,
    /// Scale applied to the moment ellipse to form the aperture
    pub aperture_scale: f64,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            nsigma: 2.8,
            npixels: 15,
            aperture_scale: 3.0,
        }
    }
}

/// Parameters for the local-maximum search over a field
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeakParams {
    pub nsigma: f64,
    /// Side of the square neighbourhood a peak must dominate
    pub box_size: usize,
    /// Peaks closer than this to the border are dropped
    pub edge_margin: usize,
}

impl Default for PeakParams {
    fn default() -> Self {
        Self {
            nsigma: 5.0,
            box_size: 5,
            edge_margin: 10,
        }
    }
}

/// Elliptical aperture around a detected object; `x` is the column
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EllipticalAperture {
    pub x: f64,
    pub y: f64,
    /// Semi-major axis in pixels
    pub a: f64,
    /// Semi-minor axis in pixels
    pub b: f64,
    /// Angle of the major axis from the x axis, radians
    pub theta: f64,
    /// Pixels in the detected segment
    pub area: usize,
    /// Background-subtracted flux of the segment
    pub flux: f64,
}

impl EllipticalAperture {
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let (s, c) = self.theta.sin_cos();
        let dx = x - self.x;
        let dy = y - self.y;
        let u = dx * c + dy * s;
        let v = -dx * s + dy * c;
        (u / self.a).powi(2) + (v / self.b).powi(2) <= 1.0
    }
}

/// 8-connected components of the `true` pixels with at least `min_pixels`
/// members. Pixels are `(row, col)`.
pub fn label_components(mask: ArrayView2<bool>, min_pixels: usize) -> Vec<Vec<(usize, usize)>> {
    let (rows, cols) = mask.dim();
    let mut visited = Array2::from_elem((rows, cols), false);
    let mut components = Vec::new();

    for r in 0..rows {
        for c in 0..cols {
            if !mask[[r, c]] || visited[[r, c]] {
                continue;
            }

            let mut pixels = Vec::new();
            let mut queue = VecDeque::new();
            queue.push_back((r, c));
            visited[[r, c]] = true;

            while let Some((cr, cc)) = queue.pop_front() {
                pixels.push((cr, cc));
                for dr in -1i64..=1 {
                    for dc in -1i64..=1 {
                        if dr == 0 && dc == 0 {
                            continue;
                        }
                        let nr = cr as i64 + dr;
                        let nc = cc as i64 + dc;
                        if nr < 0 || nc < 0 || nr >= rows as i64 || nc >= cols as i64 {
                            continue;
                        }
                        let (nr, nc) = (nr as usize, nc as usize);
                        if mask[[nr, nc]] && !visited[[nr, nc]] {
                            visited[[nr, nc]] = true;
                            queue.push_back((nr, nc));
                        }
                    }
                }
            }

            if pixels.len() >= min_pixels {
                components.push(pixels);
            }
        }
    }

    components
}

fn moment_ellipse(
    stamp: ArrayView2<f64>,
    pixels: &[(usize, usize)],
    floor: f64,
    scale: f64,
) -> Option<EllipticalAperture> {
    let mut sum = 0.0;
    let mut sx = 0.0;
    let mut sy = 0.0;
    for &(r, c) in pixels {
        let w = (stamp[[r, c]] - floor).max(0.0);
        sum += w;
        sx += w * c as f64;
        sy += w * r as f64;
    }
    if sum <= 0.0 {
        return None;
    }
    let (x, y) = (sx / sum, sy / sum);

    let (mut cxx, mut cyy, mut cxy) = (0.0, 0.0, 0.0);
    for &(r, c) in pixels {
        let w = (stamp[[r, c]] - floor).max(0.0);
        let dx = c as f64 - x;
        let dy = r as f64 - y;
        cxx += w * dx * dx;
        cyy += w * dy * dy;
        cxy += w * dx * dy;
    }
    cxx /= sum;
    cyy /= sum;
    cxy /= sum;

    let half_trace = (cxx + cyy) / 2.0;
    let disc = (((cxx - cyy) / 2.0).powi(2) + cxy * cxy).sqrt();
    // Single-pixel and line segments still get a usable aperture
    let a = (half_trace + disc).max(0.0).sqrt().max(0.5);
    let b = (half_trace - disc).max(0.0).sqrt().max(0.5);
    let theta = 0.5 * (2.0 * cxy).atan2(cxx - cyy);

    Some(EllipticalAperture {
        x,
        y,
        a: a * scale,
        b: b * scale,
        theta,
        area: pixels.len(),
        flux: sum,
    })
}

/// Detect objects in a stamp.
///
/// Apertures come back sorted by distance from the stamp centre, so index 0
/// is the object the stamp was cut around.
pub fn detect_objects(stamp: ArrayView2<f64>, params: &DetectionParams) -> Vec<EllipticalAperture> {
    let (rows, cols) = stamp.dim();
    let values: Vec<f64> = stamp.iter().copied().filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        return Vec::new();
    }

    let stats = sigma_clipped_stats(&values, 3.0, 5);
    let threshold = stats.median + params.nsigma * stats.std_dev;
    let above = stamp.mapv(|v| v.is_finite() && v > threshold);

    let components = label_components(above.view(), params.npixels.max(1));
    let mut apertures: Vec<EllipticalAperture> = components
        .iter()
        .filter_map(|pixels| moment_ellipse(stamp, pixels, stats.median, params.aperture_scale))
        .collect();

    let cx = (cols as f64 - 1.0) / 2.0;
    let cy = (rows as f64 - 1.0) / 2.0;
    apertures.sort_by(|p, q| {
        let dp = (p.x - cx).powi(2) + (p.y - cy).powi(2);
        let dq = (q.x - cx).powi(2) + (q.y - cy).powi(2);
        dp.total_cmp(&dq)
    });

    info!(
        "Detected {} objects above {:.3} ({:.1} sigma)",
        apertures.len(),
        threshold,
        params.nsigma
    );
    for (i, ap) in apertures.iter().enumerate() {
        debug!(
            "  obj {}: ({:.1}, {:.1}) a={:.1} b={:.1} theta={:.2} area={} flux={:.1}",
            i, ap.x, ap.y, ap.a, ap.b, ap.theta, ap.area, ap.flux
        );
    }

    apertures
}

/// One mask per aperture: 0 inside the ellipse, 1 elsewhere
pub fn mask_objects(stamp: ArrayView2<f64>, apertures: &[EllipticalAperture]) -> Vec<Array2<f64>> {
    let dim = stamp.dim();
    apertures
        .iter()
        .map(|ap| {
            Array2::from_shape_fn(dim, |(r, c)| {
                if ap.contains(c as f64, r as f64) {
                    0.0
                } else {
                    1.0
                }
            })
        })
        .collect()
}

/// Local intensity maxima above the clipped median + `nsigma`σ.
///
/// A pixel qualifies when no other pixel in its `box_size` neighbourhood is
/// brighter; on plateaus the first pixel in scan order wins. Peaks are
/// returned brightest first.
pub fn search_local_max(image: ArrayView2<f64>, params: &PeakParams) -> Vec<PixelPos> {
    let (rows, cols) = image.dim();
    let values: Vec<f64> = image.iter().copied().filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        return Vec::new();
    }
    let stats = sigma_clipped_stats(&values, 3.0, 5);
    let threshold = stats.median + params.nsigma * stats.std_dev;
    let half = (params.box_size / 2).max(1) as i64;
    let margin = params.edge_margin as i64;

    let mut peaks: Vec<(PixelPos, f64)> = Vec::new();
    for r in 0..rows as i64 {
        if r < margin || r >= rows as i64 - margin {
            continue;
        }
        for c in 0..cols as i64 {
            if c < margin || c >= cols as i64 - margin {
                continue;
            }
            let v = image[[r as usize, c as usize]];
            if !v.is_finite() || v <= threshold {
                continue;
            }

            let mut is_peak = true;
            'scan: for nr in (r - half).max(0)..=(r + half).min(rows as i64 - 1) {
                for nc in (c - half).max(0)..=(c + half).min(cols as i64 - 1) {
                    if nr == r && nc == c {
                        continue;
                    }
                    let n = image[[nr as usize, nc as usize]];
                    let earlier = (nr, nc) < (r, c);
                    if n > v || (earlier && n == v) {
                        is_peak = false;
                        break 'scan;
                    }
                }
            }
            if is_peak {
                peaks.push((PixelPos::new(c, r), v));
            }
        }
    }

    peaks.sort_by(|a, b| b.1.total_cmp(&a.1));
    info!(
        "Found {} local maxima above {:.3} ({:.1} sigma)",
        peaks.len(),
        threshold,
        params.nsigma
    );
    peaks.into_iter().map(|(p, _)| p).collect()
}
