//! Light-profile measurements on stamps
use ndarray::{s, ArrayView2};
use tracing::debug;

use crate::cutout::{brightest_pixel, edge_pixels};
use crate::fitting::fit_profile_fwhm;
use crate::stats::median;

/// Profile directions as (row step, column step)
const DIRECTIONS: [(i64, i64); 4] = [(0, 1), (1, 0), (1, 1), (1, -1)];

/// FWHM along the horizontal, vertical and both diagonal cuts through the
/// brightest pixel of the central half of `stamp`.
///
/// Each cut spans `radius` pixels either side of the peak and is fitted
/// with a Gaussian after removing the stamp's edge median. Cuts that cannot
/// be fitted are reported as NaN, so the result always has four entries.
pub fn measure_fwhm(stamp: ArrayView2<f64>, radius: usize) -> Vec<f64> {
    let (rows, cols) = stamp.dim();
    if rows < 4 || cols < 4 || radius < 2 {
        return vec![f64::NAN; DIRECTIONS.len()];
    }

    let (r_lo, c_lo) = (rows / 4, cols / 4);
    let central = stamp.slice(s![r_lo..rows - r_lo, c_lo..cols - c_lo]);
    let Some(peak) = brightest_pixel(central) else {
        return vec![f64::NAN; DIRECTIONS.len()];
    };
    let (r0, c0) = (peak.y + r_lo as i64, peak.x + c_lo as i64);
    let pedestal = median(&edge_pixels(stamp));

    let fwhms: Vec<f64> = DIRECTIONS
        .iter()
        .map(|&(dr, dc)| {
            let step = ((dr * dr + dc * dc) as f64).sqrt();
            let mut offsets = Vec::with_capacity(2 * radius + 1);
            let mut values = Vec::with_capacity(2 * radius + 1);
            for t in -(radius as i64)..=radius as i64 {
                let r = r0 + t * dr;
                let c = c0 + t * dc;
                if r < 0 || c < 0 || r >= rows as i64 || c >= cols as i64 {
                    continue;
                }
                let v = stamp[[r as usize, c as usize]];
                if v.is_finite() {
                    offsets.push(t as f64 * step);
                    values.push(v - pedestal);
                }
            }
            fit_profile_fwhm(&offsets, &values).unwrap_or(f64::NAN)
        })
        .collect();

    debug!("FWHM at ({}, {}): {:?}", c0, r0, fwhms);
    fwhms
}

/// Azimuthally averaged profile around the stamp centre in 1-pixel annuli
/// out to `max_radius`. Empty annuli are NaN.
pub fn radial_profile(stamp: ArrayView2<f64>, max_radius: usize) -> Vec<f64> {
    let (rows, cols) = stamp.dim();
    let cx = (cols as f64 - 1.0) / 2.0;
    let cy = (rows as f64 - 1.0) / 2.0;

    let mut sums = vec![0.0; max_radius + 1];
    let mut counts = vec![0usize; max_radius + 1];
    for ((r, c), &v) in stamp.indexed_iter() {
        if !v.is_finite() {
            continue;
        }
        let d = ((c as f64 - cx).powi(2) + (r as f64 - cy).powi(2)).sqrt();
        let bin = d.round() as usize;
        if bin <= max_radius {
            sums[bin] += v;
            counts[bin] += 1;
        }
    }

    sums.iter()
        .zip(&counts)
        .map(|(s, &n)| if n == 0 { f64::NAN } else { s / n as f64 })
        .collect()
}
