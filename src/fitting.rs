/// Least-squares model fitting
/// Levenberg-Marquardt over small analytic models: a 1D Gaussian used for
/// pixel-value distributions and light profiles, and an axis-aligned 2D
/// Gaussian used to refine source centres.
use nalgebra::{DMatrix, DVector};
use ndarray::ArrayView2;

use crate::error::{PrepError, Result};
use crate::stats::sigma_clipped_stats;

/// FWHM / sigma for a Gaussian profile
pub const GAUSSIAN_FWHM_FACTOR: f64 = 2.354_820_045_030_949;

/// Trait for fit models
pub trait Model {
    /// Evaluate the model at (x, y); 1D models ignore `y`
    fn value(&self, x: f64, y: f64, params: &[f64]) -> f64;

    /// Partial derivatives of the model with respect to each parameter
    fn gradient(&self, x: f64, y: f64, params: &[f64], grad: &mut [f64]);
}

/// 1D Gaussian without offset. Parameters: [A, mu, sigma]
pub struct Gaussian1D;

impl Model for Gaussian1D {
    fn value(&self, x: f64, _y: f64, params: &[f64]) -> f64 {
        let a = params[0];
        let mu = params[1];
        let sigma = params[2];
        let arg = -(x - mu).powi(2) / (2.0 * sigma * sigma);
        a * arg.exp()
    }

    fn gradient(&self, x: f64, _y: f64, params: &[f64], grad: &mut [f64]) {
        let a = params[0];
        let mu = params[1];
        let sigma = params[2];
        let dx = x - mu;
        let s2 = sigma * sigma;
        let e = (-dx * dx / (2.0 * s2)).exp();

        grad[0] = e;
        grad[1] = a * e * dx / s2;
        grad[2] = a * e * dx * dx / (s2 * sigma);
    }
}

/// Axis-aligned 2D Gaussian on a constant background.
/// Parameters: [A, B, x0, y0, sigma_x, sigma_y]
pub struct Gaussian2D;

impl Model for Gaussian2D {
    fn value(&self, x: f64, y: f64, params: &[f64]) -> f64 {
        let a = params[0];
        let b = params[1];
        let dx = x - params[2];
        let dy = y - params[3];
        let sx = params[4];
        let sy = params[5];
        let arg = -(dx * dx / (2.0 * sx * sx) + dy * dy / (2.0 * sy * sy));
        b + a * arg.exp()
    }

    fn gradient(&self, x: f64, y: f64, params: &[f64], grad: &mut [f64]) {
        let a = params[0];
        let dx = x - params[2];
        let dy = y - params[3];
        let sx = params[4];
        let sy = params[5];
        let sx2 = sx * sx;
        let sy2 = sy * sy;
        let e = (-(dx * dx / (2.0 * sx2) + dy * dy / (2.0 * sy2))).exp();

        grad[0] = e;
        grad[1] = 1.0;
        grad[2] = a * e * dx / sx2;
        grad[3] = a * e * dy / sy2;
        grad[4] = a * e * dx * dx / (sx2 * sx);
        grad[5] = a * e * dy * dy / (sy2 * sy);
    }
}

/// Simple Levenberg-Marquardt optimizer with box constraints
pub struct LevenbergMarquardt {
    max_iterations: usize,
    tolerance: f64,
    lambda: f64,
    lambda_factor: f64,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-9,
            lambda: 0.01,
            lambda_factor: 10.0,
        }
    }
}

impl LevenbergMarquardt {
    fn sum_squares(
        model: &dyn Model,
        points: &[(f64, f64)],
        values: &[f64],
        params: &[f64],
    ) -> f64 {
        points
            .iter()
            .zip(values)
            .map(|(&(x, y), observed)| (observed - model.value(x, y, params)).powi(2))
            .sum()
    }

    /// Fit `model` to the samples, returning the best parameters found
    pub fn fit(
        &mut self,
        model: &dyn Model,
        points: &[(f64, f64)],
        values: &[f64],
        initial_params: &[f64],
        lower_bounds: &[f64],
        upper_bounds: &[f64],
    ) -> Result<Vec<f64>> {
        let n_params = initial_params.len();
        let n_points = points.len();

        if n_points < n_params {
            return Err(PrepError::invalid_argument(
                "not enough data points for fitting",
            ));
        }

        let mut params = initial_params.to_vec();
        let mut jacobian = DMatrix::<f64>::zeros(n_points, n_params);
        let mut residuals = DVector::<f64>::zeros(n_points);
        let mut gradient = vec![0.0; n_params];

        for _iter in 0..self.max_iterations {
            let mut current_error = 0.0;
            for (i, (&(x, y), observed)) in points.iter().zip(values).enumerate() {
                let residual = observed - model.value(x, y, &params);
                residuals[i] = residual;
                current_error += residual * residual;

                model.gradient(x, y, &params, &mut gradient);
                for (j, &grad) in gradient.iter().enumerate() {
                    jacobian[(i, j)] = grad;
                }
            }

            if current_error < self.tolerance {
                break;
            }

            let jt = jacobian.transpose();
            let jtj = &jt * &jacobian;
            let jtr = &jt * &residuals;

            // Inner loop: raise lambda until a step lowers the error
            let improvement = loop {
                let mut h = jtj.clone();
                for i in 0..n_params {
                    h[(i, i)] += self.lambda * (1.0 + jtj[(i, i)]);
                }

                let step = h.lu().solve(&jtr).map(|delta| {
                    (0..n_params)
                        .map(|i| {
                            (params[i] + delta[i])
                                .max(lower_bounds[i])
                                .min(upper_bounds[i])
                        })
                        .collect::<Vec<_>>()
                });

                if let Some(new_params) = step {
                    let new_error = Self::sum_squares(model, points, values, &new_params);
                    if new_error.is_finite() && new_error < current_error {
                        params = new_params;
                        self.lambda = (self.lambda / self.lambda_factor).max(1e-12);
                        break Some(current_error - new_error);
                    }
                }

                self.lambda *= self.lambda_factor;
                if self.lambda > 1e10 {
                    break None;
                }
            };

            match improvement {
                Some(delta) if delta / current_error.max(f64::MIN_POSITIVE) > self.tolerance => {}
                _ => break,
            }
        }

        Ok(params)
    }
}

/// Fit a Gaussian to the distribution of a 1D sample.
///
/// Returns `(mean, sigma)`. The sample is histogrammed within five
/// clipped standard deviations of its clipped mean and a Gaussian is fit
/// to the histogram, so a minority of bright outliers does not widen the
/// result. Falls back to the clipped moments when the fit is unusable.
pub fn fit_gaussian_1d(sample: &[f64]) -> (f64, f64) {
    let seed = sigma_clipped_stats(sample, 3.0, 5);
    if seed.count < 10 || seed.std_dev <= 0.0 {
        return (seed.mean, seed.std_dev);
    }

    let lo = seed.mean - 5.0 * seed.std_dev;
    let hi = seed.mean + 5.0 * seed.std_dev;
    let n_bins = ((seed.count as f64).sqrt() as usize).clamp(10, 50);
    let bin_width = (hi - lo) / n_bins as f64;

    let mut counts = vec![0.0; n_bins];
    for &v in sample.iter().filter(|v| v.is_finite()) {
        if v >= lo && v < hi {
            let bin = (((v - lo) / bin_width) as usize).min(n_bins - 1);
            counts[bin] += 1.0;
        }
    }

    let points: Vec<(f64, f64)> = (0..n_bins)
        .map(|i| (lo + (i as f64 + 0.5) * bin_width, 0.0))
        .collect();
    let peak = counts.iter().cloned().fold(0.0, f64::max);

    let initial = [peak, seed.mean, seed.std_dev];
    let lower = [0.0, lo, bin_width * 0.1];
    let upper = [peak * 3.0 + 1.0, hi, hi - lo];

    match LevenbergMarquardt::default().fit(&Gaussian1D, &points, &counts, &initial, &lower, &upper)
    {
        Ok(p) if p[2].is_finite() && p[2] > 0.0 && p[1] > lo && p[1] < hi => (p[1], p[2]),
        _ => (seed.mean, seed.std_dev),
    }
}

/// Fit a Gaussian to a light profile sampled at `offsets` and return its FWHM.
pub fn fit_profile_fwhm(offsets: &[f64], values: &[f64]) -> Option<f64> {
    if offsets.len() < 4 || offsets.len() != values.len() {
        return None;
    }

    let (peak_idx, peak) = values
        .iter()
        .cloned()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(&b.1))?;
    if peak <= 0.0 {
        return None;
    }

    // Initial width from the half-maximum crossing
    let half = peak / 2.0;
    let above = values.iter().filter(|v| **v >= half).count().max(1);
    let spacing = (offsets[offsets.len() - 1] - offsets[0]).abs() / (offsets.len() - 1) as f64;
    let sigma0 = (above as f64 * spacing / GAUSSIAN_FWHM_FACTOR).max(0.3);
    let span = (offsets[offsets.len() - 1] - offsets[0]).abs();

    let points: Vec<(f64, f64)> = offsets.iter().map(|&x| (x, 0.0)).collect();
    let initial = [peak, offsets[peak_idx], sigma0];
    let lower = [0.0, offsets[0].min(offsets[offsets.len() - 1]), 0.05];
    let upper = [peak * 3.0, offsets[0].max(offsets[offsets.len() - 1]), span.max(1.0)];

    let params = LevenbergMarquardt::default()
        .fit(&Gaussian1D, &points, values, &initial, &lower, &upper)
        .ok()?;

    let fwhm = params[2].abs() * GAUSSIAN_FWHM_FACTOR;
    fwhm.is_finite().then_some(fwhm)
}

/// Fit an axis-aligned 2D Gaussian to a stamp and return the peak as
/// `(x, y)` in stamp coordinates, or `None` when the fit leaves the stamp.
pub fn fit_gaussian_centroid(stamp: ArrayView2<f64>) -> Option<(f64, f64)> {
    let (rows, cols) = stamp.dim();
    if rows < 3 || cols < 3 {
        return None;
    }

    let mut points = Vec::with_capacity(rows * cols);
    let mut values = Vec::with_capacity(rows * cols);
    let mut peak = (0usize, 0usize, f64::NEG_INFINITY);
    let mut floor = f64::INFINITY;
    for ((r, c), &v) in stamp.indexed_iter() {
        if !v.is_finite() {
            continue;
        }
        points.push((c as f64, r as f64));
        values.push(v);
        if v > peak.2 {
            peak = (r, c, v);
        }
        floor = floor.min(v);
    }
    if points.len() < 6 || peak.2 <= floor {
        return None;
    }

    let amplitude = peak.2 - floor;
    let initial = [amplitude, floor, peak.1 as f64, peak.0 as f64, 1.5, 1.5];
    let lower = [0.0, floor - amplitude, -0.5, -0.5, 0.3, 0.3];
    let upper = [
        amplitude * 3.0,
        peak.2,
        cols as f64 - 0.5,
        rows as f64 - 0.5,
        cols.max(rows) as f64,
        cols.max(rows) as f64,
    ];

    let params = LevenbergMarquardt::default()
        .fit(&Gaussian2D, &points, &values, &initial, &lower, &upper)
        .ok()?;

    let (x0, y0) = (params[2], params[3]);
    let inside = x0 >= 0.0 && y0 >= 0.0 && x0 <= (cols - 1) as f64 && y0 <= (rows - 1) as f64;
    (inside && x0.is_finite() && y0.is_finite()).then_some((x0, y0))
}
