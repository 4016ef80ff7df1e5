/// Robust statistics used by the background, detection and fitting code.
use bumpalo::Bump;

/// Summary of a sigma-clipped sample
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct ClippedStats {
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    /// Number of samples that survived clipping
    pub count: usize,
}

/// Arithmetic mean of the finite values, 0.0 for an empty sample
pub fn mean(values: &[f64]) -> f64 {
    let (sum, n) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(s, n), &v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

/// Population standard deviation around `mean`
pub fn std_dev(values: &[f64], mean: f64) -> f64 {
    let (sum_sq, n) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(s, n), &v| (s + (v - mean).powi(2), n + 1));
    if n == 0 {
        0.0
    } else {
        (sum_sq / n as f64).sqrt()
    }
}

/// Median of the finite values, 0.0 for an empty sample
pub fn median(values: &[f64]) -> f64 {
    let arena = Bump::new();
    median_arena(&arena, values)
}

/// Median using an arena for the temporary sorted copy
pub fn median_arena(arena: &Bump, values: &[f64]) -> f64 {
    let mut sorted = bumpalo::collections::Vec::with_capacity_in(values.len(), arena);
    sorted.extend(values.iter().copied().filter(|v| v.is_finite()));
    if sorted.is_empty() {
        return 0.0;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));

    if sorted.len() % 2 == 0 {
        let mid = sorted.len() / 2;
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[sorted.len() / 2]
    }
}

/// Iterative sigma clipping around the median.
///
/// Values further than `sigma` standard deviations from the median are
/// rejected until the sample stops shrinking or `max_iters` is reached.
pub fn sigma_clipped_stats(values: &[f64], sigma: f64, max_iters: usize) -> ClippedStats {
    let arena = Bump::new();
    let mut kept = bumpalo::collections::Vec::with_capacity_in(values.len(), &arena);
    kept.extend(values.iter().copied().filter(|v| v.is_finite()));

    for _ in 0..max_iters {
        if kept.len() < 3 {
            break;
        }
        let med = median_arena(&arena, &kept);
        let m = mean(&kept);
        let sd = std_dev(&kept, m);
        if sd == 0.0 {
            break;
        }
        let before = kept.len();
        kept.retain(|v| (*v - med).abs() <= sigma * sd);
        if kept.len() == before {
            break;
        }
    }

    let m = mean(&kept);
    ClippedStats {
        mean: m,
        median: median_arena(&arena, &kept),
        std_dev: std_dev(&kept, m),
        count: kept.len(),
    }
}
