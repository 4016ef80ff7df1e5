/// Stamp cutouts around positions in a field image
use ndarray::{s, Array2, ArrayView2};

use crate::error::{PrepError, Result};
use crate::fitting::fit_gaussian_centroid;

/// Integer pixel position; `x` is the column and `y` the row
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PixelPos {
    pub x: i64,
    pub y: i64,
}

impl PixelPos {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }

    /// Round a fractional position to the nearest pixel
    pub fn round(x: f64, y: f64) -> Result<Self> {
        if !x.is_finite() || !y.is_finite() {
            return Err(PrepError::invalid_argument(format!(
                "pixel position ({}, {}) is not finite",
                x, y
            )));
        }
        Ok(Self {
            x: x.round() as i64,
            y: y.round() as i64,
        })
    }
}

impl std::fmt::Display for PixelPos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// How to re-centre a cutout before cutting it
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CenterKernel {
    /// Peak of a 2D Gaussian fit to the central region
    Gaussian,
    /// Brightest pixel of the central region
    Brightest,
}

impl std::str::FromStr for CenterKernel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gaussian" | "center_gaussian" => Ok(CenterKernel::Gaussian),
            "bright" | "brightest" | "center_bright" => Ok(CenterKernel::Brightest),
            _ => Err(format!("Unknown center kernel: {}", s)),
        }
    }
}

/// Row/column window of a cutout, clipped to the image
fn window(
    dim: (usize, usize),
    center: PixelPos,
    radius: usize,
) -> Option<(usize, usize, usize, usize)> {
    let (rows, cols) = dim;
    let r = radius as i64;
    let row_lo = (center.y - r).max(0);
    let row_hi = (center.y + r).min(rows as i64 - 1);
    let col_lo = (center.x - r).max(0);
    let col_hi = (center.x + r).min(cols as i64 - 1);

    if row_lo > row_hi || col_lo > col_hi {
        return None;
    }
    Some((row_lo as usize, row_hi as usize, col_lo as usize, col_hi as usize))
}

/// Cut a `(2*radius+1)` square stamp centred on `center`.
///
/// Windows that run off the image are trimmed, so stamps near the border
/// come back smaller and possibly non-square.
pub fn cutout(image: ArrayView2<f64>, center: PixelPos, radius: usize) -> Result<Array2<f64>> {
    let (row_lo, row_hi, col_lo, col_hi) = window(image.dim(), center, radius).ok_or_else(|| {
        PrepError::invalid_argument(format!(
            "cutout at {} with radius {} lies outside the {}x{} image",
            center,
            radius,
            image.ncols(),
            image.nrows()
        ))
    })?;

    Ok(image
        .slice(s![row_lo..=row_hi, col_lo..=col_hi])
        .to_owned())
}

/// Cut a stamp after re-centring on the source near `center`.
///
/// The refined centre is searched in the inner part of the stamp (the
/// outer 40% of each side is ignored). Returns the stamp and the centre it
/// was cut at.
pub fn cut_center_auto(
    image: ArrayView2<f64>,
    center: PixelPos,
    kernel: CenterKernel,
    radius: usize,
) -> Result<(Array2<f64>, PixelPos)> {
    let size = 2 * radius + 1;
    let margin = (size as f64 / 2.5) as usize;
    let half = radius.saturating_sub(margin).max(1).min(radius.max(1));

    let (row_lo, row_hi, col_lo, col_hi) = window(image.dim(), center, half).ok_or_else(|| {
        PrepError::invalid_argument(format!("centre {} lies outside the image", center))
    })?;
    let search = image.slice(s![row_lo..=row_hi, col_lo..=col_hi]);

    let local = match kernel {
        CenterKernel::Gaussian => fit_gaussian_centroid(search)
            .and_then(|(x, y)| PixelPos::round(x, y).ok())
            .or_else(|| brightest_pixel(search)),
        CenterKernel::Brightest => brightest_pixel(search),
    };

    let refined = match local {
        Some(p) => PixelPos::new(col_lo as i64 + p.x, row_lo as i64 + p.y),
        None => center,
    };

    let stamp = cutout(image, refined, radius)?;
    Ok((stamp, refined))
}

/// Position of the brightest finite pixel, in stamp coordinates
pub fn brightest_pixel(stamp: ArrayView2<f64>) -> Option<PixelPos> {
    stamp
        .indexed_iter()
        .filter(|(_, v)| v.is_finite())
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|((r, c), _)| PixelPos::new(c as i64, r as i64))
}

/// Pixels of the four border rows/columns of a stamp
pub fn edge_pixels(stamp: ArrayView2<f64>) -> Vec<f64> {
    let (rows, cols) = stamp.dim();
    if rows == 0 || cols == 0 {
        return Vec::new();
    }

    let mut edge = Vec::with_capacity(2 * (rows + cols));
    edge.extend(stamp.row(0).iter().copied());
    edge.extend(stamp.row(rows - 1).iter().copied());
    edge.extend(stamp.column(0).iter().copied());
    edge.extend(stamp.column(cols - 1).iter().copied());
    edge
}

/// Trim the longer axis of a stamp symmetrically towards a square.
///
/// The cut on each side is half the size difference, rounded toward zero,
/// so an odd difference leaves the stamp one pixel short of square.
pub fn trim_to_square(stamp: ArrayView2<f64>) -> Array2<f64> {
    let (rows, cols) = stamp.dim();
    let cut = (rows as i64 - cols as i64) / 2;
    if cut > 0 {
        let cut = cut as usize;
        stamp.slice(s![cut..rows - cut, ..]).to_owned()
    } else if cut < 0 {
        let cut = (-cut) as usize;
        stamp.slice(s![.., cut..cols - cut]).to_owned()
    } else {
        stamp.to_owned()
    }
}
