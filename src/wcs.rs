//! World coordinate system from FITS header keywords.
//!
//! Supports the gnomonic (TAN) projection used by imaging data, with the
//! linear part given either as a CD matrix, as CDELT with a PC matrix, or as
//! CDELT with CROTA2. SIP distortion terms are ignored. Headers without a
//! celestial CTYPE fall back to a linear mapping with one degree per pixel,
//! which makes the pixel scale read back as the 3600.0 sentinel.
//!
//! Pixel coordinates are 0-based `(x, y)` = (column, row); the FITS
//! reference pixel CRPIX is 1-based.

use nalgebra::{Matrix2, Vector2};
use tracing::debug;

use crate::error::{PrepError, Result};
use crate::fits::FitsHeader;

/// Pixel scale reported when the header carries no usable scale
pub const PIXEL_SCALE_SENTINEL: f64 = 3600.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    Tan,
    Linear,
}

#[derive(Debug, Clone)]
pub struct Wcs {
    pub crpix: [f64; 2],
    pub crval: [f64; 2],
    /// Linear transform from pixel offsets to intermediate world coordinates (degrees)
    pub cd: Matrix2<f64>,
    pub projection: Projection,
}

// TAN projection

/// Forward gnomonic projection of `(ra, dec)` about `(ra0, dec0)`, all in radians.
/// Returns `None` for points on or behind the tangent plane.
fn tan_project(ra: f64, dec: f64, ra0: f64, dec0: f64) -> Option<(f64, f64)> {
    let da = ra - ra0;
    let denom = dec.sin() * dec0.sin() + dec.cos() * dec0.cos() * da.cos();
    if denom <= 1e-12 {
        return None;
    }
    let xi = dec.cos() * da.sin() / denom;
    let eta = (dec.sin() * dec0.cos() - dec.cos() * dec0.sin() * da.cos()) / denom;
    Some((xi, eta))
}

/// Inverse gnomonic projection, all in radians
fn inverse_tan_project(xi: f64, eta: f64, ra0: f64, dec0: f64) -> (f64, f64) {
    let rho = (xi * xi + eta * eta).sqrt();
    if rho < 1e-15 {
        return (ra0, dec0);
    }
    let c = rho.atan();
    let (sin_c, cos_c) = c.sin_cos();
    let dec = (cos_c * dec0.sin() + eta * sin_c * dec0.cos() / rho).asin();
    let ra = ra0 + (xi * sin_c).atan2(rho * dec0.cos() * cos_c - eta * dec0.sin() * sin_c);
    (ra, dec)
}

/// Great-circle separation in degrees
fn angular_separation(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (ra1, dec1) = (a.0.to_radians(), a.1.to_radians());
    let (ra2, dec2) = (b.0.to_radians(), b.1.to_radians());
    let h = ((dec2 - dec1) / 2.0).sin().powi(2)
        + dec1.cos() * dec2.cos() * ((ra2 - ra1) / 2.0).sin().powi(2);
    (2.0 * h.sqrt().min(1.0).asin()).to_degrees()
}

impl Wcs {
    pub fn from_header(header: &FitsHeader) -> Self {
        let ctype1 = header.get("CTYPE1").unwrap_or("");
        let projection = if ctype1.contains("-TAN") {
            Projection::Tan
        } else {
            Projection::Linear
        };

        let crpix = [
            header.get_f64("CRPIX1").unwrap_or(0.0),
            header.get_f64("CRPIX2").unwrap_or(0.0),
        ];
        let crval = [
            header.get_f64("CRVAL1").unwrap_or(0.0),
            header.get_f64("CRVAL2").unwrap_or(0.0),
        ];

        let has_cd = ["CD1_1", "CD1_2", "CD2_1", "CD2_2"]
            .iter()
            .any(|k| header.contains(k));

        let cd = if has_cd {
            Matrix2::new(
                header.get_f64("CD1_1").unwrap_or(0.0),
                header.get_f64("CD1_2").unwrap_or(0.0),
                header.get_f64("CD2_1").unwrap_or(0.0),
                header.get_f64("CD2_2").unwrap_or(0.0),
            )
        } else {
            let cdelt1 = header.get_f64("CDELT1").unwrap_or(1.0);
            let cdelt2 = header.get_f64("CDELT2").unwrap_or(1.0);
            let has_pc = ["PC1_1", "PC1_2", "PC2_1", "PC2_2"]
                .iter()
                .any(|k| header.contains(k));
            let pc = if has_pc {
                Matrix2::new(
                    header.get_f64("PC1_1").unwrap_or(1.0),
                    header.get_f64("PC1_2").unwrap_or(0.0),
                    header.get_f64("PC2_1").unwrap_or(0.0),
                    header.get_f64("PC2_2").unwrap_or(1.0),
                )
            } else {
                let rot = header.get_f64("CROTA2").unwrap_or(0.0).to_radians();
                let (s, c) = rot.sin_cos();
                // CROTA2 convention expressed as a PC matrix
                Matrix2::new(c, -s * cdelt2 / cdelt1, s * cdelt1 / cdelt2, c)
            };
            Matrix2::from_diagonal(&Vector2::new(cdelt1, cdelt2)) * pc
        };

        debug!(
            "WCS: projection={:?} crpix={:?} crval={:?} cd={:?}",
            projection, crpix, crval, cd
        );

        Self {
            crpix,
            crval,
            cd,
            projection,
        }
    }

    /// Sky coordinates in degrees to 0-based pixel coordinates
    pub fn world_to_pixel(&self, ra: f64, dec: f64) -> Result<(f64, f64)> {
        let intermediate = match self.projection {
            Projection::Tan => {
                let (xi, eta) = tan_project(
                    ra.to_radians(),
                    dec.to_radians(),
                    self.crval[0].to_radians(),
                    self.crval[1].to_radians(),
                )
                .ok_or_else(|| {
                    PrepError::invalid_argument(format!(
                        "sky position ({}, {}) is not on the image's tangent plane",
                        ra, dec
                    ))
                })?;
                Vector2::new(xi.to_degrees(), eta.to_degrees())
            }
            Projection::Linear => Vector2::new(ra - self.crval[0], dec - self.crval[1]),
        };

        let inv = self.cd.try_inverse().ok_or_else(|| {
            PrepError::invalid_argument("header WCS has a singular CD matrix")
        })?;
        let offset = inv * intermediate;
        Ok((
            offset[0] + self.crpix[0] - 1.0,
            offset[1] + self.crpix[1] - 1.0,
        ))
    }

    /// 0-based pixel coordinates to sky coordinates in degrees
    pub fn pixel_to_world(&self, x: f64, y: f64) -> (f64, f64) {
        let offset = Vector2::new(x - (self.crpix[0] - 1.0), y - (self.crpix[1] - 1.0));
        let intermediate = self.cd * offset;
        match self.projection {
            Projection::Tan => {
                let (ra, dec) = inverse_tan_project(
                    intermediate[0].to_radians(),
                    intermediate[1].to_radians(),
                    self.crval[0].to_radians(),
                    self.crval[1].to_radians(),
                );
                (ra.to_degrees().rem_euclid(360.0), dec.to_degrees())
            }
            Projection::Linear => (
                intermediate[0] + self.crval[0],
                intermediate[1] + self.crval[1],
            ),
        }
    }

    /// Size of one pixel step along the y axis at the reference pixel, in
    /// arcseconds
    pub fn pixel_scale(&self) -> f64 {
        let (x0, y0) = (self.crpix[0] - 1.0, self.crpix[1] - 1.0);
        let a = self.pixel_to_world(x0, y0);
        let b = self.pixel_to_world(x0, y0 + 1.0);
        let degrees = match self.projection {
            Projection::Tan => angular_separation(a, b),
            Projection::Linear => ((b.0 - a.0).powi(2) + (b.1 - a.1).powi(2)).sqrt(),
        };
        degrees * 3600.0
    }
}

/// Pixel scale in arcsec/pixel; 3600.0 signals that the header had none
pub fn read_pixel_scale(header: &FitsHeader) -> f64 {
    Wcs::from_header(header).pixel_scale()
}
