//! Numeric collaborators used by the preparation session
//!
//! Every measurement the session needs goes through [`Toolkit`], whose
//! default methods call the implementations in this crate. Tests and
//! callers with their own measurement code override individual methods.

use ndarray::{Array2, ArrayView2};

use crate::background::{estimate_background_std, measure_bkg, BackgroundParams};
use crate::cutout::{self, CenterKernel, PixelPos};
use crate::detection::{self, DetectionParams, EllipticalAperture, PeakParams};
use crate::error::Result;
use crate::fits::FitsHeader;
use crate::fitting;
use crate::profile;
use crate::wcs::{read_pixel_scale, Wcs};

pub trait Toolkit {
    fn background_params(&self) -> BackgroundParams {
        BackgroundParams::default()
    }

    fn detection_params(&self) -> DetectionParams {
        DetectionParams::default()
    }

    fn peak_params(&self) -> PeakParams {
        PeakParams::default()
    }

    /// Background level map with the image's shape
    fn background(&self, image: ArrayView2<f64>) -> Result<Array2<f64>> {
        Ok(measure_bkg(image, &self.background_params())?.level)
    }

    /// Sky position in degrees to 0-based pixel coordinates
    fn world_to_pixel(&self, header: &FitsHeader, ra: f64, dec: f64) -> Result<(f64, f64)> {
        Wcs::from_header(header).world_to_pixel(ra, dec)
    }

    /// Pixel scale in arcsec; 3600.0 when the header has none
    fn pixel_scale(&self, header: &FitsHeader) -> f64 {
        read_pixel_scale(header)
    }

    fn cutout(
        &self,
        image: ArrayView2<f64>,
        center: PixelPos,
        radius: usize,
    ) -> Result<Array2<f64>> {
        cutout::cutout(image, center, radius)
    }

    fn cut_center_auto(
        &self,
        image: ArrayView2<f64>,
        center: PixelPos,
        kernel: CenterKernel,
        radius: usize,
    ) -> Result<(Array2<f64>, PixelPos)> {
        cutout::cut_center_auto(image, center, kernel, radius)
    }

    /// `(mean, sigma)` of a Gaussian fitted to the sample's distribution
    fn fit_gaussian_1d(&self, sample: &[f64]) -> (f64, f64) {
        fitting::fit_gaussian_1d(sample)
    }

    fn background_std(&self, stamp: ArrayView2<f64>) -> f64 {
        estimate_background_std(stamp)
    }

    fn detect_objects(&self, stamp: ArrayView2<f64>) -> Vec<EllipticalAperture> {
        detection::detect_objects(stamp, &self.detection_params())
    }

    fn mask_objects(
        &self,
        stamp: ArrayView2<f64>,
        apertures: &[EllipticalAperture],
    ) -> Vec<Array2<f64>> {
        detection::mask_objects(stamp, apertures)
    }

    fn search_local_max(&self, image: ArrayView2<f64>) -> Vec<PixelPos> {
        detection::search_local_max(image, &self.peak_params())
    }

    fn measure_fwhm(&self, stamp: ArrayView2<f64>, radius: usize) -> Vec<f64> {
        profile::measure_fwhm(stamp, radius)
    }
}

/// Built-in collaborators with configurable parameters
#[derive(Debug, Clone, Default)]
pub struct StandardToolkit {
    pub background: BackgroundParams,
    pub detection: DetectionParams,
    pub peaks: PeakParams,
}

impl StandardToolkit {
    pub fn new(
        background: BackgroundParams,
        detection: DetectionParams,
        peaks: PeakParams,
    ) -> Self {
        Self {
            background,
            detection,
            peaks,
        }
    }
}

impl Toolkit for StandardToolkit {
    fn background_params(&self) -> BackgroundParams {
        self.background
    }

    fn detection_params(&self) -> DetectionParams {
        self.detection
    }

    fn peak_params(&self) -> PeakParams {
        self.peaks
    }
}
