//! Tunable parameters for a preparation run
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::background::BackgroundParams;
use crate::detection::{DetectionParams, PeakParams};
use crate::error::Result;
use crate::toolkit::StandardToolkit;

/// Candidate cutout radii tried in order when no radius is given
pub const DEFAULT_RADIUS_LIST: [usize; 7] = [30, 35, 40, 45, 50, 60, 70];

/// Zero-point used when the caller does not supply one
pub const DEFAULT_ZERO_POINT: f64 = 27.0;

/// Adaptive radius search for the target cutout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadiusParams {
    pub radius_list: Vec<usize>,
    /// Accept a radius once this fraction of edge pixels or fewer are outliers
    pub edge_fraction: f64,
    /// Edge pixels above mean + `edge_sigma`·σ count as outliers
    pub edge_sigma: f64,
}

impl Default for RadiusParams {
    fn default() -> Self {
        Self {
            radius_list: DEFAULT_RADIUS_LIST.to_vec(),
            edge_fraction: 0.03,
            edge_sigma: 2.0,
        }
    }
}

/// Filters for PSF candidates found in the field
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PsfSearchParams {
    pub radius: usize,
    /// Maximum std/mean of a candidate's FWHM measurements
    pub max_fwhm_spread: f64,
    /// Candidates wider than this multiple of the median FWHM are dropped
    pub fwhm_median_factor: f64,
    pub min_flux_ratio: f64,
    pub max_flux_ratio: f64,
}

impl Default for PsfSearchParams {
    fn default() -> Self {
        Self {
            radius: 50,
            max_fwhm_spread: 0.1,
            fwhm_median_factor: 1.5,
            min_flux_ratio: 0.5,
            max_flux_ratio: 10.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrepConfig {
    pub background: BackgroundParams,
    pub detection: DetectionParams,
    pub peaks: PeakParams,
    pub radius: RadiusParams,
    pub psf: PsfSearchParams,
}

impl PrepConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn toolkit(&self) -> StandardToolkit {
        StandardToolkit::new(self.background, self.detection, self.peaks)
    }
}
