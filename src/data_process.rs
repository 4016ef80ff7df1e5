//! Preparation session for one target in a field-of-view image.
//!
//! A [`DataProcess`] turns a FOV image and a target position into the
//! materials a profile-fitting stage consumes: a target stamp, its noise
//! map, a keep-mask for contaminating objects and one or more PSF stamps.
//! Fields are filled in by successive calls and [`DataProcess::checkout`]
//! reports whether everything needed for fitting is present.

use std::path::{Path, PathBuf};

use ndarray::{Array2, ArrayView2, Zip};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{PsfSearchParams, RadiusParams, DEFAULT_ZERO_POINT};
use crate::cutout::{edge_pixels, trim_to_square, CenterKernel, PixelPos};
use crate::detection::EllipticalAperture;
use crate::error::{PrepError, Result};
use crate::fits::{write_image, FitsHeader};
use crate::plot;
use crate::profile::radial_profile;
use crate::selection::{IndexSelector, NoSelection};
use crate::stats::{mean, median, std_dev};
use crate::toolkit::{StandardToolkit, Toolkit};
use crate::wcs::PIXEL_SCALE_SENTINEL;

/// Exposure time in seconds, either one value or a per-pixel map
#[derive(Debug, Clone, PartialEq)]
pub enum ExposureTime {
    Scalar(f64),
    Map(Array2<f64>),
}

/// How positions handed to the session are expressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionType {
    /// 0-based `(x, y)` pixel coordinates
    #[default]
    Pixel,
    /// `(ra, dec)` in degrees, converted through the header WCS
    Wcs,
}

impl std::str::FromStr for PositionType {
    type Err = PrepError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pixel" => Ok(PositionType::Pixel),
            "wcs" => Ok(PositionType::Wcs),
            _ => Err(PrepError::invalid_argument(format!(
                "position type should be either 'pixel' or 'wcs', got '{}'",
                s
            ))),
        }
    }
}

/// Progress of a session.
///
/// The stage records what has been produced so far; it does not gate the
/// operations. Each operation checks its own inputs: materials and PSF
/// search need the FOV image, and [`DataProcess::fitting_materials`]
/// requires `Checked`. A PSF search may therefore run straight from
/// `Initialized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Stage {
    Initialized,
    MaterialsGenerated,
    PsfFound,
    Checked,
}

/// Everything needed to open a session
#[derive(Debug, Clone, Default)]
pub struct SessionInput {
    pub fov_image: Option<Array2<f64>>,
    pub target_pos: Option<(f64, f64)>,
    pub pos_type: PositionType,
    pub header: Option<FitsHeader>,
    pub exptime: Option<ExposureTime>,
    pub fov_noise_map: Option<Array2<f64>>,
    /// Subtract the estimated background from the FOV image
    pub rm_bkglight: bool,
    pub zp: Option<f64>,
    /// Diagnostic PNGs are written here when set
    pub plot_dir: Option<PathBuf>,
}

/// Options for [`DataProcess::generate_target_materials`]
#[derive(Debug, Clone, Default)]
pub struct MaterialsOptions {
    /// Re-centre the cutout on the target with this kernel
    pub cut_kernel: Option<CenterKernel>,
    pub radius: Option<usize>,
    /// Overrides the configured candidate radii
    pub radius_list: Option<Vec<usize>>,
    pub bkg_std: Option<f64>,
    /// Ask the selector which detected objects to mask
    pub create_mask: bool,
}

/// Options for [`DataProcess::find_psf`]
#[derive(Debug, Clone, Default)]
pub struct PsfOptions {
    /// Stamp radius; the configured default when `None`
    pub radius: Option<usize>,
    /// Use these positions instead of searching the field
    pub positions: Option<Vec<(f64, f64)>>,
    pub pos_type: PositionType,
    /// Ask the selector which candidates to keep instead of taking the sharpest
    pub interactive: bool,
}

/// A field source that passed the PSF consistency checks
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PsfCandidate {
    pub position: PixelPos,
    /// Per-direction FWHM in pixels
    pub fwhms: Vec<f64>,
    pub fwhm: f64,
    pub flux: f64,
}

/// Result of [`DataProcess::checkout`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CheckoutReport {
    /// Names of required fields that are absent
    pub missing: Vec<String>,
    /// Fields that are present but inconsistent
    pub inconsistent: Vec<String>,
    /// The selected PSF was trimmed to a square and renormalised
    pub psf_trimmed: bool,
}

impl CheckoutReport {
    pub fn problem_count(&self) -> usize {
        self.missing.len() + self.inconsistent.len()
    }

    pub fn is_ready(&self) -> bool {
        self.problem_count() == 0
    }
}

/// Borrowed view of the materials handed to a fitting stage
#[derive(Debug)]
pub struct FittingMaterials<'a> {
    pub target_stamp: &'a Array2<f64>,
    pub noise_map: &'a Array2<f64>,
    pub target_mask: &'a Array2<f64>,
    pub psf: &'a Array2<f64>,
    pub pixel_scale: f64,
    pub zp: f64,
}

impl FittingMaterials<'_> {
    /// Write the four stamps as FITS files into `dir`
    pub fn write_fits(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)?;
        let keywords = [("PIXSCALE", self.pixel_scale), ("ZP", self.zp)];

        let mut written = Vec::with_capacity(4);
        for (name, data) in [
            ("target_stamp.fits", self.target_stamp),
            ("noise_map.fits", self.noise_map),
            ("target_mask.fits", self.target_mask),
            ("psf.fits", self.psf),
        ] {
            let path = dir.join(name);
            write_image(&path, data, &keywords)?;
            written.push(path);
        }
        info!("Wrote fitting materials to {}", dir.display());
        Ok(written)
    }
}

pub struct DataProcess {
    toolkit: Box<dyn Toolkit>,
    selector: Box<dyn IndexSelector>,
    stage: Stage,
    radius_params: RadiusParams,
    psf_params: PsfSearchParams,

    pub fov_image: Option<Array2<f64>>,
    pub target_pos: PixelPos,
    pub header: Option<FitsHeader>,
    pub exptime: Option<ExposureTime>,
    pub fov_noise_map: Option<Array2<f64>>,
    /// Arcsec per pixel; only known when a header was supplied
    pub pixel_scale: Option<f64>,
    pub zp: f64,
    pub plot_dir: Option<PathBuf>,

    pub target_radius: Option<usize>,
    pub target_stamp: Option<Array2<f64>>,
    pub noise_map: Option<Array2<f64>>,
    pub bkg_std: Option<f64>,
    pub target_mask: Option<Array2<f64>>,
    /// Detected objects that were not masked
    pub apertures: Vec<EllipticalAperture>,

    pub psf_candidates: Vec<PsfCandidate>,
    pub psf_pos_list: Option<Vec<PixelPos>>,
    pub psf_list: Option<Vec<Array2<f64>>>,
    pub psf_radius: Option<usize>,
    /// Index into `psf_list` of the PSF used for fitting
    pub psf_id_for_fitting: Option<usize>,
}

impl std::fmt::Debug for DataProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataProcess")
            .field("stage", &self.stage)
            .field("target_pos", &self.target_pos)
            .field("pixel_scale", &self.pixel_scale)
            .field("zp", &self.zp)
            .field("target_radius", &self.target_radius)
            .field("psf_pos_list", &self.psf_pos_list)
            .field("psf_id_for_fitting", &self.psf_id_for_fitting)
            .finish_non_exhaustive()
    }
}

fn check_dims(name: &str, dim: (usize, usize), expected: (usize, usize)) -> Result<()> {
    if dim != expected {
        return Err(PrepError::invalid_argument(format!(
            "{} has shape {:?} but the FOV image is {:?}",
            name, dim, expected
        )));
    }
    Ok(())
}

impl DataProcess {
    /// Open a session with the built-in measurement toolkit
    pub fn new(input: SessionInput) -> Result<Self> {
        Self::with_toolkit(input, Box::new(StandardToolkit::default()))
    }

    pub fn with_toolkit(input: SessionInput, toolkit: Box<dyn Toolkit>) -> Result<Self> {
        let (x, y) = input
            .target_pos
            .ok_or_else(|| PrepError::invalid_argument("the target position must be assigned"))?;

        let target_pos = match input.pos_type {
            PositionType::Pixel => PixelPos::round(x, y)?,
            PositionType::Wcs => {
                let header = input.header.as_ref().ok_or_else(|| {
                    PrepError::missing_data(
                        "a header with WCS keywords is needed for a 'wcs' position",
                    )
                })?;
                let (px, py) = toolkit.world_to_pixel(header, x, y)?;
                debug!("Target ({}, {}) maps to pixel ({:.2}, {:.2})", x, y, px, py);
                PixelPos::round(px, py)?
            }
        };

        if let Some(ExposureTime::Scalar(t)) = input.exptime {
            if !(t.is_finite() && t > 0.0) {
                return Err(PrepError::invalid_argument(format!(
                    "exposure time must be positive, got {}",
                    t
                )));
            }
        }

        let mut fov_image = input.fov_image;
        if let Some(fov) = fov_image.as_mut() {
            let dim = fov.dim();
            let inside = target_pos.x >= 0
                && target_pos.y >= 0
                && (target_pos.x as usize) < dim.1
                && (target_pos.y as usize) < dim.0;
            if !inside {
                return Err(PrepError::invalid_argument(format!(
                    "target position {} lies outside the {}x{} image",
                    target_pos, dim.1, dim.0
                )));
            }
            if let Some(ExposureTime::Map(map)) = &input.exptime {
                check_dims("exposure time map", map.dim(), dim)?;
            }
            if let Some(noise) = &input.fov_noise_map {
                check_dims("FOV noise map", noise.dim(), dim)?;
            }

            if input.rm_bkglight {
                let bkg = toolkit.background(fov.view())?;
                check_dims("background map", bkg.dim(), dim)?;
                *fov -= &bkg;
                info!(
                    "Removed background light (median level {:.4})",
                    median(bkg.as_slice().unwrap_or(&[]))
                );
            }
        }

        let pixel_scale = input.header.as_ref().map(|h| toolkit.pixel_scale(h));
        if pixel_scale == Some(PIXEL_SCALE_SENTINEL) {
            warn!("Pixel size could not be read from the header");
        }

        let zp = match input.zp {
            Some(zp) => zp,
            None => {
                warn!(
                    "Zero-point not provided, using {:.1} to calculate magnitudes",
                    DEFAULT_ZERO_POINT
                );
                DEFAULT_ZERO_POINT
            }
        };

        info!("Target position {}", target_pos);

        Ok(Self {
            toolkit,
            selector: Box::new(NoSelection),
            stage: Stage::Initialized,
            radius_params: RadiusParams::default(),
            psf_params: PsfSearchParams::default(),
            fov_image,
            target_pos,
            header: input.header,
            exptime: input.exptime,
            fov_noise_map: input.fov_noise_map,
            pixel_scale,
            zp,
            plot_dir: input.plot_dir,
            target_radius: None,
            target_stamp: None,
            noise_map: None,
            bkg_std: None,
            target_mask: None,
            apertures: Vec::new(),
            psf_candidates: Vec::new(),
            psf_pos_list: None,
            psf_list: None,
            psf_radius: None,
            psf_id_for_fitting: Some(0),
        })
    }

    /// Selector consulted for object masking and interactive PSF choice
    pub fn with_selector(mut self, selector: Box<dyn IndexSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_params(mut self, radius: RadiusParams, psf: PsfSearchParams) -> Self {
        self.radius_params = radius;
        self.psf_params = psf;
        self
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    fn fov(&self) -> Result<ArrayView2<'_, f64>> {
        fov_view(&self.fov_image)
    }

    /// Smallest radius in `radius_list` whose cutout border is background
    /// dominated; the last radius when none is.
    ///
    /// A border pixel counts as an outlier above mean + `edge_sigma`·σ of
    /// a Gaussian fitted to the border values.
    pub fn select_radius(&self, radius_list: &[usize]) -> Result<usize> {
        let fov = self.fov()?;
        let last = *radius_list
            .last()
            .ok_or_else(|| PrepError::invalid_argument("the radius list is empty"))?;

        for &radius in radius_list {
            let stamp = self.toolkit.cutout(fov, self.target_pos, radius)?;
            let edge = edge_pixels(stamp.view());
            if edge.is_empty() {
                continue;
            }
            let (gauss_mean, gauss_sigma) = self.toolkit.fit_gaussian_1d(&edge);
            let limit = gauss_mean + self.radius_params.edge_sigma * gauss_sigma;
            let fraction = edge.iter().filter(|&&v| v > limit).count() as f64 / edge.len() as f64;
            debug!(
                "Radius {}: {:.1}% of edge pixels above {:.4}",
                radius,
                fraction * 100.0,
                limit
            );
            if fraction < self.radius_params.edge_fraction {
                return Ok(radius);
            }
        }
        Ok(last)
    }

    fn resolve_exptime(&self) -> Result<ExposureTime> {
        if let Some(exptime) = &self.exptime {
            return Ok(exptime.clone());
        }
        let value = self
            .header
            .as_ref()
            .and_then(|h| h.get_f64("EXPTIME"))
            .ok_or_else(|| {
                PrepError::missing_data(
                    "no exposure time in the header; supply one explicitly",
                )
            })?;
        if !(value.is_finite() && value > 0.0) {
            return Err(PrepError::invalid_argument(format!(
                "header EXPTIME must be positive, got {}",
                value
            )));
        }
        Ok(ExposureTime::Scalar(value))
    }

    /// Cut the target stamp and build its noise map and mask
    pub fn generate_target_materials(&mut self, options: &MaterialsOptions) -> Result<()> {
        let radius = match options.radius {
            Some(r) => r,
            None => {
                let list = options
                    .radius_list
                    .clone()
                    .unwrap_or_else(|| self.radius_params.radius_list.clone());
                self.select_radius(&list)?
            }
        };
        info!("Cutting target at {} with radius {}", self.target_pos, radius);

        let fov = fov_view(&self.fov_image)?;
        let target_stamp = match options.cut_kernel {
            Some(kernel) => {
                let (stamp, center) = self
                    .toolkit
                    .cut_center_auto(fov, self.target_pos, kernel, radius)?;
                if center != self.target_pos {
                    info!("Target re-centred from {} to {}", self.target_pos, center);
                }
                self.target_pos = center;
                stamp
            }
            None => self.toolkit.cutout(fov, self.target_pos, radius)?,
        };

        let noise_map = match &self.fov_noise_map {
            Some(fov_noise) => self.toolkit.cutout(fov_noise.view(), self.target_pos, radius)?,
            None => {
                let bkg_std = match options.bkg_std {
                    Some(s) => s,
                    None => {
                        let larger = self.toolkit.cutout(fov, self.target_pos, radius * 2)?;
                        self.toolkit.background_std(larger.view())
                    }
                };
                debug!("Background std {:.5}", bkg_std);
                self.bkg_std = Some(bkg_std);

                let exptime_stamp = match self.resolve_exptime()? {
                    ExposureTime::Scalar(t) => Array2::from_elem(target_stamp.dim(), t),
                    ExposureTime::Map(map) => {
                        self.toolkit.cutout(map.view(), self.target_pos, radius)?
                    }
                };
                if exptime_stamp.dim() != target_stamp.dim() {
                    return Err(PrepError::invalid_state(format!(
                        "exposure time stamp {:?} does not match target stamp {:?}",
                        exptime_stamp.dim(),
                        target_stamp.dim()
                    )));
                }

                let variance_floor = bkg_std * bkg_std;
                Zip::from(&target_stamp)
                    .and(&exptime_stamp)
                    .map_collect(|&v, &t| ((v / t).abs() + variance_floor).sqrt())
            }
        };
        if noise_map.dim() != target_stamp.dim() {
            return Err(PrepError::invalid_state(format!(
                "noise map {:?} does not match target stamp {:?}",
                noise_map.dim(),
                target_stamp.dim()
            )));
        }

        let mut target_mask = Array2::<f64>::ones(target_stamp.dim());
        let mut apertures = self.toolkit.detect_objects(target_stamp.view());
        if options.create_mask {
            let lines: Vec<String> = apertures
                .iter()
                .map(|ap| {
                    format!(
                        "({:.1}, {:.1}) a={:.1} b={:.1} area={} flux={:.1}",
                        ap.x, ap.y, ap.a, ap.b, ap.area, ap.flux
                    )
                })
                .collect();
            let chosen = self.selector.select(
                "Input the indices of the objects to mask, separated by spaces:",
                &lines,
            )?;
            let chosen = valid_indices(chosen, apertures.len(), "object");

            let (masked, kept): (Vec<_>, Vec<_>) = apertures
                .into_iter()
                .enumerate()
                .partition(|(i, _)| chosen.contains(i));
            let masked: Vec<EllipticalAperture> = masked.into_iter().map(|(_, ap)| ap).collect();
            apertures = kept.into_iter().map(|(_, ap)| ap).collect();

            for mask in self.toolkit.mask_objects(target_stamp.view(), &masked) {
                if mask.dim() != target_mask.dim() {
                    return Err(PrepError::invalid_state(format!(
                        "object mask {:?} does not match target stamp {:?}",
                        mask.dim(),
                        target_mask.dim()
                    )));
                }
                target_mask *= &mask;
            }
            info!("Masked {} object(s)", masked.len());
        }

        if let Some(dir) = &self.plot_dir {
            let masked_stamp = &target_stamp * &target_mask;
            plot::save_panels_png(
                &dir.join("target_materials.png"),
                &[target_stamp.view(), noise_map.view(), masked_stamp.view()],
            )?;
        }

        info!(
            "Target materials ready: stamp {}x{}, {} unmasked object(s)",
            target_stamp.ncols(),
            target_stamp.nrows(),
            apertures.len()
        );

        self.target_radius = Some(radius);
        self.target_stamp = Some(target_stamp);
        self.noise_map = Some(noise_map);
        self.target_mask = Some(target_mask);
        self.apertures = apertures;
        self.stage = match self.stage {
            Stage::Initialized => Stage::MaterialsGenerated,
            Stage::Checked => Stage::PsfFound,
            other => other,
        };
        Ok(())
    }

    /// Consistency-checked PSF candidates from the field's local maxima
    fn search_psf_candidates(&self, fov: ArrayView2<f64>, radius: usize) -> Vec<PsfCandidate> {
        let params = self.psf_params;
        let mut candidates = Vec::new();

        for position in self.toolkit.search_local_max(fov) {
            let cut = self
                .toolkit
                .cut_center_auto(fov, position, CenterKernel::Brightest, radius);
            let stamp = match cut {
                Ok((stamp, _)) => stamp,
                Err(e) => {
                    debug!("Skipping candidate {}: {}", position, e);
                    continue;
                }
            };
            let fwhms = self.toolkit.measure_fwhm(stamp.view(), radius / 5);
            if fwhms.is_empty() || fwhms.iter().any(|f| !f.is_finite()) {
                debug!("Skipping candidate {}: FWHM not measurable", position);
                continue;
            }
            let fwhm = mean(&fwhms);
            let spread = std_dev(&fwhms, fwhm) / fwhm;
            if !spread.is_finite() || spread >= params.max_fwhm_spread {
                debug!("Skipping candidate {}: FWHM spread {:.3}", position, spread);
                continue;
            }
            candidates.push(PsfCandidate {
                position,
                fwhms,
                fwhm,
                flux: stamp.sum(),
            });
        }

        let median_fwhm = median(&candidates.iter().map(|c| c.fwhm).collect::<Vec<_>>());
        let target_flux = self.target_stamp.as_ref().map(|s| s.sum());
        candidates.retain(|c| {
            let sharp = c.fwhm < median_fwhm * params.fwhm_median_factor;
            let comparable = match target_flux {
                Some(t) => c.flux < t * params.max_flux_ratio && c.flux > t * params.min_flux_ratio,
                None => true,
            };
            sharp && comparable
        });
        candidates
    }

    /// Locate PSF stars and cut their stamps
    pub fn find_psf(&mut self, options: &PsfOptions) -> Result<()> {
        let radius = options.radius.unwrap_or(self.psf_params.radius);
        let fov = fov_view(&self.fov_image)?;

        let positions = match &options.positions {
            None => {
                let candidates = self.search_psf_candidates(fov, radius);
                info!("{} PSF candidate(s) passed the FWHM and flux checks", candidates.len());
                if candidates.is_empty() {
                    return Err(PrepError::missing_data("no usable PSF candidates in the field"));
                }

                let positions: Vec<PixelPos> = if options.interactive {
                    let mut lines = Vec::with_capacity(candidates.len());
                    for (i, c) in candidates.iter().enumerate() {
                        let (stamp, _) = self.toolkit.cut_center_auto(
                            fov,
                            c.position,
                            CenterKernel::Gaussian,
                            radius,
                        )?;
                        lines.push(format!(
                            "PSF location {} FWHMs {:?} flux {:.1}",
                            c.position,
                            c.fwhms
                                .iter()
                                .map(|f| (f * 1000.0).round() / 1000.0)
                                .collect::<Vec<_>>(),
                            c.flux
                        ));
                        if let Some(dir) = &self.plot_dir {
                            let path = dir.join(format!("psf_candidate_{}.png", i));
                            plot::save_stamp_png(&path, stamp.view())?;
                        }
                    }
                    let chosen = self.selector.select(
                        "Input the indices of the PSFs to use, separated by spaces:",
                        &lines,
                    )?;
                    valid_indices(chosen, candidates.len(), "PSF candidate")
                        .into_iter()
                        .map(|i| candidates[i].position)
                        .collect()
                } else {
                    let best = candidates
                        .iter()
                        .min_by(|a, b| a.fwhm.total_cmp(&b.fwhm))
                        .map(|c| c.position);
                    best.into_iter().collect()
                };
                self.psf_candidates = candidates;
                positions
            }
            Some(given) => match options.pos_type {
                PositionType::Pixel => given
                    .iter()
                    .map(|&(x, y)| PixelPos::round(x, y))
                    .collect::<Result<Vec<_>>>()?,
                PositionType::Wcs => {
                    let header = self.header.as_ref().ok_or_else(|| {
                        PrepError::missing_data(
                            "a header with WCS keywords is needed for 'wcs' PSF positions",
                        )
                    })?;
                    given
                        .iter()
                        .map(|&(ra, dec)| {
                            let (x, y) = self.toolkit.world_to_pixel(header, ra, dec)?;
                            PixelPos::round(x, y)
                        })
                        .collect::<Result<Vec<_>>>()?
                }
            },
        };

        if positions.is_empty() {
            warn!("No PSF selected");
        }

        let psf_list = positions
            .iter()
            .map(|&p| {
                self.toolkit
                    .cut_center_auto(fov, p, CenterKernel::Gaussian, radius)
                    .map(|(stamp, _)| stamp)
            })
            .collect::<Result<Vec<_>>>()?;

        for p in &positions {
            info!("PSF at {}", p);
        }
        self.psf_pos_list = Some(positions);
        self.psf_list = Some(psf_list);
        self.psf_radius = Some(radius);
        self.stage = Stage::PsfFound;
        Ok(())
    }

    /// Radial profiles of the target stamp followed by every PSF stamp,
    /// each normalised to its central value. A chart is written to
    /// `plot_path` when given.
    pub fn profiles_compare(&self, plot_path: Option<&Path>) -> Result<Vec<Vec<f64>>> {
        let target = self
            .target_stamp
            .as_ref()
            .ok_or_else(|| PrepError::invalid_state("profiles need a target stamp"))?;
        let psfs = self
            .psf_list
            .as_ref()
            .ok_or_else(|| PrepError::invalid_state("profiles need a PSF list"))?;

        let profiles: Vec<Vec<f64>> = std::iter::once(target)
            .chain(psfs.iter())
            .map(|stamp| {
                let max_radius = stamp.nrows().min(stamp.ncols()) / 2;
                let mut profile = radial_profile(stamp.view(), max_radius);
                if let Some(&center) = profile.first() {
                    if center.is_finite() && center != 0.0 {
                        profile.iter_mut().for_each(|v| *v /= center);
                    }
                }
                profile
            })
            .collect();

        if let Some(path) = plot_path {
            plot::save_profiles_png(path, &profiles)?;
        }
        Ok(profiles)
    }

    /// Write the FOV image with the target and PSF positions marked
    pub fn plot_overview(&self, path: &Path) -> Result<()> {
        let fov = self.fov()?;
        let target_radius = self
            .target_radius
            .or_else(|| self.radius_params.radius_list.first().copied())
            .unwrap_or(0);
        let psf_positions = self.psf_pos_list.as_deref().unwrap_or(&[]);
        let psf_radius = self.psf_radius.unwrap_or(self.psf_params.radius);
        plot::save_overview_png(
            path,
            fov,
            self.target_pos,
            target_radius,
            psf_positions,
            psf_radius,
        )
    }

    /// Check that the session holds everything a fitting stage needs.
    ///
    /// A non-square selected PSF is trimmed along its longer axis and
    /// renormalised to unit sum first; that is the only failure. Absent
    /// fields are reported, not raised.
    pub fn checkout(&mut self) -> Result<CheckoutReport> {
        let mut report = CheckoutReport::default();

        if let (Some(list), Some(id)) = (self.psf_list.as_mut(), self.psf_id_for_fitting) {
            if let Some(psf) = list.get_mut(id) {
                if !psf.is_empty() && psf.nrows() != psf.ncols() {
                    warn!(
                        "PSF is {}x{}, trimming it to a square",
                        psf.ncols(),
                        psf.nrows()
                    );
                    let mut trimmed = trim_to_square(psf.view());
                    let total = trimmed.sum();
                    if total.is_finite() && total != 0.0 {
                        trimmed /= total;
                    }
                    *psf = trimmed;
                    report.psf_trimmed = true;
                    if psf.nrows() != psf.ncols() {
                        return Err(PrepError::invalid_state(format!(
                            "PSF shape {}x{} is not a square after trimming",
                            psf.ncols(),
                            psf.nrows()
                        )));
                    }
                }
            }
        }

        let psf_id_valid = match (&self.psf_list, self.psf_id_for_fitting) {
            (Some(list), Some(id)) => id < list.len(),
            _ => false,
        };
        let present = [
            ("pixel_scale", self.pixel_scale.is_some()),
            ("target_stamp", self.target_stamp.is_some()),
            ("noise_map", self.noise_map.is_some()),
            ("target_mask", self.target_mask.is_some()),
            ("psf_list", self.psf_list.is_some()),
            ("psf_id_for_fitting", psf_id_valid),
        ];
        for (name, ok) in present {
            if !ok {
                warn!("The keyword of {} is missing", name);
                report.missing.push(name.to_string());
            }
        }

        if let Some(stamp) = &self.target_stamp {
            let others = [
                ("noise_map", &self.noise_map),
                ("target_mask", &self.target_mask),
            ];
            for (name, other) in others {
                if let Some(other) = other {
                    if other.dim() != stamp.dim() {
                        warn!(
                            "{} shape {:?} differs from the target stamp {:?}",
                            name,
                            other.dim(),
                            stamp.dim()
                        );
                        report.inconsistent.push(name.to_string());
                    }
                }
            }
        }

        if report.is_ready() {
            info!("The session is ready to be passed to fitting");
            self.stage = Stage::Checked;
        } else {
            warn!("{} problem(s) found", report.problem_count());
        }
        Ok(report)
    }

    /// Magnitude of the unmasked target flux
    pub fn target_magnitude(&self) -> Result<f64> {
        let (stamp, mask) = match (&self.target_stamp, &self.target_mask) {
            (Some(s), Some(m)) => (s, m),
            _ => return Err(PrepError::invalid_state("target materials have not been generated")),
        };
        let flux = (stamp * mask).sum();
        if flux.is_nan() || flux <= 0.0 {
            return Err(PrepError::invalid_state(format!(
                "target flux {} is not positive",
                flux
            )));
        }
        Ok(-2.5 * flux.log10() + self.zp)
    }

    /// Materials for fitting; available once checkout has passed
    pub fn fitting_materials(&self) -> Result<FittingMaterials<'_>> {
        if self.stage != Stage::Checked {
            return Err(PrepError::invalid_state(
                "checkout has not passed for this session",
            ));
        }
        let missing = || PrepError::invalid_state("session changed after checkout");
        let psf = self
            .psf_list
            .as_ref()
            .zip(self.psf_id_for_fitting)
            .and_then(|(list, id)| list.get(id))
            .ok_or_else(missing)?;
        Ok(FittingMaterials {
            target_stamp: self.target_stamp.as_ref().ok_or_else(missing)?,
            noise_map: self.noise_map.as_ref().ok_or_else(missing)?,
            target_mask: self.target_mask.as_ref().ok_or_else(missing)?,
            psf,
            pixel_scale: self.pixel_scale.ok_or_else(missing)?,
            zp: self.zp,
        })
    }
}

fn fov_view(fov_image: &Option<Array2<f64>>) -> Result<ArrayView2<'_, f64>> {
    fov_image
        .as_ref()
        .map(|f| f.view())
        .ok_or_else(|| PrepError::invalid_state("no FOV image was supplied to the session"))
}

/// In-range, de-duplicated indices in the order given
fn valid_indices(chosen: Vec<usize>, len: usize, what: &str) -> Vec<usize> {
    let mut valid = Vec::with_capacity(chosen.len());
    for i in chosen {
        if i >= len {
            warn!("Ignoring {} index {}: only {} available", what, i, len);
        } else if !valid.contains(&i) {
            valid.push(i);
        }
    }
    valid
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::FixedSelection;
    use crate::test_synthetic::SyntheticField;
    use crate::wcs::Wcs;
    use approx::assert_relative_eq;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn tan_header() -> FitsHeader {
        let mut h = FitsHeader::new();
        h.insert("CTYPE1", "RA---TAN");
        h.insert("CTYPE2", "DEC--TAN");
        h.insert("CRPIX1", 101.0);
        h.insert("CRPIX2", 81.0);
        h.insert("CRVAL1", 34.5);
        h.insert("CRVAL2", -5.1);
        h.insert("CDELT1", -0.168 / 3600.0);
        h.insert("CDELT2", 0.168 / 3600.0);
        h
    }

    fn pixel_session(x: f64, y: f64) -> SessionInput {
        SessionInput {
            target_pos: Some((x, y)),
            zp: Some(25.0),
            ..Default::default()
        }
    }

    /// A session with every field checkout looks at
    fn populated(psf: Array2<f64>) -> DataProcess {
        let mut dp = DataProcess::new(SessionInput {
            header: Some(tan_header()),
            ..pixel_session(5.0, 5.0)
        })
        .unwrap();
        dp.target_stamp = Some(Array2::ones((11, 11)));
        dp.noise_map = Some(Array2::ones((11, 11)));
        dp.target_mask = Some(Array2::ones((11, 11)));
        dp.psf_list = Some(vec![psf]);
        dp
    }

    /// Edge-fit stub: every border is treated as N(0, 1)
    struct UnitEdgeFit;

    impl Toolkit for UnitEdgeFit {
        fn fit_gaussian_1d(&self, _sample: &[f64]) -> (f64, f64) {
            (0.0, 1.0)
        }
    }

    /// Records the shape of every stamp handed to the background-std
    /// estimate and answers with a fixed value
    struct RecordingBkgStd {
        seen: Rc<RefCell<Vec<(usize, usize)>>>,
        value: f64,
    }

    impl Toolkit for RecordingBkgStd {
        fn background_std(&self, stamp: ArrayView2<f64>) -> f64 {
            self.seen.borrow_mut().push(stamp.dim());
            self.value
        }
    }

    /// Detects one object but returns masks of the wrong shape
    struct MisshapenMasks;

    impl Toolkit for MisshapenMasks {
        fn detect_objects(&self, _stamp: ArrayView2<f64>) -> Vec<EllipticalAperture> {
            vec![EllipticalAperture {
                x: 5.0,
                y: 5.0,
                a: 2.0,
                b: 2.0,
                theta: 0.0,
                area: 12,
                flux: 100.0,
            }]
        }

        fn mask_objects(
            &self,
            _stamp: ArrayView2<f64>,
            apertures: &[EllipticalAperture],
        ) -> Vec<Array2<f64>> {
            apertures.iter().map(|_| Array2::zeros((3, 3))).collect()
        }
    }

    #[test]
    fn test_pixel_position_rounded() {
        let dp = DataProcess::new(pixel_session(10.4, 20.6)).unwrap();
        assert_eq!(dp.target_pos, PixelPos::new(10, 21));
        assert_eq!(dp.stage(), Stage::Initialized);
        assert_eq!(dp.psf_id_for_fitting, Some(0));
        assert_eq!(dp.zp, 25.0);
    }

    #[test]
    fn test_wcs_position_uses_header_transform() {
        let header = tan_header();
        let (ra, dec) = Wcs::from_header(&header).pixel_to_world(120.0, 64.0);

        let dp = DataProcess::new(SessionInput {
            target_pos: Some((ra, dec)),
            pos_type: PositionType::Wcs,
            header: Some(header),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(dp.target_pos, PixelPos::new(120, 64));
        assert_relative_eq!(dp.pixel_scale.unwrap(), 0.168, epsilon = 1e-9);
    }

    #[test]
    fn test_unknown_position_type_rejected() {
        for bad in ["galactic", "", "pix"] {
            let err = bad.parse::<PositionType>().unwrap_err();
            assert!(matches!(err, PrepError::InvalidArgument(_)));
        }
        assert_eq!("WCS".parse::<PositionType>().unwrap(), PositionType::Wcs);
    }

    #[test]
    fn test_missing_target_rejected() {
        let err = DataProcess::new(SessionInput::default()).unwrap_err();
        assert!(matches!(err, PrepError::InvalidArgument(_)));
    }

    #[test]
    fn test_wcs_position_without_header() {
        let err = DataProcess::new(SessionInput {
            target_pos: Some((10.0, 10.0)),
            pos_type: PositionType::Wcs,
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, PrepError::MissingData(_)));
    }

    #[test]
    fn test_defaults_without_header_or_zp() {
        let dp = DataProcess::new(SessionInput {
            target_pos: Some((1.0, 1.0)),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(dp.zp, DEFAULT_ZERO_POINT);
        assert_eq!(dp.pixel_scale, None);

        let dp = DataProcess::new(SessionInput {
            header: Some(FitsHeader::new()),
            ..pixel_session(1.0, 1.0)
        })
        .unwrap();
        assert_eq!(dp.pixel_scale, Some(PIXEL_SCALE_SENTINEL));
    }

    #[test]
    fn test_target_outside_image_rejected() {
        let err = DataProcess::new(SessionInput {
            fov_image: Some(Array2::zeros((50, 50))),
            ..pixel_session(60.0, 10.0)
        })
        .unwrap_err();
        assert!(matches!(err, PrepError::InvalidArgument(_)));
    }

    #[test]
    fn test_background_removal_flattens_empty_region() {
        let fov = SyntheticField::new(200, 200, 21)
            .background(100.0)
            .noise(2.0)
            .galaxy(100.0, 100.0, 50000.0, 5.0, 0.7, 0.4)
            .render();
        let dp = DataProcess::new(SessionInput {
            fov_image: Some(fov),
            rm_bkglight: true,
            ..pixel_session(100.0, 100.0)
        })
        .unwrap();

        let image = dp.fov_image.as_ref().unwrap();
        let empty = image.slice(ndarray::s![150..190, 10..50]);
        let level = empty.mean().unwrap();
        assert!(level.abs() < 0.3, "residual background {}", level);
    }

    #[test]
    fn test_radius_selection_first_clean_border() {
        // Bright square of half-width 37 around the target
        let fov = Array2::from_shape_fn((201, 201), |(r, c)| {
            let d = (r as i64 - 100).abs().max((c as i64 - 100).abs());
            if d < 38 {
                10.0
            } else {
                0.0
            }
        });
        let dp = DataProcess::with_toolkit(
            SessionInput {
                fov_image: Some(fov),
                ..pixel_session(100.0, 100.0)
            },
            Box::new(UnitEdgeFit),
        )
        .unwrap();

        assert_eq!(dp.select_radius(&[30, 35, 40, 45]).unwrap(), 40);
        assert_eq!(dp.select_radius(&[30, 35]).unwrap(), 35);
        assert_eq!(dp.select_radius(&[45, 30]).unwrap(), 45);
        assert!(dp.select_radius(&[]).is_err());
    }

    #[test]
    fn test_materials_with_header_exptime() {
        let fov = SyntheticField::new(160, 160, 4)
            .noise(1.0)
            .galaxy(80.0, 80.0, 40000.0, 5.0, 0.6, 0.2)
            .render();
        let mut header = FitsHeader::new();
        header.insert("EXPTIME", 400.0);
        let mut dp = DataProcess::new(SessionInput {
            fov_image: Some(fov),
            header: Some(header),
            ..pixel_session(80.0, 80.0)
        })
        .unwrap();

        dp.generate_target_materials(&MaterialsOptions {
            radius: Some(20),
            bkg_std: Some(0.5),
            ..Default::default()
        })
        .unwrap();

        let stamp = dp.target_stamp.as_ref().unwrap();
        let noise = dp.noise_map.as_ref().unwrap();
        assert_eq!(stamp.dim(), (41, 41));
        assert_eq!(noise.dim(), stamp.dim());
        let expected = ((stamp[[20, 20]] / 400.0).abs() + 0.25).sqrt();
        assert_relative_eq!(noise[[20, 20]], expected, epsilon = 1e-12);
        assert_eq!(dp.target_mask.as_ref().unwrap().sum(), 41.0 * 41.0);
        assert_eq!(dp.bkg_std, Some(0.5));
        assert_eq!(dp.stage(), Stage::MaterialsGenerated);
    }

    #[test]
    fn test_bkg_std_measured_on_double_radius_stamp() {
        let fov = SyntheticField::new(200, 200, 5)
            .noise(1.0)
            .galaxy(100.0, 100.0, 30000.0, 4.0, 0.7, 0.3)
            .render();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut dp = DataProcess::with_toolkit(
            SessionInput {
                fov_image: Some(fov),
                exptime: Some(ExposureTime::Scalar(50.0)),
                ..pixel_session(100.0, 100.0)
            },
            Box::new(RecordingBkgStd {
                seen: Rc::clone(&seen),
                value: 0.7,
            }),
        )
        .unwrap();
        dp.generate_target_materials(&MaterialsOptions {
            radius: Some(15),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(*seen.borrow(), vec![(61, 61)]);
        assert_eq!(dp.bkg_std, Some(0.7));

        let stamp = dp.target_stamp.as_ref().unwrap();
        let noise = dp.noise_map.as_ref().unwrap();
        assert_eq!(stamp.dim(), (31, 31));
        for (&s, &n) in stamp.iter().zip(noise.iter()) {
            assert_relative_eq!(n, ((s / 50.0).abs() + 0.49).sqrt(), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_mask_shape_mismatch_is_an_error() {
        let mut dp = DataProcess::with_toolkit(
            SessionInput {
                fov_image: Some(Array2::from_elem((40, 40), 1.0)),
                exptime: Some(ExposureTime::Scalar(1.0)),
                ..pixel_session(20.0, 20.0)
            },
            Box::new(MisshapenMasks),
        )
        .unwrap()
        .with_selector(Box::new(FixedSelection(vec![0])));

        let err = dp
            .generate_target_materials(&MaterialsOptions {
                radius: Some(5),
                bkg_std: Some(1.0),
                create_mask: true,
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, PrepError::InvalidState(_)));
        assert!(dp.target_mask.is_none());
    }

    #[test]
    fn test_materials_need_exptime() {
        let fov = SyntheticField::new(80, 80, 1).noise(1.0).render();
        let mut dp = DataProcess::new(SessionInput {
            fov_image: Some(fov.clone()),
            ..pixel_session(40.0, 40.0)
        })
        .unwrap();
        let err = dp
            .generate_target_materials(&MaterialsOptions {
                radius: Some(10),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, PrepError::MissingData(_)));

        // A header without EXPTIME does not help
        let mut header = FitsHeader::new();
        header.insert("TELESCOP", "HST");
        let mut dp = DataProcess::new(SessionInput {
            fov_image: Some(fov),
            header: Some(header),
            ..pixel_session(40.0, 40.0)
        })
        .unwrap();
        let err = dp
            .generate_target_materials(&MaterialsOptions {
                radius: Some(10),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, PrepError::MissingData(_)));
    }

    #[test]
    fn test_materials_cut_noise_from_fov_noise_map() {
        let fov = SyntheticField::new(60, 60, 2).noise(1.0).render();
        let noise_fov = Array2::from_shape_fn((60, 60), |(r, c)| (r * 60 + c) as f64);
        let mut dp = DataProcess::new(SessionInput {
            fov_image: Some(fov),
            fov_noise_map: Some(noise_fov.clone()),
            ..pixel_session(30.0, 25.0)
        })
        .unwrap();
        dp.generate_target_materials(&MaterialsOptions {
            radius: Some(5),
            ..Default::default()
        })
        .unwrap();

        let noise = dp.noise_map.as_ref().unwrap();
        assert_eq!(noise.dim(), (11, 11));
        assert_eq!(noise[[5, 5]], noise_fov[[25, 30]]);
        assert_eq!(dp.bkg_std, None);
    }

    #[test]
    fn test_exptime_map_cut_with_stamp() {
        let fov = Array2::from_elem((40, 40), 8.0);
        let mut map = Array2::from_elem((40, 40), 2.0);
        map[[20, 20]] = 8.0;
        let mut dp = DataProcess::new(SessionInput {
            fov_image: Some(fov),
            exptime: Some(ExposureTime::Map(map)),
            ..pixel_session(20.0, 20.0)
        })
        .unwrap();
        dp.generate_target_materials(&MaterialsOptions {
            radius: Some(4),
            bkg_std: Some(0.0),
            ..Default::default()
        })
        .unwrap();

        let noise = dp.noise_map.as_ref().unwrap();
        assert_relative_eq!(noise[[4, 4]], 1.0);
        assert_relative_eq!(noise[[0, 0]], 2.0);
    }

    #[test]
    fn test_exptime_map_shape_checked() {
        let err = DataProcess::new(SessionInput {
            fov_image: Some(Array2::zeros((40, 40))),
            exptime: Some(ExposureTime::Map(Array2::ones((20, 40)))),
            ..pixel_session(20.0, 20.0)
        })
        .unwrap_err();
        assert!(matches!(err, PrepError::InvalidArgument(_)));
    }

    #[test]
    fn test_create_mask_masks_selected_objects() {
        let fov = SyntheticField::new(121, 121, 8)
            .noise(1.0)
            .galaxy(60.0, 60.0, 40000.0, 4.0, 0.7, 0.0)
            .star(80.0, 45.0, 8000.0, 1.5)
            .star(35.0, 80.0, 8000.0, 1.5)
            .render();
        let mut dp = DataProcess::new(SessionInput {
            fov_image: Some(fov),
            exptime: Some(ExposureTime::Scalar(100.0)),
            ..pixel_session(60.0, 60.0)
        })
        .unwrap()
        .with_selector(Box::new(FixedSelection(vec![1, 9])));

        dp.generate_target_materials(&MaterialsOptions {
            radius: Some(40),
            create_mask: true,
            ..Default::default()
        })
        .unwrap();

        // Stamp is centred on the target; object 1 is the nearer star at (80, 45)
        let mask = dp.target_mask.as_ref().unwrap();
        assert_eq!(mask[[45 - 20, 80 - 20]], 0.0);
        assert_eq!(mask[[80 - 20, 35 - 20]], 1.0);
        assert_eq!(mask[[40, 40]], 1.0);
        assert_eq!(dp.apertures.len(), 2);
    }

    #[test]
    fn test_mask_untouched_without_create_mask() {
        let fov = SyntheticField::new(121, 121, 8)
            .noise(1.0)
            .galaxy(60.0, 60.0, 40000.0, 4.0, 0.7, 0.0)
            .star(80.0, 45.0, 8000.0, 1.5)
            .render();
        let mut dp = DataProcess::new(SessionInput {
            fov_image: Some(fov),
            exptime: Some(ExposureTime::Scalar(100.0)),
            ..pixel_session(60.0, 60.0)
        })
        .unwrap()
        .with_selector(Box::new(FixedSelection(vec![0, 1])));
        dp.generate_target_materials(&MaterialsOptions {
            radius: Some(40),
            ..Default::default()
        })
        .unwrap();

        assert!(dp.target_mask.as_ref().unwrap().iter().all(|&v| v == 1.0));
        assert_eq!(dp.apertures.len(), 2);
    }

    #[test]
    fn test_cut_kernel_recentres_target() {
        let fov = SyntheticField::new(100, 100, 6)
            .noise(0.5)
            .star(52.0, 47.0, 20000.0, 2.0)
            .render();
        let mut dp = DataProcess::new(SessionInput {
            fov_image: Some(fov),
            exptime: Some(ExposureTime::Scalar(1.0)),
            ..pixel_session(50.0, 49.0)
        })
        .unwrap();
        dp.generate_target_materials(&MaterialsOptions {
            radius: Some(20),
            cut_kernel: Some(CenterKernel::Gaussian),
            bkg_std: Some(0.5),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(dp.target_pos, PixelPos::new(52, 47));
    }

    fn psf_field() -> Array2<f64> {
        SyntheticField::new(300, 300, 12)
            .noise(1.0)
            .star(60.0, 60.0, 50000.0, 1.5)
            .star(240.0, 70.0, 60000.0, 1.5)
            .star(70.0, 230.0, 40000.0, 1.5)
            .star(230.0, 230.0, 60000.0, 3.0)
            .render()
    }

    #[test]
    fn test_find_psf_picks_sharpest_star() {
        let mut dp = DataProcess::new(SessionInput {
            fov_image: Some(psf_field()),
            ..pixel_session(150.0, 150.0)
        })
        .unwrap();
        dp.find_psf(&PsfOptions {
            radius: Some(20),
            ..Default::default()
        })
        .unwrap();

        let sharp = [
            PixelPos::new(60, 60),
            PixelPos::new(240, 70),
            PixelPos::new(70, 230),
        ];
        assert_eq!(dp.psf_candidates.len(), 3);
        assert!(dp.psf_candidates.iter().all(|c| sharp.contains(&c.position)));

        let chosen = dp.psf_pos_list.as_ref().unwrap();
        assert_eq!(chosen.len(), 1);
        assert!(sharp.contains(&chosen[0]));
        let psfs = dp.psf_list.as_ref().unwrap();
        assert_eq!(psfs[0].dim(), (41, 41));
        assert_eq!(dp.stage(), Stage::PsfFound);
    }

    #[test]
    fn test_find_psf_rejects_elongated_source() {
        let fov = SyntheticField::new(300, 300, 12)
            .noise(1.0)
            .star(60.0, 60.0, 50000.0, 1.5)
            .star(240.0, 70.0, 60000.0, 1.5)
            .galaxy(150.0, 220.0, 60000.0, 1.6, 0.5, 0.0)
            .render();
        let mut dp = DataProcess::new(SessionInput {
            fov_image: Some(fov),
            ..pixel_session(150.0, 150.0)
        })
        .unwrap();
        dp.find_psf(&PsfOptions {
            radius: Some(20),
            ..Default::default()
        })
        .unwrap();

        let mut found: Vec<PixelPos> = dp.psf_candidates.iter().map(|c| c.position).collect();
        found.sort_by_key(|p| (p.x, p.y));
        assert_eq!(found, vec![PixelPos::new(60, 60), PixelPos::new(240, 70)]);
    }

    #[test]
    fn test_stage_records_progress_only() {
        let fov = SyntheticField::new(100, 100, 9)
            .noise(0.5)
            .star(50.0, 50.0, 20000.0, 1.5)
            .render();
        let mut dp = DataProcess::new(SessionInput {
            fov_image: Some(fov),
            exptime: Some(ExposureTime::Scalar(10.0)),
            ..pixel_session(50.0, 50.0)
        })
        .unwrap();
        assert_eq!(dp.stage(), Stage::Initialized);

        // A PSF search does not need target materials first
        dp.find_psf(&PsfOptions {
            radius: Some(10),
            positions: Some(vec![(50.0, 50.0)]),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(dp.stage(), Stage::PsfFound);

        dp.generate_target_materials(&MaterialsOptions {
            radius: Some(10),
            bkg_std: Some(0.5),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(dp.stage(), Stage::PsfFound);

        // No header, so no pixel scale: checkout reports and the stage holds
        let report = dp.checkout().unwrap();
        assert_eq!(report.missing, vec!["pixel_scale".to_string()]);
        assert_eq!(dp.stage(), Stage::PsfFound);
        assert!(dp.fitting_materials().is_err());
    }

    #[test]
    fn test_find_psf_flux_window_against_target() {
        let fov = SyntheticField::new(300, 300, 13)
            .noise(1.0)
            .galaxy(150.0, 150.0, 100000.0, 3.0, 0.7, 0.0)
            .star(60.0, 60.0, 20000.0, 1.5)
            .star(240.0, 70.0, 80000.0, 1.5)
            .render();
        let mut dp = DataProcess::new(SessionInput {
            fov_image: Some(fov),
            exptime: Some(ExposureTime::Scalar(100.0)),
            ..pixel_session(150.0, 150.0)
        })
        .unwrap();
        dp.generate_target_materials(&MaterialsOptions {
            radius: Some(30),
            ..Default::default()
        })
        .unwrap();
        dp.find_psf(&PsfOptions {
            radius: Some(20),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(dp.psf_pos_list.as_ref().unwrap(), &vec![PixelPos::new(240, 70)]);
    }

    #[test]
    fn test_find_psf_interactive_selection() {
        let fov = SyntheticField::new(200, 200, 14)
            .noise(1.0)
            .star(50.0, 50.0, 50000.0, 1.5)
            .star(150.0, 140.0, 30000.0, 1.5)
            .render();
        let mut dp = DataProcess::new(SessionInput {
            fov_image: Some(fov),
            ..pixel_session(100.0, 100.0)
        })
        .unwrap()
        .with_selector(Box::new(FixedSelection(vec![1, 7])));
        dp.find_psf(&PsfOptions {
            radius: Some(15),
            interactive: true,
            ..Default::default()
        })
        .unwrap();

        assert_eq!(dp.psf_candidates.len(), 2);
        assert_eq!(dp.psf_pos_list.as_ref().unwrap(), &vec![PixelPos::new(150, 140)]);
    }

    #[test]
    fn test_find_psf_explicit_positions() {
        let header = tan_header();
        let wcs = Wcs::from_header(&header);
        let fov = SyntheticField::new(160, 200, 15)
            .noise(0.5)
            .star(40.0, 50.0, 30000.0, 1.5)
            .star(150.0, 110.0, 30000.0, 1.5)
            .render();
        let mut dp = DataProcess::new(SessionInput {
            fov_image: Some(fov),
            header: Some(header),
            ..pixel_session(100.0, 80.0)
        })
        .unwrap();

        dp.find_psf(&PsfOptions {
            radius: Some(10),
            positions: Some(vec![(40.2, 49.8)]),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(dp.psf_pos_list.as_ref().unwrap(), &vec![PixelPos::new(40, 50)]);
        assert_eq!(dp.psf_list.as_ref().unwrap()[0].dim(), (21, 21));

        let sky = wcs.pixel_to_world(150.0, 110.0);
        dp.find_psf(&PsfOptions {
            radius: Some(10),
            positions: Some(vec![sky]),
            pos_type: PositionType::Wcs,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(dp.psf_pos_list.as_ref().unwrap(), &vec![PixelPos::new(150, 110)]);
    }

    #[test]
    fn test_find_psf_without_fov() {
        let mut dp = DataProcess::new(pixel_session(1.0, 1.0)).unwrap();
        let err = dp.find_psf(&PsfOptions::default()).unwrap_err();
        assert!(matches!(err, PrepError::InvalidState(_)));
    }

    #[test]
    fn test_checkout_trims_non_square_psf() {
        let mut dp = populated(Array2::ones((21, 19)));
        let report = dp.checkout().unwrap();

        let psf = &dp.psf_list.as_ref().unwrap()[0];
        assert_eq!(psf.dim(), (19, 19));
        assert_relative_eq!(psf.sum(), 1.0, epsilon = 1e-12);
        assert!(report.psf_trimmed);
        assert!(report.is_ready());
    }

    #[test]
    fn test_checkout_fails_when_trim_cannot_square() {
        let mut dp = populated(Array2::ones((21, 18)));
        let err = dp.checkout().unwrap_err();
        assert!(matches!(err, PrepError::InvalidState(_)));
    }

    #[test]
    fn test_checkout_ready_when_complete() {
        let mut dp = populated(Array2::ones((11, 11)));
        let report = dp.checkout().unwrap();
        assert_eq!(report.problem_count(), 0);
        assert!(report.is_ready());
        assert!(!report.psf_trimmed);
        assert_eq!(dp.stage(), Stage::Checked);
        // A square PSF is left as it was
        assert_eq!(dp.psf_list.as_ref().unwrap()[0].sum(), 121.0);
    }

    #[test]
    fn test_checkout_reports_missing_noise_map() {
        let mut dp = populated(Array2::ones((11, 11)));
        dp.noise_map = None;
        let report = dp.checkout().unwrap();
        assert_eq!(report.missing, vec!["noise_map".to_string()]);
        assert_eq!(report.problem_count(), 1);
        assert!(!report.is_ready());
        assert_eq!(dp.stage(), Stage::Initialized);
    }

    #[test]
    fn test_checkout_reports_bad_psf_id_and_shape() {
        let mut dp = populated(Array2::ones((11, 11)));
        dp.psf_id_for_fitting = Some(3);
        dp.target_mask = Some(Array2::ones((9, 9)));
        let report = dp.checkout().unwrap();
        assert_eq!(report.missing, vec!["psf_id_for_fitting".to_string()]);
        assert_eq!(report.inconsistent, vec!["target_mask".to_string()]);
    }

    #[test]
    fn test_fresh_session_checkout_lists_everything() {
        let mut dp = DataProcess::new(pixel_session(1.0, 1.0)).unwrap();
        let report = dp.checkout().unwrap();
        assert_eq!(
            report.missing,
            vec![
                "pixel_scale",
                "target_stamp",
                "noise_map",
                "target_mask",
                "psf_list",
                "psf_id_for_fitting"
            ]
        );
    }

    #[test]
    fn test_fitting_materials_after_checkout() {
        let mut dp = populated(Array2::ones((11, 11)));
        assert!(matches!(
            dp.fitting_materials().unwrap_err(),
            PrepError::InvalidState(_)
        ));

        dp.checkout().unwrap();
        let materials = dp.fitting_materials().unwrap();
        assert_relative_eq!(materials.pixel_scale, 0.168, epsilon = 1e-9);
        assert_eq!(materials.zp, 25.0);

        let dir = tempfile::tempdir().unwrap();
        let written = materials.write_fits(dir.path()).unwrap();
        assert_eq!(written.len(), 4);
        let psf = crate::fits::FitsImage::from_file(&dir.path().join("psf.fits")).unwrap();
        assert_eq!(psf.data.dim(), (11, 11));
        assert!((psf.header.get_f64("ZP").unwrap() - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_target_magnitude() {
        let mut dp = populated(Array2::ones((11, 11)));
        let mut mask = Array2::ones((11, 11));
        mask[[0, 0]] = 0.0;
        dp.target_mask = Some(mask);
        let mag = dp.target_magnitude().unwrap();
        assert_relative_eq!(mag, -2.5 * 120.0_f64.log10() + 25.0, epsilon = 1e-12);

        dp.target_stamp = None;
        assert!(dp.target_magnitude().is_err());
    }

    #[test]
    fn test_profiles_compare_normalised() {
        let star = SyntheticField::new(21, 21, 0).star(10.0, 10.0, 1000.0, 2.0).model();
        let mut dp = populated(star.clone());
        dp.target_stamp = Some(star);
        dp.psf_list.as_mut().unwrap().push(Array2::ones((15, 15)));

        let dir = tempfile::tempdir().unwrap();
        let chart = dir.path().join("profiles.png");
        let profiles = dp.profiles_compare(Some(&chart)).unwrap();
        assert_eq!(profiles.len(), 3);
        assert_eq!(profiles[0].len(), 11);
        assert_eq!(profiles[2].len(), 8);
        assert!(profiles.iter().all(|p| p[0] == 1.0));
        assert!(chart.exists());

        dp.psf_list = None;
        assert!(dp.profiles_compare(None).is_err());
    }

    #[test]
    fn test_plot_overview_and_materials_plot() {
        let dir = tempfile::tempdir().unwrap();
        let fov = SyntheticField::new(80, 80, 3)
            .noise(1.0)
            .star(40.0, 40.0, 5000.0, 2.0)
            .render();
        let mut dp = DataProcess::new(SessionInput {
            fov_image: Some(fov),
            exptime: Some(ExposureTime::Scalar(10.0)),
            plot_dir: Some(dir.path().to_path_buf()),
            ..pixel_session(40.0, 40.0)
        })
        .unwrap();
        dp.generate_target_materials(&MaterialsOptions {
            radius: Some(10),
            bkg_std: Some(1.0),
            ..Default::default()
        })
        .unwrap();
        assert!(dir.path().join("target_materials.png").exists());

        let overview = dir.path().join("overview.png");
        dp.plot_overview(&overview).unwrap();
        assert!(overview.exists());
    }
}
