use anyhow::{Context, Result};
use decomp_prep::data_process::{
    DataProcess, ExposureTime, MaterialsOptions, PositionType, PsfOptions, SessionInput,
};
use decomp_prep::fits::{write_image, FitsImage};
use decomp_prep::selection::ConsoleSelector;
use decomp_prep::{CenterKernel, PrepConfig};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::cli::{MaterialsArgs, PsfArgs};

pub struct PrepareOptions<'a> {
    pub fits: &'a Path,
    pub hdu: Option<usize>,
    pub target: (f64, f64),
    pub pos_type: &'a str,
    pub materials: &'a MaterialsArgs,
    pub psf: &'a PsfArgs,
    pub output: &'a Path,
    pub plot: bool,
    pub format: &'a str,
}

#[derive(Serialize)]
struct PrepareSummary {
    target_pos: (i64, i64),
    target_radius: Option<usize>,
    pixel_scale: Option<f64>,
    zp: f64,
    bkg_std: Option<f64>,
    magnitude: Option<f64>,
    unmasked_objects: usize,
    psf_positions: Vec<(i64, i64)>,
    psf_id_for_fitting: Option<usize>,
    missing: Vec<String>,
    inconsistent: Vec<String>,
    psf_trimmed: bool,
    files: Vec<PathBuf>,
}

pub fn prepare(options: &PrepareOptions, config: &PrepConfig) -> Result<()> {
    let image = FitsImage::load(options.fits, options.hdu)
        .with_context(|| format!("Failed to read FITS image: {}", options.fits.display()))?;
    let materials = options.materials;

    let exptime = match (&materials.exptime_map, materials.exptime) {
        (Some(path), _) => Some(ExposureTime::Map(load_plane(path)?)),
        (None, Some(t)) => Some(ExposureTime::Scalar(t)),
        (None, None) => None,
    };
    let fov_noise_map = materials.noise_map.as_deref().map(load_plane).transpose()?;

    std::fs::create_dir_all(options.output).with_context(|| {
        format!(
            "Failed to create output directory: {}",
            options.output.display()
        )
    })?;
    let plot_dir = options.plot.then(|| options.output.to_path_buf());

    let interactive = materials.create_mask || options.psf.interactive_psf;
    let mut session = DataProcess::with_toolkit(
        SessionInput {
            fov_image: Some(image.data),
            target_pos: Some(options.target),
            pos_type: options.pos_type.parse()?,
            header: Some(image.header),
            exptime,
            fov_noise_map,
            rm_bkglight: materials.rm_bkg,
            zp: materials.zp,
            plot_dir: plot_dir.clone(),
        },
        Box::new(config.toolkit()),
    )
    .context("Failed to initialise the session")?
    .with_params(config.radius.clone(), config.psf);
    if interactive {
        session = session.with_selector(Box::new(ConsoleSelector::stdio()));
    }

    let cut_kernel = materials
        .cut_kernel
        .as_deref()
        .map(|k| k.parse::<CenterKernel>())
        .transpose()
        .map_err(anyhow::Error::msg)?;
    session
        .generate_target_materials(&MaterialsOptions {
            cut_kernel,
            radius: materials.radius,
            radius_list: None,
            bkg_std: materials.bkg_std,
            create_mask: materials.create_mask,
        })
        .context("Failed to generate target materials")?;

    let psf = options.psf;
    let psf_pos_type: PositionType = psf.psf_pos_type.parse()?;
    session
        .find_psf(&PsfOptions {
            radius: psf.psf_radius,
            positions: (!psf.psf_pos.is_empty()).then(|| psf.psf_pos.clone()),
            pos_type: psf_pos_type,
            interactive: psf.interactive_psf,
        })
        .context("Failed to find PSF stars")?;
    session.psf_id_for_fitting = Some(psf.psf_id);

    let report = session.checkout().context("Checkout failed")?;
    let files = write_outputs(&session, options.output)?;

    if let Some(dir) = &plot_dir {
        session.plot_overview(&dir.join("overview.png"))?;
        session.profiles_compare(Some(&dir.join("profiles.png")))?;
    }

    let summary = PrepareSummary {
        target_pos: (session.target_pos.x, session.target_pos.y),
        target_radius: session.target_radius,
        pixel_scale: session.pixel_scale,
        zp: session.zp,
        bkg_std: session.bkg_std,
        magnitude: session.target_magnitude().ok(),
        unmasked_objects: session.apertures.len(),
        psf_positions: session
            .psf_pos_list
            .iter()
            .flatten()
            .map(|p| (p.x, p.y))
            .collect(),
        psf_id_for_fitting: session.psf_id_for_fitting,
        missing: report.missing.clone(),
        inconsistent: report.inconsistent.clone(),
        psf_trimmed: report.psf_trimmed,
        files,
    };

    match options.format.to_lowercase().as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&summary)?),
        _ => print_summary(&summary),
    }

    if !report.is_ready() {
        anyhow::bail!(
            "{} problem(s) found; the materials are not ready for fitting",
            report.problem_count()
        );
    }
    Ok(())
}

fn load_plane(path: &Path) -> Result<ndarray::Array2<f64>> {
    let image = FitsImage::from_file(path)
        .with_context(|| format!("Failed to read FITS image: {}", path.display()))?;
    Ok(image.data)
}

/// Write every stamp the session holds
fn write_outputs(session: &DataProcess, dir: &Path) -> Result<Vec<PathBuf>> {
    let mut keywords = vec![("ZP", session.zp)];
    if let Some(scale) = session.pixel_scale {
        keywords.push(("PIXSCALE", scale));
    }

    let mut stamps = Vec::new();
    for (name, stamp) in [
        ("target_stamp.fits", &session.target_stamp),
        ("noise_map.fits", &session.noise_map),
        ("target_mask.fits", &session.target_mask),
    ] {
        if let Some(stamp) = stamp {
            stamps.push((name.to_string(), stamp));
        }
    }
    for (i, psf) in session.psf_list.iter().flatten().enumerate() {
        stamps.push((format!("psf_{}.fits", i), psf));
    }

    let mut written = Vec::with_capacity(stamps.len());
    for (name, stamp) in stamps {
        let path = dir.join(name);
        write_image(&path, stamp, &keywords)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        written.push(path);
    }
    Ok(written)
}

fn print_summary(summary: &PrepareSummary) {
    println!("Target Preparation");
    println!("==================");
    println!("  Position:      ({}, {})", summary.target_pos.0, summary.target_pos.1);
    if let Some(radius) = summary.target_radius {
        println!("  Stamp radius:  {}", radius);
    }
    match summary.pixel_scale {
        Some(scale) => println!("  Pixel scale:   {:.4}\"/px", scale),
        None => println!("  Pixel scale:   unknown"),
    }
    println!("  Zero-point:    {:.3}", summary.zp);
    if let Some(bkg_std) = summary.bkg_std {
        println!("  Bkg std:       {:.5}", bkg_std);
    }
    if let Some(mag) = summary.magnitude {
        println!("  Magnitude:     {:.3}", mag);
    }
    println!("  Unmasked objs: {}", summary.unmasked_objects);

    println!("\nPSF Stars:");
    println!("{:<6} {:<10} {:<10}", "Index", "X", "Y");
    println!("{}", "-".repeat(28));
    for (i, (x, y)) in summary.psf_positions.iter().enumerate() {
        let marker = if Some(i) == summary.psf_id_for_fitting { " *" } else { "" };
        println!("{:<6} {:<10} {:<10}{}", i, x, y, marker);
    }
    if summary.psf_trimmed {
        println!("  (PSF used for fitting was trimmed to a square)");
    }

    println!("\nCheckout:");
    if summary.missing.is_empty() && summary.inconsistent.is_empty() {
        println!("  Ready for fitting");
    }
    for name in &summary.missing {
        println!("  Missing: {}", name);
    }
    for name in &summary.inconsistent {
        println!("  Inconsistent shape: {}", name);
    }

    println!("\nFiles:");
    for file in &summary.files {
        println!("  {}", file.display());
    }
}
