use anyhow::{Context, Result};
use decomp_prep::data_process::{DataProcess, PsfCandidate, PsfOptions, SessionInput};
use decomp_prep::fits::{write_image, FitsImage};
use decomp_prep::selection::ConsoleSelector;
use decomp_prep::{PixelPos, PrepConfig};
use serde::Serialize;
use std::path::Path;

use super::format_fwhms;

#[derive(Serialize)]
struct FindPsfOutput<'a> {
    candidates: &'a [PsfCandidate],
    selected: &'a [PixelPos],
}

pub fn find_psf(
    fits: &Path,
    hdu: Option<usize>,
    radius: Option<usize>,
    interactive: bool,
    output: Option<&Path>,
    format: &str,
    config: &PrepConfig,
) -> Result<()> {
    let image = FitsImage::load(fits, hdu)
        .with_context(|| format!("Failed to read FITS image: {}", fits.display()))?;

    // No target here, so the image centre stands in and no flux window applies
    let center = ((image.width() / 2) as f64, (image.height() / 2) as f64);
    let mut session = DataProcess::with_toolkit(
        SessionInput {
            fov_image: Some(image.data),
            target_pos: Some(center),
            header: Some(image.header),
            zp: Some(decomp_prep::config::DEFAULT_ZERO_POINT),
            ..Default::default()
        },
        Box::new(config.toolkit()),
    )?
    .with_params(config.radius.clone(), config.psf);
    if interactive {
        session = session.with_selector(Box::new(ConsoleSelector::stdio()));
    }

    session
        .find_psf(&PsfOptions {
            radius,
            interactive,
            ..Default::default()
        })
        .context("PSF search failed")?;

    let selected = session.psf_pos_list.as_deref().unwrap_or(&[]);
    match format.to_lowercase().as_str() {
        "json" => {
            let out = FindPsfOutput {
                candidates: &session.psf_candidates,
                selected,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        _ => {
            println!("PSF Candidates in {}", fits.display());
            println!(
                "{:<6} {:<8} {:<8} {:<8} {:<24} {:<12}",
                "Index", "X", "Y", "FWHM", "Per-direction", "Flux"
            );
            println!("{}", "-".repeat(70));
            for (i, c) in session.psf_candidates.iter().enumerate() {
                let marker = if selected.contains(&c.position) { " *" } else { "" };
                println!(
                    "{:<6} {:<8} {:<8} {:<8.3} {:<24} {:<12.1}{}",
                    i,
                    c.position.x,
                    c.position.y,
                    c.fwhm,
                    format_fwhms(&c.fwhms),
                    c.flux,
                    marker
                );
            }
            println!(
                "\n{} candidate(s), {} selected",
                session.psf_candidates.len(),
                selected.len()
            );
        }
    }

    if let Some(dir) = output {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;
        for (i, psf) in session.psf_list.iter().flatten().enumerate() {
            let path = dir.join(format!("psf_{}.fits", i));
            write_image(&path, psf, &[])
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote {}", path.display());
        }
    }

    Ok(())
}
