use anyhow::{Context, Result};
use decomp_prep::fits::{format_header_summary, FitsImage};
use decomp_prep::logging::is_verbose;
use decomp_prep::wcs::{read_pixel_scale, Projection, Wcs, PIXEL_SCALE_SENTINEL};
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct InspectOutput<'a> {
    file: String,
    hdu: usize,
    width: usize,
    height: usize,
    exptime: Option<f64>,
    pixel_scale: Option<f64>,
    wcs: Option<&'a str>,
    center_world: Option<(f64, f64)>,
}

fn has_wcs(image: &FitsImage) -> bool {
    ["CRPIX1", "CRVAL1", "CD1_1", "CDELT1"]
        .iter()
        .any(|k| image.header.contains(k))
}

pub fn inspect(fits: &Path, hdu: Option<usize>, format: &str) -> Result<()> {
    let image = FitsImage::load(fits, hdu)
        .with_context(|| format!("Failed to read FITS image: {}", fits.display()))?;

    let scale = read_pixel_scale(&image.header);
    let pixel_scale = (scale != PIXEL_SCALE_SENTINEL).then_some(scale);
    let wcs = has_wcs(&image).then(|| Wcs::from_header(&image.header));
    let projection = wcs.as_ref().map(|w| match w.projection {
        Projection::Tan => "TAN",
        Projection::Linear => "linear",
    });
    let center_world = wcs.as_ref().map(|w| {
        w.pixel_to_world(
            (image.width() as f64 - 1.0) / 2.0,
            (image.height() as f64 - 1.0) / 2.0,
        )
    });

    if format.eq_ignore_ascii_case("json") {
        let out = InspectOutput {
            file: fits.display().to_string(),
            hdu: image.hdu_index,
            width: image.width(),
            height: image.height(),
            exptime: image.header.get_f64("EXPTIME"),
            pixel_scale,
            wcs: projection,
            center_world,
        };
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("File: {}", fits.display());
    println!("  HDU: {}", image.hdu_index);
    println!("  Dimensions: {}x{}", image.width(), image.height());
    match pixel_scale {
        Some(scale) => println!("  Pixel scale: {:.4}\"/px", scale),
        None => println!("  Pixel scale: not available"),
    }
    match (projection, center_world) {
        (Some(kind), Some((ra, dec))) => {
            println!("  WCS: {} (centre RA {:.6}, Dec {:.6})", kind, ra, dec)
        }
        _ => println!("  WCS: none"),
    }
    print!("{}", format_header_summary(&image.header, is_verbose()));

    Ok(())
}
