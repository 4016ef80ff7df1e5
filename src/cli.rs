use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "decomp-prep")]
#[command(about = "Prepare target stamps, noise maps, masks and PSFs for galaxy profile fitting", long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// JSON file with tuning parameters
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build the fitting materials for one target and write them as FITS
    Prepare {
        /// FOV image
        fits: PathBuf,

        /// Target position as X,Y (pixels) or RA,DEC (degrees)
        #[arg(short, long, value_parser = parse_pair, allow_hyphen_values = true)]
        target: (f64, f64),

        /// How the target position is given (pixel, wcs)
        #[arg(long, default_value = "pixel")]
        pos_type: String,

        /// HDU holding the image; the first image HDU when omitted
        #[arg(long)]
        hdu: Option<usize>,

        #[command(flatten)]
        materials: MaterialsArgs,

        #[command(flatten)]
        psf: PsfArgs,

        /// Directory for the output FITS files
        #[arg(short, long, default_value = "prep_output")]
        output: PathBuf,

        /// Also write diagnostic PNGs into the output directory
        #[arg(long)]
        plot: bool,

        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Search a FOV image for PSF stars
    FindPsf {
        /// FOV image
        fits: PathBuf,

        #[arg(long)]
        hdu: Option<usize>,

        /// Stamp radius around each PSF star
        #[arg(short, long)]
        radius: Option<usize>,

        /// Choose among the candidates instead of taking the sharpest
        #[arg(short, long)]
        interactive: bool,

        /// Write the chosen PSF stamps here
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Show the header, pixel scale and WCS of a FITS file
    Inspect {
        fits: PathBuf,

        #[arg(long)]
        hdu: Option<usize>,

        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },
}

#[derive(Args, Debug, Clone)]
pub struct MaterialsArgs {
    /// Exposure time in seconds; read from EXPTIME when omitted
    #[arg(long)]
    pub exptime: Option<f64>,

    /// FITS file with a per-pixel exposure time map
    #[arg(long, conflicts_with = "exptime")]
    pub exptime_map: Option<PathBuf>,

    /// FITS file with a FOV noise map to cut instead of modelling noise
    #[arg(long)]
    pub noise_map: Option<PathBuf>,

    /// Subtract the estimated background light first
    #[arg(long)]
    pub rm_bkg: bool,

    /// Photometric zero-point
    #[arg(long)]
    pub zp: Option<f64>,

    /// Stamp radius; chosen from the configured list when omitted
    #[arg(short, long)]
    pub radius: Option<usize>,

    /// Re-centre the target before cutting (gaussian, brightest)
    #[arg(long)]
    pub cut_kernel: Option<String>,

    /// Background standard deviation; estimated when omitted
    #[arg(long)]
    pub bkg_std: Option<f64>,

    /// Pick objects around the target to mask
    #[arg(long)]
    pub create_mask: bool,
}

#[derive(Args, Debug, Clone)]
pub struct PsfArgs {
    /// Stamp radius around each PSF star
    #[arg(long)]
    pub psf_radius: Option<usize>,

    /// PSF star position as X,Y or RA,DEC; repeatable
    #[arg(long = "psf-pos", value_parser = parse_pair, allow_hyphen_values = true)]
    pub psf_pos: Vec<(f64, f64)>,

    /// How --psf-pos positions are given (pixel, wcs)
    #[arg(long, default_value = "pixel")]
    pub psf_pos_type: String,

    /// Choose PSF stars among the candidates
    #[arg(long)]
    pub interactive_psf: bool,

    /// Index of the PSF used for fitting
    #[arg(long, default_value = "0")]
    pub psf_id: usize,
}

/// Parse "A,B" into a pair of floats
fn parse_pair(s: &str) -> Result<(f64, f64), String> {
    let (a, b) = s
        .split_once(',')
        .ok_or_else(|| format!("expected two comma-separated numbers, got '{}'", s))?;
    let a = a.trim().parse::<f64>().map_err(|e| format!("'{}': {}", a, e))?;
    let b = b.trim().parse::<f64>().map_err(|e| format!("'{}': {}", b, e))?;
    Ok((a, b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pair() {
        assert_eq!(parse_pair("10.5,-3").unwrap(), (10.5, -3.0));
        assert_eq!(parse_pair(" 150.1 , 2.2 ").unwrap(), (150.1, 2.2));
        assert!(parse_pair("10").is_err());
        assert!(parse_pair("a,b").is_err());
    }

    #[test]
    fn test_prepare_arguments() {
        let cli = Cli::parse_from([
            "decomp-prep",
            "prepare",
            "field.fits",
            "--target",
            "34.5,-5.1",
            "--pos-type",
            "wcs",
            "--psf-pos",
            "10,20",
            "--psf-pos",
            "30,40",
            "--create-mask",
            "-v",
        ]);
        assert!(cli.verbose);
        match cli.command {
            Commands::Prepare {
                target,
                pos_type,
                materials,
                psf,
                ..
            } => {
                assert_eq!(target, (34.5, -5.1));
                assert_eq!(pos_type, "wcs");
                assert!(materials.create_mask);
                assert_eq!(psf.psf_pos, vec![(10.0, 20.0), (30.0, 40.0)]);
            }
            _ => panic!("expected prepare"),
        }
    }
}
