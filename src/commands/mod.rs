pub mod find_psf;
pub mod inspect;
pub mod prepare;

pub use find_psf::find_psf;
pub use inspect::inspect;
pub use prepare::{prepare, PrepareOptions};

use anyhow::{Context, Result};
use decomp_prep::PrepConfig;
use std::path::Path;

/// Configuration from `--config`, or the defaults
pub fn load_config(path: Option<&Path>) -> Result<PrepConfig> {
    match path {
        Some(path) => PrepConfig::from_file(path)
            .with_context(|| format!("Failed to load config: {}", path.display())),
        None => Ok(PrepConfig::default()),
    }
}

/// Shorten FWHM lists for display
pub(crate) fn format_fwhms(fwhms: &[f64]) -> String {
    fwhms
        .iter()
        .map(|f| format!("{:.2}", f))
        .collect::<Vec<_>>()
        .join("/")
}
