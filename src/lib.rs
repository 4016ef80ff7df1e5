pub mod background;
pub mod config;
pub mod cutout;
pub mod data_process;
pub mod detection;
pub mod error;
pub mod fits;
pub mod fitting;
pub mod logging;
pub mod plot;
pub mod profile;
pub mod selection;
pub mod stats;
pub mod toolkit;
pub mod wcs;

#[cfg(test)]
mod test_synthetic;

// Re-export commonly used items
pub use config::PrepConfig;
pub use cutout::{CenterKernel, PixelPos};
pub use data_process::{
    CheckoutReport, DataProcess, ExposureTime, FittingMaterials, MaterialsOptions, PositionType,
    PsfOptions, SessionInput, Stage,
};
pub use error::{PrepError, Result};
pub use fits::{FitsHeader, FitsImage};
pub use toolkit::{StandardToolkit, Toolkit};
