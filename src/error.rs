use thiserror::Error;

/// Errors raised while preparing fitting materials.
#[derive(Error, Debug)]
pub enum PrepError {
    /// A caller-supplied argument is unusable (bad position type, missing target, ...)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Data required by the operation is not available
    #[error("missing data: {0}")]
    MissingData(String),

    /// The session is not in a state that allows the operation
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("FITS error: {0}")]
    Fits(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error("configuration error: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PrepError>;

impl PrepError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        PrepError::InvalidArgument(msg.into())
    }

    pub fn missing_data(msg: impl Into<String>) -> Self {
        PrepError::MissingData(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        PrepError::InvalidState(msg.into())
    }
}
