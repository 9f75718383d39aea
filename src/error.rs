use thiserror::Error;

/// Everything that can go wrong while planning a decomposition.
///
/// Configuration errors are raised as soon as they are detected and are never clamped away.
/// [`DecompError::Collective`] means a process-group operation failed; there is no recovery from
/// that inside this crate and callers are expected to abort the run.
#[derive(Error, Debug)]
pub enum DecompError {
    #[error("unit count must be at least 1, got {0}")]
    InvalidUnitCount(usize),

    #[error("unit {unit} is out of range for {units} units")]
    UnitOutOfRange { unit: usize, units: usize },

    #[error("axis {axis} is out of range for a {ndim}-dimensional shape")]
    InvalidAxis { axis: usize, ndim: usize },

    #[error("invalid shape {0:?}: dimensions must be non-empty and positive")]
    InvalidShape(Vec<usize>),

    #[error("bytes per cell must be positive")]
    InvalidCellSize,

    #[error("memory ceiling must be positive")]
    InvalidMemoryCeiling,

    #[error("overhead factor must be finite and positive, got {0}")]
    InvalidOverhead(f64),

    #[error("unsupported decomposition type: {0:?}")]
    UnsupportedDecomposition(String),

    #[error("integer overflow while computing {0}")]
    Overflow(&'static str),

    #[error("datastream_setup must be called before iterating")]
    NotConfigured,

    #[error("collective operation failed: {0}")]
    Collective(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("logger error: {0}")]
    Logger(#[from] log::SetLoggerError),
}

pub type Result<T> = std::result::Result<T, DecompError>;

impl From<rmp_serde::encode::Error> for DecompError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        DecompError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for DecompError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        DecompError::Serialization(e.to_string())
    }
}
