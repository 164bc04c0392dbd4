use std::convert::Infallible;
use thiserror::Error;

/// Errors of the control backend. Failures of the pure backend are wrapped in [`Error::Backend`].
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Backend(#[from] x6compiler_backend::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("device error: {0}")]
    Device(String),

    #[error("cannot write npy array: {0}")]
    NpyWrite(#[from] ndarray_npy::WriteNpyError),

    #[error("invalid run configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("plotting failed: {0}")]
    Plot(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Infallible> for Error {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}
