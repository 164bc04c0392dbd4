//! Error type shared by every module of the backend.
//!
//! All fallible operations return [`Result`]. I/O failures are carried unchanged so that callers
//! see the underlying OS error; the remaining variants describe malformed inputs (configuration
//! files, pattern files, capture streams) or invalid arguments.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no section [{section}] found in `{file}`")]
    MissingSection { file: String, section: String },

    #[error("no option `{key}` in section [{section}]")]
    MissingKey { section: String, key: String },

    #[error("cannot parse {what} from `{value}`")]
    Parse { what: &'static str, value: String },

    #[error("pulse index {index} is out of bounds; it cannot be greater than ArraySize-1 (ArraySize={array_size})")]
    PulseIndex { index: usize, array_size: usize },

    #[error("stream {0} is not present in the capture")]
    MissingStream(String),

    #[error("malformed Velo/Vita stream: {0}")]
    Stream(String),

    #[error("cannot read npy array: {0}")]
    Npy(#[from] ndarray_npy::ReadNpyError),

    #[error("cannot read npz archive: {0}")]
    Npz(#[from] ndarray_npy::ReadNpzError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn parse(what: &'static str, value: impl Into<String>) -> Self {
        Error::Parse {
            what,
            value: value.into(),
        }
    }
}
