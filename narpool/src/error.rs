//! Error handling.

use std::error::Error as StdError;
use std::io;

use displaydoc::Display;

pub type NarpoolResult<T> = Result<T, NarpoolError>;

/// An error.
#[derive(Debug, Display)]
pub enum NarpoolError {
    /// Invalid cache name "{name}"
    InvalidCacheName { name: String },

    /// Invalid store path hash "{hash}": {reason}
    InvalidStorePathHash { hash: String, reason: &'static str },

    /// Signing error: {0}
    SigningError(super::signing::Error),

    /// I/O error: {error}.
    IoError { error: io::Error },
}

impl NarpoolError {
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidCacheName { .. } => "InvalidCacheName",
            Self::InvalidStorePathHash { .. } => "InvalidStorePathHash",
            Self::SigningError(_) => "SigningError",
            Self::IoError { .. } => "IoError",
        }
    }
}

impl StdError for NarpoolError {}

impl From<io::Error> for NarpoolError {
    fn from(error: io::Error) -> Self {
        Self::IoError { error }
    }
}

impl From<super::signing::Error> for NarpoolError {
    fn from(error: super::signing::Error) -> Self {
        Self::SigningError(error)
    }
}
