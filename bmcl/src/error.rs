//! Error handling.

use std::error::Error as StdError;
use std::io;

use displaydoc::Display;

pub type BmclResult<T> = Result<T, BmclError>;

/// An error.
#[derive(Debug, Display)]
pub enum BmclError {
    /// Invalid file hash "{hash}": {reason}
    InvalidHash { hash: String, reason: &'static str },

    /// Manifest error: {0}
    ManifestError(super::manifest::Error),

    /// Signing error: {0}
    SigningError(super::signing::Error),

    /// I/O error: {error}.
    IoError { error: io::Error },
}

impl BmclError {
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidHash { .. } => "InvalidHash",
            Self::ManifestError(_) => "ManifestError",
            Self::SigningError(_) => "SigningError",
            Self::IoError { .. } => "IoError",
        }
    }
}

impl StdError for BmclError {}

impl From<io::Error> for BmclError {
    fn from(error: io::Error) -> Self {
        Self::IoError { error }
    }
}

impl From<super::manifest::Error> for BmclError {
    fn from(error: super::manifest::Error) -> Self {
        Self::ManifestError(error)
    }
}

impl From<super::signing::Error> for BmclError {
    fn from(error: super::signing::Error) -> Self {
        Self::SigningError(error)
    }
}
