//! Error handling.

use std::error::Error as StdError;

use anyhow::Error as AnyError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use displaydoc::Display;
use serde::Serialize;

use bmcl::error::BmclError;

pub type NodeResult<T> = Result<T, NodeError>;

/// An error.
#[derive(Debug, Display)]
pub enum NodeError {
    // Generic responses
    /// The URL you requested was not found.
    NotFound,

    /// The signature is invalid or has expired.
    Forbidden,

    /// The node encountered an internal error or misconfiguration.
    InternalServerError,

    // Specialized errors
    /// Verification of {expected} failed: got {actual_hash} with {actual_size} bytes, expected {expected_size} bytes.
    VerificationError {
        expected: String,
        actual_hash: String,
        expected_size: u64,
        actual_size: u64,
    },

    /// Storage error: {0}
    StorageError(AnyError),

    /// Storage write error: {0}
    StorageWriteError(AnyError),

    /// The control plane rejected "{event}": {error}
    ControlPlaneError { event: String, error: String },

    /// Timed out waiting for the acknowledgement of "{event}".
    AckTimeout { event: String },

    /// The control channel is disconnected.
    Disconnected,

    /// The cluster was kicked after repeated keep-alive failures.
    Kicked,

    /// No storage is online.
    NoOnlineStorage,

    /// Database error: {0}
    DatabaseError(AnyError),

    /// General request error: {0}
    RequestError(AnyError),

    /// Manifest error: {0}
    ManifestError(bmcl::manifest::Error),

    /// Error from the common components.
    BmclError(BmclError),
}

#[derive(Serialize)]
pub struct ErrorResponse {
    code: u16,
    error: String,
    message: String,
}

impl NodeError {
    pub fn database_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::DatabaseError(AnyError::new(error))
    }

    pub fn storage_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::StorageError(AnyError::new(error))
    }

    pub fn storage_write_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::StorageWriteError(AnyError::new(error))
    }

    pub fn request_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::RequestError(AnyError::new(error))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::Forbidden => "Forbidden",
            Self::InternalServerError => "InternalServerError",

            Self::VerificationError { .. } => "VerificationError",
            Self::StorageError(_) => "StorageError",
            Self::StorageWriteError(_) => "StorageWriteError",
            Self::ControlPlaneError { .. } => "ControlPlaneError",
            Self::AckTimeout { .. } => "AckTimeout",
            Self::Disconnected => "Disconnected",
            Self::Kicked => "Kicked",
            Self::NoOnlineStorage => "NoOnlineStorage",
            Self::DatabaseError(_) => "DatabaseError",
            Self::RequestError(_) => "RequestError",
            Self::ManifestError(_) => "ManifestError",
            Self::BmclError(e) => e.name(),
        }
    }

    /// Returns whether retrying the operation may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            Self::NotFound | Self::Forbidden | Self::ManifestError(_) | Self::BmclError(_)
        )
    }

    /// Returns a version of this error for clients.
    fn into_clients(self) -> Self {
        match self {
            Self::BmclError(BmclError::InvalidHash { .. }) => Self::NotFound,
            Self::BmclError(BmclError::SigningError(_)) => Self::Forbidden,

            Self::NotFound | Self::Forbidden => self,
            Self::NoOnlineStorage => self,

            _ => Self::InternalServerError,
        }
    }

    fn http_status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,

            Self::NoOnlineStorage => StatusCode::SERVICE_UNAVAILABLE,
            Self::RequestError(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl StdError for NodeError {}

impl From<BmclError> for NodeError {
    fn from(error: BmclError) -> Self {
        match error {
            BmclError::ManifestError(e) => Self::ManifestError(e),
            _ => Self::BmclError(error),
        }
    }
}

impl From<bmcl::manifest::Error> for NodeError {
    fn from(error: bmcl::manifest::Error) -> Self {
        Self::ManifestError(error)
    }
}

impl From<bmcl::signing::Error> for NodeError {
    fn from(_: bmcl::signing::Error) -> Self {
        Self::Forbidden
    }
}

impl From<reqwest::Error> for NodeError {
    fn from(error: reqwest::Error) -> Self {
        Self::RequestError(AnyError::new(error))
    }
}

impl From<sea_orm::DbErr> for NodeError {
    fn from(error: sea_orm::DbErr) -> Self {
        Self::database_error(error)
    }
}

impl IntoResponse for NodeError {
    fn into_response(self) -> Response {
        if !matches!(
            self,
            Self::NotFound | Self::Forbidden | Self::BmclError(BmclError::InvalidHash { .. })
        ) {
            tracing::error!("{:?}", self);
        }

        let sanitized = self.into_clients();

        let status_code = sanitized.http_status_code();
        let error_response = ErrorResponse {
            code: status_code.as_u16(),
            message: sanitized.to_string(),
            error: sanitized.name().to_string(),
        };

        (status_code, Json(error_response)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitized_status() {
        let storage = NodeError::StorageError(anyhow::anyhow!("secret path /data"));
        assert_eq!(
            StatusCode::INTERNAL_SERVER_ERROR,
            storage.into_response().status()
        );

        let signing = NodeError::from(BmclError::SigningError(bmcl::signing::Error::Expired));
        assert_eq!(StatusCode::FORBIDDEN, signing.into_response().status());

        assert_eq!(
            StatusCode::NOT_FOUND,
            NodeError::NotFound.into_response().status()
        );
    }

    #[test]
    fn test_transient() {
        assert!(NodeError::Kicked.is_transient());
        assert!(NodeError::AckTimeout {
            event: "enable".to_string()
        }
        .is_transient());
        assert!(!NodeError::Forbidden.is_transient());
    }
}
