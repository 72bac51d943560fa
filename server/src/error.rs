//! Error handling.

use std::error::Error as StdError;

use anyhow::Error as AnyError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use displaydoc::Display;
use serde::Serialize;

use narpool::error::NarpoolError;

pub type ServerResult<T> = Result<T, ServerError>;

/// An error.
#[derive(Debug, Display)]
pub enum ServerError {
    // Generic responses
    /// The URL you requested was not found.
    NotFound,

    /// Unauthorized.
    Unauthorized,

    /// The server encountered an internal error or misconfiguration.
    InternalServerError,

    // Specialized responses
    /// The requested cache does not exist.
    NoSuchCache,

    /// The requested object does not exist.
    NoSuchObject,

    /// The requested upload does not exist.
    NoSuchUpload,

    /// "{name}" already exists.
    Conflict { name: String },

    /// Invalid compression type "{name}".
    InvalidCompressionType { name: String },

    /// All storage back-ends refused the write.
    StorageFull,

    /// Invalid configuration: {0}
    ConfigError(AnyError),

    /// Database error: {0}
    DatabaseError(AnyError),

    /// Storage error: {0}
    StorageError(AnyError),

    /// Upstream error: {0}
    UpstreamError(AnyError),

    /// General request error: {0}
    RequestError(AnyError),

    /// Error from the common components.
    NarpoolError(NarpoolError),
}

#[derive(Serialize)]
pub struct ErrorResponse {
    code: u16,
    error: String,
    message: String,
}

impl ServerError {
    pub fn database_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::DatabaseError(AnyError::new(error))
    }

    pub fn storage_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::StorageError(AnyError::new(error))
    }

    pub fn upstream_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::UpstreamError(AnyError::new(error))
    }

    pub fn request_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::RequestError(AnyError::new(error))
    }

    fn name(&self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::Unauthorized => "Unauthorized",
            Self::InternalServerError => "InternalServerError",

            Self::NoSuchCache => "NoSuchCache",
            Self::NoSuchObject => "NoSuchObject",
            Self::NoSuchUpload => "NoSuchUpload",
            Self::Conflict { .. } => "Conflict",
            Self::InvalidCompressionType { .. } => "InvalidCompressionType",
            Self::StorageFull => "StorageFull",
            Self::ConfigError(_) => "ConfigError",
            Self::DatabaseError(_) => "DatabaseError",
            Self::StorageError(_) => "StorageError",
            Self::UpstreamError(_) => "UpstreamError",
            Self::RequestError(_) => "RequestError",
            Self::NarpoolError(e) => e.name(),
        }
    }

    /// Returns a version of this error for clients.
    fn into_clients(self) -> Self {
        match self {
            Self::ConfigError(_) => Self::InternalServerError,
            Self::DatabaseError(_) => Self::InternalServerError,
            Self::StorageError(_) => Self::InternalServerError,

            _ => self,
        }
    }

    fn http_status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,

            Self::NoSuchCache => StatusCode::BAD_REQUEST,
            Self::NoSuchObject => StatusCode::NOT_FOUND,
            Self::NoSuchUpload => StatusCode::BAD_REQUEST,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::InvalidCompressionType { .. } => StatusCode::BAD_REQUEST,
            Self::StorageFull => StatusCode::INSUFFICIENT_STORAGE,
            Self::UpstreamError(_) => StatusCode::BAD_GATEWAY,
            Self::RequestError(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl StdError for ServerError {}

impl From<NarpoolError> for ServerError {
    fn from(error: NarpoolError) -> Self {
        Self::NarpoolError(error)
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        if matches!(
            self,
            Self::DatabaseError(_) | Self::StorageError(_) | Self::ConfigError(_)
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
