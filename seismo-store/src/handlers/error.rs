//! Maps every error surfaced while serving `/stream-query` onto one of the
//! HTTP status codes spec.md §6 names: 400 for validation failures, 500 for
//! everything else (registry/read/pool/export failures are all "internal"
//! from the caller's point of view).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::reader::ReadError;
use crate::registry::RegistryError;
use seismo_formats::WaveformExportError;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Export(#[from] WaveformExportError),
    #[error("database pool: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("worker thread panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::Read(ReadError::InvalidWindow | ReadError::InvalidIdentity) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "stream-query request failed");
        }
        (status, self.to_string()).into_response()
    }
}
