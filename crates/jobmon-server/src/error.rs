//! HTTP mapping for store errors.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

use jobmon_core::contracts::ErrorResponse;

use crate::storage::StoreError;

/// Route-level error: a store error plus its HTTP mapping.
#[derive(Debug)]
pub struct ServerError(pub StoreError);

impl From<StoreError> for ServerError {
    fn from(error: StoreError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            StoreError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            StoreError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            StoreError::NotResumable { .. } => StatusCode::CONFLICT,
            StoreError::InvalidTransition { .. } => StatusCode::CONFLICT,
            StoreError::Database(_) | StoreError::Serialization(_) => {
                error!("server fault: {}", self.0);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(ErrorResponse::new(self.0.to_string()))).into_response()
    }
}
