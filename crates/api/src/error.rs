//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use checkout::CheckoutError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Bad request from the client (malformed id, missing header).
    BadRequest(String),
    /// Engine error.
    Checkout(CheckoutError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Checkout(err) => checkout_error_to_response(err),
        };

        let body = serde_json::json!({ "error": message, "code": code });
        (status, axum::Json(body)).into_response()
    }
}

fn checkout_error_to_response(err: CheckoutError) -> (StatusCode, &'static str, String) {
    let status = match &err {
        CheckoutError::NotFound { .. } => StatusCode::NOT_FOUND,
        CheckoutError::LinkUnavailable { .. } => StatusCode::GONE,
        CheckoutError::InsufficientInventory { .. }
        | CheckoutError::InvalidState { .. }
        | CheckoutError::ReservationConflict { .. }
        | CheckoutError::KeyConflict { .. }
        | CheckoutError::RequestInProgress { .. } => StatusCode::CONFLICT,
        CheckoutError::InvalidOffer(_)
        | CheckoutError::CurrencyMismatch { .. }
        | CheckoutError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
        CheckoutError::Store(_) | CheckoutError::Catalog(_) => {
            tracing::error!(error = %err, "infrastructure failure");
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    (status, err.code(), err.to_string())
}

impl From<CheckoutError> for ApiError {
    fn from(err: CheckoutError) -> Self {
        ApiError::Checkout(err)
    }
}
