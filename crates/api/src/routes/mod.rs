//! HTTP route handlers.

pub mod checkouts;
pub mod health;
pub mod links;
pub mod metrics;
pub mod variants;

use uuid::Uuid;

use crate::error::ApiError;

fn parse_uuid<T: From<Uuid>>(id: &str) -> Result<T, ApiError> {
    let uuid =
        Uuid::parse_str(id).map_err(|e| ApiError::BadRequest(format!("Invalid ID format: {e}")))?;
    Ok(T::from(uuid))
}
