pub mod file_handlers;
pub mod health_handlers;
pub mod upload_handlers;

use crate::errors::AppError;
use axum::{extract::FromRequestParts, http::request::Parts};
use uuid::Uuid;

/// Header carrying the authenticated caller.
pub const OWNER_HEADER: &str = "x-owner-id";

/// The caller's owner id, taken from the `x-owner-id` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerId(pub Uuid);

impl<S> FromRequestParts<S> for OwnerId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(OWNER_HEADER)
            .ok_or_else(|| AppError::unauthorized(format!("missing {OWNER_HEADER} header")))?;

        value
            .to_str()
            .ok()
            .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
            .map(OwnerId)
            .ok_or_else(|| AppError::bad_request(format!("{OWNER_HEADER} must be a UUID")))
    }
}
