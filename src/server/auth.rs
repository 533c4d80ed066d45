//! Driver authorization
//!
//! Driver operations carry the shared PIN in the `x-driver-pin` header.

use axum::{extract::FromRequestParts, http::request::Parts};

use super::{AppState, error::AppError};

/// Header carrying the driver PIN
pub const DRIVER_PIN_HEADER: &str = "x-driver-pin";

/// Proof that the request came from the driver
#[derive(Debug, Clone, Copy)]
pub struct Driver;

impl FromRequestParts<AppState> for Driver {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let pin = parts
            .headers
            .get(DRIVER_PIN_HEADER)
            .and_then(|value| value.to_str().ok());
        match pin {
            Some(pin) if pin == &*state.driver_pin => Ok(Driver),
            _ => Err(AppError::Unauthorized),
        }
    }
}
