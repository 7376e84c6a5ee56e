use actix_web::body::{EitherBody, MessageBody};
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::middleware::Next;
use actix_web::{web, Error};
use log::warn;

use crate::errors::{AuthError, PlatformError};

pub const API_KEY_HEADER: &str = "x-api-key";

/// Shared secret every `/backup` request must present.
#[derive(Clone)]
pub struct ApiKey(pub String);

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Rejects requests without the expected [`API_KEY_HEADER`] with a 401 before
/// they reach a handler.
pub async fn require_api_key<B: MessageBody>(
    req: ServiceRequest,
    next: Next<B>,
) -> Result<ServiceResponse<EitherBody<B>>, Error> {
    let authorized = match (
        req.app_data::<web::Data<ApiKey>>(),
        req.headers()
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok()),
    ) {
        (Some(expected), Some(provided)) => {
            !expected.0.is_empty() && constant_time_eq(expected.0.as_bytes(), provided.as_bytes())
        }
        _ => false,
    };
    if !authorized {
        warn!("rejected unauthenticated {} {}", req.method(), req.path());
        let err = PlatformError::AuthError(AuthError::NotAuthorized(format!(
            "missing or invalid {API_KEY_HEADER} header"
        )));
        return Ok(req.error_response(err).map_into_right_body());
    }
    Ok(next.call(req).await?.map_into_left_body())
}
