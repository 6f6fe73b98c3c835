// =============================================================================
// Bearer Token Authentication — Axum extractor
// =============================================================================
//
// Operator endpoints (kill switch, config replacement, ingest, backfill)
// require `Authorization: Bearer <token>` matching `ONCHAIN_ADMIN_TOKEN`.
// The token is read per request so rotation needs no restart. Read-only
// endpoints are public.
// =============================================================================

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

pub const ADMIN_TOKEN_ENV: &str = "ONCHAIN_ADMIN_TOKEN";

/// Constant-time byte comparison.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Check `Authorization` header value against `expected`.
fn check(header: Option<&str>, expected: &str) -> Result<(), AuthRejection> {
    if expected.is_empty() {
        warn!("{ADMIN_TOKEN_ENV} is not set; rejecting operator request");
        return Err(AuthRejection {
            status: StatusCode::FORBIDDEN,
            message: "server authentication not configured",
        });
    }
    let Some(token) = header.and_then(|v| v.strip_prefix("Bearer ")) else {
        return Err(AuthRejection {
            status: StatusCode::UNAUTHORIZED,
            message: "missing or malformed authorization header",
        });
    };
    if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
        warn!("invalid operator token presented");
        return Err(AuthRejection {
            status: StatusCode::FORBIDDEN,
            message: "invalid authorization token",
        });
    }
    Ok(())
}

/// Extractor proving the caller holds the operator token.
pub struct AuthBearer;

#[derive(Debug)]
pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, axum::Json(body)).into_response()
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthBearer
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let expected = std::env::var(ADMIN_TOKEN_ENV).unwrap_or_default();
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        check(header, &expected).map(|()| AuthBearer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_cases() {
        assert!(constant_time_eq(b"", b""));
        assert!(constant_time_eq(b"token", b"token"));
        assert!(!constant_time_eq(b"token", b"tokem"));
        assert!(!constant_time_eq(b"short", b"longer"));
    }

    #[test]
    fn header_checks() {
        assert!(check(Some("Bearer s3cret"), "s3cret").is_ok());
        assert_eq!(
            check(Some("Bearer nope"), "s3cret").unwrap_err().status,
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            check(Some("Basic s3cret"), "s3cret").unwrap_err().status,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(check(None, "s3cret").unwrap_err().status, StatusCode::UNAUTHORIZED);
        assert_eq!(
            check(Some("Bearer "), "").unwrap_err().status,
            StatusCode::FORBIDDEN
        );
    }
}
