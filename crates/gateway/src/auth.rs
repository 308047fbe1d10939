use {
    axum::{
        extract::{Request, State},
        http::{HeaderMap, header},
        middleware::Next,
        response::{IntoResponse, Response},
    },
    secrecy::{ExposeSecret, Secret},
    subtle::ConstantTimeEq,
    tracing::{debug, warn},
};

use crate::{error::ApiError, state::AppState};

/// Header accepted as an alternative to `Authorization: Bearer`.
pub const API_TOKEN_HEADER: &str = "x-api-token";

// ── Types ────────────────────────────────────────────────────────────────────

/// Resolved API auth configuration.
#[derive(Debug, Clone, Default)]
pub struct ResolvedAuth {
    pub token: Option<Secret<String>>,
}

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    TokenMissing,
    TokenMismatch,
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Constant-time string comparison.
fn safe_equal(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Pull the caller's token from `Authorization: Bearer` or `X-API-Token`.
pub fn extract_token(headers: &HeaderMap) -> Option<&str> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    bearer.or_else(|| {
        headers
            .get(API_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
    })
}

// ── Auth logic ───────────────────────────────────────────────────────────────

impl ResolvedAuth {
    pub fn new(token: Option<Secret<String>>) -> Self {
        Self { token }
    }

    pub fn is_enabled(&self) -> bool {
        self.token.is_some()
    }

    /// Check a provided token. Always passes when no token is configured.
    pub fn authorize(&self, provided: Option<&str>) -> Result<(), AuthFailure> {
        let Some(expected) = &self.token else {
            return Ok(());
        };
        let Some(given) = provided else {
            return Err(AuthFailure::TokenMissing);
        };
        if !safe_equal(given, expected.expose_secret()) {
            return Err(AuthFailure::TokenMismatch);
        }
        Ok(())
    }
}

/// Middleware guarding every API route except liveness.
pub async fn require_token(State(state): State<AppState>, req: Request, next: Next) -> Response {
    match state.auth.authorize(extract_token(req.headers())) {
        Ok(()) => {
            debug!(path = %req.uri().path(), "authenticated request");
            next.run(req).await
        },
        Err(failure) => {
            warn!(path = %req.uri().path(), ?failure, "unauthorized request");
            let message = match failure {
                AuthFailure::TokenMissing => {
                    "API token is required. Include it in Authorization header (Bearer <token>) or X-API-Token header"
                },
                AuthFailure::TokenMismatch => "Invalid API token",
            };
            ApiError::unauthorized(message).into_response()
        },
    }
}

#[cfg(test)]
mod tests {
    use {super::*, axum::http::HeaderValue};

    fn auth(token: &str) -> ResolvedAuth {
        ResolvedAuth::new(Some(Secret::new(token.to_string())))
    }

    #[test]
    fn open_when_unconfigured() {
        assert!(ResolvedAuth::default().authorize(None).is_ok());
    }

    #[test]
    fn token_checks() {
        let a = auth("s3cret");
        assert_eq!(a.authorize(None), Err(AuthFailure::TokenMissing));
        assert_eq!(a.authorize(Some("nope")), Err(AuthFailure::TokenMismatch));
        assert_eq!(a.authorize(Some("s3cre")), Err(AuthFailure::TokenMismatch));
        assert!(a.authorize(Some("s3cret")).is_ok());
    }

    #[test]
    fn bearer_preferred_over_header() {
        let mut headers = HeaderMap::new();
        headers.insert(API_TOKEN_HEADER, HeaderValue::from_static("from-header"));
        assert_eq!(extract_token(&headers), Some("from-header"));

        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer from-bearer"),
        );
        assert_eq!(extract_token(&headers), Some("from-bearer"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_token(&headers), Some("from-header"));
    }
}
