//! JSON error envelope and the mapping from lifecycle/dispatch errors.

use {
    axum::{
        Json,
        http::StatusCode,
        response::{IntoResponse, Response},
    },
    chrono::Utc,
    serde_json::json,
    tracing::{error, warn},
    wagate_whatsapp::Error as WaError,
};

use crate::payload::PayloadError;

/// An error rendered as `{success: false, error, message, timestamp}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub error: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, error: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            error,
            message: message.into(),
        }
    }

    pub fn missing_fields(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "Missing required fields", message)
    }

    pub fn invalid_message() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "Invalid message format",
            "Message must be a non-empty string",
        )
    }

    pub fn bad_request(error: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Unauthorized", message)
    }

    pub fn not_found(error: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, error, message)
    }

    pub fn unavailable() -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "Service unavailable",
            "WhatsApp is not connected. Please check connection status.",
        )
    }

    /// Map a dispatch failure; `context` names the operation for 500s.
    pub fn dispatch(err: WaError, context: &'static str) -> Self {
        match err {
            WaError::ServiceUnavailable { state } => {
                warn!(%state, "send refused, WhatsApp not connected");
                Self::unavailable()
            },
            WaError::InvalidPayload(msg) => Self::bad_request("Invalid payload", msg),
            other => {
                error!(error = %other, "{context}");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, context, other.to_string())
            },
        }
    }
}

impl From<PayloadError> for ApiError {
    fn from(err: PayloadError) -> Self {
        match err {
            PayloadError::TooLarge { .. } => {
                Self::new(StatusCode::PAYLOAD_TOO_LARGE, "File too large", err.to_string())
            },
            PayloadError::UnsupportedType(_) => Self::bad_request("Invalid file type", err.to_string()),
            PayloadError::InvalidBase64(_) => Self::bad_request("Invalid base64 format", err.to_string()),
            PayloadError::Multipart(_) => Self::bad_request("Invalid form data", err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "success": false,
            "error": self.error,
            "message": self.message,
            "timestamp": Utc::now(),
        });
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, wagate_whatsapp::ConnectionState};

    #[test]
    fn unavailable_maps_to_503() {
        let err = ApiError::dispatch(
            WaError::ServiceUnavailable {
                state: ConnectionState::PairingReady,
            },
            "Failed to send message",
        );
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.error, "Service unavailable");
    }

    #[test]
    fn session_failures_map_to_500() {
        let err = ApiError::dispatch(
            WaError::TransientDisconnect("bridge exited".into()),
            "Failed to send message",
        );
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.error, "Failed to send message");
        assert!(err.message.contains("bridge exited"));
    }

    #[test]
    fn oversized_upload_is_413() {
        let err = ApiError::from(PayloadError::TooLarge { size: 20, limit: 10 });
        assert_eq!(err.status, StatusCode::PAYLOAD_TOO_LARGE);
    }
}
