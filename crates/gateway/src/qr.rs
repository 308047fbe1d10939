//! Pairing endpoints: QR status/image and the lifecycle actions.

use {
    axum::{
        Json,
        extract::State,
        http::header,
        response::{IntoResponse, Response},
    },
    chrono::Utc,
    serde_json::{Value, json},
    tracing::{debug, info, warn},
    wagate_whatsapp::{ActionOutcome, ConnectionState},
};

use crate::{error::ApiError, state::AppState};

pub async fn qr_status(State(state): State<AppState>) -> Json<Value> {
    let status = state.manager.status();
    let available = status.state == ConnectionState::PairingReady;
    debug!(state = %status.state, available, "QR status requested");
    Json(json!({
        "success": true,
        "data": {
            "qrAvailable": available,
            "connectionStatus": status.state,
            "qrCodeImageUrl": status.pairing_image_url,
            "timestamp": status.timestamp,
        },
    }))
}

pub async fn qr_image(State(state): State<AppState>) -> Result<Response, ApiError> {
    if state.manager.status().state != ConnectionState::PairingReady {
        return Err(ApiError::not_found(
            "QR Code not available",
            "WhatsApp is not in QR code generation state",
        ));
    }
    let Some(path) = state
        .manager
        .pairing_image_path()
        .filter(|_| state.manager.has_pairing_image())
    else {
        return Err(ApiError::not_found(
            "QR Code image not found",
            "QR Code image file does not exist",
        ));
    };

    // The image can be replaced or removed between the check and the read.
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, path = %path.display(), "failed to read QR image");
            return Err(ApiError::not_found(
                "QR Code image not found",
                "QR Code image file does not exist",
            ));
        },
    };

    Ok((
        [
            (header::CONTENT_TYPE, "image/png"),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            (header::PRAGMA, "no-cache"),
            (header::EXPIRES, "0"),
        ],
        bytes,
    )
        .into_response())
}

fn action_response(state: &AppState, outcome: ActionOutcome) -> Json<Value> {
    Json(json!({
        "success": outcome.success,
        "data": {
            "message": outcome.message,
            "connectionStatus": state.manager.status().state,
            "timestamp": Utc::now(),
        },
    }))
}

pub async fn logout(State(state): State<AppState>) -> Json<Value> {
    let outcome = state.manager.logout().await;
    info!(success = outcome.success, message = %outcome.message, "logout requested");
    action_response(&state, outcome)
}

pub async fn regenerate(State(state): State<AppState>) -> Json<Value> {
    let outcome = state.manager.regenerate_qr().await;
    info!(success = outcome.success, message = %outcome.message, "QR regeneration requested");
    action_response(&state, outcome)
}

pub async fn clear_auth(State(state): State<AppState>) -> Json<Value> {
    let outcome = state.manager.clear_auth().await;
    info!(success = outcome.success, message = %outcome.message, "auth clear requested");
    action_response(&state, outcome)
}
