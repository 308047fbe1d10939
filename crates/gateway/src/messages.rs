//! Send endpoints plus the base64 utility endpoints.

use {
    axum::{
        Json,
        extract::{Multipart, State, rejection::JsonRejection},
    },
    base64::{Engine as _, engine::general_purpose::STANDARD as BASE64},
    chrono::Utc,
    serde::Deserialize,
    serde_json::{Value, json},
    tracing::{debug, info},
    wagate_whatsapp::{Attachment, UploadedFile},
};

use crate::{
    error::ApiError,
    payload::{FALLBACK_FILENAME, FALLBACK_MIMETYPE, decode_file, read_upload},
    state::AppState,
};

type ApiResult = Result<Json<Value>, ApiError>;

const SEND_FAILED: &str = "Failed to send message";
const GROUP_SEND_FAILED: &str = "Failed to send group message";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextRequest {
    phone_number: Option<String>,
    group_id: Option<String>,
    message: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRequest {
    phone_number: Option<String>,
    file: Option<String>,
    caption: Option<String>,
    filename: Option<String>,
    mimetype: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    file: Option<String>,
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|e| ApiError::bad_request("Invalid request body", e.body_text()))
}

fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Split a message into (present, well-formed). An empty string counts as
/// missing; any other non-string or blank value is malformed.
fn message_text(message: Option<Value>) -> Result<Option<String>, ApiError> {
    match message {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Err(ApiError::invalid_message()),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(Value::Bool(false)) => Ok(None),
        Some(_) => Err(ApiError::invalid_message()),
    }
}

/// Fail fast before decoding large payloads. The dispatcher checks again
/// under the state lock.
fn ensure_connected(state: &AppState) -> Result<(), ApiError> {
    if state.manager.is_connected() {
        Ok(())
    } else {
        Err(ApiError::unavailable())
    }
}

pub async fn send_message(
    State(state): State<AppState>,
    payload: Result<Json<TextRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    let phone = present(req.phone_number);
    debug!(phone = phone.as_deref().unwrap_or("-"), "send message request");

    let missing = || ApiError::missing_fields("phoneNumber and message are required");
    let message = message_text(req.message);
    let Some(phone) = phone else {
        return Err(missing());
    };
    let message = message?.ok_or_else(missing)?;

    let receipt = state
        .dispatcher
        .send_text(&phone, &message)
        .await
        .map_err(|e| ApiError::dispatch(e, SEND_FAILED))?;

    info!(to = %receipt.to, "message sent");
    Ok(Json(json!({
        "success": true,
        "data": {
            "phoneNumber": phone,
            "to": receipt.to,
            "message": message,
            "status": "sent",
            "timestamp": Utc::now(),
        },
        "message": receipt.message,
    })))
}

pub async fn send_group_message(
    State(state): State<AppState>,
    payload: Result<Json<TextRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    let group = present(req.group_id);
    debug!(group = group.as_deref().unwrap_or("-"), "send group message request");

    let missing = || ApiError::missing_fields("groupId and message are required");
    let message = message_text(req.message);
    let Some(group) = group else {
        return Err(missing());
    };
    let message = message?.ok_or_else(missing)?;

    let receipt = state
        .dispatcher
        .send_group_text(&group, &message)
        .await
        .map_err(|e| ApiError::dispatch(e, GROUP_SEND_FAILED))?;

    info!(to = %receipt.to, "group message sent");
    Ok(Json(json!({
        "success": true,
        "data": {
            "groupId": group,
            "to": receipt.to,
            "message": message,
            "status": "sent",
            "timestamp": Utc::now(),
        },
        "message": receipt.message,
    })))
}

pub async fn send_document(
    State(state): State<AppState>,
    payload: Result<Json<FileRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    let (Some(phone), Some(file)) = (present(req.phone_number), present(req.file)) else {
        return Err(ApiError::missing_fields("phoneNumber and file are required"));
    };
    ensure_connected(&state)?;

    let decoded = decode_file(&file, state.max_upload_bytes)?;
    let filename = present(req.filename).unwrap_or(decoded.filename);
    let mimetype = present(req.mimetype).unwrap_or(decoded.mimetype);
    let caption = present(req.caption);
    let size = decoded.data.len();
    debug!(%filename, %mimetype, size, "document decoded");

    let receipt = state
        .dispatcher
        .send_document(
            &phone,
            Attachment::Decoded {
                data: decoded.data,
                mimetype: Some(mimetype.clone()),
                filename: Some(filename.clone()),
            },
            caption.clone(),
        )
        .await
        .map_err(|e| ApiError::dispatch(e, SEND_FAILED))?;

    Ok(Json(json!({
        "success": true,
        "data": {
            "phoneNumber": phone,
            "to": receipt.to,
            "filename": filename,
            "mimetype": mimetype,
            "fileSize": size,
            "caption": caption,
            "status": "sent",
            "timestamp": Utc::now(),
        },
        "message": receipt.message,
    })))
}

pub async fn send_image(
    State(state): State<AppState>,
    payload: Result<Json<FileRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    let (Some(phone), Some(file)) = (present(req.phone_number), present(req.file)) else {
        return Err(ApiError::missing_fields("phoneNumber and file are required"));
    };
    ensure_connected(&state)?;

    let decoded = decode_file(&file, state.max_upload_bytes)?;
    // Bare base64 says nothing about the format; let the dispatcher default it.
    let mimetype = present(req.mimetype)
        .or_else(|| (decoded.mimetype != FALLBACK_MIMETYPE).then_some(decoded.mimetype));
    let caption = present(req.caption);
    let size = decoded.data.len();

    let receipt = state
        .dispatcher
        .send_image(
            &phone,
            Attachment::Decoded {
                data: decoded.data,
                mimetype: mimetype.clone(),
                filename: None,
            },
            caption.clone(),
        )
        .await
        .map_err(|e| ApiError::dispatch(e, SEND_FAILED))?;

    Ok(Json(json!({
        "success": true,
        "data": {
            "phoneNumber": phone,
            "to": receipt.to,
            "mimetype": mimetype,
            "fileSize": size,
            "caption": caption,
            "status": "sent",
            "timestamp": Utc::now(),
        },
        "message": receipt.message,
    })))
}

/// Shared body of the two multipart send routes.
async fn upload_and_send(state: &AppState, multipart: Multipart, image: bool) -> ApiResult {
    let form = read_upload(multipart, state.max_upload_bytes).await?;
    let phone = form.field("phoneNumber").map(str::to_string);
    let caption = form.field("caption").map(str::to_string);
    let (Some(phone), Some(file)) = (phone, form.file) else {
        return Err(ApiError::missing_fields("phoneNumber and file are required"));
    };
    ensure_connected(state)?;

    let UploadedFile {
        buffer,
        mimetype,
        filename,
    } = file;
    let size = buffer.len();
    let upload = UploadedFile {
        buffer,
        mimetype: mimetype.clone(),
        filename: filename.clone(),
    };

    let sent = if image {
        state
            .dispatcher
            .send_image(&phone, Attachment::Upload(upload), caption.clone())
            .await
    } else {
        state
            .dispatcher
            .send_document(&phone, Attachment::Upload(upload), caption.clone())
            .await
    };
    let receipt = sent.map_err(|e| ApiError::dispatch(e, SEND_FAILED))?;

    Ok(Json(json!({
        "success": true,
        "data": {
            "phoneNumber": phone,
            "to": receipt.to,
            "fileName": filename,
            "fileSize": size,
            "mimeType": mimetype,
            "caption": caption,
            "status": "sent",
            "timestamp": Utc::now(),
        },
        "message": receipt.message,
    })))
}

pub async fn upload_document(State(state): State<AppState>, multipart: Multipart) -> ApiResult {
    upload_and_send(&state, multipart, false).await
}

pub async fn upload_image(State(state): State<AppState>, multipart: Multipart) -> ApiResult {
    upload_and_send(&state, multipart, true).await
}

pub async fn analyze_base64(
    State(state): State<AppState>,
    payload: Result<Json<AnalyzeRequest>, JsonRejection>,
) -> ApiResult {
    let Some(file) = present(body(payload)?.file) else {
        return Err(ApiError::bad_request(
            "No file provided",
            "Please provide a base64 file to analyze",
        ));
    };
    let decoded = decode_file(&file, state.max_upload_bytes)?;
    Ok(Json(json!({
        "success": true,
        "data": {
            "filename": decoded.filename,
            "mimetype": decoded.mimetype,
            "fileSize": decoded.data.len(),
            "isDataUrl": decoded.is_data_url,
            "timestamp": Utc::now(),
        },
        "message": "Base64 file analyzed successfully",
    })))
}

pub async fn convert_to_base64(State(state): State<AppState>, multipart: Multipart) -> ApiResult {
    let form = read_upload(multipart, state.max_upload_bytes).await?;
    let Some(file) = form.file else {
        return Err(ApiError::bad_request(
            "No file uploaded",
            "Please upload a file to convert to base64",
        ));
    };
    Ok(Json(json!({
        "success": true,
        "data": {
            "fileName": file.filename.as_deref().unwrap_or(FALLBACK_FILENAME),
            "fileSize": file.buffer.len(),
            "mimeType": file.mimetype.as_deref().unwrap_or(FALLBACK_MIMETYPE),
            "base64": BASE64.encode(&file.buffer),
            "timestamp": Utc::now(),
        },
        "message": "File converted to base64 successfully",
    })))
}
