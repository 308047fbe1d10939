//! Request payload resolution: base64 / data-URL files and multipart uploads.

use std::collections::HashMap;

use {
    axum::extract::{Multipart, multipart::MultipartError},
    base64::{
        Engine as _,
        alphabet,
        engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    },
    bytes::Bytes,
    wagate_whatsapp::UploadedFile,
};

/// MIME types accepted for uploads.
pub const ALLOWED_MIME_TYPES: &[&str] = &[
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "text/plain",
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "audio/mpeg",
    "audio/wav",
    "audio/ogg",
    "video/mp4",
    "video/avi",
    "video/mov",
];

pub const FALLBACK_MIMETYPE: &str = "application/octet-stream";
pub const FALLBACK_FILENAME: &str = "document";

/// Padding-tolerant standard alphabet.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("file is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error(
        "invalid file type {0:?}. Only documents, images, audio, and video files are allowed."
    )]
    UnsupportedType(String),

    #[error("invalid base64 data: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("{0}")]
    Multipart(#[from] MultipartError),
}

/// A file decoded from a base64 string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFile {
    pub mimetype: String,
    pub filename: String,
    pub data: Bytes,
    pub is_data_url: bool,
}

/// Decode bare base64 or a `data:<mime>[;filename="…"];base64,<data>` URL.
///
/// Bare base64 carries no metadata and falls back to
/// `application/octet-stream` / `document`.
pub fn decode_file(input: &str, limit: usize) -> Result<DecodedFile, PayloadError> {
    let input = input.trim();
    let (mimetype, filename, encoded, is_data_url) = match parse_data_url(input) {
        Some((header, encoded)) => {
            let mimetype = header
                .split(';')
                .next()
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .unwrap_or(FALLBACK_MIMETYPE);
            let filename = embedded_filename(header).unwrap_or(FALLBACK_FILENAME);
            (mimetype, filename, encoded, true)
        },
        None => (FALLBACK_MIMETYPE, FALLBACK_FILENAME, input, false),
    };

    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let data = LENIENT.decode(compact.as_bytes())?;
    if data.len() > limit {
        return Err(PayloadError::TooLarge {
            size: data.len(),
            limit,
        });
    }

    Ok(DecodedFile {
        mimetype: mimetype.to_string(),
        filename: filename.to_string(),
        data: Bytes::from(data),
        is_data_url,
    })
}

fn parse_data_url(input: &str) -> Option<(&str, &str)> {
    let rest = input.strip_prefix("data:")?;
    let idx = rest.find(";base64,")?;
    Some((&rest[..idx], &rest[idx + ";base64,".len()..]))
}

fn embedded_filename(header: &str) -> Option<&str> {
    let start = header.find("filename=\"")? + "filename=\"".len();
    let len = header[start..].find('"')?;
    Some(&header[start..start + len]).filter(|name| !name.is_empty())
}

pub fn is_allowed_mime(mimetype: &str) -> bool {
    ALLOWED_MIME_TYPES.contains(&mimetype)
}

/// Text fields and the optional `file` part of a multipart form.
#[derive(Debug, Default)]
pub struct UploadForm {
    pub fields: HashMap<String, String>,
    pub file: Option<UploadedFile>,
}

impl UploadForm {
    /// Non-blank text field.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

/// Drain a multipart form. The `file` part must be an allowed type and at
/// most `limit` bytes.
pub async fn read_upload(mut multipart: Multipart, limit: usize) -> Result<UploadForm, PayloadError> {
    let mut form = UploadForm::default();
    while let Some(field) = multipart.next_field().await? {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        if name == "file" {
            let filename = field.file_name().map(str::to_string);
            let mimetype = field
                .content_type()
                .unwrap_or(FALLBACK_MIMETYPE)
                .to_string();
            if !is_allowed_mime(&mimetype) {
                return Err(PayloadError::UnsupportedType(mimetype));
            }
            let buffer = field.bytes().await?;
            if buffer.len() > limit {
                return Err(PayloadError::TooLarge {
                    size: buffer.len(),
                    limit,
                });
            }
            form.file = Some(UploadedFile {
                buffer,
                mimetype: Some(mimetype),
                filename,
            });
        } else {
            let value = field.text().await?;
            form.fields.insert(name, value);
        }
    }
    Ok(form)
}
