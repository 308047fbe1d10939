//! Outbound message dispatch.
//!
//! Validation happens only after the session guard is acquired, so a
//! disconnected gateway always answers "service unavailable" first.

use {
    bytes::Bytes,
    serde::Serialize,
    tracing::{debug, info},
    wagate_channels::{Address, AddressKind, SessionPayload},
    wagate_config::WagateConfig,
};

use crate::{
    error::{Error, Result},
    lifecycle::ConnectionManager,
};

const DEFAULT_DOCUMENT_MIMETYPE: &str = "application/octet-stream";
const DEFAULT_IMAGE_MIMETYPE: &str = "image/jpeg";
const DEFAULT_FILENAME: &str = "document";

/// Destination as supplied by the caller, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub raw: String,
    pub kind: AddressKind,
}

impl Recipient {
    pub fn individual(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            kind: AddressKind::Individual,
        }
    }

    pub fn group(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            kind: AddressKind::Group,
        }
    }
}

/// A file received as a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub buffer: Bytes,
    pub mimetype: Option<String>,
    pub filename: Option<String>,
}

/// Binary content of a document or image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attachment {
    /// Already-decoded bytes with explicit metadata.
    Decoded {
        data: Bytes,
        mimetype: Option<String>,
        filename: Option<String>,
    },
    Upload(UploadedFile),
}

impl Attachment {
    fn into_parts(self) -> (Bytes, Option<String>, Option<String>) {
        match self {
            Self::Decoded {
                data,
                mimetype,
                filename,
            } => (data, mimetype, filename),
            Self::Upload(file) => (file.buffer, file.mimetype, file.filename),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    Text {
        to: Recipient,
        body: String,
    },
    Document {
        to: Recipient,
        file: Attachment,
        caption: Option<String>,
    },
    Image {
        to: Recipient,
        file: Attachment,
        caption: Option<String>,
    },
}

impl OutboundMessage {
    fn recipient(&self) -> &Recipient {
        match self {
            Self::Text { to, .. } | Self::Document { to, .. } | Self::Image { to, .. } => to,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReceipt {
    pub success: bool,
    pub message: String,
    /// Normalized address the message went to.
    pub to: String,
}

/// Turn a phone number or group id into a protocol address.
///
/// Individual numbers keep only their digits; a leading `0` is replaced by
/// the country code, and numbers not already starting with it get it
/// prepended.
pub fn normalize_recipient(raw: &str, kind: AddressKind, country_code: &str) -> Result<Address> {
    match kind {
        AddressKind::Individual => {
            let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
            if digits.is_empty() {
                return Err(Error::invalid("recipient has no digits"));
            }
            let number = if let Some(rest) = digits.strip_prefix('0') {
                format!("{country_code}{rest}")
            } else if digits.starts_with(country_code) {
                digits
            } else {
                format!("{country_code}{digits}")
            };
            Ok(Address::individual(&number))
        },
        AddressKind::Group => {
            let id = raw.trim();
            if id.is_empty() {
                return Err(Error::invalid("group id is empty"));
            }
            Ok(Address::group(id))
        },
    }
}

/// Sends messages through the connected session.
#[derive(Clone)]
pub struct Dispatcher {
    manager: ConnectionManager,
    country_code: String,
    footer: Option<String>,
}

impl Dispatcher {
    pub fn new(
        manager: ConnectionManager,
        country_code: impl Into<String>,
        footer: Option<String>,
    ) -> Self {
        Self {
            manager,
            country_code: country_code.into(),
            footer: footer.filter(|f| !f.trim().is_empty()),
        }
    }

    pub fn from_config(manager: ConnectionManager, config: &WagateConfig) -> Self {
        Self::new(
            manager,
            config.whatsapp.country_code.clone(),
            config.whatsapp.message_footer.clone(),
        )
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Send one message. Exactly one adapter send per successful call.
    pub async fn dispatch(&self, message: OutboundMessage) -> Result<DispatchReceipt> {
        let session = self.manager.connected_session().await?;

        let kind = message.recipient().kind;
        let to = normalize_recipient(&message.recipient().raw, kind, &self.country_code)?;
        let (payload, receipt) = self.prepare(message, kind)?;

        debug!(to = %to, kind = payload.kind(), "dispatching message");
        session.send(&to, &payload).await?;
        info!(to = %to, kind = payload.kind(), "message sent");

        Ok(DispatchReceipt {
            success: true,
            message: receipt.into(),
            to: to.to_string(),
        })
    }

    pub async fn send_text(&self, phone: &str, body: &str) -> Result<DispatchReceipt> {
        self.dispatch(OutboundMessage::Text {
            to: Recipient::individual(phone),
            body: body.to_string(),
        })
        .await
    }

    pub async fn send_group_text(&self, group_id: &str, body: &str) -> Result<DispatchReceipt> {
        self.dispatch(OutboundMessage::Text {
            to: Recipient::group(group_id),
            body: body.to_string(),
        })
        .await
    }

    pub async fn send_document(
        &self,
        phone: &str,
        file: Attachment,
        caption: Option<String>,
    ) -> Result<DispatchReceipt> {
        self.dispatch(OutboundMessage::Document {
            to: Recipient::individual(phone),
            file,
            caption,
        })
        .await
    }

    pub async fn send_image(
        &self,
        phone: &str,
        file: Attachment,
        caption: Option<String>,
    ) -> Result<DispatchReceipt> {
        self.dispatch(OutboundMessage::Image {
            to: Recipient::individual(phone),
            file,
            caption,
        })
        .await
    }

    fn prepare(
        &self,
        message: OutboundMessage,
        kind: AddressKind,
    ) -> Result<(SessionPayload, &'static str)> {
        match message {
            OutboundMessage::Text { body, .. } => {
                let body = body.trim();
                if body.is_empty() {
                    return Err(Error::invalid("message body is empty"));
                }
                let body = match &self.footer {
                    Some(footer) => format!("{body}\n\n{footer}"),
                    None => body.to_string(),
                };
                let receipt = match kind {
                    AddressKind::Individual => "Message sent successfully",
                    AddressKind::Group => "Group message sent successfully",
                };
                Ok((SessionPayload::Text { body }, receipt))
            },
            OutboundMessage::Document { file, caption, .. } => {
                let (data, mimetype, filename) = file.into_parts();
                if data.is_empty() {
                    return Err(Error::invalid("document is empty"));
                }
                Ok((
                    SessionPayload::Document {
                        data,
                        mimetype: non_empty(mimetype)
                            .unwrap_or_else(|| DEFAULT_DOCUMENT_MIMETYPE.into()),
                        filename: non_empty(filename).unwrap_or_else(|| DEFAULT_FILENAME.into()),
                        caption: non_empty(caption),
                    },
                    "Document sent successfully",
                ))
            },
            OutboundMessage::Image { file, caption, .. } => {
                let (data, mimetype, _) = file.into_parts();
                if data.is_empty() {
                    return Err(Error::invalid("image is empty"));
                }
                Ok((
                    SessionPayload::Image {
                        data,
                        mimetype: non_empty(mimetype)
                            .unwrap_or_else(|| DEFAULT_IMAGE_MIMETYPE.into()),
                        caption: non_empty(caption),
                    },
                    "Image sent successfully",
                ))
            },
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
