use std::fmt;

use {
    async_trait::async_trait,
    bytes::Bytes,
    tokio::sync::{mpsc, oneshot},
};

use crate::address::Address;

/// Stream of events produced by one opened session.
///
/// The stream ends when the session is gone; a `Closed` event is expected
/// before that, but consumers must tolerate the channel simply closing.
pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

/// Opaque pairing material. The adapter owns its format.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials(Vec<u8>);

impl Credentials {
    pub fn new(blob: Vec<u8>) -> Self {
        Self(blob)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credentials([REDACTED; {} bytes])", self.0.len())
    }
}

/// Why a session closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The device was unlinked; stored credentials are no longer valid.
    LoggedOut,
    ConnectionLost,
    ConnectionReplaced,
    RestartRequired,
    TimedOut,
    Other(String),
}

impl CloseReason {
    pub fn is_logout(&self) -> bool {
        matches!(self, Self::LoggedOut)
    }

    /// Map a protocol disconnect status code.
    pub fn from_status_code(code: u16) -> Self {
        match code {
            401 => Self::LoggedOut,
            408 => Self::TimedOut,
            428 => Self::ConnectionLost,
            440 => Self::ConnectionReplaced,
            515 => Self::RestartRequired,
            other => Self::Other(format!("status {other}")),
        }
    }

    /// Parse a reason name as sent by the bridge (`logged_out`, `connection_lost`, ...).
    pub fn from_name(name: &str) -> Self {
        match name {
            "logged_out" | "loggedOut" => Self::LoggedOut,
            "connection_lost" | "connectionLost" | "connection_closed" | "connectionClosed" => {
                Self::ConnectionLost
            },
            "connection_replaced" | "connectionReplaced" => Self::ConnectionReplaced,
            "restart_required" | "restartRequired" => Self::RestartRequired,
            "timed_out" | "timedOut" => Self::TimedOut,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoggedOut => f.write_str("logged out"),
            Self::ConnectionLost => f.write_str("connection lost"),
            Self::ConnectionReplaced => f.write_str("connection replaced"),
            Self::RestartRequired => f.write_str("restart required"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Other(reason) => f.write_str(reason),
        }
    }
}

/// Released once rotated credentials are durable. Dropping it without
/// calling [`RotationAck::ack`] signals that persisting failed.
pub struct RotationAck(Option<oneshot::Sender<()>>);

impl RotationAck {
    /// An ack nobody waits on.
    pub fn detached() -> Self {
        Self(None)
    }

    /// An ack paired with the receiver the adapter awaits.
    pub fn channel() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self(Some(tx)), rx)
    }

    pub fn ack(mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

impl fmt::Debug for RotationAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RotationAck")
            .field(&self.0.is_some())
            .finish()
    }
}

/// A message observed on the session. Only logged by the gateway.
#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    pub from: String,
    pub id: Option<String>,
    pub push_name: Option<String>,
    pub text: Option<String>,
}

/// Events emitted by an open session, delivered one at a time.
#[derive(Debug)]
pub enum SessionEvent {
    /// A fresh pairing code should be shown to the user.
    PairingCode(String),
    Connecting,
    Opened,
    Closed(CloseReason),
    /// New credentials must be persisted before `ack` is released.
    CredentialsRotated {
        credentials: Credentials,
        ack: RotationAck,
    },
    MessageReceived(InboundMessage),
}

/// Payload handed to [`SessionAdapter::send`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionPayload {
    Text {
        body: String,
    },
    Document {
        data: Bytes,
        mimetype: String,
        filename: String,
        caption: Option<String>,
    },
    Image {
        data: Bytes,
        mimetype: String,
        caption: Option<String>,
    },
}

impl SessionPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Document { .. } => "document",
            Self::Image { .. } => "image",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no session is open")]
    NotOpen,

    /// The session went away while the command was in flight.
    #[error("session disconnected: {0}")]
    Disconnected(String),

    #[error("rejected by session: {0}")]
    Rejected(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The external protocol session.
///
/// At most one session is open at a time; `open` replaces any previous one.
#[async_trait]
pub trait SessionAdapter: Send + Sync {
    /// Open a session, resuming from `credentials` when given. Returns the
    /// event stream for this session.
    async fn open(&self, credentials: Option<Credentials>) -> Result<SessionEvents, SessionError>;

    /// Transmit one message.
    async fn send(&self, to: &Address, payload: &SessionPayload) -> Result<(), SessionError>;

    /// Unlink the device from the account.
    async fn logout(&self) -> Result<(), SessionError>;

    /// Drop the current session without unlinking.
    async fn close(&self);
}
