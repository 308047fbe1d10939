//! WhatsApp session lifecycle and outbound dispatch.
//!
//! [`ConnectionManager`] owns the single protocol session: it opens it through
//! a [`wagate_channels::SessionAdapter`], reacts to the session's events
//! (pairing codes, open/close, credential rotation), keeps the pairing QR
//! image and stored credentials in step with the connection state, and
//! schedules reconnects. [`Dispatcher`] turns send requests into adapter
//! calls, refusing them unless the session is connected.

pub mod backoff;
pub mod bridge;
pub mod credentials;
pub mod dispatch;
pub mod error;
#[cfg(any(test, feature = "test-support"))]
pub mod fake;
pub mod lifecycle;
pub mod qr;
pub mod state;

pub use {
    backoff::ReconnectPolicy,
    bridge::BridgeAdapter,
    credentials::CredentialStore,
    dispatch::{
        Attachment, DispatchReceipt, Dispatcher, OutboundMessage, Recipient, UploadedFile,
        normalize_recipient,
    },
    error::{Error, Result},
    lifecycle::{ActionOutcome, ConnectedSession, ConnectionManager, ManagerOptions},
    qr::{PairingArtifact, QrArtifactManager},
    state::{ConnectionState, StatusSnapshot},
};
