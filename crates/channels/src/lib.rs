//! Session adapter boundary.
//!
//! The chat protocol client (pairing, encryption, transport) lives behind the
//! [`SessionAdapter`] trait. The lifecycle manager only ever sees the
//! commands and [`SessionEvent`]s defined here, so it can be driven by the
//! real bridge process or by an in-memory fake in tests.

pub mod address;
pub mod session;

pub use {
    address::{Address, AddressKind, GROUP_SUFFIX, INDIVIDUAL_SUFFIX},
    session::{
        CloseReason, Credentials, InboundMessage, RotationAck, SessionAdapter, SessionError,
        SessionEvent, SessionEvents, SessionPayload,
    },
};
