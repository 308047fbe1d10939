//! Gateway: the HTTP surface over the WhatsApp session.
//!
//! Lifecycle:
//! 1. Build the bridge adapter, connection manager and dispatcher from config
//! 2. Resolve API auth, bind address
//! 3. Start the session (pairing or silent resume)
//! 4. Serve `/api/v1` until ctrl-c, then close the session
//!
//! Handlers only parse requests and shape JSON envelopes; connection state and
//! sending live in `wagate-whatsapp`.

pub mod auth;
pub mod error;
pub mod messages;
pub mod payload;
pub mod qr;
pub mod server;
pub mod state;

pub use {
    server::{API_PREFIX, build_app, build_state, start_gateway},
    state::AppState,
};
