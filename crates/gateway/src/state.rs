use std::sync::Arc;

use wagate_whatsapp::{ConnectionManager, Dispatcher};

use crate::auth::ResolvedAuth;

/// Shared state handed to every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub manager: ConnectionManager,
    pub dispatcher: Dispatcher,
    pub auth: Arc<ResolvedAuth>,
    /// Largest decoded file accepted from a request.
    pub max_upload_bytes: usize,
    pub version: &'static str,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher, auth: ResolvedAuth, max_upload_bytes: usize) -> Self {
        Self {
            manager: dispatcher.manager().clone(),
            dispatcher,
            auth: Arc::new(auth),
            max_upload_bytes,
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}
