//! Connection lifecycle manager.
//!
//! Owns the one protocol session per process. Every transition, whether it
//! comes from a session event or from an HTTP action, runs under the same
//! write lock; sends hold the read lock for their whole duration so the
//! state cannot flip underneath an in-flight send. Status is published on a
//! watch channel so readers never wait on the lock. Rotated credentials are
//! persisted off the lock, since an adapter may hold a send open until the
//! rotation is acknowledged.

use std::{
    path::PathBuf,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use {
    chrono::{DateTime, Utc},
    serde::Serialize,
    tokio::{
        sync::{Mutex, RwLock, RwLockReadGuard, watch},
        task::JoinHandle,
    },
    tracing::{debug, error, info, warn},
    wagate_channels::{
        Address, CloseReason, Credentials, RotationAck, SessionAdapter, SessionEvent,
        SessionEvents, SessionPayload,
    },
    wagate_config::WagateConfig,
};

use crate::{
    backoff::ReconnectPolicy,
    credentials::CredentialStore,
    error::{Error, Result},
    qr::QrArtifactManager,
    state::{ConnectionState, StatusSnapshot},
};

/// Route the HTTP layer serves the pairing image from.
pub const DEFAULT_PAIRING_IMAGE_URL: &str = "/api/v1/qr/image";

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub reconnect: ReconnectPolicy,
    pub pairing_image_url: String,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            pairing_image_url: DEFAULT_PAIRING_IMAGE_URL.into(),
        }
    }
}

/// Result of logout / regenerate / clear-auth. `success: false` is a normal
/// outcome (e.g. nothing to log out of), not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionOutcome {
    pub success: bool,
    pub message: String,
}

impl ActionOutcome {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn noop(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

struct Lifecycle {
    state: ConnectionState,
    changed_at: DateTime<Utc>,
    reconnect_attempt: u32,
    last_error: Option<String>,
    pump: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
}

struct Inner {
    adapter: Arc<dyn SessionAdapter>,
    credentials: CredentialStore,
    qr: QrArtifactManager,
    options: ManagerOptions,
    lifecycle: RwLock<Lifecycle>,
    status: watch::Sender<StatusSnapshot>,
    /// Bumped (under the write lock) whenever the current session is
    /// superseded; events and retry timers from older generations are dropped.
    generation: AtomicU64,
    /// Serializes credential writes from rotations against erasure.
    persist: Mutex<()>,
}

/// Handle to the session lifecycle. Clones share the same session.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

/// Proof that the session was connected when acquired; holds the state read
/// lock until dropped.
pub struct ConnectedSession<'a> {
    _guard: RwLockReadGuard<'a, Lifecycle>,
    adapter: &'a dyn SessionAdapter,
}

impl ConnectedSession<'_> {
    pub async fn send(&self, to: &Address, payload: &SessionPayload) -> Result<()> {
        self.adapter.send(to, payload).await.map_err(Error::from)
    }
}

impl ConnectionManager {
    pub fn new(
        adapter: Arc<dyn SessionAdapter>,
        credentials: CredentialStore,
        qr: QrArtifactManager,
        options: ManagerOptions,
    ) -> Self {
        let initial = StatusSnapshot::initial();
        let lifecycle = Lifecycle {
            state: initial.state,
            changed_at: initial.timestamp,
            reconnect_attempt: 0,
            last_error: None,
            pump: None,
            retry: None,
        };
        let (status, _) = watch::channel(initial);
        Self {
            inner: Arc::new(Inner {
                adapter,
                credentials,
                qr,
                options,
                lifecycle: RwLock::new(lifecycle),
                status,
                generation: AtomicU64::new(0),
                persist: Mutex::new(()),
            }),
        }
    }

    /// Build the manager with storage under the configured data directory.
    pub fn from_config(adapter: Arc<dyn SessionAdapter>, config: &WagateConfig) -> Result<Self> {
        config.validate()?;
        let data_dir = config.whatsapp.data_dir_or(wagate_config::data_dir());
        let credentials = CredentialStore::open(&data_dir.join("auth"))?;
        let qr = QrArtifactManager::new(data_dir.join("qr.png"))
            .with_terminal_output(config.whatsapp.print_qr_in_terminal);
        let options = ManagerOptions {
            reconnect: ReconnectPolicy::from_config(&config.reconnect),
            ..ManagerOptions::default()
        };
        Ok(Self::new(adapter, credentials, qr, options))
    }

    // ── Read side ───────────────────────────────────────────────────────────

    /// Latest status snapshot. Never blocks.
    pub fn status(&self) -> StatusSnapshot {
        self.inner.status.borrow().clone()
    }

    /// Receiver notified on every transition.
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.inner.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.status.borrow().connected
    }

    /// A pairing image is ready to be served.
    pub fn has_pairing_image(&self) -> bool {
        self.inner.status.borrow().state == ConnectionState::PairingReady
            && self.inner.qr.has_image()
    }

    pub fn pairing_image_path(&self) -> Option<PathBuf> {
        self.inner
            .qr
            .current()
            .and_then(|artifact| artifact.rendered_image_path)
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.inner.credentials
    }

    pub fn pairing(&self) -> &QrArtifactManager {
        &self.inner.qr
    }

    /// Lock the session for sending. Fails fast unless connected.
    pub async fn connected_session(&self) -> Result<ConnectedSession<'_>> {
        let guard = self.inner.lifecycle.read().await;
        if guard.state != ConnectionState::Connected {
            return Err(Error::ServiceUnavailable { state: guard.state });
        }
        Ok(ConnectedSession {
            _guard: guard,
            adapter: self.inner.adapter.as_ref(),
        })
    }

    // ── Actions ─────────────────────────────────────────────────────────────

    /// Open a session unless one is already live. Failures land in `Failed`.
    pub async fn initialize(&self) {
        let mut lc = self.inner.lifecycle.write().await;
        self.initialize_locked(&mut lc).await;
    }

    /// Log out of the current session and forget its credentials.
    pub async fn logout(&self) -> ActionOutcome {
        let mut lc = self.inner.lifecycle.write().await;
        if !lc.state.has_session() && lc.state != ConnectionState::Reconnecting {
            debug!(state = %lc.state, "logout requested without an active session");
            return ActionOutcome::noop("No active session to logout");
        }

        self.end_session(&mut lc).await;
        self.inner.qr.discard().await;
        if let Err(e) = self.erase_credentials(false).await {
            warn!(error = %e, "failed to erase credentials on logout");
        }
        self.set_state(&mut lc, ConnectionState::LoggedOut);
        info!("logged out");
        ActionOutcome::ok("Logged out successfully")
    }

    /// Drop the current pairing attempt and start a fresh one.
    ///
    /// A confirmed identity survives unless the session was connected (in
    /// which case it is logged out first), so the adapter may resume silently
    /// instead of showing a new code.
    pub async fn regenerate_qr(&self) -> ActionOutcome {
        let mut lc = self.inner.lifecycle.write().await;
        let was_connected = lc.state == ConnectionState::Connected;

        self.end_session(&mut lc).await;
        self.inner.qr.discard().await;
        if let Err(e) = self.erase_credentials(!was_connected).await {
            warn!(error = %e, "failed to clear pairing credentials");
        }

        self.set_state(&mut lc, ConnectionState::Disconnected);
        self.initialize_locked(&mut lc).await;
        self.restart_outcome(&lc, "QR code regeneration initiated")
    }

    /// Forget all credentials and start pairing from scratch.
    pub async fn clear_auth(&self) -> ActionOutcome {
        let mut lc = self.inner.lifecycle.write().await;

        self.end_session(&mut lc).await;
        self.inner.qr.discard().await;
        if let Err(e) = self.erase_credentials(false).await {
            error!(error = %e, "failed to erase credentials");
            self.set_state(&mut lc, ConnectionState::Disconnected);
            return ActionOutcome::noop(format!("Failed to clear authentication: {e}"));
        }

        self.set_state(&mut lc, ConnectionState::Disconnected);
        self.initialize_locked(&mut lc).await;
        self.restart_outcome(&lc, "Authentication cleared, a new QR code will be generated")
    }

    /// Close the session without unlinking the device. Credentials are kept
    /// so the next start resumes silently.
    pub async fn shutdown(&self) {
        let mut lc = self.inner.lifecycle.write().await;
        if lc.state.has_session() {
            self.inner.adapter.close().await;
        }
        self.next_generation();
        lc.reconnect_attempt = 0;
        if let Some(pump) = lc.pump.take() {
            pump.abort();
        }
        if let Some(retry) = lc.retry.take() {
            retry.abort();
        }
        self.inner.qr.discard().await;
        self.set_state(&mut lc, ConnectionState::Disconnected);
    }

    // ── Internals ───────────────────────────────────────────────────────────

    async fn initialize_locked(&self, lc: &mut Lifecycle) {
        if lc.state.has_session() {
            debug!(state = %lc.state, "session already initialized");
            return;
        }

        let generation = self.next_generation();
        if let Some(pump) = lc.pump.take() {
            pump.abort();
        }
        if let Some(retry) = lc.retry.take() {
            retry.abort();
        }
        self.set_state(lc, ConnectionState::Connecting);

        let credentials = match self.inner.credentials.load() {
            Ok(credentials) => credentials,
            Err(e) => {
                self.fail(lc, Error::Initialization(format!("cannot read credentials: {e}")));
                return;
            },
        };

        info!(
            resume = credentials.is_some(),
            generation,
            "initializing WhatsApp session"
        );
        match self.inner.adapter.open(credentials).await {
            Ok(events) => {
                lc.last_error = None;
                lc.pump = Some(self.spawn_pump(generation, events));
                self.publish(lc);
            },
            Err(e) => self.fail(lc, Error::Initialization(e.to_string())),
        }
    }

    /// Tear down whatever session or retry timer is live and invalidate its
    /// pending events.
    async fn end_session(&self, lc: &mut Lifecycle) {
        match lc.state {
            ConnectionState::Connected => {
                if let Err(e) = self.inner.adapter.logout().await {
                    warn!(error = %e, "session logout failed, closing anyway");
                }
                self.inner.adapter.close().await;
            },
            ConnectionState::Connecting | ConnectionState::PairingReady => {
                self.inner.adapter.close().await;
            },
            _ => {},
        }

        self.next_generation();
        lc.reconnect_attempt = 0;
        if let Some(pump) = lc.pump.take() {
            pump.abort();
        }
        if let Some(retry) = lc.retry.take() {
            retry.abort();
        }
    }

    fn spawn_pump(&self, generation: u64, mut events: SessionEvents) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(manager) = Self::upgrade(&weak) else {
                    break;
                };
                manager.handle_event(generation, event).await;
            }
            debug!(generation, "session event stream ended");
        })
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    async fn handle_event(&self, generation: u64, event: SessionEvent) {
        let event = match event {
            SessionEvent::MessageReceived(msg) => {
                debug!(
                    from = %msg.from,
                    id = msg.id.as_deref().unwrap_or("-"),
                    push_name = msg.push_name.as_deref().unwrap_or("-"),
                    has_text = msg.text.is_some(),
                    "inbound message"
                );
                return;
            },
            SessionEvent::CredentialsRotated { credentials, ack } => {
                self.persist_rotation(generation, &credentials, ack).await;
                return;
            },
            other => other,
        };

        let mut lc = self.inner.lifecycle.write().await;
        let current = self.generation();
        if current != generation {
            debug!(generation, current, "dropping event from superseded session");
            return;
        }

        match event {
            SessionEvent::PairingCode(code) => match lc.state {
                ConnectionState::Connecting | ConnectionState::PairingReady => {
                    self.inner.qr.issue(&code).await;
                    self.set_state(&mut lc, ConnectionState::PairingReady);
                },
                other => warn!(state = %other, "ignoring pairing code"),
            },
            SessionEvent::Connecting => match lc.state {
                ConnectionState::PairingReady => {
                    self.inner.qr.discard().await;
                    self.set_state(&mut lc, ConnectionState::Connecting);
                },
                ConnectionState::Connecting => debug!("session connecting"),
                other => debug!(state = %other, "ignoring connecting event"),
            },
            SessionEvent::Opened => match lc.state {
                ConnectionState::Connecting
                | ConnectionState::PairingReady
                | ConnectionState::Reconnecting
                | ConnectionState::Connected => {
                    self.inner.qr.discard().await;
                    if let Err(e) = self.inner.credentials.promote_pending().await {
                        error!(error = %e, "failed to promote pending credentials");
                    }
                    lc.reconnect_attempt = 0;
                    lc.last_error = None;
                    self.set_state(&mut lc, ConnectionState::Connected);
                },
                other => warn!(state = %other, "ignoring open event"),
            },
            SessionEvent::Closed(reason) => self.on_closed(&mut lc, reason).await,
            SessionEvent::CredentialsRotated { .. } | SessionEvent::MessageReceived(_) => {},
        }
    }

    /// Store rotated credentials, then release the adapter's ack. Once a
    /// device identity exists (or the session is open) the rotation replaces
    /// it; before that it stays pending until the first open.
    ///
    /// Does not touch the lifecycle lock: an in-flight send holds the read
    /// side and may be waiting on this very ack.
    async fn persist_rotation(&self, generation: u64, credentials: &Credentials, ack: RotationAck) {
        let _persist = self.inner.persist.lock().await;
        if self.generation() != generation {
            debug!(generation, "dropping credentials from superseded session");
            return;
        }

        let store = &self.inner.credentials;
        let confirmed = match store.has_identity() {
            Ok(has_identity) => has_identity || self.is_connected(),
            Err(e) => {
                error!(error = %e, "failed to read credential store");
                return;
            },
        };
        match store.save(credentials, confirmed).await {
            Ok(()) => ack.ack(),
            Err(e) => error!(error = %e, "failed to persist rotated credentials"),
        }
    }

    /// Erase stored credentials (only the unconfirmed ones when
    /// `pending_only`). Callers bump the generation first so a rotation from
    /// the old session cannot land afterwards.
    async fn erase_credentials(&self, pending_only: bool) -> Result<()> {
        let _persist = self.inner.persist.lock().await;
        if pending_only {
            self.inner.credentials.clear_pending().await
        } else {
            self.inner.credentials.clear().await
        }
    }

    async fn on_closed(&self, lc: &mut Lifecycle, reason: CloseReason) {
        self.inner.qr.discard().await;
        // Runs on the pump task itself, so detach rather than abort.
        lc.pump = None;

        if reason.is_logout() {
            info!("connection closed, logged out");
            self.next_generation();
            if let Err(e) = self.erase_credentials(false).await {
                warn!(error = %e, "failed to erase credentials after remote logout");
            }
            self.set_state(lc, ConnectionState::LoggedOut);
            return;
        }

        let generation = self.next_generation();
        lc.reconnect_attempt += 1;
        let attempt = lc.reconnect_attempt;
        let Some(delay) = self.inner.options.reconnect.delay_for(attempt) else {
            self.fail(
                lc,
                Error::Initialization(format!(
                    "reconnect attempts exhausted after {} tries (last close: {reason})",
                    attempt - 1
                )),
            );
            return;
        };

        info!(%reason, attempt, delay = ?delay, "connection closed, reconnecting");
        self.set_state(lc, ConnectionState::Reconnecting);

        let weak = Arc::downgrade(&self.inner);
        lc.retry = Some(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Some(manager) = Self::upgrade(&weak) {
                manager.retry_initialize(generation).await;
            }
        }));
    }

    async fn retry_initialize(&self, generation: u64) {
        let mut lc = self.inner.lifecycle.write().await;
        if self.generation() != generation || lc.state != ConnectionState::Reconnecting {
            debug!(generation, "reconnect superseded");
            return;
        }
        // This task owns the handle; detach it so initialize does not abort us.
        lc.retry = None;
        self.initialize_locked(&mut lc).await;
    }

    fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Supersede the current session. Only called with the write lock held.
    fn next_generation(&self) -> u64 {
        self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn fail(&self, lc: &mut Lifecycle, err: Error) {
        error!(error = %err, "WhatsApp session failed");
        lc.last_error = Some(err.to_string());
        self.set_state(lc, ConnectionState::Failed);
    }

    fn restart_outcome(&self, lc: &Lifecycle, message: &str) -> ActionOutcome {
        match lc.state {
            ConnectionState::Failed => ActionOutcome::noop(
                lc.last_error
                    .clone()
                    .unwrap_or_else(|| "session failed to start".into()),
            ),
            _ => ActionOutcome::ok(message),
        }
    }

    fn set_state(&self, lc: &mut Lifecycle, state: ConnectionState) {
        if lc.state != state {
            info!(from = %lc.state, to = %state, "connection state changed");
        }
        lc.state = state;
        lc.changed_at = Utc::now();
        self.publish(lc);
    }

    fn publish(&self, lc: &Lifecycle) {
        let pairing_image_url = (lc.state == ConnectionState::PairingReady
            && self.inner.qr.has_image())
        .then(|| self.inner.options.pairing_image_url.clone());
        self.inner.status.send_replace(StatusSnapshot {
            connected: lc.state == ConnectionState::Connected,
            state: lc.state,
            pairing_image_url,
            timestamp: lc.changed_at,
            last_error: lc.last_error.clone(),
            reconnect_attempt: lc.reconnect_attempt,
        });
    }
}
