//! In-memory [`SessionAdapter`] for tests. Events are injected by hand.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use {
    async_trait::async_trait,
    tokio::sync::mpsc,
    wagate_channels::{
        Address, Credentials, RotationAck, SessionAdapter, SessionError, SessionEvent,
        SessionEvents, SessionPayload,
    },
};

#[derive(Default)]
struct FakeState {
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
    opens: Vec<Option<Credentials>>,
    sent: Vec<(Address, SessionPayload)>,
    logouts: usize,
    closes: usize,
    fail_open: Option<String>,
    fail_send: Option<String>,
    rotate_on_send: Option<Credentials>,
}

/// Records every call and lets tests play the remote side.
#[derive(Default)]
pub struct FakeAdapter {
    state: Mutex<FakeState>,
}

impl FakeAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver an event on the most recently opened session.
    pub fn emit(&self, event: SessionEvent) -> bool {
        self.lock()
            .events
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    pub fn open_count(&self) -> usize {
        self.lock().opens.len()
    }

    /// Credentials passed to each `open`, oldest first.
    pub fn opened_with(&self) -> Vec<Option<Credentials>> {
        self.lock().opens.clone()
    }

    pub fn sent(&self) -> Vec<(Address, SessionPayload)> {
        self.lock().sent.clone()
    }

    pub fn logout_count(&self) -> usize {
        self.lock().logouts
    }

    pub fn close_count(&self) -> usize {
        self.lock().closes
    }

    pub fn fail_next_open(&self, reason: &str) {
        self.lock().fail_open = Some(reason.to_string());
    }

    /// Reject every send with `reason`; `None` restores success.
    pub fn fail_sends(&self, reason: Option<&str>) {
        self.lock().fail_send = reason.map(str::to_string);
    }

    /// Make the next send rotate credentials and hold until the rotation is
    /// acknowledged, failing after two seconds.
    pub fn rotate_on_next_send(&self, credentials: Credentials) {
        self.lock().rotate_on_send = Some(credentials);
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SessionAdapter for FakeAdapter {
    async fn open(&self, credentials: Option<Credentials>) -> Result<SessionEvents, SessionError> {
        let mut state = self.lock();
        state.opens.push(credentials);
        if let Some(reason) = state.fail_open.take() {
            state.events = None;
            return Err(SessionError::Other(anyhow::anyhow!(reason)));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.events = Some(tx);
        Ok(rx)
    }

    async fn send(&self, to: &Address, payload: &SessionPayload) -> Result<(), SessionError> {
        let rotation = {
            let mut state = self.lock();
            if let Some(reason) = &state.fail_send {
                return Err(SessionError::Rejected(reason.clone()));
            }
            state
                .rotate_on_send
                .take()
                .map(|credentials| (credentials, state.events.clone()))
        };

        if let Some((credentials, events)) = rotation {
            let (ack, acked) = RotationAck::channel();
            let delivered = events.is_some_and(|tx| {
                tx.send(SessionEvent::CredentialsRotated { credentials, ack })
                    .is_ok()
            });
            if !delivered {
                return Err(SessionError::NotOpen);
            }
            if !matches!(
                tokio::time::timeout(Duration::from_secs(2), acked).await,
                Ok(Ok(()))
            ) {
                return Err(SessionError::Disconnected(
                    "rotation ack never arrived".into(),
                ));
            }
        }

        self.lock().sent.push((to.clone(), payload.clone()));
        Ok(())
    }

    async fn logout(&self) -> Result<(), SessionError> {
        self.lock().logouts += 1;
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.lock();
        state.closes += 1;
        state.events = None;
    }
}
