//! Session adapter backed by an external bridge process.
//!
//! The bridge speaks newline-delimited JSON on stdio. Commands carry an `op`
//! tag, events an `event` tag; `send` and `logout` are correlated with their
//! `result` event by a numeric id.

use std::{
    collections::HashMap,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    anyhow::Context,
    async_trait::async_trait,
    base64::{Engine as _, engine::general_purpose::STANDARD as BASE64},
    serde::{Deserialize, Serialize},
    tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        process::{Child, ChildStdin, ChildStdout, Command},
        sync::{Mutex, mpsc, oneshot},
        task::JoinHandle,
    },
    tracing::{debug, info, trace, warn},
    wagate_channels::{
        Address, CloseReason, Credentials, InboundMessage, RotationAck, SessionAdapter,
        SessionError, SessionEvent, SessionEvents, SessionPayload,
    },
    wagate_config::BridgeConfig,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<(), String>>>>>;

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum WireCommand<'a> {
    Open {
        #[serde(skip_serializing_if = "Option::is_none")]
        credentials: Option<String>,
    },
    Send {
        id: u64,
        to: &'a str,
        payload: WirePayload<'a>,
    },
    Logout {
        id: u64,
    },
    CredsAck {
        id: u64,
    },
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WirePayload<'a> {
    Text {
        body: &'a str,
    },
    Document {
        data: String,
        mimetype: &'a str,
        filename: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        caption: Option<&'a str>,
    },
    Image {
        data: String,
        mimetype: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        caption: Option<&'a str>,
    },
}

impl<'a> From<&'a SessionPayload> for WirePayload<'a> {
    fn from(payload: &'a SessionPayload) -> Self {
        match payload {
            SessionPayload::Text { body } => Self::Text { body },
            SessionPayload::Document {
                data,
                mimetype,
                filename,
                caption,
            } => Self::Document {
                data: BASE64.encode(data),
                mimetype,
                filename,
                caption: caption.as_deref(),
            },
            SessionPayload::Image {
                data,
                mimetype,
                caption,
            } => Self::Image {
                data: BASE64.encode(data),
                mimetype,
                caption: caption.as_deref(),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum WireEvent {
    Qr {
        code: String,
    },
    Connecting,
    Open,
    Close {
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        status_code: Option<u16>,
    },
    Creds {
        id: u64,
        blob: String,
    },
    Message {
        from: String,
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        push_name: Option<String>,
        #[serde(default)]
        text: Option<String>,
    },
    Result {
        id: u64,
        ok: bool,
        #[serde(default)]
        error: Option<String>,
    },
}

fn close_reason(reason: Option<String>, status_code: Option<u16>) -> CloseReason {
    match (status_code, reason) {
        (Some(code), _) => CloseReason::from_status_code(code),
        (None, Some(name)) => CloseReason::from_name(&name),
        (None, None) => CloseReason::ConnectionLost,
    }
}

/// One running bridge process.
struct BridgeSession {
    child: Mutex<Child>,
    stdin: Arc<Mutex<ChildStdin>>,
    pending: Pending,
    next_id: AtomicU64,
    tasks: Vec<JoinHandle<()>>,
}

impl BridgeSession {
    async fn request<'a>(
        &self,
        build: impl FnOnce(u64) -> WireCommand<'a>,
    ) -> Result<(), SessionError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if let Err(e) = write_command(&self.stdin, &build(id)).await {
            self.pending.lock().await.remove(&id);
            return Err(SessionError::Disconnected(format!("{e:#}")));
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(SessionError::Rejected(reason)),
            Ok(Err(_)) => Err(SessionError::Disconnected("bridge exited".into())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(SessionError::Other(anyhow::anyhow!(
                    "bridge request {id} timed out after {}s",
                    REQUEST_TIMEOUT.as_secs()
                )))
            },
        }
    }

    async fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            debug!(error = %e, "bridge process already gone");
        }
        for (_, tx) in self.pending.lock().await.drain() {
            let _ = tx.send(Err("session closed".into()));
        }
    }
}

async fn write_command(stdin: &Mutex<ChildStdin>, command: &WireCommand<'_>) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(command)?;
    line.push('\n');
    let mut stdin = stdin.lock().await;
    stdin
        .write_all(line.as_bytes())
        .await
        .context("write to bridge stdin")?;
    stdin.flush().await?;
    Ok(())
}

/// [`SessionAdapter`] that drives a bridge child process.
pub struct BridgeAdapter {
    config: BridgeConfig,
    session: Mutex<Option<Arc<BridgeSession>>>,
}

impl BridgeAdapter {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
        }
    }

    async fn current(&self) -> Result<Arc<BridgeSession>, SessionError> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(Arc::clone)
            .ok_or(SessionError::NotOpen)
    }

    fn spawn(&self) -> anyhow::Result<(Child, ChildStdin, ChildStdout)> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn bridge: {}", self.config.command))?;
        let stdin = child.stdin.take().context("failed to capture bridge stdin")?;
        let stdout = child
            .stdout
            .take()
            .context("failed to capture bridge stdout")?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "wagate_whatsapp::bridge::stderr", "{line}");
                }
            });
        }
        Ok((child, stdin, stdout))
    }
}

#[async_trait]
impl SessionAdapter for BridgeAdapter {
    async fn open(&self, credentials: Option<Credentials>) -> Result<SessionEvents, SessionError> {
        let mut slot = self.session.lock().await;
        if let Some(previous) = slot.take() {
            previous.shutdown().await;
        }

        let (child, stdin, stdout) = self.spawn()?;
        let stdin = Arc::new(Mutex::new(stdin));
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_events(
            stdout,
            events_tx,
            Arc::clone(&pending),
            Arc::clone(&stdin),
        ));

        let open = WireCommand::Open {
            credentials: credentials.map(|c| BASE64.encode(c.as_bytes())),
        };
        let session = Arc::new(BridgeSession {
            child: Mutex::new(child),
            stdin,
            pending,
            next_id: AtomicU64::new(1),
            tasks: vec![reader],
        });
        if let Err(e) = write_command(&session.stdin, &open).await {
            session.shutdown().await;
            return Err(SessionError::Other(e));
        }

        info!(command = %self.config.command, "bridge session started");
        *slot = Some(session);
        Ok(events_rx)
    }

    async fn send(&self, to: &Address, payload: &SessionPayload) -> Result<(), SessionError> {
        let session = self.current().await?;
        trace!(to = %to, kind = payload.kind(), "send -> bridge");
        session
            .request(|id| WireCommand::Send {
                id,
                to: to.as_str(),
                payload: payload.into(),
            })
            .await
    }

    async fn logout(&self) -> Result<(), SessionError> {
        let session = self.current().await?;
        session.request(|id| WireCommand::Logout { id }).await
    }

    async fn close(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.shutdown().await;
            debug!("bridge session closed");
        }
    }
}

async fn read_events(
    stdout: ChildStdout,
    events: mpsc::UnboundedSender<SessionEvent>,
    pending: Pending,
    stdin: Arc<Mutex<ChildStdin>>,
) {
    let mut closed = false;
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("bridge stdout closed");
                break;
            },
            Err(e) => {
                warn!(error = %e, "error reading from bridge stdout");
                break;
            },
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        trace!(raw = %trimmed, "bridge -> gateway");

        let event = match serde_json::from_str::<WireEvent>(trimmed) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "unparseable bridge event");
                continue;
            },
        };

        let forwarded = match event {
            WireEvent::Qr { code } => SessionEvent::PairingCode(code),
            WireEvent::Connecting => SessionEvent::Connecting,
            WireEvent::Open => SessionEvent::Opened,
            WireEvent::Close {
                reason,
                status_code,
            } => {
                closed = true;
                SessionEvent::Closed(close_reason(reason, status_code))
            },
            WireEvent::Creds { id, blob } => {
                let blob = match BASE64.decode(blob.as_bytes()) {
                    Ok(blob) => blob,
                    Err(e) => {
                        warn!(id, error = %e, "bridge sent undecodable credentials");
                        continue;
                    },
                };
                let (ack, acked) = RotationAck::channel();
                let stdin = Arc::clone(&stdin);
                tokio::spawn(async move {
                    if acked.await.is_err() {
                        warn!(id, "rotated credentials were not persisted");
                        return;
                    }
                    if let Err(e) = write_command(&stdin, &WireCommand::CredsAck { id }).await {
                        warn!(id, error = %e, "failed to acknowledge credentials");
                    }
                });
                SessionEvent::CredentialsRotated {
                    credentials: Credentials::new(blob),
                    ack,
                }
            },
            WireEvent::Message {
                from,
                id,
                push_name,
                text,
            } => SessionEvent::MessageReceived(InboundMessage {
                from,
                id,
                push_name,
                text,
            }),
            WireEvent::Result { id, ok, error } => {
                match pending.lock().await.remove(&id) {
                    Some(tx) => {
                        let outcome = if ok {
                            Ok(())
                        } else {
                            Err(error.unwrap_or_else(|| "rejected by bridge".into()))
                        };
                        let _ = tx.send(outcome);
                    },
                    None => warn!(id, "result for unknown bridge request"),
                }
                continue;
            },
        };

        if events.send(forwarded).is_err() {
            debug!("session event receiver dropped");
        }
    }

    for (_, tx) in pending.lock().await.drain() {
        let _ = tx.send(Err("bridge exited".into()));
    }
    if !closed {
        let _ = events.send(SessionEvent::Closed(CloseReason::ConnectionLost));
    }
}

#[cfg(test)]
mod tests {
    use {super::*, bytes::Bytes};

    fn script(body: &str) -> BridgeAdapter {
        BridgeAdapter::new(BridgeConfig {
            command: "sh".into(),
            args: vec!["-c".into(), body.into()],
            env: HashMap::new(),
        })
    }

    async fn next(events: &mut SessionEvents) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn forwards_pairing_and_open() {
        let adapter = script(
            r#"read open; echo '{"event":"qr","code":"2@abc"}'; echo '{"event":"open"}'; cat >/dev/null"#,
        );
        let mut events = adapter.open(None).await.unwrap();
        assert!(matches!(next(&mut events).await, SessionEvent::PairingCode(c) if c == "2@abc"));
        assert!(matches!(next(&mut events).await, SessionEvent::Opened));
        adapter.close().await;
    }

    #[tokio::test]
    async fn send_resolves_with_result_event() {
        let adapter = script(
            r#"read open; echo '{"event":"open"}'; read cmd; echo '{"event":"result","id":1,"ok":true}'; read cmd; echo '{"event":"result","id":2,"ok":false,"error":"not on whatsapp"}'; cat >/dev/null"#,
        );
        let mut events = adapter.open(None).await.unwrap();
        assert!(matches!(next(&mut events).await, SessionEvent::Opened));

        let to = Address::individual("628123");
        let payload = SessionPayload::Image {
            data: Bytes::from_static(b"img"),
            mimetype: "image/png".into(),
            caption: None,
        };
        adapter.send(&to, &payload).await.unwrap();

        let err = adapter.send(&to, &payload).await.unwrap_err();
        assert!(matches!(err, SessionError::Rejected(ref m) if m == "not on whatsapp"));
        adapter.close().await;
    }

    #[tokio::test]
    async fn credentials_are_acked_after_persist() {
        let adapter = script(
            r#"read open; echo '{"event":"creds","id":7,"blob":"aGVsbG8="}'; read ack; case "$ack" in *creds_ack*'"id":7'*) echo '{"event":"open"}';; esac; cat >/dev/null"#,
        );
        let mut events = adapter.open(None).await.unwrap();
        match next(&mut events).await {
            SessionEvent::CredentialsRotated { credentials, ack } => {
                assert_eq!(credentials.as_bytes(), b"hello");
                ack.ack();
            },
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(next(&mut events).await, SessionEvent::Opened));
        adapter.close().await;
    }

    #[tokio::test]
    async fn close_status_code_maps_to_reason() {
        let adapter = script(
            r#"read open; echo '{"event":"close","reason":"whatever","status_code":401}'; cat >/dev/null"#,
        );
        let mut events = adapter.open(None).await.unwrap();
        assert!(matches!(
            next(&mut events).await,
            SessionEvent::Closed(CloseReason::LoggedOut)
        ));
        adapter.close().await;
    }

    #[tokio::test]
    async fn process_exit_reports_connection_lost() {
        let adapter = script("read open; exit 0");
        let mut events = adapter.open(None).await.unwrap();
        assert!(matches!(
            next(&mut events).await,
            SessionEvent::Closed(CloseReason::ConnectionLost)
        ));
    }

    #[tokio::test]
    async fn open_passes_credentials() {
        let adapter = script(
            r#"read open; case "$open" in *'"credentials":"c2VjcmV0"'*) echo '{"event":"open"}';; *) echo '{"event":"qr","code":"x"}';; esac; cat >/dev/null"#,
        );
        let mut events = adapter
            .open(Some(Credentials::new(b"secret".to_vec())))
            .await
            .unwrap();
        assert!(matches!(next(&mut events).await, SessionEvent::Opened));
        adapter.close().await;
    }

    #[tokio::test]
    async fn send_without_session_is_not_open() {
        let adapter = script("cat");
        let err = adapter
            .send(&Address::individual("1"), &SessionPayload::Text {
                body: "hi".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NotOpen));
    }

    #[tokio::test]
    async fn nonexistent_command_fails_to_open() {
        let adapter = BridgeAdapter::new(BridgeConfig {
            command: "nonexistent_bridge_xyz_42".into(),
            ..BridgeConfig::default()
        });
        assert!(adapter.open(None).await.is_err());
    }

    #[test]
    fn payload_wire_shape() {
        let payload = SessionPayload::Document {
            data: Bytes::from_static(b"pdf"),
            mimetype: "application/pdf".into(),
            filename: "a.pdf".into(),
            caption: Some("invoice".into()),
        };
        let cmd = WireCommand::Send {
            id: 3,
            to: "1@s.whatsapp.net",
            payload: (&payload).into(),
        };
        let json: serde_json::Value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["op"], "send");
        assert_eq!(json["payload"]["type"], "document");
        assert_eq!(json["payload"]["data"], "cGRm");
        assert_eq!(json["payload"]["caption"], "invoice");
    }
}
