use std::{net::SocketAddr, sync::Arc};

use {
    axum::{
        Json, Router,
        extract::{DefaultBodyLimit, State},
        http::{StatusCode, Uri},
        middleware,
        response::IntoResponse,
        routing::{get, post},
    },
    chrono::Utc,
    serde_json::{Value, json},
    tower_http::{
        cors::{Any, CorsLayer},
        trace::TraceLayer,
    },
    tracing::{info, warn},
    wagate_channels::SessionAdapter,
    wagate_config::WagateConfig,
    wagate_whatsapp::{BridgeAdapter, ConnectionManager, Dispatcher},
};

use crate::{auth, auth::ResolvedAuth, messages, qr, state::AppState};

/// Mount point of the versioned API.
pub const API_PREFIX: &str = "/api/v1";

// ── Router ───────────────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Base64 inflates payloads by a third; leave room for the JSON around it.
    let body_limit = state.max_upload_bytes / 3 * 4 + 64 * 1024;

    let protected = Router::new()
        .route("/status", get(status_handler))
        .route("/message", post(messages::send_message))
        .route("/message/group", post(messages::send_group_message))
        .route("/document", post(messages::send_document))
        .route("/document/upload", post(messages::upload_document))
        .route("/image", post(messages::send_image))
        .route("/image/upload", post(messages::upload_image))
        .route("/analyze-base64", post(messages::analyze_base64))
        .route("/convert-to-base64", post(messages::convert_to_base64))
        .route("/qr/status", get(qr::qr_status))
        .route("/qr/image", get(qr::qr_image))
        .route("/qr/logout", post(qr::logout))
        .route("/qr/regenerate", post(qr::regenerate))
        .route("/qr/clear-auth", post(qr::clear_auth))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_token,
        ));

    let api = Router::new()
        .route("/ping", get(ping_handler))
        .merge(protected);

    Router::new()
        .nest(API_PREFIX, api)
        .fallback(not_found_handler)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Wire the bridge-backed session into a gateway state.
pub fn build_state(config: &WagateConfig) -> anyhow::Result<AppState> {
    let adapter: Arc<dyn SessionAdapter> =
        Arc::new(BridgeAdapter::new(config.whatsapp.bridge.clone()));
    let manager = ConnectionManager::from_config(adapter, config)?;
    let dispatcher = Dispatcher::from_config(manager, config);
    let auth = ResolvedAuth::new(config.server.api_token.clone());
    Ok(AppState::new(
        dispatcher,
        auth,
        config.server.max_upload_bytes,
    ))
}

/// Start the WhatsApp session and serve the HTTP API until ctrl-c.
pub async fn start_gateway(config: WagateConfig) -> anyhow::Result<()> {
    let state = build_state(&config)?;
    if !state.auth.is_enabled() {
        warn!("no API token configured, the HTTP API is unauthenticated");
    }

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Startup banner.
    let lines = [
        format!("wagate gateway v{}", state.version),
        format!("listening on http://{addr}{API_PREFIX}"),
        format!(
            "auth: {}",
            if state.auth.is_enabled() {
                "token"
            } else {
                "none"
            }
        ),
        format!(
            "credentials: {}",
            state.manager.credentials().path().display()
        ),
    ];
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    state.manager.initialize().await;

    let manager = state.manager.clone();
    let app = build_app(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutdown requested");
        })
        .await?;

    manager.shutdown().await;
    info!("gateway stopped");
    Ok(())
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn ping_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "success": true,
        "message": "pong",
        "version": state.version,
        "timestamp": Utc::now(),
    }))
}

async fn status_handler(State(state): State<AppState>) -> Json<Value> {
    let status = state.manager.status();
    Json(json!({
        "success": true,
        "data": {
            "connected": status.connected,
            "connectionStatus": status.state,
            "qrCodeImageUrl": status.pairing_image_url,
            "reconnectAttempt": status.reconnect_attempt,
            "lastError": status.last_error,
            "timestamp": status.timestamp,
        },
    }))
}

async fn not_found_handler(uri: Uri) -> impl IntoResponse {
    warn!(path = %uri.path(), "route not found");
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "success": false,
            "error": "Route not found",
        })),
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use {
        super::*,
        axum::{
            body::{Body, to_bytes},
            http::{Request, header},
        },
        secrecy::Secret,
        tower::ServiceExt,
        wagate_channels::{SessionEvent, SessionPayload},
        wagate_whatsapp::{
            ConnectionState, CredentialStore, ManagerOptions, QrArtifactManager, ReconnectPolicy,
            fake::FakeAdapter,
        },
    };

    struct TestApp {
        _dir: tempfile::TempDir,
        adapter: Arc<FakeAdapter>,
        state: AppState,
    }

    impl TestApp {
        fn new(token: Option<&str>) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let adapter = FakeAdapter::new();
            let manager = ConnectionManager::new(
                adapter.clone(),
                CredentialStore::open(&dir.path().join("auth")).unwrap(),
                QrArtifactManager::new(dir.path().join("qr.png")),
                ManagerOptions {
                    reconnect: ReconnectPolicy::immediate(),
                    ..ManagerOptions::default()
                },
            );
            let dispatcher = Dispatcher::new(manager, "62", None);
            let auth = ResolvedAuth::new(token.map(|t| Secret::new(t.to_string())));
            Self {
                _dir: dir,
                adapter,
                state: AppState::new(dispatcher, auth, 1024 * 1024),
            }
        }

        async fn reach(&self, state: ConnectionState) {
            let mut rx = self.state.manager.subscribe();
            tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.state == state))
                .await
                .unwrap()
                .unwrap();
        }

        async fn connect(&self) {
            self.state.manager.initialize().await;
            self.adapter.emit(SessionEvent::Opened);
            self.reach(ConnectionState::Connected).await;
        }

        async fn call(&self, req: Request<Body>) -> (StatusCode, Vec<u8>) {
            let resp = build_app(self.state.clone()).oneshot(req).await.unwrap();
            let status = resp.status();
            let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
            (status, bytes.to_vec())
        }

        async fn json(&self, req: Request<Body>) -> (StatusCode, Value) {
            let (status, bytes) = self.call(req).await;
            (status, serde_json::from_slice(&bytes).unwrap())
        }
    }

    fn get(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    fn post_json(path: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn multipart(path: &str, parts: &[(&str, Option<(&str, &str)>, &str)]) -> Request<Body> {
        let boundary = "wagate-test-boundary";
        let mut body = Vec::new();
        for (name, file, data) in parts {
            body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
            match file {
                Some((filename, mime)) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\nContent-Type: {mime}\r\n\r\n"
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                ),
            }
            body.extend_from_slice(data.as_bytes());
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
        Request::builder()
            .method("POST")
            .uri(path)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn ping_is_public() {
        let app = TestApp::new(Some("tok"));
        let (status, body) = app.json(get("/api/v1/ping")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "pong");
    }

    #[tokio::test]
    async fn token_required_when_configured() {
        let app = TestApp::new(Some("tok"));
        let (status, body) = app.json(get("/api/v1/status")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);

        let req = Request::builder()
            .uri("/api/v1/status")
            .header(header::AUTHORIZATION, "Bearer tok")
            .body(Body::empty())
            .unwrap();
        let (status, _) = app.json(req).await;
        assert_eq!(status, StatusCode::OK);

        let req = Request::builder()
            .uri("/api/v1/status")
            .header("x-api-token", "wrong")
            .body(Body::empty())
            .unwrap();
        let (status, body) = app.json(req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["message"], "Invalid API token");
    }

    #[tokio::test]
    async fn unknown_route_is_json_404() {
        let app = TestApp::new(None);
        let (status, body) = app.json(get("/api/v1/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Route not found");
    }

    #[tokio::test]
    async fn status_reports_state() {
        let app = TestApp::new(None);
        let (_, body) = app.json(get("/api/v1/status")).await;
        assert_eq!(body["data"]["connected"], false);
        assert_eq!(body["data"]["connectionStatus"], "disconnected");
    }

    #[tokio::test]
    async fn message_validation_order() {
        let app = TestApp::new(None);

        let (status, body) = app
            .json(post_json("/api/v1/message", json!({"phoneNumber": "0812"})))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Missing required fields");

        let (status, body) = app
            .json(post_json(
                "/api/v1/message",
                json!({"phoneNumber": "0812", "message": "   "}),
            ))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid message format");

        let (status, body) = app
            .json(post_json(
                "/api/v1/message",
                json!({"phoneNumber": "0812", "message": "hi"}),
            ))
            .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "Service unavailable");
        assert!(app.adapter.sent().is_empty());
    }

    #[tokio::test]
    async fn malformed_json_is_400() {
        let app = TestApp::new(None);
        let req = Request::builder()
            .method("POST")
            .uri("/api/v1/message")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = app.json(req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn end_to_end_pair_then_send() {
        let app = TestApp::new(None);
        app.state.manager.initialize().await;
        app.adapter
            .emit(SessionEvent::PairingCode("2@pairing-code".into()));
        app.reach(ConnectionState::PairingReady).await;

        let (_, body) = app.json(get("/api/v1/qr/status")).await;
        assert_eq!(body["data"]["qrAvailable"], true);
        assert_eq!(body["data"]["connectionStatus"], "pairing_ready");
        assert_eq!(body["data"]["qrCodeImageUrl"], "/api/v1/qr/image");

        let resp = build_app(app.state.clone())
            .oneshot(get("/api/v1/qr/image"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "image/png");
        assert_eq!(
            resp.headers()[header::CACHE_CONTROL],
            "no-cache, no-store, must-revalidate"
        );

        app.adapter.emit(SessionEvent::Opened);
        app.reach(ConnectionState::Connected).await;

        let (status, _) = app.json(get("/api/v1/qr/image")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = app
            .json(post_json(
                "/api/v1/message",
                json!({"phoneNumber": "0812-345", "message": " hello "}),
            ))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Message sent successfully");
        assert_eq!(body["data"]["to"], "62812345@s.whatsapp.net");

        let sent = app.adapter.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, SessionPayload::Text {
            body: "hello".into()
        });
    }

    #[tokio::test]
    async fn group_message() {
        let app = TestApp::new(None);
        app.connect().await;
        let (status, body) = app
            .json(post_json(
                "/api/v1/message/group",
                json!({"groupId": "12036", "message": "all hands"}),
            ))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["to"], "12036@g.us");
    }

    #[tokio::test]
    async fn document_from_data_url() {
        let app = TestApp::new(None);
        app.connect().await;
        let (status, body) = app
            .json(post_json(
                "/api/v1/document",
                json!({
                    "phoneNumber": "0812",
                    "file": "data:application/pdf;base64,JVBERg==",
                    "caption": "invoice",
                }),
            ))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["mimetype"], "application/pdf");
        assert_eq!(body["data"]["fileSize"], 4);

        match &app.adapter.sent()[0].1 {
            SessionPayload::Document {
                filename, caption, ..
            } => {
                assert_eq!(filename, "document");
                assert_eq!(caption.as_deref(), Some("invoice"));
            },
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_base64_is_400() {
        let app = TestApp::new(None);
        app.connect().await;
        let (status, body) = app
            .json(post_json(
                "/api/v1/document",
                json!({"phoneNumber": "0812", "file": "***"}),
            ))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid base64 format");
    }

    #[tokio::test]
    async fn image_upload_multipart() {
        let app = TestApp::new(None);
        app.connect().await;
        let req = multipart("/api/v1/image/upload", &[
            ("phoneNumber", None, "0812"),
            ("caption", None, "cat"),
            ("file", Some(("cat.png", "image/png")), "PNG"),
        ]);
        let (status, body) = app.json(req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Image sent successfully");
        assert_eq!(body["data"]["fileName"], "cat.png");
        assert_eq!(body["data"]["mimeType"], "image/png");
    }

    #[tokio::test]
    async fn upload_rejects_disallowed_type() {
        let app = TestApp::new(None);
        app.connect().await;
        let req = multipart("/api/v1/document/upload", &[
            ("phoneNumber", None, "0812"),
            ("file", Some(("evil.exe", "application/x-msdownload")), "MZ"),
        ]);
        let (status, body) = app.json(req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid file type");
        assert!(app.adapter.sent().is_empty());
    }

    #[tokio::test]
    async fn convert_and_analyze() {
        let app = TestApp::new(None);
        let req = multipart("/api/v1/convert-to-base64", &[(
            "file",
            Some(("note.txt", "text/plain")),
            "hello",
        )]);
        let (status, body) = app.json(req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["base64"], "aGVsbG8=");
        assert_eq!(body["data"]["fileSize"], 5);

        let (status, body) = app
            .json(post_json(
                "/api/v1/analyze-base64",
                json!({"file": "data:text/plain;base64,aGVsbG8="}),
            ))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["mimetype"], "text/plain");
        assert_eq!(body["data"]["isDataUrl"], true);
        assert_eq!(body["data"]["fileSize"], 5);

        let (status, body) = app
            .json(post_json("/api/v1/analyze-base64", json!({})))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No file provided");
    }

    #[tokio::test]
    async fn logout_without_session_reports_failure() {
        let app = TestApp::new(None);
        let (status, body) = app.json(post_json("/api/v1/qr/logout", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert_eq!(body["data"]["connectionStatus"], "disconnected");
    }

    #[tokio::test]
    async fn clear_auth_restarts_pairing() {
        let app = TestApp::new(None);
        app.connect().await;
        let (status, body) = app
            .json(post_json("/api/v1/qr/clear-auth", json!({})))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["connectionStatus"], "connecting");
        assert_eq!(app.adapter.logout_count(), 1);
        assert_eq!(app.adapter.open_count(), 2);
    }

    #[tokio::test]
    async fn regenerate_from_pairing() {
        let app = TestApp::new(None);
        app.state.manager.initialize().await;
        app.adapter.emit(SessionEvent::PairingCode("first".into()));
        app.reach(ConnectionState::PairingReady).await;

        let (_, body) = app
            .json(post_json("/api/v1/qr/regenerate", json!({})))
            .await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["connectionStatus"], "connecting");
        assert!(!app.state.manager.has_pairing_image());
    }
}
