//! HTTP + WebSocket front of the control server.
//!
//! Routes:
//!   GET  /ws                         → control channel (JSON text frames,
//!                                      binary preview frames)
//!   POST /upload_chunk               → video artifact (multipart)
//!   POST /upload_calib               → calibration image (multipart)
//!   POST /api/start                  → broadcast `start_recording`
//!   POST /api/stop                   → broadcast `stop_recording`
//!   POST /api/trigger_calibration    → broadcast `trigger_calibration`
//!   GET  /api/clients                → connection table
//!   GET  /api/clients/{sid}/preview  → latest preview JPEG
//!   GET  /api/artifacts              → artifact ledger
//!   GET  /api/health                 → health check

use std::collections::HashMap;
use std::time::Instant;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::multipart::MultipartError;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use take_common::artifact::{CorrelationId, MediaKind, SessionDescriptor};
use take_common::config::Config;
use take_common::protocol::{
    self, fields, CalibrationRequest, DispatchResponse, Downstream, HealthResponse, StartRequest,
    StopRequest, UploadAck, Upstream, UPLOAD_CALIB_PATH, UPLOAD_CHUNK_PATH, WS_PATH,
};

use crate::coordinator::{ArtifactRecord, ClientSummary, Coordinator, Ingest, Target};
use crate::store::{self, ArtifactStore};

/// Per-connection queue of downstream commands.
const OUTBOX_CAPACITY: usize = 64;

/// Shared state for route handlers.
#[derive(Clone)]
struct AppState {
    coordinator: Coordinator,
    store: ArtifactStore,
    start_time: Instant,
    cancel: CancellationToken,
}

fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route(WS_PATH, get(ws_upgrade))
        .route(UPLOAD_CHUNK_PATH, post(upload_chunk))
        .route(UPLOAD_CALIB_PATH, post(upload_calib))
        .route("/api/start", post(api_start))
        .route("/api/stop", post(api_stop))
        .route("/api/trigger_calibration", post(api_trigger_calibration))
        .route("/api/clients", get(list_clients))
        .route("/api/clients/{sid}/preview", get(client_preview))
        .route("/api/artifacts", get(list_artifacts))
        .route("/api/health", get(health))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the server.  Runs until `cancel` fires.
pub async fn run(config: &Config, cancel: CancellationToken) -> anyhow::Result<()> {
    let state = AppState {
        coordinator: Coordinator::new(),
        store: ArtifactStore::new(&config.upload_dir, &config.calibration_dir),
        start_time: Instant::now(),
        cancel: cancel.clone(),
    };
    let app = router(state, config.max_upload_bytes);

    let listener = TcpListener::bind(&config.server_listen_addr)
        .await
        .with_context(|| format!("Cannot listen on {}", config.server_listen_addr))?;
    info!("Control server listening on {}", config.server_listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;

    Ok(())
}

// ── control channel ──────────────────────────────────────────────────────

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One task per connection: the reader loop below plus a writer task
/// draining the connection's outbox.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Downstream>(OUTBOX_CAPACITY);
    let sid = state.coordinator.connect(tx.clone()).await;

    let writer = tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            let text = match protocol::encode(&cmd) {
                Ok(text) => text,
                Err(e) => {
                    error!("Cannot encode {}: {e}", cmd.name());
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    loop {
        let msg = tokio::select! {
            _ = state.cancel.cancelled() => break,
            msg = receiver.next() => msg,
        };
        let Some(Ok(msg)) = msg else {
            break;
        };

        match msg {
            Message::Text(text) => match protocol::decode::<Upstream>(text.as_str()) {
                Ok(event) => handle_event(&state, &sid, &tx, event).await,
                Err(e) => warn!("{sid}: ignoring message: {e}"),
            },
            Message::Binary(frame) => {
                if !state.coordinator.store_preview(&sid, frame).await {
                    debug!("{sid}: preview not granted, frame dropped");
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.coordinator.disconnect(&sid).await;
    drop(tx);
    let _ = writer.await;
}

async fn handle_event(state: &AppState, sid: &str, tx: &mpsc::Sender<Downstream>, event: Upstream) {
    match event {
        Upstream::Connected {
            device_id,
            capabilities,
        } => {
            let Some(granted) = state.coordinator.hello(sid, &device_id, &capabilities).await
            else {
                return;
            };
            let reply = Downstream::Session {
                sid: sid.to_string(),
                capabilities: granted,
            };
            if tx.send(reply).await.is_err() {
                warn!("{sid}: closed before the handshake reply");
            }
        }
        Upstream::StateChanged { state: recorder } => {
            state.coordinator.update_state(sid, recorder).await;
        }
        Upstream::UploadFailed {
            scene,
            take,
            reason,
        } => {
            state
                .coordinator
                .record_upload_failure(sid, &scene, &take, &reason)
                .await;
        }
        Upstream::Status { text } => {
            debug!("{sid}: {text}");
            state.coordinator.record_status(sid, text).await;
        }
    }
}

// ── artifact ingest ──────────────────────────────────────────────────────

#[derive(Error, Debug)]
enum IngestError {
    #[error("malformed multipart body: {0}")]
    Multipart(#[from] MultipartError),

    #[error("no {0} part")]
    MissingPart(&'static str),

    #[error("{0} part is empty")]
    EmptyPart(&'static str),

    #[error("invalid {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },

    #[error("cannot store artifact: {0}")]
    Storage(#[from] std::io::Error),
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Multipart(e) => e.status(),
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        if status.is_server_error() {
            error!("Upload failed: {self}");
        } else {
            warn!("Upload rejected: {self}");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// A multipart body split into file parts and text fields.
#[derive(Default)]
struct UploadForm {
    files: HashMap<String, (Option<String>, Bytes)>,
    text: HashMap<String, String>,
}

impl UploadForm {
    async fn read(mut multipart: Multipart) -> Result<Self, IngestError> {
        let mut form = Self::default();
        while let Some(field) = multipart.next_field().await? {
            let name = field.name().unwrap_or_default().to_string();
            match field.file_name().map(str::to_string) {
                Some(file_name) => {
                    let data = field.bytes().await?;
                    form.files.insert(name, (Some(file_name), data));
                }
                None => {
                    let value = field.text().await?;
                    form.text.insert(name, value);
                }
            }
        }
        Ok(form)
    }

    fn take_file(&mut self, name: &'static str) -> Result<(Option<String>, Bytes), IngestError> {
        let (file_name, data) = self.files.remove(name).ok_or(IngestError::MissingPart(name))?;
        if data.is_empty() {
            return Err(IngestError::EmptyPart(name));
        }
        Ok((file_name, data))
    }

    fn text_or(&self, name: &str, default: &str) -> String {
        self.text
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .unwrap_or(default)
            .to_string()
    }
}

fn ack(record: &ArtifactRecord, outcome: Ingest) -> Json<UploadAck> {
    Json(UploadAck {
        status: match outcome {
            Ingest::Created => "stored",
            Ingest::Replaced => "replaced",
        }
        .to_string(),
        correlation_id: record.correlation_id.to_string(),
        path: Some(record.path.clone()),
    })
}

async fn upload_chunk(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<UploadAck>, IngestError> {
    let mut form = UploadForm::read(multipart).await?;
    let (file_name, payload) = form.take_file(fields::VIDEO)?;

    let desc = SessionDescriptor::new(
        form.text_or(fields::SCENE, "test"),
        form.text_or(fields::TAKE, "001"),
        form.text_or(fields::DEVICE_ID, "unknown"),
    );
    let raw_ts = form.text_or(fields::TIMESTAMP, "");
    let timestamp = if raw_ts.is_empty() {
        Utc::now().timestamp_millis()
    } else {
        raw_ts.parse::<i64>().map_err(|_| IngestError::InvalidField {
            field: fields::TIMESTAMP,
            value: raw_ts.clone(),
        })?
    };

    let ext = store::video_extension(file_name.as_deref());
    let path = state
        .store
        .save_video(&desc, timestamp, ext, &payload)
        .await?;
    info!("Received take {desc}: {}", path.display());

    let record = ArtifactRecord {
        correlation_id: CorrelationId::for_take(&desc, timestamp),
        kind: MediaKind::Video,
        scene: Some(desc.scene),
        take: Some(desc.take),
        device_id: Some(desc.device_id),
        sid: None,
        count: None,
        path: path.display().to_string(),
        size: payload.len(),
        received_at: Utc::now(),
        submissions: 0,
    };
    let outcome = state.coordinator.ingest(record.clone()).await;
    Ok(ack(&record, outcome))
}

async fn upload_calib(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<UploadAck>, IngestError> {
    let mut form = UploadForm::read(multipart).await?;
    // Older clients reuse the `video` part for the still.
    let (_, payload) = match form.take_file(fields::IMAGE) {
        Err(IngestError::MissingPart(_)) => form.take_file(fields::VIDEO)?,
        other => other?,
    };

    let sid = form.text_or(fields::SID, "unknown");
    let raw_count = form.text_or(fields::COUNT, "0");
    let count = raw_count
        .parse::<u32>()
        .map_err(|_| IngestError::InvalidField {
            field: fields::COUNT,
            value: raw_count.clone(),
        })?;

    let path = state.store.save_calibration(&sid, count, &payload).await?;
    info!("Saved calibration image {count} from {sid}: {}", path.display());

    let record = ArtifactRecord {
        correlation_id: CorrelationId::for_calibration(&sid, count),
        kind: MediaKind::CalibrationImage,
        scene: None,
        take: None,
        device_id: None,
        sid: Some(sid),
        count: Some(count),
        path: path.display().to_string(),
        size: payload.len(),
        received_at: Utc::now(),
        submissions: 0,
    };
    let outcome = state.coordinator.ingest(record.clone()).await;
    Ok(ack(&record, outcome))
}

// ── operator API ─────────────────────────────────────────────────────────

/// Operator bodies are optional; a blank body means "all defaults".
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, (StatusCode, String)> {
    let raw: &[u8] = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}"
    } else {
        body
    };
    serde_json::from_slice(raw).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
}

async fn api_start(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<DispatchResponse>, (StatusCode, String)> {
    let req: StartRequest = parse_body(&body)?;
    info!("Triggering START for {}_{}", req.scene, req.take);

    let cmd = Downstream::StartRecording {
        scene: req.scene.clone(),
        take: req.take.clone(),
        device_id: None,
    };
    let reached = state
        .coordinator
        .dispatch(cmd, &Target::from_devices(req.devices))
        .await;
    Ok(Json(DispatchResponse {
        status: "started".into(),
        reached,
        scene: Some(req.scene),
        take: Some(req.take),
        count: None,
    }))
}

async fn api_stop(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<DispatchResponse>, (StatusCode, String)> {
    let req: StopRequest = parse_body(&body)?;
    info!("Triggering STOP");

    let reached = state
        .coordinator
        .dispatch(Downstream::StopRecording {}, &Target::from_devices(req.devices))
        .await;
    Ok(Json(DispatchResponse {
        status: "stopped".into(),
        reached,
        scene: None,
        take: None,
        count: None,
    }))
}

async fn api_trigger_calibration(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<DispatchResponse>, (StatusCode, String)> {
    let req: CalibrationRequest = parse_body(&body)?;
    info!("Triggering CALIBRATION capture {}", req.count);

    let reached = state
        .coordinator
        .dispatch(
            Downstream::TriggerCalibration { count: req.count },
            &Target::from_devices(req.devices),
        )
        .await;
    Ok(Json(DispatchResponse {
        status: "triggered".into(),
        reached,
        scene: None,
        take: None,
        count: Some(req.count),
    }))
}

async fn list_clients(State(state): State<AppState>) -> Json<Vec<ClientSummary>> {
    Json(state.coordinator.clients().await)
}

async fn client_preview(
    State(state): State<AppState>,
    Path(sid): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    let frame = state
        .coordinator
        .preview(&sid)
        .await
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(([(header::CONTENT_TYPE, "image/jpeg")], frame))
}

async fn list_artifacts(State(state): State<AppState>) -> Json<Vec<ArtifactRecord>> {
    Json(state.coordinator.artifacts().await)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}
