//! Local HTTP surface of a capture node.
//!
//! Routes:
//!   GET  /api/health  → health check
//!   GET  /api/status  → current state, status text and audio meter
//!   POST /api/record  → local record trigger, optional `{scene, take}`
//!   POST /api/stop    → local stop trigger

use std::time::Instant;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use take_common::protocol::{HealthResponse, LocalRecordRequest, NodeStatus};

use crate::session::LocalIntent;
use crate::status::StatusBoard;

/// Shared state for route handlers.
#[derive(Clone)]
struct AppState {
    board: StatusBoard,
    intents: mpsc::Sender<LocalIntent>,
    start_time: Instant,
}

fn router(board: StatusBoard, intents: mpsc::Sender<LocalIntent>) -> Router {
    let state = AppState {
        board,
        intents,
        start_time: Instant::now(),
    };

    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/record", post(record))
        .route("/api/stop", post(stop))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server.  Runs until `cancel` fires.
pub async fn run(
    listen_addr: &str,
    board: StatusBoard,
    intents: mpsc::Sender<LocalIntent>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let app = router(board, intents);
    let listener = TcpListener::bind(listen_addr).await?;
    info!("Capture HTTP server listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;

    Ok(())
}

// ── route handlers ───────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

async fn status(State(state): State<AppState>) -> Json<NodeStatus> {
    Json(state.board.snapshot())
}

/// The body is optional, so it is parsed by hand rather than through the
/// `Json` extractor.
async fn record(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<NodeStatus>), (StatusCode, String)> {
    let req: LocalRecordRequest = if body.iter().all(u8::is_ascii_whitespace) {
        LocalRecordRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
    };

    submit(
        &state,
        LocalIntent::Record {
            scene: req.scene,
            take: req.take,
        },
    )
    .await
}

async fn stop(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<NodeStatus>), (StatusCode, String)> {
    submit(&state, LocalIntent::Stop).await
}

/// Hand the intent to the session.  The answer reflects the state at
/// submission time; poll `/api/status` for the outcome.
async fn submit(
    state: &AppState,
    intent: LocalIntent,
) -> Result<(StatusCode, Json<NodeStatus>), (StatusCode, String)> {
    if state.intents.send(intent).await.is_err() {
        warn!("Local trigger dropped: session is gone");
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "session is shutting down".to_string(),
        ));
    }
    Ok((StatusCode::ACCEPTED, Json(state.board.snapshot())))
}

#[cfg(test)]
mod tests {
    use take_common::protocol::RecorderState;

    use super::*;

    async fn serve(board: StatusBoard) -> (String, mpsc::Receiver<LocalIntent>) {
        let (tx, rx) = mpsc::channel(4);
        let app = router(board, tx);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{addr}"), rx)
    }

    #[tokio::test]
    async fn test_status_reflects_board() {
        let board = StatusBoard::new("cam-a");
        board.set_state(RecorderState::ArmedRecording);
        let (base, _rx) = serve(board).await;

        let status: NodeStatus = reqwest::get(format!("{base}/api/status"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status.device_id, "cam-a");
        assert_eq!(status.state, RecorderState::ArmedRecording);
        assert!(!status.connected);
    }

    #[tokio::test]
    async fn test_record_and_stop_reach_session() {
        let (base, mut rx) = serve(StatusBoard::new("cam-a")).await;
        let client = reqwest::Client::new();

        let resp = client.post(format!("{base}/api/record")).send().await.unwrap();
        assert_eq!(resp.status(), 202);
        assert_eq!(
            rx.recv().await,
            Some(LocalIntent::Record {
                scene: None,
                take: None
            })
        );

        let resp = client
            .post(format!("{base}/api/record"))
            .body(r#"{"scene":"S2","take":"4"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);
        assert_eq!(
            rx.recv().await,
            Some(LocalIntent::Record {
                scene: Some("S2".into()),
                take: Some("4".into())
            })
        );

        let resp = client.post(format!("{base}/api/stop")).send().await.unwrap();
        assert_eq!(resp.status(), 202);
        assert_eq!(rx.recv().await, Some(LocalIntent::Stop));
    }

    #[tokio::test]
    async fn test_bad_record_body() {
        let (base, _rx) = serve(StatusBoard::new("cam-a")).await;
        let resp = reqwest::Client::new()
            .post(format!("{base}/api/record"))
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }
}
