//! Artifact uploader – ships finalized captures to the control server.
//!
//! One multipart POST per artifact.  A delivery is successful only when the
//! server answers 2xx with a JSON acknowledgment; everything else is a
//! [`DeliveryError`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use tracing::{debug, info, warn};

use take_common::artifact::{Artifact, ArtifactOrigin};
use take_common::protocol::{fields, UploadAck, UPLOAD_CALIB_PATH, UPLOAD_CHUNK_PATH};

use crate::error::DeliveryError;

/// Anything that can deliver an artifact.  The session holds it as
/// `Arc<dyn Deliver>` so delivery can run on its own task.
#[async_trait]
pub trait Deliver: Send + Sync {
    async fn deliver(&self, artifact: Artifact) -> Result<UploadAck, DeliveryError>;
}

pub struct HttpUploader {
    client: reqwest::Client,
    base_url: String,
}

impl HttpUploader {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn form(artifact: &Artifact) -> Result<(&'static str, Form), DeliveryError> {
        let part = Part::stream(artifact.payload.clone())
            .file_name(artifact.upload_file_name())
            .mime_str(artifact.mime)?;

        match &artifact.origin {
            ArtifactOrigin::Take(desc) => {
                let form = Form::new()
                    .part(fields::VIDEO, part)
                    .text(fields::TIMESTAMP, artifact.timestamp_millis().to_string())
                    .text(fields::SCENE, desc.scene.clone())
                    .text(fields::TAKE, desc.take.clone())
                    .text(fields::DEVICE_ID, desc.device_id.clone());
                Ok((UPLOAD_CHUNK_PATH, form))
            }
            ArtifactOrigin::Calibration { round, sid } => {
                let form = Form::new()
                    .part(fields::IMAGE, part)
                    .text(fields::SID, sid.clone())
                    .text(fields::COUNT, round.to_string());
                Ok((UPLOAD_CALIB_PATH, form))
            }
        }
    }
}

#[async_trait]
impl Deliver for HttpUploader {
    async fn deliver(&self, artifact: Artifact) -> Result<UploadAck, DeliveryError> {
        let (path, form) = Self::form(&artifact)?;
        let url = format!("{}{path}", self.base_url);
        debug!(
            "POST {url} ({} bytes, {:?})",
            artifact.payload.len(),
            artifact.kind
        );

        let resp = self.client.post(&url).multipart(form).send().await?;
        let status = resp.status();
        let body = resp.text().await?;

        if !status.is_success() {
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let ack = parse_ack(&body, artifact.correlation_id().to_string())?;
        info!("Delivered {} ({})", ack.correlation_id, ack.status);
        Ok(ack)
    }
}

/// Any well-formed JSON body counts as an acknowledgment.  Fields are read
/// from our own object shape or the looser `{"message": ...}` one older
/// servers answer with; anything else falls back to `ok`.
fn parse_ack(body: &str, fallback_id: String) -> Result<UploadAck, DeliveryError> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| DeliveryError::InvalidAck(e.to_string()))?;

    let text = |key: &str| {
        value
            .as_object()
            .and_then(|obj| obj.get(key))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };
    Ok(UploadAck {
        status: text("status")
            .or_else(|| text("message"))
            .unwrap_or_else(|| "ok".into()),
        correlation_id: text("correlation_id").unwrap_or(fallback_id),
        path: text("path").or_else(|| text("file")),
    })
}

/// Bounded retry around another deliverer.  Only transport errors and
/// 5xx answers are retried; the correlation id makes a resubmission an
/// overwrite on the server.
pub struct RetryingUploader {
    inner: Arc<dyn Deliver>,
    retries: u32,
    backoff: Duration,
}

impl RetryingUploader {
    pub fn new(inner: Arc<dyn Deliver>, retries: u32, backoff: Duration) -> Self {
        Self {
            inner,
            retries,
            backoff,
        }
    }
}

fn is_transient(err: &DeliveryError) -> bool {
    match err {
        DeliveryError::Transport(_) => true,
        DeliveryError::Rejected { status, .. } => *status >= 500,
        _ => false,
    }
}

#[async_trait]
impl Deliver for RetryingUploader {
    async fn deliver(&self, artifact: Artifact) -> Result<UploadAck, DeliveryError> {
        let mut delay = self.backoff;
        let mut attempt = 0;
        loop {
            match self.inner.deliver(artifact.clone()).await {
                Err(e) if attempt < self.retries && is_transient(&e) => {
                    attempt += 1;
                    warn!(
                        "Upload attempt {attempt}/{} failed: {e}; retrying in {}ms",
                        self.retries,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use axum::extract::{Multipart, State};
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use bytes::Bytes;
    use chrono::DateTime;

    use take_common::artifact::SessionDescriptor;

    use super::*;

    #[derive(Default)]
    struct Seen {
        fields: Mutex<HashMap<String, String>>,
        files: Mutex<Vec<(String, String, usize)>>,
        hits: AtomicUsize,
    }

    async fn record(
        State(seen): State<Arc<Seen>>,
        mut multipart: Multipart,
    ) -> Json<serde_json::Value> {
        seen.hits.fetch_add(1, Ordering::SeqCst);
        while let Some(field) = multipart.next_field().await.unwrap() {
            let name = field.name().unwrap_or_default().to_string();
            match field.file_name().map(str::to_string) {
                Some(file) => {
                    let data = field.bytes().await.unwrap();
                    seen.files.lock().unwrap().push((name, file, data.len()));
                }
                None => {
                    let text = field.text().await.unwrap();
                    seen.fields.lock().unwrap().insert(name, text);
                }
            }
        }
        Json(serde_json::json!({ "message": "Chunk uploaded" }))
    }

    async fn flaky(State(seen): State<Arc<Seen>>) -> (StatusCode, Json<serde_json::Value>) {
        if seen.hits.fetch_add(1, Ordering::SeqCst) == 0 {
            (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({})))
        } else {
            (StatusCode::OK, Json(serde_json::json!({ "status": "stored" })))
        }
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    fn video() -> Artifact {
        Artifact::video(
            Bytes::from_static(b"webm-bytes"),
            SessionDescriptor::new("S1", "7", "cam-a"),
            DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
            "webm",
            "video/webm",
        )
    }

    #[tokio::test]
    async fn test_video_upload_envelope() {
        let seen = Arc::new(Seen::default());
        let app = Router::new()
            .route(UPLOAD_CHUNK_PATH, post(record))
            .with_state(seen.clone());
        let base = serve(app).await;

        let uploader = HttpUploader::new(&base, Duration::from_secs(5)).unwrap();
        let ack = uploader.deliver(video()).await.unwrap();
        assert_eq!(ack.status, "Chunk uploaded");
        assert_eq!(ack.correlation_id, "video:S1/7/cam-a/1700000000000");

        let fields = seen.fields.lock().unwrap().clone();
        assert_eq!(fields["scene"], "S1");
        assert_eq!(fields["take"], "7");
        assert_eq!(fields["device_id"], "cam-a");
        assert_eq!(fields["timestamp"], "1700000000000");
        assert_eq!(
            seen.files.lock().unwrap().as_slice(),
            &[("video".to_string(), "recording.webm".to_string(), 10)]
        );
    }

    #[tokio::test]
    async fn test_calibration_upload_envelope() {
        let seen = Arc::new(Seen::default());
        let app = Router::new()
            .route(UPLOAD_CALIB_PATH, post(record))
            .with_state(seen.clone());
        let base = serve(app).await;

        let uploader = HttpUploader::new(&base, Duration::from_secs(5)).unwrap();
        let artifact = Artifact::calibration(Bytes::from_static(b"\xff\xd8jpg"), 4, "sid-1");
        let ack = uploader.deliver(artifact).await.unwrap();
        assert_eq!(ack.correlation_id, "calib:sid-1/4");

        let fields = seen.fields.lock().unwrap().clone();
        assert_eq!(fields["sid"], "sid-1");
        assert_eq!(fields["count"], "4");
        assert_eq!(seen.files.lock().unwrap()[0].0, "image");
    }

    #[tokio::test]
    async fn test_non_success_is_a_failure() {
        let app = Router::new().route(
            UPLOAD_CHUNK_PATH,
            post(|| async { (StatusCode::BAD_REQUEST, "No video part") }),
        );
        let base = serve(app).await;

        let uploader = HttpUploader::new(&base, Duration::from_secs(5)).unwrap();
        match uploader.deliver(video()).await {
            Err(DeliveryError::Rejected { status, body }) => {
                assert_eq!(status, 400);
                assert_eq!(body, "No video part");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_from_server_error() {
        let seen = Arc::new(Seen::default());
        let app = Router::new()
            .route(UPLOAD_CHUNK_PATH, post(flaky))
            .with_state(seen.clone());
        let base = serve(app).await;

        let inner = Arc::new(HttpUploader::new(&base, Duration::from_secs(5)).unwrap());
        let plain = HttpUploader::new(&base, Duration::from_secs(5)).unwrap();
        let retrying = RetryingUploader::new(inner, 2, Duration::from_millis(10));

        let ack = retrying.deliver(video()).await.unwrap();
        assert_eq!(ack.status, "stored");
        assert_eq!(seen.hits.load(Ordering::SeqCst), 2);

        // Without the wrapper the first failure is terminal.
        seen.hits.store(0, Ordering::SeqCst);
        assert!(plain.deliver(video()).await.is_err());
    }

    #[test]
    fn test_parse_ack() {
        let ack = parse_ack(r#"{"status":"ok","correlation_id":"x","path":"/a"}"#, "y".into())
            .unwrap();
        assert_eq!(ack.correlation_id, "x");
        assert_eq!(ack.path.as_deref(), Some("/a"));

        let ack = parse_ack(r#"{"message":"Calib image uploaded"}"#, "y".into()).unwrap();
        assert_eq!(ack.status, "Calib image uploaded");
        assert_eq!(ack.correlation_id, "y");

        for body in ["[]", r#""ok""#, "null", "42"] {
            let ack = parse_ack(body, "video:S1/1/cam-a/1000".into()).unwrap();
            assert_eq!(ack.status, "ok", "body {body}");
            assert_eq!(ack.correlation_id, "video:S1/1/cam-a/1000");
            assert!(ack.path.is_none());
        }

        assert!(matches!(
            parse_ack("<html>", "y".into()),
            Err(DeliveryError::InvalidAck(_))
        ));
        assert!(matches!(parse_ack("", "y".into()), Err(DeliveryError::InvalidAck(_))));
    }
}
