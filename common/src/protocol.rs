//! Wire protocol shared by capture nodes and the control server.
//!
//! The control channel is a WebSocket at [`WS_PATH`].  Text frames carry
//! JSON envelopes `{"event": <name>, "data": {...}}`; binary frames carry
//! preview JPEGs.  Artifacts travel over plain HTTP multipart uploads.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

pub const WS_PATH: &str = "/ws";
pub const UPLOAD_CHUNK_PATH: &str = "/upload_chunk";
pub const UPLOAD_CALIB_PATH: &str = "/upload_calib";

/// Multipart field names of the upload endpoints.
pub mod fields {
    pub const VIDEO: &str = "video";
    pub const IMAGE: &str = "image";
    pub const TIMESTAMP: &str = "timestamp";
    pub const SCENE: &str = "scene";
    pub const TAKE: &str = "take";
    pub const DEVICE_ID: &str = "device_id";
    pub const SID: &str = "sid";
    pub const COUNT: &str = "count";
}

// ── capabilities ─────────────────────────────────────────────────────────

/// Optional features negotiated when a client connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Calibration,
    Preview,
}

impl Capability {
    pub const ALL: [Capability; 2] = [Capability::Calibration, Capability::Preview];

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "calibration" => Some(Self::Calibration),
            "preview" => Some(Self::Preview),
            _ => None,
        }
    }
}

/// Intersection of what a client offers and what the server supports,
/// in the server's order.
pub fn negotiate(offered: &[Capability], supported: &[Capability]) -> Vec<Capability> {
    supported
        .iter()
        .copied()
        .filter(|c| offered.contains(c))
        .collect()
}

// ── recorder state ───────────────────────────────────────────────────────

/// State of a client's recording state machine, as reported upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecorderState {
    #[default]
    Idle,
    ArmedRecording,
    Finalizing,
    Uploading,
}

impl fmt::Display for RecorderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::ArmedRecording => "armed-recording",
            Self::Finalizing => "finalizing",
            Self::Uploading => "uploading",
        };
        f.write_str(s)
    }
}

// ── control channel events ───────────────────────────────────────────────

/// Server → client events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Downstream {
    /// Handshake reply to [`Upstream::Connected`].
    Session {
        sid: String,
        capabilities: Vec<Capability>,
    },
    StartRecording {
        #[serde(deserialize_with = "string_or_number")]
        scene: String,
        #[serde(deserialize_with = "string_or_number")]
        take: String,
        /// Set when the operator targeted specific devices.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
    },
    StopRecording {},
    TriggerCalibration {
        count: u32,
    },
}

/// Client → server events.  Preview frames are sent as binary frames and
/// have no JSON form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Upstream {
    Connected {
        device_id: String,
        capabilities: Vec<Capability>,
    },
    StateChanged {
        state: RecorderState,
    },
    UploadFailed {
        scene: String,
        take: String,
        reason: String,
    },
    Status {
        text: String,
    },
}

impl Downstream {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Session { .. } => "session",
            Self::StartRecording { .. } => "start_recording",
            Self::StopRecording {} => "stop_recording",
            Self::TriggerCalibration { .. } => "trigger_calibration",
        }
    }
}

/// Encode an event as a JSON text frame.
pub fn encode<T: Serialize>(event: &T) -> serde_json::Result<String> {
    serde_json::to_string(event)
}

/// Decode a JSON text frame.
pub fn decode<'a, T: Deserialize<'a>>(text: &'a str) -> serde_json::Result<T> {
    serde_json::from_str(text)
}

/// Scene and take are opaque operator values; accept numbers too.
fn string_or_number<'de, D: Deserializer<'de>>(de: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(de)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

// ── HTTP types ───────────────────────────────────────────────────────────

/// JSON acknowledgment returned by both upload endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadAck {
    pub status: String,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Health-check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
}

/// `POST /api/start`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    #[serde(default = "default_scene", deserialize_with = "string_or_number")]
    pub scene: String,
    #[serde(default = "default_take", deserialize_with = "string_or_number")]
    pub take: String,
    #[serde(default)]
    pub devices: Option<Vec<String>>,
}

/// `POST /api/stop`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopRequest {
    #[serde(default)]
    pub devices: Option<Vec<String>>,
}

/// `POST /api/trigger_calibration`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationRequest {
    #[serde(default)]
    pub count: u32,
    #[serde(default)]
    pub devices: Option<Vec<String>>,
}

/// Reply to the operator command routes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub status: String,
    /// Number of connected clients the command was handed to.
    pub reached: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
}

/// Capture-node local trigger, `POST /api/record`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalRecordRequest {
    #[serde(default)]
    pub scene: Option<String>,
    #[serde(default)]
    pub take: Option<String>,
}

/// Capture-node status surface, `GET /api/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub device_id: String,
    pub state: RecorderState,
    pub status: String,
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_level: Option<u8>,
    pub clipping: bool,
}

fn default_scene() -> String {
    "Scene".into()
}

fn default_take() -> String {
    "001".into()
}
