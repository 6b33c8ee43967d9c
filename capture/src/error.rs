//! Error taxonomy of a capture node.
//!
//! Neither type ever crosses the control channel as an error: each is
//! turned into a status string by the session.

use thiserror::Error;

/// Failures of the local media source.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// The device is not open yet.  Start commands are ignored.
    #[error("media source not ready")]
    NotReady,

    #[error("a capture is already running")]
    Busy,

    #[error("no capture is running")]
    Idle,

    /// Capture finished without producing any data.
    #[error("capture produced no data")]
    Empty,

    #[error("no frame available yet")]
    NoFrame,

    /// Device-level failure (permission denied, device gone, encoder died).
    #[error("capture failed: {0}")]
    Failed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    /// Whether the session can keep going after this error.  Fatal
    /// errors need an operator to fix the device.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Io(_))
    }
}

/// Terminal outcome of a failed artifact delivery.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("network error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("server answered {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("acknowledgment is not JSON: {0}")]
    InvalidAck(String),

    #[error("upload task failed: {0}")]
    Aborted(String),
}
