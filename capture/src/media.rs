//! Media source adapter seam.
//!
//! The session talks to the camera and microphone only through
//! [`MediaSource`].  A running capture is exposed as two streams that both
//! end once the capture has been flushed.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use take_common::config::VideoFormat;

use crate::error::CaptureError;

/// One audio-level sample, scaled to a 0..=100 meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioLevel {
    pub percent: u8,
    pub clipping: bool,
}

impl AudioLevel {
    /// Meter value above which the input is flagged as clipping.
    pub const CLIP_PERCENT: u8 = 90;

    pub fn from_percent(percent: f64) -> Self {
        let percent = percent.clamp(0.0, 100.0).round() as u8;
        Self {
            percent,
            clipping: percent > Self::CLIP_PERCENT,
        }
    }

    /// Map an RMS level in dBFS onto the meter: -60 dB and below is silent,
    /// 0 dB is full scale.
    pub fn from_dbfs(db: f64) -> Self {
        if !db.is_finite() {
            return Self::from_percent(0.0);
        }
        Self::from_percent((db + 60.0) / 60.0 * 100.0)
    }
}

/// Which still image to grab from the live feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Snapshot {
    /// Low-resolution, low-quality frame for the operator preview.
    Preview,
    /// Full-resolution frame for calibration.
    Still,
}

/// Streams of a running capture.
pub struct CaptureStreams {
    /// Encoded container bytes, in order.
    pub chunks: mpsc::Receiver<Bytes>,
    /// Best-effort meter samples; may skip values under load.
    pub levels: mpsc::Receiver<AudioLevel>,
}

/// Exclusive handle on the local camera and microphone.
#[async_trait]
pub trait MediaSource: Send {
    /// Acquire the device and start the idle preview.
    async fn open(&mut self) -> Result<(), CaptureError>;

    /// Whether a capture could start right now.  A source whose device
    /// dropped out may try to reacquire it here.
    async fn is_ready(&mut self) -> bool;

    async fn start_capture(&mut self) -> Result<CaptureStreams, CaptureError>;

    /// Ask the running capture to stop.  Returns immediately; the chunk
    /// stream ends once everything has been flushed.
    async fn stop_capture(&mut self) -> Result<(), CaptureError>;

    /// Called after the chunk stream has ended.  Reports how the capture
    /// terminated and puts the device back into idle preview.
    async fn capture_finished(&mut self) -> Result<(), CaptureError>;

    async fn snapshot(&mut self, kind: Snapshot) -> Result<Bytes, CaptureError>;

    fn format(&self) -> VideoFormat;

    /// Release every process and handle.  Safe to call more than once.
    async fn release(&mut self);
}
