//! The node's single human-readable status indicator.

use std::fmt;

use tokio::sync::watch;

use take_common::artifact::SessionDescriptor;
use take_common::protocol::{NodeStatus, RecorderState};

use crate::media::AudioLevel;

/// Every transition and failure lands here as one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Starting,
    Ready(&'static str),
    Connected,
    Disconnected,
    NotReady,
    Busy(RecorderState),
    Recording(SessionDescriptor),
    Processing,
    Uploading,
    UploadComplete,
    UploadFailed(String),
    CalibrationCapturing(u32),
    CalibrationSent(u32),
    CalibrationFailed(u32, String),
    CaptureFailed(String),
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "Starting..."),
            Self::Ready(format) => write!(f, "Ready ({format})"),
            Self::Connected => write!(f, "Connected to Server"),
            Self::Disconnected => write!(f, "Disconnected, reconnecting..."),
            Self::NotReady => write!(f, "Not ready: camera unavailable"),
            Self::Busy(state) => write!(f, "Already busy ({state}), start ignored"),
            Self::Recording(desc) => write!(f, "Recording {}/{}...", desc.scene, desc.take),
            Self::Processing => write!(f, "Processing..."),
            Self::Uploading => write!(f, "Uploading..."),
            Self::UploadComplete => write!(f, "Upload Complete!"),
            Self::UploadFailed(reason) => write!(f, "Upload Failed: {reason}"),
            Self::CalibrationCapturing(n) => write!(f, "Capturing Calib {n}..."),
            Self::CalibrationSent(n) => write!(f, "Calib {n} Sent"),
            Self::CalibrationFailed(n, reason) => write!(f, "Calib {n} Failed: {reason}"),
            Self::CaptureFailed(reason) => write!(f, "Error: {reason}"),
        }
    }
}

/// Publishes [`NodeStatus`] snapshots to whoever watches them (the local
/// HTTP surface, tests).
#[derive(Clone)]
pub struct StatusBoard {
    tx: watch::Sender<NodeStatus>,
}

impl StatusBoard {
    pub fn new(device_id: &str) -> Self {
        let (tx, _) = watch::channel(NodeStatus {
            device_id: device_id.to_string(),
            state: RecorderState::Idle,
            status: Status::Starting.to_string(),
            connected: false,
            sid: None,
            audio_level: None,
            clipping: false,
        });
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<NodeStatus> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> NodeStatus {
        self.tx.borrow().clone()
    }

    pub fn set_status(&self, status: &Status) {
        let text = status.to_string();
        self.tx.send_modify(|s| s.status = text);
    }

    pub fn set_state(&self, state: RecorderState) {
        self.tx.send_modify(|s| {
            s.state = state;
            if state != RecorderState::ArmedRecording {
                s.audio_level = None;
                s.clipping = false;
            }
        });
    }

    pub fn set_link(&self, sid: Option<String>) {
        self.tx.send_modify(|s| {
            s.connected = sid.is_some();
            s.sid = sid;
        });
    }

    pub fn set_level(&self, level: AudioLevel) {
        self.tx.send_if_modified(|s| {
            let changed = s.audio_level != Some(level.percent) || s.clipping != level.clipping;
            s.audio_level = Some(level.percent);
            s.clipping = level.clipping;
            changed
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_texts() {
        let desc = SessionDescriptor::new("S1", "1", "cam");
        assert_eq!(Status::Recording(desc).to_string(), "Recording S1/1...");
        assert_eq!(Status::CalibrationSent(3).to_string(), "Calib 3 Sent");
        assert_eq!(
            Status::Busy(RecorderState::Uploading).to_string(),
            "Already busy (uploading), start ignored"
        );
    }

    #[test]
    fn test_board_tracks_level_only_while_recording() {
        let board = StatusBoard::new("cam");
        board.set_state(RecorderState::ArmedRecording);
        board.set_level(AudioLevel::from_percent(95.0));
        let snap = board.snapshot();
        assert_eq!(snap.audio_level, Some(95));
        assert!(snap.clipping);

        board.set_state(RecorderState::Finalizing);
        let snap = board.snapshot();
        assert_eq!(snap.audio_level, None);
        assert!(!snap.clipping);
    }

    #[test]
    fn test_board_link() {
        let board = StatusBoard::new("cam");
        board.set_link(Some("abc".into()));
        assert!(board.snapshot().connected);
        board.set_link(None);
        let snap = board.snapshot();
        assert!(!snap.connected);
        assert!(snap.sid.is_none());
    }
}
