//! Recording artifacts and the identifiers that correlate them.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Scene/take/device tuple identifying one recording unit.
///
/// Scene and take are opaque operator values; nothing here enforces
/// uniqueness.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub scene: String,
    pub take: String,
    pub device_id: String,
}

impl SessionDescriptor {
    pub fn new(scene: impl Into<String>, take: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            scene: scene.into(),
            take: take.into(),
            device_id: device_id.into(),
        }
    }
}

impl fmt::Display for SessionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.scene, self.take, self.device_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Video,
    CalibrationImage,
}

/// What an artifact answers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactOrigin {
    Take(SessionDescriptor),
    /// `sid` is the control-channel connection id current at capture time.
    Calibration { round: u32, sid: String },
}

/// Value the server uses to match an uploaded artifact to the command
/// that produced it.  Derived from the metadata envelope, so a resubmitted
/// artifact maps to the same id while a re-record of the same take, which
/// carries a new capture time, does not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn for_take(desc: &SessionDescriptor, timestamp_millis: i64) -> Self {
        Self(format!(
            "video:{}/{}/{}/{timestamp_millis}",
            desc.scene, desc.take, desc.device_id
        ))
    }

    pub fn for_calibration(sid: &str, round: u32) -> Self {
        Self(format!("calib:{sid}/{round}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A finalized binary capture plus its metadata envelope.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub payload: Bytes,
    pub kind: MediaKind,
    pub origin: ArtifactOrigin,
    pub captured_at: DateTime<Utc>,
    /// File extension of the payload (`webm`, `mp4`, `jpg`).
    pub extension: &'static str,
    pub mime: &'static str,
}

impl Artifact {
    pub fn video(
        payload: Bytes,
        desc: SessionDescriptor,
        captured_at: DateTime<Utc>,
        extension: &'static str,
        mime: &'static str,
    ) -> Self {
        Self {
            payload,
            kind: MediaKind::Video,
            origin: ArtifactOrigin::Take(desc),
            captured_at,
            extension,
            mime,
        }
    }

    pub fn calibration(payload: Bytes, round: u32, sid: impl Into<String>) -> Self {
        Self {
            payload,
            kind: MediaKind::CalibrationImage,
            origin: ArtifactOrigin::Calibration {
                round,
                sid: sid.into(),
            },
            captured_at: Utc::now(),
            extension: "jpg",
            mime: "image/jpeg",
        }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        match &self.origin {
            ArtifactOrigin::Take(desc) => CorrelationId::for_take(desc, self.timestamp_millis()),
            ArtifactOrigin::Calibration { round, sid } => CorrelationId::for_calibration(sid, *round),
        }
    }

    pub fn descriptor(&self) -> Option<&SessionDescriptor> {
        match &self.origin {
            ArtifactOrigin::Take(desc) => Some(desc),
            ArtifactOrigin::Calibration { .. } => None,
        }
    }

    pub fn timestamp_millis(&self) -> i64 {
        self.captured_at.timestamp_millis()
    }

    /// File name sent with the multipart part, e.g. `recording.webm`.
    pub fn upload_file_name(&self) -> String {
        match &self.origin {
            ArtifactOrigin::Take(_) => format!("recording.{}", self.extension),
            ArtifactOrigin::Calibration { round, .. } => format!("img_{round}.{}", self.extension),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_is_derived_from_envelope() {
        let desc = SessionDescriptor::new("S1", "1", "cam-a");
        let at = DateTime::from_timestamp_millis(1000).unwrap();
        let a = Artifact::video(Bytes::from_static(b"x"), desc.clone(), at, "webm", "video/webm");
        let resubmitted = a.clone();
        assert_eq!(a.correlation_id(), resubmitted.correlation_id());
        assert_eq!(a.correlation_id().as_str(), "video:S1/1/cam-a/1000");
        assert_eq!(a.upload_file_name(), "recording.webm");

        let later = DateTime::from_timestamp_millis(2000).unwrap();
        let rerecorded = Artifact::video(Bytes::from_static(b"yy"), desc, later, "webm", "video/webm");
        assert_ne!(a.correlation_id(), rerecorded.correlation_id());
    }

    #[test]
    fn test_calibration_ids() {
        let calib = Artifact::calibration(Bytes::new(), 3, "abc");
        assert_eq!(calib.correlation_id().as_str(), "calib:abc/3");
        assert_eq!(calib.kind, MediaKind::CalibrationImage);
        assert_eq!(calib.upload_file_name(), "img_3.jpg");
        assert!(calib.descriptor().is_none());
    }
}
