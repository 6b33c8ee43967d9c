//! On-disk artifact store.
//!
//! Layout:
//!   {upload_dir}/{scene}_{take}_{device}_{timestamp}.{ext}
//!   {calibration_dir}/mobile_{sid}/img_{count:04}.jpg
//!
//! The same envelope always maps to the same path, so a resubmitted
//! artifact overwrites the first copy.

use std::path::{Path, PathBuf};

use tracing::debug;

use take_common::artifact::SessionDescriptor;

/// Container extensions accepted for video uploads.
const VIDEO_EXTENSIONS: [&str; 3] = ["webm", "mp4", "mkv"];

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    upload_dir: PathBuf,
    calibration_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(upload_dir: impl Into<PathBuf>, calibration_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
            calibration_dir: calibration_dir.into(),
        }
    }

    pub fn video_path(&self, desc: &SessionDescriptor, timestamp: i64, ext: &str) -> PathBuf {
        let name = format!(
            "{}_{}_{}_{}.{}",
            sanitize(&desc.scene),
            sanitize(&desc.take),
            sanitize(&desc.device_id),
            timestamp,
            ext
        );
        self.upload_dir.join(name)
    }

    pub fn calibration_path(&self, sid: &str, count: u32) -> PathBuf {
        self.calibration_dir
            .join(format!("mobile_{}", sanitize(sid)))
            .join(format!("img_{count:04}.jpg"))
    }

    pub async fn save_video(
        &self,
        desc: &SessionDescriptor,
        timestamp: i64,
        ext: &str,
        payload: &[u8],
    ) -> std::io::Result<PathBuf> {
        let path = self.video_path(desc, timestamp, ext);
        write_atomic(&path, payload).await?;
        Ok(path)
    }

    pub async fn save_calibration(
        &self,
        sid: &str,
        count: u32,
        payload: &[u8],
    ) -> std::io::Result<PathBuf> {
        let path = self.calibration_path(sid, count);
        write_atomic(&path, payload).await?;
        Ok(path)
    }
}

/// Extension to store a video under, taken from the uploaded file name.
pub fn video_extension(file_name: Option<&str>) -> &'static str {
    let ext = file_name
        .and_then(|n| Path::new(n).extension())
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    VIDEO_EXTENSIONS
        .iter()
        .find(|known| ext.as_deref() == Some(**known))
        .copied()
        .unwrap_or("webm")
}

/// Keep path components to a safe character set.
fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.');
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Write to a sibling temp file, then rename over the target.
async fn write_atomic(path: &Path, payload: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("part");
    tokio::fs::write(&tmp, payload).await?;
    tokio::fs::rename(&tmp, path).await?;
    debug!("Stored {} ({} bytes)", path.display(), payload.len());
    Ok(())
}
