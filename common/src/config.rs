//! Configuration parsing – reads a KEY=VALUE file (`take.conf`).
//!
//! The capture node and the control server load the same file; each
//! ignores the keys it does not need.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::protocol::Capability;

/// Application configuration, shared between capture nodes and the server.
#[derive(Debug, Clone)]
pub struct Config {
    // ── server ───────────────────────────────────────────────────────
    /// Address the control server listens on (WebSocket + uploads + API).
    pub server_listen_addr: String,
    pub upload_dir: PathBuf,
    pub calibration_dir: PathBuf,
    /// Upper bound on a single multipart upload body.
    pub max_upload_bytes: usize,

    // ── capture node ─────────────────────────────────────────────────
    /// Base URL of the control server.  `None` means "discover via mDNS".
    pub server_url: Option<String>,
    pub device_id: String,
    /// Address of the capture node's local status/trigger surface.
    pub capture_listen_addr: String,
    /// ffmpeg input arguments for the camera.
    pub video_input: Vec<String>,
    /// ffmpeg input arguments for the microphone; empty records video only.
    pub audio_input: Vec<String>,
    pub video_format: VideoFormat,
    pub preview_fps: u32,
    pub capabilities: Vec<Capability>,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    pub upload_timeout: Duration,
    /// Retries layered above a single video delivery.  `0` keeps the
    /// single-attempt contract.
    pub upload_retries: u32,
    pub work_dir: PathBuf,
}

/// Container format of recorded video segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFormat {
    Webm,
    Mp4,
}

impl VideoFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Webm => "webm",
            Self::Mp4 => "mp4",
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            Self::Webm => "video/webm",
            Self::Mp4 => "video/mp4",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "webm" => Some(Self::Webm),
            "mp4" => Some(Self::Mp4),
            _ => None,
        }
    }
}

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "/etc/take/take.conf"
    }

    /// Base URL to use when neither `SERVER_URL` nor mDNS yields one.
    pub fn fallback_server_url() -> &'static str {
        "http://127.0.0.1:5000"
    }

    /// Interval between two preview frames.
    pub fn preview_interval(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.preview_fps.max(1)))
    }
}

impl Default for Config {
    fn default() -> Self {
        from_map(&HashMap::new())
    }
}

/// Parse a `KEY=VALUE` configuration file.
///
/// Lines starting with `#` are comments.  Values may be optionally
/// double-quoted.  Unknown keys and unparsable values are logged and
/// ignored; the affected settings keep their defaults.
pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config: {}", path.display()))?;

    let map = parse_conf(&text);
    for problem in problems(&map) {
        warn!("{}: {problem}", path.display());
    }
    info!("Loaded config from {}", path.display());
    Ok(from_map(&map))
}

const KEYS: &[&str] = &[
    "SERVER_LISTEN_ADDR",
    "UPLOAD_DIR",
    "CALIBRATION_DIR",
    "MAX_UPLOAD_MB",
    "SERVER_URL",
    "DEVICE_ID",
    "CAPTURE_LISTEN_ADDR",
    "VIDEO_INPUT",
    "AUDIO_INPUT",
    "VIDEO_FORMAT",
    "PREVIEW_FPS",
    "CAPABILITIES",
    "RECONNECT_MIN_MS",
    "RECONNECT_MAX_MS",
    "UPLOAD_TIMEOUT_SECS",
    "UPLOAD_RETRIES",
    "WORK_DIR",
];

const NUMERIC_KEYS: &[&str] = &[
    "MAX_UPLOAD_MB",
    "PREVIEW_FPS",
    "RECONNECT_MIN_MS",
    "RECONNECT_MAX_MS",
    "UPLOAD_TIMEOUT_SECS",
    "UPLOAD_RETRIES",
];

/// Entries `from_map` will not honour, sorted by key.
fn problems(map: &HashMap<String, String>) -> Vec<String> {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();

    let mut out = Vec::new();
    for key in keys {
        let value = &map[key];
        if !KEYS.contains(&key.as_str()) {
            out.push(format!("unknown key {key}"));
            continue;
        }
        if value.is_empty() {
            continue;
        }
        if key == "CAPABILITIES" {
            for name in value.split(',').map(str::trim) {
                if Capability::parse(name).is_none() {
                    out.push(format!("unknown capability '{name}' ignored"));
                }
            }
            continue;
        }
        let valid = match key.as_str() {
            k if NUMERIC_KEYS.contains(&k) => value.parse::<u64>().is_ok(),
            "VIDEO_FORMAT" => VideoFormat::parse(value).is_some(),
            _ => true,
        };
        if !valid {
            out.push(format!("invalid value {key}={value}, using the default"));
        }
    }
    out
}

fn from_map(map: &HashMap<String, String>) -> Config {
    let get = |key: &str| -> Option<String> { map.get(key).cloned().filter(|v| !v.is_empty()) };
    let get_u64 = |key: &str, default: u64| -> u64 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };

    let args = |key: &str, default: &str| -> Vec<String> {
        map.get(key)
            .cloned()
            .unwrap_or_else(|| default.into())
            .split_whitespace()
            .map(str::to_string)
            .collect()
    };

    let capabilities = get("CAPABILITIES")
        .unwrap_or_else(|| "calibration,preview".into())
        .split(',')
        .filter_map(|c| Capability::parse(c.trim()))
        .collect();

    let reconnect_min = Duration::from_millis(get_u64("RECONNECT_MIN_MS", 500));
    let reconnect_max = Duration::from_millis(get_u64("RECONNECT_MAX_MS", 10_000)).max(reconnect_min);

    Config {
        server_listen_addr: get("SERVER_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:5000".into()),
        upload_dir: PathBuf::from(get("UPLOAD_DIR").unwrap_or_else(|| "uploads".into())),
        calibration_dir: PathBuf::from(
            get("CALIBRATION_DIR").unwrap_or_else(|| "calibration_images".into()),
        ),
        max_upload_bytes: (get_u64("MAX_UPLOAD_MB", 512) as usize) * 1024 * 1024,

        server_url: get("SERVER_URL").map(|u| u.trim_end_matches('/').to_string()),
        device_id: get("DEVICE_ID").unwrap_or_else(default_device_id),
        capture_listen_addr: get("CAPTURE_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8090".into()),
        video_input: args("VIDEO_INPUT", "-f v4l2 -i /dev/video0"),
        audio_input: args("AUDIO_INPUT", "-f alsa -i default"),
        video_format: get("VIDEO_FORMAT")
            .and_then(|v| VideoFormat::parse(&v))
            .unwrap_or(VideoFormat::Webm),
        preview_fps: get_u64("PREVIEW_FPS", 10).clamp(1, 30) as u32,
        capabilities,
        reconnect_min,
        reconnect_max,
        upload_timeout: Duration::from_secs(get_u64("UPLOAD_TIMEOUT_SECS", 120)),
        upload_retries: get_u64("UPLOAD_RETRIES", 0) as u32,
        work_dir: PathBuf::from(get("WORK_DIR").unwrap_or_else(|| "/tmp/take-capture".into())),
    }
}

fn default_device_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "unknown".into())
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            let key = key.trim();
            let val = val.trim().trim_matches('"');
            map.insert(key.to_string(), val.to_string());
        }
    }
    map
}

// ─── tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_conf() {
        let text = r#"
# comment
SERVER_URL="http://10.0.0.2:5000/"
DEVICE_ID=cam-left
VIDEO_INPUT="-f lavfi -i testsrc"
SERVER_LISTEN_ADDR=0.0.0.0:9090
"#;
        let map = parse_conf(text);
        assert_eq!(map["SERVER_URL"], "http://10.0.0.2:5000/");
        assert_eq!(map["DEVICE_ID"], "cam-left");
        assert_eq!(map["SERVER_LISTEN_ADDR"], "0.0.0.0:9090");
    }

    #[test]
    fn test_load_applies_defaults_and_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("take.conf");
        std::fs::write(
            &path,
            "SERVER_URL=http://ctl:5000/\nVIDEO_FORMAT=MP4\nPREVIEW_FPS=100\nCAPABILITIES=preview\nAUDIO_INPUT=\n",
        )
        .unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.server_url.as_deref(), Some("http://ctl:5000"));
        assert_eq!(config.video_format, VideoFormat::Mp4);
        assert_eq!(config.preview_fps, 30);
        assert_eq!(config.capabilities, [Capability::Preview]);
        assert_eq!(config.upload_retries, 0);
        assert_eq!(config.upload_dir, PathBuf::from("uploads"));
        assert!(config.audio_input.is_empty());
    }

    #[test]
    fn test_problems_are_reported() {
        let map = parse_conf(
            "DEVICE_ID=cam-a\nDEVICE=cam-b\nPREVIEW_FPS=fast\nVIDEO_FORMAT=avi\n\
             CAPABILITIES=preview,telepathy\nUPLOAD_RETRIES=\nMAX_UPLOAD_MB=64\n",
        );
        assert_eq!(
            problems(&map),
            [
                "unknown capability 'telepathy' ignored",
                "unknown key DEVICE",
                "invalid value PREVIEW_FPS=fast, using the default",
                "invalid value VIDEO_FORMAT=avi, using the default",
            ]
        );

        let config = from_map(&map);
        assert_eq!(config.preview_fps, 10);
        assert_eq!(config.video_format, VideoFormat::Webm);
        assert_eq!(config.max_upload_bytes, 64 * 1024 * 1024);
        assert_eq!(config.capabilities, [Capability::Preview]);
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.server_url.is_none());
        assert_eq!(config.preview_interval(), Duration::from_millis(100));
        assert_eq!(config.video_input, ["-f", "v4l2", "-i", "/dev/video0"]);
        assert!(config.reconnect_max >= config.reconnect_min);
        assert_eq!(config.max_upload_bytes, 512 * 1024 * 1024);
    }
}
