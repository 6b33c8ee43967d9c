//! ffmpeg-backed media source.
//!
//! Exactly one ffmpeg child owns the camera at a time: an idle child that
//! only refreshes the preview and still JPEGs in the work directory, or a
//! recording child that additionally encodes the container to stdout and
//! prints audio RMS levels on stderr.  Stopping a recording sends `q` on
//! stdin so ffmpeg finalizes the container before exiting.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use take_common::config::{Config, VideoFormat};

use crate::error::CaptureError;
use crate::media::{AudioLevel, CaptureStreams, MediaSource, Snapshot};

const PREVIEW_FILE: &str = "preview.jpg";
const STILL_FILE: &str = "still.jpg";
const LEVEL_KEY: &str = "lavfi.astats.Overall.RMS_level=";

/// How long ffmpeg gets to fail on a bad input before we call it running.
const STARTUP_GRACE: Duration = Duration::from_millis(500);
/// How long ffmpeg gets to finalize the container after `q`.
const STOP_GRACE: Duration = Duration::from_secs(10);

pub struct FfmpegSource {
    program: PathBuf,
    video_input: Vec<String>,
    audio_input: Vec<String>,
    format: VideoFormat,
    preview_fps: u32,
    work_dir: PathBuf,
    idle: Option<Child>,
    recording: Option<Child>,
}

impl FfmpegSource {
    pub fn new(config: &Config) -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            video_input: config.video_input.clone(),
            audio_input: config.audio_input.clone(),
            format: config.video_format,
            preview_fps: config.preview_fps,
            work_dir: config.work_dir.clone(),
            idle: None,
            recording: None,
        }
    }

    fn frame_path(&self, kind: Snapshot) -> PathBuf {
        match kind {
            Snapshot::Preview => self.work_dir.join(PREVIEW_FILE),
            Snapshot::Still => self.work_dir.join(STILL_FILE),
        }
    }

    /// Outputs shared by the idle and the recording child: a 320x180
    /// preview at the preview rate and a full-size still twice a second.
    fn frame_outputs(&self) -> Vec<String> {
        let preview_filter = format!("fps={},scale=320:180", self.preview_fps);
        let mut args = Vec::new();
        args.extend(
            [
                "-map",
                "0:v:0",
                "-vf",
                preview_filter.as_str(),
                "-q:v",
                "8",
                "-update",
                "1",
                "-y",
            ]
            .map(String::from),
        );
        args.push(self.frame_path(Snapshot::Preview).display().to_string());
        args.extend(
            ["-map", "0:v:0", "-vf", "fps=2", "-q:v", "2", "-update", "1", "-y"].map(String::from),
        );
        args.push(self.frame_path(Snapshot::Still).display().to_string());
        args
    }

    fn idle_args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-nostdin"]
            .map(String::from)
            .to_vec();
        args.extend(self.video_input.iter().cloned());
        args.extend(self.frame_outputs());
        args
    }

    fn record_args(&self) -> Vec<String> {
        let has_audio = !self.audio_input.is_empty();
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "info", "-nostats"]
            .map(String::from)
            .to_vec();
        args.extend(self.video_input.iter().cloned());
        args.extend(self.audio_input.iter().cloned());

        args.extend(["-map", "0:v:0"].map(String::from));
        if has_audio {
            args.extend(
                [
                    "-map",
                    "1:a:0",
                    "-af",
                    "astats=metadata=1:reset=5,ametadata=print:key=lavfi.astats.Overall.RMS_level",
                ]
                .map(String::from),
            );
        }
        match self.format {
            VideoFormat::Webm => {
                args.extend(
                    ["-c:v", "libvpx", "-deadline", "realtime", "-cpu-used", "8", "-b:v", "2M"]
                        .map(String::from),
                );
                if has_audio {
                    args.extend(["-c:a", "libopus"].map(String::from));
                }
                args.extend(["-f", "webm", "pipe:1"].map(String::from));
            }
            VideoFormat::Mp4 => {
                args.extend(
                    [
                        "-c:v",
                        "libx264",
                        "-preset",
                        "veryfast",
                        "-tune",
                        "zerolatency",
                        "-pix_fmt",
                        "yuv420p",
                    ]
                    .map(String::from),
                );
                if has_audio {
                    args.extend(["-c:a", "aac"].map(String::from));
                }
                args.extend(
                    ["-movflags", "frag_keyframe+empty_moov", "-f", "mp4", "pipe:1"]
                        .map(String::from),
                );
            }
        }
        args.extend(self.frame_outputs());
        args
    }

    async fn start_idle(&mut self) -> Result<(), CaptureError> {
        let mut child = spawn_ffmpeg(&self.program, &self.idle_args(), false)?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr, None));
        }

        // Give ffmpeg a moment to fail on a bad device before declaring success.
        tokio::time::sleep(STARTUP_GRACE).await;
        if let Some(status) = child.try_wait()? {
            return Err(CaptureError::Failed(format!(
                "ffmpeg exited immediately with {status}; check VIDEO_INPUT in take.conf"
            )));
        }

        info!("Idle preview started (pid={:?})", child.id());
        self.idle = Some(child);
        Ok(())
    }

    async fn stop_idle(&mut self) {
        if let Some(mut child) = self.idle.take() {
            let _ = child.kill().await;
            debug!("Idle preview stopped");
        }
    }
}

#[async_trait]
impl MediaSource for FfmpegSource {
    async fn open(&mut self) -> Result<(), CaptureError> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        self.start_idle().await
    }

    async fn is_ready(&mut self) -> bool {
        if self.recording.is_some() {
            return false;
        }
        match self.idle.as_mut().map(|c| c.try_wait()) {
            Some(Ok(None)) => return true,
            Some(Ok(Some(status))) => {
                warn!("Idle preview exited with {status}");
                self.idle = None;
            }
            Some(Err(e)) => {
                warn!("Cannot check idle preview: {e}");
                return false;
            }
            None => {}
        }

        // The idle child is gone; one respawn attempt per start.
        match self.start_idle().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Idle preview restart failed: {e}");
                false
            }
        }
    }

    async fn start_capture(&mut self) -> Result<CaptureStreams, CaptureError> {
        if self.recording.is_some() {
            return Err(CaptureError::Busy);
        }
        if !self.is_ready().await {
            return Err(CaptureError::NotReady);
        }
        self.stop_idle().await;

        let mut child = spawn_ffmpeg(&self.program, &self.record_args(), true)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Failed("ffmpeg stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CaptureError::Failed("ffmpeg stderr not captured".into()))?;

        let (chunk_tx, chunks) = mpsc::channel(64);
        let (level_tx, levels) = mpsc::channel(16);

        tokio::spawn(async move {
            let mut stream = ReaderStream::new(stdout);
            let mut total = 0usize;
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        total += bytes.len();
                        if chunk_tx.send(bytes).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Reading encoder output failed: {e}");
                        break;
                    }
                }
            }
            debug!("Encoder output closed after {total} bytes");
        });
        tokio::spawn(drain_stderr(stderr, Some(level_tx)));

        info!(
            "Recording started (pid={:?}, format={})",
            child.id(),
            self.format.extension()
        );
        self.recording = Some(child);
        Ok(CaptureStreams { chunks, levels })
    }

    async fn stop_capture(&mut self) -> Result<(), CaptureError> {
        let child = self.recording.as_mut().ok_or(CaptureError::Idle)?;
        match child.stdin.take() {
            Some(mut stdin) => {
                // ffmpeg may already be gone; its output stream ends either way.
                if let Err(e) = stdin.write_all(b"q").await {
                    debug!("Cannot send stop to ffmpeg: {e}");
                }
                let _ = stdin.shutdown().await;
            }
            None => debug!("Stop already requested"),
        }
        Ok(())
    }

    async fn capture_finished(&mut self) -> Result<(), CaptureError> {
        let mut child = self.recording.take().ok_or(CaptureError::Idle)?;
        let outcome = match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(CaptureError::Failed(format!("ffmpeg exited with {status}"))),
            Ok(Err(e)) => Err(CaptureError::Io(e)),
            Err(_) => {
                let _ = child.kill().await;
                Err(CaptureError::Failed("ffmpeg did not finish in time".into()))
            }
        };

        // A cleanly finished take stands even if the preview cannot come
        // back; `is_ready` retries it on the next start.
        if let Err(e) = self.start_idle().await {
            warn!("Idle preview restart failed: {e}");
        }
        outcome
    }

    async fn snapshot(&mut self, kind: Snapshot) -> Result<Bytes, CaptureError> {
        read_frame(&self.frame_path(kind)).await
    }

    fn format(&self) -> VideoFormat {
        self.format
    }

    async fn release(&mut self) {
        self.stop_idle().await;
        if let Some(mut child) = self.recording.take() {
            let _ = child.kill().await;
        }
        info!("Media source released");
    }
}

fn spawn_ffmpeg(program: &Path, args: &[String], recording: bool) -> Result<Child, CaptureError> {
    let mut cmd = Command::new(program);
    cmd.args(args).kill_on_drop(true).stderr(Stdio::piped());
    if recording {
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null()).stdout(Stdio::null());
    }
    debug!("Spawning: {} {}", program.display(), args.join(" "));
    cmd.spawn()
        .map_err(|e| CaptureError::Failed(format!("cannot spawn ffmpeg: {e}")))
}

/// Forward ffmpeg's stderr to the log, picking out audio levels when a
/// meter is attached.  The meter is best-effort: a full channel drops the
/// sample.
async fn drain_stderr<R: AsyncRead + Unpin>(stderr: R, levels: Option<mpsc::Sender<AudioLevel>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(db) = parse_level(&line) {
            if let Some(tx) = &levels {
                let _ = tx.try_send(AudioLevel::from_dbfs(db));
            }
            continue;
        }
        if levels.is_some() {
            // Recording runs at info level; only surface problems.
            if line.contains("rror") {
                warn!("[ffmpeg] {line}");
            }
        } else if !line.is_empty() {
            warn!("[ffmpeg] {line}");
        }
    }
    debug!("ffmpeg stderr stream ended");
}

/// Extract the dBFS value from an `ametadata` print line.
fn parse_level(line: &str) -> Option<f64> {
    let idx = line.find(LEVEL_KEY)?;
    let value = line[idx + LEVEL_KEY.len()..].trim();
    match value {
        "-inf" => Some(f64::NEG_INFINITY),
        v => v.parse().ok(),
    }
}

/// Read a JPEG that ffmpeg rewrites in place, retrying on torn reads.
async fn read_frame(path: &Path) -> Result<Bytes, CaptureError> {
    for _ in 0..3 {
        match tokio::fs::read(path).await {
            Ok(bytes) if is_complete_jpeg(&bytes) => return Ok(Bytes::from(bytes)),
            Ok(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(CaptureError::NoFrame),
            Err(e) => return Err(e.into()),
        }
    }
    Err(CaptureError::NoFrame)
}

fn is_complete_jpeg(bytes: &[u8]) -> bool {
    bytes.len() > 4 && bytes.starts_with(&[0xFF, 0xD8]) && bytes.ends_with(&[0xFF, 0xD9])
}
