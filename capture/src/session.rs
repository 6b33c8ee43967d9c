//! Per-node client session.
//!
//! Owns the media source, the recording state machine, the control
//! channel handle and the uploader, and drives them from one event loop.
//! Remote commands and local intents go through the same handlers.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use take_common::artifact::{Artifact, SessionDescriptor};
use take_common::protocol::{Capability, Downstream, RecorderState, UploadAck, Upstream};

use crate::channel::{ChannelHandle, Outbound};
use crate::error::{CaptureError, DeliveryError};
use crate::machine::{Machine, StartRejected};
use crate::media::{AudioLevel, MediaSource, Snapshot};
use crate::status::{Status, StatusBoard};
use crate::uploader::Deliver;

/// Scene used by a local record trigger when none was ever given.
const DEFAULT_SCENE: &str = "test";
const DEFAULT_TAKE: &str = "001";

/// Triggers coming from the node's own HTTP surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalIntent {
    /// Missing fields fall back to the last scene/take this node saw.
    Record {
        scene: Option<String>,
        take: Option<String>,
    },
    Stop,
}

type Upload = JoinHandle<Result<UploadAck, DeliveryError>>;
type CalibrationOutcome = (u32, Result<UploadAck, DeliveryError>);

pub struct ClientSession<S: MediaSource> {
    device_id: String,
    source: S,
    machine: Machine,
    channel: ChannelHandle,
    uploader: Arc<dyn Deliver>,
    board: StatusBoard,
    preview_interval: Duration,

    /// Set after a capture failure; the node refuses to record until it
    /// is restarted.
    fatal: bool,
    last_take: (String, String),

    chunks: Option<mpsc::Receiver<Bytes>>,
    levels: Option<mpsc::Receiver<AudioLevel>>,
    buffer: BytesMut,
    started_at: Option<DateTime<Utc>>,
    upload: Option<Upload>,
    calib_tx: mpsc::Sender<CalibrationOutcome>,
    calib_rx: mpsc::Receiver<CalibrationOutcome>,
}

impl<S: MediaSource> ClientSession<S> {
    /// Acquire the media source.  A failure here is a capture failure: the
    /// session still runs (so the operator sees the status) but never
    /// records.
    pub async fn open(
        device_id: String,
        mut source: S,
        channel: ChannelHandle,
        uploader: Arc<dyn Deliver>,
        board: StatusBoard,
        preview_interval: Duration,
    ) -> Self {
        let (calib_tx, calib_rx) = mpsc::channel(8);
        let opened = source.open().await;
        let format = source.format();

        let mut session = Self {
            device_id,
            source,
            machine: Machine::new(),
            channel,
            uploader,
            board,
            preview_interval,
            fatal: false,
            last_take: (DEFAULT_SCENE.to_string(), DEFAULT_TAKE.to_string()),
            chunks: None,
            levels: None,
            buffer: BytesMut::new(),
            started_at: None,
            upload: None,
            calib_tx,
            calib_rx,
        };

        let sid = session.channel.link.borrow_and_update().sid.clone();
        session.board.set_link(sid);
        match opened {
            Ok(()) => session.set_status(Status::Ready(format.extension())),
            Err(e) => session.fail_capture(e),
        }
        session
    }

    /// Event loop.  Returns when `cancel` fires; call [`teardown`] after.
    ///
    /// [`teardown`]: ClientSession::teardown
    pub async fn run(&mut self, mut intents: mpsc::Receiver<LocalIntent>, cancel: CancellationToken) {
        let mut preview = tokio::time::interval(self.preview_interval);
        preview.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut commands_open = true;
        let mut intents_open = true;
        let mut link_open = true;

        loop {
            let preview_on = !self.fatal && self.channel.link.borrow().granted(Capability::Preview);

            tokio::select! {
                _ = cancel.cancelled() => break,

                cmd = self.channel.commands.recv(), if commands_open => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => commands_open = false,
                },

                intent = intents.recv(), if intents_open => match intent {
                    Some(intent) => self.handle_intent(intent).await,
                    None => intents_open = false,
                },

                changed = self.channel.link.changed(), if link_open => match changed {
                    Ok(()) => self.link_changed(),
                    Err(_) => link_open = false,
                },

                chunk = next_or_pending(&mut self.chunks) => match chunk {
                    Some(chunk) => self.buffer.extend_from_slice(&chunk),
                    None => self.capture_ended().await,
                },

                level = next_or_pending(&mut self.levels) => match level {
                    Some(level) => self.board.set_level(level),
                    None => self.levels = None,
                },

                outcome = join_or_pending(&mut self.upload) => {
                    self.upload = None;
                    self.upload_done(outcome);
                }

                Some((round, outcome)) = self.calib_rx.recv() => self.calibration_done(round, outcome),

                _ = preview.tick(), if preview_on => self.send_preview().await,
            }
        }
    }

    /// Release every acquired resource.  An in-flight upload is awaited,
    /// never cancelled.
    pub async fn teardown(mut self) {
        if let Some(desc) = self.machine.descriptor() {
            if self.machine.state() != RecorderState::Uploading {
                warn!("Shutting down during {} of {desc}; take is lost", self.machine.state());
            }
        }
        self.chunks = None;
        self.levels = None;
        self.source.release().await;

        if let Some(upload) = self.upload.take() {
            info!("Waiting for upload in flight");
            let outcome = upload.await;
            self.upload_done(outcome);
        }
        self.board.set_link(None);
        info!("Client session closed");
    }

    // ── command handlers ─────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Downstream) {
        match cmd {
            Downstream::StartRecording {
                scene,
                take,
                device_id,
            } => {
                if device_id.as_deref().is_some_and(|d| d != self.device_id) {
                    debug!("Start for {device_id:?} is not for us");
                    return;
                }
                self.start(scene, take).await;
            }
            Downstream::StopRecording {} => self.stop().await,
            Downstream::TriggerCalibration { count } => self.calibrate(count).await,
            Downstream::Session { .. } => {}
        }
    }

    async fn handle_intent(&mut self, intent: LocalIntent) {
        match intent {
            LocalIntent::Record { scene, take } => {
                let scene = scene.unwrap_or_else(|| self.last_take.0.clone());
                let take = take.unwrap_or_else(|| self.last_take.1.clone());
                self.start(scene, take).await;
            }
            LocalIntent::Stop => self.stop().await,
        }
    }

    async fn start(&mut self, scene: String, take: String) {
        if self.fatal {
            warn!("Start ignored: media source has failed");
            self.set_status(Status::NotReady);
            return;
        }

        let desc = SessionDescriptor::new(scene, take, self.device_id.as_str());
        self.last_take = (desc.scene.clone(), desc.take.clone());

        let ready = self.source.is_ready().await;
        match self.machine.start(desc.clone(), ready) {
            Ok(()) => {}
            Err(StartRejected::Busy(state)) => {
                info!("Start {desc} ignored while {state}");
                self.set_status(Status::Busy(state));
                return;
            }
            Err(StartRejected::NotReady) => {
                warn!("Start {desc} ignored: media source not ready");
                self.set_status(Status::NotReady);
                return;
            }
        }

        match self.source.start_capture().await {
            Ok(streams) => {
                self.chunks = Some(streams.chunks);
                self.levels = Some(streams.levels);
                self.buffer.clear();
                self.started_at = Some(Utc::now());
                info!("Recording {desc}");
                self.announce_state();
                self.set_status(Status::Recording(desc));
            }
            Err(e) => {
                self.machine.abort();
                self.fail_capture(e);
            }
        }
    }

    async fn stop(&mut self) {
        if !self.machine.stop() {
            debug!("Stop ignored while {}", self.machine.state());
            return;
        }
        self.announce_state();
        self.set_status(Status::Processing);

        if let Err(e) = self.source.stop_capture().await {
            self.chunks = None;
            self.levels = None;
            self.machine.abort();
            self.fail_capture(e);
        }
    }

    /// The chunk stream ended: the capture is flushed (or died).
    async fn capture_ended(&mut self) {
        self.chunks = None;
        self.levels = None;

        if self.machine.state() == RecorderState::ArmedRecording {
            warn!("Capture ended without a stop command");
            self.machine.stop();
            self.announce_state();
            self.set_status(Status::Processing);
        }

        let finished = self.source.capture_finished().await;
        let payload = std::mem::take(&mut self.buffer).freeze();
        let finished = match finished {
            Ok(()) if payload.is_empty() => Err(CaptureError::Empty),
            other => other,
        };
        if let Err(e) = finished {
            self.machine.abort();
            self.fail_capture(e);
            return;
        }

        let Some(desc) = self.machine.flushed() else {
            return;
        };
        let captured_at = self.started_at.take().unwrap_or_else(Utc::now);
        let format = self.source.format();
        info!("Take {desc} finalized ({} bytes)", payload.len());
        let artifact = Artifact::video(payload, desc, captured_at, format.extension(), format.mime());

        self.announce_state();
        self.set_status(Status::Uploading);

        let uploader = self.uploader.clone();
        self.upload = Some(tokio::spawn(async move { uploader.deliver(artifact).await }));
    }

    fn upload_done(&mut self, outcome: Result<Result<UploadAck, DeliveryError>, JoinError>) {
        let outcome = outcome.unwrap_or_else(|e| Err(DeliveryError::Aborted(e.to_string())));
        let Some(desc) = self.machine.delivered() else {
            return;
        };
        self.announce_state();

        match outcome {
            Ok(ack) => {
                info!("Take {desc} uploaded as {}", ack.correlation_id);
                self.set_status(Status::UploadComplete);
            }
            Err(e) => {
                error!("Upload of {desc} failed: {e}");
                self.set_status(Status::UploadFailed(e.to_string()));
                self.send(Upstream::UploadFailed {
                    scene: desc.scene,
                    take: desc.take,
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Grab a still and ship it on its own task.  Recording state is not
    /// touched.
    async fn calibrate(&mut self, round: u32) {
        self.set_status(Status::CalibrationCapturing(round));
        let frame = match self.source.snapshot(Snapshot::Still).await {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Calibration {round}: no frame: {e}");
                self.set_status(Status::CalibrationFailed(round, e.to_string()));
                return;
            }
        };

        let sid = self
            .channel
            .link
            .borrow()
            .sid
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        let artifact = Artifact::calibration(frame, round, sid);
        let uploader = self.uploader.clone();
        let done = self.calib_tx.clone();
        tokio::spawn(async move {
            let outcome = uploader.deliver(artifact).await;
            let _ = done.send((round, outcome)).await;
        });
    }

    fn calibration_done(&mut self, round: u32, outcome: Result<UploadAck, DeliveryError>) {
        match outcome {
            Ok(_) => {
                info!("Calibration image {round} delivered");
                self.set_status(Status::CalibrationSent(round));
            }
            Err(e) => {
                warn!("Calibration image {round} failed: {e}");
                self.set_status(Status::CalibrationFailed(round, e.to_string()));
            }
        }
    }

    async fn send_preview(&mut self) {
        match self.source.snapshot(Snapshot::Preview).await {
            Ok(frame) => {
                let _ = self.channel.upstream.try_send(Outbound::Preview(frame));
            }
            Err(e) => debug!("Preview skipped: {e}"),
        }
    }

    fn link_changed(&mut self) {
        let sid = self.channel.link.borrow_and_update().sid.clone();
        let connected = sid.is_some();
        self.board.set_link(sid);
        if connected {
            self.set_status(Status::Connected);
            self.announce_state();
        } else {
            self.set_status(Status::Disconnected);
        }
    }

    // ── status plumbing ──────────────────────────────────────────────

    fn fail_capture(&mut self, err: CaptureError) {
        if err.is_fatal() {
            error!("Media source failed: {err}");
            self.fatal = true;
        } else {
            warn!("Capture failed: {err}");
        }
        self.announce_state();
        self.set_status(Status::CaptureFailed(err.to_string()));
    }

    fn announce_state(&self) {
        let state = self.machine.state();
        self.board.set_state(state);
        self.send(Upstream::StateChanged { state });
    }

    fn set_status(&self, status: Status) {
        debug!("Status: {status}");
        self.board.set_status(&status);
        self.send(Upstream::Status {
            text: status.to_string(),
        });
    }

    /// At-most-once: dropped when the link is down or the queue is full.
    fn send(&self, event: Upstream) {
        if self.channel.upstream.try_send(Outbound::Event(event)).is_err() {
            debug!("Upstream event dropped");
        }
    }
}

async fn next_or_pending<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn join_or_pending<T>(handle: &mut Option<JoinHandle<T>>) -> Result<T, JoinError> {
    match handle {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::sync::{watch, Notify};

    use take_common::artifact::ArtifactOrigin;
    use take_common::config::VideoFormat;
    use take_common::protocol::NodeStatus;

    use crate::channel::Link;
    use crate::media::CaptureStreams;

    use super::*;

    struct FakeSource {
        ready: bool,
        fail_start: bool,
        chunk_tx: Option<mpsc::Sender<Bytes>>,
        released: Arc<Mutex<bool>>,
    }

    impl FakeSource {
        fn new() -> Self {
            Self {
                ready: true,
                fail_start: false,
                chunk_tx: None,
                released: Arc::new(Mutex::new(false)),
            }
        }
    }

    #[async_trait]
    impl MediaSource for FakeSource {
        async fn open(&mut self) -> Result<(), CaptureError> {
            Ok(())
        }

        async fn is_ready(&mut self) -> bool {
            self.ready && self.chunk_tx.is_none()
        }

        async fn start_capture(&mut self) -> Result<CaptureStreams, CaptureError> {
            if self.fail_start {
                return Err(CaptureError::Failed("permission denied".into()));
            }
            let (chunk_tx, chunks) = mpsc::channel(8);
            let (level_tx, levels) = mpsc::channel(8);
            chunk_tx.send(Bytes::from_static(b"head")).await.unwrap();
            chunk_tx.send(Bytes::from_static(b"tail")).await.unwrap();
            level_tx.send(AudioLevel::from_percent(42.0)).await.unwrap();
            self.chunk_tx = Some(chunk_tx);
            Ok(CaptureStreams { chunks, levels })
        }

        async fn stop_capture(&mut self) -> Result<(), CaptureError> {
            self.chunk_tx.take().map(|_| ()).ok_or(CaptureError::Idle)
        }

        async fn capture_finished(&mut self) -> Result<(), CaptureError> {
            Ok(())
        }

        async fn snapshot(&mut self, kind: Snapshot) -> Result<Bytes, CaptureError> {
            Ok(match kind {
                Snapshot::Preview => Bytes::from_static(b"preview"),
                Snapshot::Still => Bytes::from_static(b"still"),
            })
        }

        fn format(&self) -> VideoFormat {
            VideoFormat::Webm
        }

        async fn release(&mut self) {
            self.chunk_tx = None;
            *self.released.lock().unwrap() = true;
        }
    }

    /// Records every artifact; optionally fails or holds deliveries.
    #[derive(Default)]
    struct FakeUploader {
        delivered: Mutex<Vec<Artifact>>,
        fail: bool,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl Deliver for FakeUploader {
        async fn deliver(&self, artifact: Artifact) -> Result<UploadAck, DeliveryError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let id = artifact.correlation_id().to_string();
            self.delivered.lock().unwrap().push(artifact);
            if self.fail {
                return Err(DeliveryError::Aborted("connection refused".into()));
            }
            Ok(UploadAck {
                status: "ok".into(),
                correlation_id: id,
                path: None,
            })
        }
    }

    struct Harness {
        commands: mpsc::Sender<Downstream>,
        intents: mpsc::Sender<LocalIntent>,
        upstream: mpsc::Receiver<Outbound>,
        link: watch::Sender<Link>,
        board: watch::Receiver<NodeStatus>,
        cancel: CancellationToken,
        task: JoinHandle<()>,
    }

    impl Harness {
        async fn start(source: FakeSource, uploader: Arc<FakeUploader>) -> Self {
            let (commands, cmd_rx) = mpsc::channel(8);
            let (intents, intent_rx) = mpsc::channel(8);
            let (out_tx, upstream) = mpsc::channel(256);
            let (link, link_rx) = watch::channel(Link {
                sid: Some("sid-1".into()),
                capabilities: vec![Capability::Calibration],
            });
            let handle = ChannelHandle {
                commands: cmd_rx,
                upstream: out_tx,
                link: link_rx,
            };
            let status = StatusBoard::new("cam-a");
            let board = status.subscribe();
            let cancel = CancellationToken::new();

            let mut session = ClientSession::open(
                "cam-a".into(),
                source,
                handle,
                uploader,
                status,
                Duration::from_millis(20),
            )
            .await;
            let token = cancel.clone();
            let task = tokio::spawn(async move {
                session.run(intent_rx, token).await;
                session.teardown().await;
            });

            Self {
                commands,
                intents,
                upstream,
                link,
                board,
                cancel,
                task,
            }
        }

        async fn send(&self, cmd: Downstream) {
            self.commands.send(cmd).await.unwrap();
        }

        async fn wait_for(&mut self, f: impl FnMut(&NodeStatus) -> bool) -> NodeStatus {
            tokio::time::timeout(Duration::from_secs(5), self.board.wait_for(f))
                .await
                .unwrap()
                .unwrap()
                .clone()
        }

        fn drain_events(&mut self) -> Vec<Upstream> {
            let mut events = Vec::new();
            while let Ok(out) = self.upstream.try_recv() {
                if let Outbound::Event(e) = out {
                    events.push(e);
                }
            }
            events
        }

        async fn shutdown(self) {
            self.cancel.cancel();
            tokio::time::timeout(Duration::from_secs(5), self.task)
                .await
                .unwrap()
                .unwrap();
        }
    }

    fn start_cmd(scene: &str, take: &str) -> Downstream {
        Downstream::StartRecording {
            scene: scene.into(),
            take: take.into(),
            device_id: None,
        }
    }

    #[tokio::test]
    async fn test_second_start_is_ignored() {
        let uploader = Arc::new(FakeUploader::default());
        let mut h = Harness::start(FakeSource::new(), uploader.clone()).await;

        h.send(start_cmd("S1", "1")).await;
        h.wait_for(|s| s.state == RecorderState::ArmedRecording).await;

        h.send(start_cmd("S1", "2")).await;
        let snap = h
            .wait_for(|s| s.status.starts_with("Already busy"))
            .await;
        assert_eq!(snap.state, RecorderState::ArmedRecording);

        h.send(Downstream::StopRecording {}).await;
        h.wait_for(|s| s.status == "Upload Complete!").await;

        let delivered = uploader.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].descriptor().unwrap().take, "1");
        drop(delivered);
        h.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_uploads_exactly_once() {
        let uploader = Arc::new(FakeUploader::default());
        let mut h = Harness::start(FakeSource::new(), uploader.clone()).await;

        h.send(start_cmd("S1", "1")).await;
        h.wait_for(|s| s.state == RecorderState::ArmedRecording).await;
        h.send(Downstream::StopRecording {}).await;
        h.send(Downstream::StopRecording {}).await;
        let snap = h.wait_for(|s| s.status == "Upload Complete!").await;
        assert_eq!(snap.state, RecorderState::Idle);

        {
            let delivered = uploader.delivered.lock().unwrap();
            assert_eq!(delivered.len(), 1);
            let artifact = &delivered[0];
            assert_eq!(&artifact.payload[..], b"headtail");
            assert_eq!(artifact.extension, "webm");
            assert_eq!(
                artifact.origin,
                ArtifactOrigin::Take(SessionDescriptor::new("S1", "1", "cam-a"))
            );
        }

        let states: Vec<RecorderState> = h
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                Upstream::StateChanged { state } => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                RecorderState::ArmedRecording,
                RecorderState::Finalizing,
                RecorderState::Uploading,
                RecorderState::Idle,
            ]
        );
        h.shutdown().await;
    }

    #[tokio::test]
    async fn test_calibration_during_recording() {
        let uploader = Arc::new(FakeUploader::default());
        let mut h = Harness::start(FakeSource::new(), uploader.clone()).await;

        h.send(start_cmd("S1", "1")).await;
        h.wait_for(|s| s.state == RecorderState::ArmedRecording).await;
        h.send(Downstream::TriggerCalibration { count: 3 }).await;
        let snap = h.wait_for(|s| s.status == "Calib 3 Sent").await;
        assert_eq!(snap.state, RecorderState::ArmedRecording);

        {
            let delivered = uploader.delivered.lock().unwrap();
            assert_eq!(delivered.len(), 1);
            assert_eq!(
                delivered[0].origin,
                ArtifactOrigin::Calibration {
                    round: 3,
                    sid: "sid-1".into()
                }
            );
            assert_eq!(&delivered[0].payload[..], b"still");
        }
        h.shutdown().await;
    }

    #[tokio::test]
    async fn test_delivery_failure_returns_to_idle() {
        let uploader = Arc::new(FakeUploader {
            fail: true,
            ..Default::default()
        });
        let mut h = Harness::start(FakeSource::new(), uploader.clone()).await;

        h.send(start_cmd("S1", "1")).await;
        h.wait_for(|s| s.state == RecorderState::ArmedRecording).await;
        h.send(Downstream::StopRecording {}).await;
        let snap = h.wait_for(|s| s.status.starts_with("Upload Failed")).await;
        assert_eq!(snap.state, RecorderState::Idle);
        assert_eq!(uploader.delivered.lock().unwrap().len(), 1);

        let failed = h
            .drain_events()
            .into_iter()
            .any(|e| matches!(e, Upstream::UploadFailed { ref scene, ref take, .. } if scene == "S1" && take == "1"));
        assert!(failed);

        // A failed upload does not block the next take.
        h.send(start_cmd("S1", "2")).await;
        h.wait_for(|s| s.state == RecorderState::ArmedRecording).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(uploader.delivered.lock().unwrap().len(), 1);
        h.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_in_idle_is_noop() {
        let uploader = Arc::new(FakeUploader::default());
        let mut h = Harness::start(FakeSource::new(), uploader.clone()).await;
        h.wait_for(|s| s.status.starts_with("Ready")).await;
        h.drain_events();

        h.send(Downstream::StopRecording {}).await;
        h.intents.send(LocalIntent::Stop).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(h.drain_events().is_empty());
        assert_eq!(h.board.borrow().state, RecorderState::Idle);
        h.shutdown().await;
    }

    #[tokio::test]
    async fn test_not_ready_is_reported() {
        let mut source = FakeSource::new();
        source.ready = false;
        let mut h = Harness::start(source, Arc::new(FakeUploader::default())).await;

        h.send(start_cmd("S1", "1")).await;
        let snap = h.wait_for(|s| s.status.starts_with("Not ready")).await;
        assert_eq!(snap.state, RecorderState::Idle);
        h.shutdown().await;
    }

    #[tokio::test]
    async fn test_capture_failure_is_fatal() {
        let mut source = FakeSource::new();
        source.fail_start = true;
        let mut h = Harness::start(source, Arc::new(FakeUploader::default())).await;

        h.send(start_cmd("S1", "1")).await;
        let snap = h.wait_for(|s| s.status.starts_with("Error:")).await;
        assert_eq!(snap.state, RecorderState::Idle);

        h.send(start_cmd("S1", "2")).await;
        h.wait_for(|s| s.status.starts_with("Not ready")).await;
        h.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnect_while_recording_still_delivers() {
        let uploader = Arc::new(FakeUploader::default());
        let mut h = Harness::start(FakeSource::new(), uploader.clone()).await;

        h.send(start_cmd("S1", "1")).await;
        h.wait_for(|s| s.state == RecorderState::ArmedRecording).await;

        h.link.send_replace(Link::default());
        let snap = h.wait_for(|s| !s.connected).await;
        assert_eq!(snap.state, RecorderState::ArmedRecording);

        h.intents.send(LocalIntent::Stop).await.unwrap();
        h.wait_for(|s| s.status == "Upload Complete!").await;
        assert_eq!(uploader.delivered.lock().unwrap().len(), 1);
        h.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_for_other_device_is_ignored() {
        let mut h = Harness::start(FakeSource::new(), Arc::new(FakeUploader::default())).await;
        h.wait_for(|s| s.status.starts_with("Ready")).await;

        h.send(Downstream::StartRecording {
            scene: "S1".into(),
            take: "1".into(),
            device_id: Some("cam-b".into()),
        })
        .await;
        h.send(Downstream::StartRecording {
            scene: "S1".into(),
            take: "1".into(),
            device_id: Some("cam-a".into()),
        })
        .await;
        h.wait_for(|s| s.state == RecorderState::ArmedRecording).await;
        h.shutdown().await;
    }

    #[tokio::test]
    async fn test_local_record_reuses_last_take() {
        let uploader = Arc::new(FakeUploader::default());
        let mut h = Harness::start(FakeSource::new(), uploader.clone()).await;

        h.intents
            .send(LocalIntent::Record {
                scene: None,
                take: None,
            })
            .await
            .unwrap();
        let snap = h.wait_for(|s| s.status.starts_with("Recording")).await;
        assert_eq!(snap.status, "Recording test/001...");
        assert_eq!(snap.state, RecorderState::ArmedRecording);
        h.intents.send(LocalIntent::Stop).await.unwrap();
        h.wait_for(|s| s.status == "Upload Complete!").await;

        h.intents
            .send(LocalIntent::Record {
                scene: None,
                take: Some("002".into()),
            })
            .await
            .unwrap();
        let snap = h.wait_for(|s| s.status.starts_with("Recording")).await;
        assert_eq!(snap.status, "Recording test/002...");
        h.shutdown().await;
    }

    #[tokio::test]
    async fn test_teardown_waits_for_upload() {
        let gate = Arc::new(Notify::new());
        let uploader = Arc::new(FakeUploader {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let source = FakeSource::new();
        let released = source.released.clone();
        let mut h = Harness::start(source, uploader.clone()).await;

        h.send(start_cmd("S1", "1")).await;
        h.wait_for(|s| s.state == RecorderState::ArmedRecording).await;
        h.send(Downstream::StopRecording {}).await;
        h.wait_for(|s| s.state == RecorderState::Uploading).await;

        h.cancel.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!h.task.is_finished());
        assert!(*released.lock().unwrap());

        gate.notify_one();
        tokio::time::timeout(Duration::from_secs(5), h.task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(uploader.delivered.lock().unwrap().len(), 1);
    }
}
