//! Session coordinator – the server's connection table and artifact ledger.
//!
//! One record per live control-channel connection.  A client that
//! reconnects gets a new connection id and a fresh `Idle` record: nothing
//! is reconciled across a disconnect.  Artifacts are keyed by correlation
//! id; a resubmission overwrites the existing entry.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use take_common::artifact::{CorrelationId, MediaKind};
use take_common::protocol::{negotiate, Capability, Downstream, RecorderState};

/// Capabilities this server implements.
const SUPPORTED: [Capability; 2] = Capability::ALL;

/// Which clients an operator command goes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    All,
    Devices(Vec<String>),
}

impl Target {
    pub fn from_devices(devices: Option<Vec<String>>) -> Self {
        match devices {
            Some(list) if !list.is_empty() => Self::Devices(list),
            _ => Self::All,
        }
    }

    fn matches(&self, device_id: Option<&str>) -> bool {
        match self {
            Self::All => true,
            Self::Devices(list) => device_id.is_some_and(|d| list.iter().any(|t| t == d)),
        }
    }
}

#[derive(Debug)]
struct ClientRecord {
    device_id: Option<String>,
    state: RecorderState,
    capabilities: Vec<Capability>,
    connected_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    status: Option<String>,
    last_failure: Option<String>,
    preview: Option<Bytes>,
    outbox: mpsc::Sender<Downstream>,
}

/// What `GET /api/clients` returns per connection.
#[derive(Debug, Clone, Serialize)]
pub struct ClientSummary {
    pub sid: String,
    pub device_id: Option<String>,
    pub state: RecorderState,
    pub capabilities: Vec<Capability>,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status: Option<String>,
    pub last_failure: Option<String>,
    pub has_preview: bool,
}

/// One ledger entry, keyed by correlation id.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactRecord {
    pub correlation_id: CorrelationId,
    pub kind: MediaKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scene: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    pub path: String,
    pub size: usize,
    pub received_at: DateTime<Utc>,
    /// How many times this correlation id was submitted.
    pub submissions: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    Created,
    Replaced,
}

#[derive(Default)]
struct Tables {
    clients: HashMap<String, ClientRecord>,
    artifacts: BTreeMap<CorrelationId, ArtifactRecord>,
}

/// Cheap to clone; every clone shares the same tables.
#[derive(Clone, Default)]
pub struct Coordinator {
    tables: Arc<RwLock<Tables>>,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection and return its id.
    pub async fn connect(&self, outbox: mpsc::Sender<Downstream>) -> String {
        let sid = uuid::Uuid::new_v4().simple().to_string();
        let now = Utc::now();
        self.tables.write().await.clients.insert(
            sid.clone(),
            ClientRecord {
                device_id: None,
                state: RecorderState::Idle,
                capabilities: Vec::new(),
                connected_at: now,
                last_seen: now,
                status: None,
                last_failure: None,
                preview: None,
                outbox,
            },
        );
        debug!("Connection {sid} registered");
        sid
    }

    /// Handle a client's `connected` announcement.  Returns the granted
    /// capabilities, or `None` if the connection is gone.
    pub async fn hello(
        &self,
        sid: &str,
        device_id: &str,
        offered: &[Capability],
    ) -> Option<Vec<Capability>> {
        let granted = negotiate(offered, &SUPPORTED);
        let mut tables = self.tables.write().await;
        let record = tables.clients.get_mut(sid)?;
        record.device_id = Some(device_id.to_string());
        record.capabilities = granted.clone();
        record.last_seen = Utc::now();
        info!("Client {device_id} connected as {sid} (capabilities={granted:?})");
        Some(granted)
    }

    pub async fn update_state(&self, sid: &str, state: RecorderState) {
        self.touch(sid, |r| {
            debug!("{sid}: {} → {state}", r.state);
            r.state = state;
        })
        .await;
    }

    pub async fn record_status(&self, sid: &str, text: String) {
        self.touch(sid, |r| r.status = Some(text)).await;
    }

    /// Bookkeeping only: the client already returned to `Idle` on its own.
    pub async fn record_upload_failure(&self, sid: &str, scene: &str, take: &str, reason: &str) {
        warn!("{sid}: upload of {scene}/{take} failed: {reason}");
        let failure = format!("{scene}/{take}: {reason}");
        self.touch(sid, |r| r.last_failure = Some(failure)).await;
    }

    /// Keep the latest preview frame.  Ignored unless preview was granted.
    pub async fn store_preview(&self, sid: &str, frame: Bytes) -> bool {
        let mut tables = self.tables.write().await;
        match tables.clients.get_mut(sid) {
            Some(r) if r.capabilities.contains(&Capability::Preview) => {
                r.preview = Some(frame);
                r.last_seen = Utc::now();
                true
            }
            _ => false,
        }
    }

    pub async fn preview(&self, sid: &str) -> Option<Bytes> {
        self.tables
            .read()
            .await
            .clients
            .get(sid)
            .and_then(|r| r.preview.clone())
    }

    pub async fn disconnect(&self, sid: &str) {
        if let Some(record) = self.tables.write().await.clients.remove(sid) {
            info!(
                "Client {} disconnected ({sid}, last state {})",
                record.device_id.as_deref().unwrap_or("?"),
                record.state
            );
        }
    }

    /// Fan a command out to the targeted clients.  Best effort: a client
    /// whose outbox is full or closed is skipped.  Returns how many
    /// clients the command was handed to.
    pub async fn dispatch(&self, cmd: Downstream, target: &Target) -> usize {
        let tables = self.tables.read().await;
        let mut reached = 0;

        for (sid, record) in &tables.clients {
            if !target.matches(record.device_id.as_deref()) {
                continue;
            }
            if matches!(cmd, Downstream::TriggerCalibration { .. })
                && !record.capabilities.contains(&Capability::Calibration)
            {
                continue;
            }

            let mut cmd = cmd.clone();
            if let (Target::Devices(_), Downstream::StartRecording { device_id, .. }) =
                (target, &mut cmd)
            {
                *device_id = record.device_id.clone();
            }

            match record.outbox.try_send(cmd) {
                Ok(()) => reached += 1,
                Err(e) => warn!("Cannot reach {sid}: {e}"),
            }
        }

        info!("Dispatched {} to {reached} client(s)", cmd.name());
        reached
    }

    /// Record an artifact in the ledger.
    pub async fn ingest(&self, mut record: ArtifactRecord) -> Ingest {
        let mut tables = self.tables.write().await;
        let outcome = match tables.artifacts.get(&record.correlation_id) {
            Some(previous) => {
                record.submissions = previous.submissions + 1;
                Ingest::Replaced
            }
            None => {
                record.submissions = 1;
                Ingest::Created
            }
        };
        info!(
            "Artifact {} stored at {} ({:?})",
            record.correlation_id, record.path, outcome
        );
        tables
            .artifacts
            .insert(record.correlation_id.clone(), record);
        outcome
    }

    pub async fn clients(&self) -> Vec<ClientSummary> {
        let tables = self.tables.read().await;
        let mut list: Vec<ClientSummary> = tables
            .clients
            .iter()
            .map(|(sid, r)| ClientSummary {
                sid: sid.clone(),
                device_id: r.device_id.clone(),
                state: r.state,
                capabilities: r.capabilities.clone(),
                connected_at: r.connected_at,
                last_seen: r.last_seen,
                status: r.status.clone(),
                last_failure: r.last_failure.clone(),
                has_preview: r.preview.is_some(),
            })
            .collect();
        list.sort_by_key(|c| c.connected_at);
        list
    }

    pub async fn artifacts(&self) -> Vec<ArtifactRecord> {
        self.tables.read().await.artifacts.values().cloned().collect()
    }

    async fn touch(&self, sid: &str, f: impl FnOnce(&mut ClientRecord)) {
        if let Some(record) = self.tables.write().await.clients.get_mut(sid) {
            record.last_seen = Utc::now();
            f(record);
        }
    }
}
