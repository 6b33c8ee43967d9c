//! Take Capture Node – records takes on command and uploads them.
//!
//! This binary:
//! 1. Reads configuration from `take.conf`
//! 2. Finds the control server (config, then mDNS, then a fallback URL)
//! 3. Keeps a control channel open and runs the recording session
//! 4. Serves a small local HTTP surface for status and manual triggers

mod capture;
mod channel;
mod error;
mod machine;
mod media;
mod server;
mod session;
mod status;
mod uploader;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use take_common::config::Config;
use take_common::discovery::{self, Announcement, ServiceRole};

use crate::capture::FfmpegSource;
use crate::channel::ChannelOptions;
use crate::session::ClientSession;
use crate::status::StatusBoard;
use crate::uploader::{Deliver, HttpUploader, RetryingUploader};

const DEFAULT_PORT: u16 = 8090;
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(3);
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── load config ──────────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| Config::default_path().to_string());
    let config =
        take_common::config::load(&PathBuf::from(&config_path)).context("Config load failed")?;

    info!(
        "Take Capture Node starting (device={}, listen={}, format={})",
        config.device_id,
        config.capture_listen_addr,
        config.video_format.extension()
    );

    std::fs::create_dir_all(&config.work_dir).context("Cannot create work directory")?;

    // ── ctrl-c ───────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    ctrlc::set_handler(move || {
        info!("Shutdown signal received");
        on_signal.cancel();
    })
    .context("Cannot set Ctrl-C handler")?;

    // ── mDNS registration + control server lookup ────────────────────
    // Setting TAKE_DISABLE_MDNS=1 skips mDNS for environments where
    // multicast is not available (e.g. bridge networking, CI).
    let (discovery, discovered) = if std::env::var("TAKE_DISABLE_MDNS").is_ok() {
        info!("TAKE_DISABLE_MDNS set – mDNS skipped");
        (None, None)
    } else {
        let port = listen_port(&config.capture_listen_addr);
        let device_id = config.device_id.clone();
        let lookup = config.server_url.is_none();
        tokio::task::spawn_blocking(move || announce_and_lookup(&device_id, port, lookup))
            .await
            .context("mDNS task failed")?
    };

    let server_url = config
        .server_url
        .clone()
        .or(discovered)
        .unwrap_or_else(|| Config::fallback_server_url().to_string());
    info!("Control server: {server_url}");

    // ── uploader ─────────────────────────────────────────────────────
    let http = Arc::new(
        HttpUploader::new(&server_url, config.upload_timeout)
            .context("Cannot create HTTP client")?,
    );
    let uploader: Arc<dyn Deliver> = if config.upload_retries > 0 {
        info!("Uploads retried up to {} time(s)", config.upload_retries);
        Arc::new(RetryingUploader::new(http, config.upload_retries, RETRY_BACKOFF))
    } else {
        http
    };

    // ── control channel ──────────────────────────────────────────────
    let (channel, channel_task) = channel::spawn(
        ChannelOptions {
            url: channel::ws_url(&server_url),
            device_id: config.device_id.clone(),
            capabilities: config.capabilities.clone(),
            reconnect_min: config.reconnect_min,
            reconnect_max: config.reconnect_max,
        },
        cancel.clone(),
    );

    // ── local HTTP surface ───────────────────────────────────────────
    let board = StatusBoard::new(&config.device_id);
    let (intent_tx, intent_rx) = mpsc::channel(8);
    let server_task = {
        let listen_addr = config.capture_listen_addr.clone();
        let board = board.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = server::run(&listen_addr, board, intent_tx, cancel).await {
                error!("HTTP server error: {e:#}");
            }
        })
    };

    // ── session ──────────────────────────────────────────────────────
    let mut session = ClientSession::open(
        config.device_id.clone(),
        FfmpegSource::new(&config),
        channel,
        uploader,
        board,
        config.preview_interval(),
    )
    .await;
    session.run(intent_rx, cancel.clone()).await;
    session.teardown().await;

    let _ = server_task.await;
    let _ = channel_task.await;

    if let Some(announcement) = discovery {
        announcement.withdraw();
    }

    info!("Take Capture Node stopped");
    Ok(())
}

fn listen_port(addr: &str) -> u16 {
    addr.parse::<SocketAddr>()
        .map(|a| a.port())
        .unwrap_or(DEFAULT_PORT)
}

/// Announce the node and, if asked, browse for a control server.
/// Blocking; run off the async workers.
fn announce_and_lookup(
    device_id: &str,
    port: u16,
    lookup: bool,
) -> (Option<Announcement>, Option<String>) {
    let handle = match discovery::announce(ServiceRole::Capture, device_id, port, Some(device_id)) {
        Ok(h) => h,
        Err(e) => {
            warn!("mDNS registration failed (non-fatal): {e:#}");
            return (None, None);
        }
    };

    if !lookup {
        return (Some(handle), None);
    }

    let url = handle
        .find_first(ServiceRole::Control, DISCOVERY_TIMEOUT)
        .and_then(|peer| peer.http_url());
    if url.is_none() {
        warn!("mDNS: no control server found");
    }
    (Some(handle), url)
}
