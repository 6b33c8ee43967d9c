//! Control channel – the node's WebSocket link to the control server.
//!
//! A background task keeps the link up: it connects, announces the node
//! with `connected`, forwards downstream commands in arrival order, and
//! reconnects with exponential backoff whenever the link drops.  Every
//! reconnect yields a fresh connection id.  Upstream events are
//! at-most-once: whatever is queued while the link is down is dropped.

use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use take_common::protocol::{self, Capability, Downstream, Upstream, WS_PATH};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Something to send upstream.
#[derive(Debug, Clone)]
pub enum Outbound {
    Event(Upstream),
    /// Preview JPEG; dropped unless the server granted `preview`.
    Preview(Bytes),
}

/// Current link as seen by the node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Link {
    /// Connection id assigned by the server; `None` while disconnected.
    pub sid: Option<String>,
    pub capabilities: Vec<Capability>,
}

impl Link {
    pub fn granted(&self, cap: Capability) -> bool {
        self.sid.is_some() && self.capabilities.contains(&cap)
    }
}

/// The session's end of the control channel.
pub struct ChannelHandle {
    pub commands: mpsc::Receiver<Downstream>,
    pub upstream: mpsc::Sender<Outbound>,
    pub link: watch::Receiver<Link>,
}

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub url: String,
    pub device_id: String,
    pub capabilities: Vec<Capability>,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
}

/// Turn the server's HTTP base URL into its WebSocket endpoint.
pub fn ws_url(base: &str) -> String {
    let base = base.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        format!("ws://{base}")
    };
    format!("{base}{WS_PATH}")
}

/// Start the channel task.  It runs until `cancel` fires or the session
/// drops its handle.
pub fn spawn(opts: ChannelOptions, cancel: CancellationToken) -> (ChannelHandle, JoinHandle<()>) {
    let (cmd_tx, commands) = mpsc::channel(32);
    let (upstream, out_rx) = mpsc::channel(64);
    let (link_tx, link) = watch::channel(Link::default());

    let task = tokio::spawn(run(opts, cmd_tx, out_rx, link_tx, cancel));
    (
        ChannelHandle {
            commands,
            upstream,
            link,
        },
        task,
    )
}

async fn run(
    opts: ChannelOptions,
    cmd_tx: mpsc::Sender<Downstream>,
    mut out_rx: mpsc::Receiver<Outbound>,
    link_tx: watch::Sender<Link>,
    cancel: CancellationToken,
) {
    let mut backoff = opts.reconnect_min;

    loop {
        let attempt = tokio::select! {
            _ = cancel.cancelled() => break,
            r = connect_async(opts.url.as_str()) => r,
        };

        match attempt {
            Ok((socket, _)) => {
                info!("Control channel connected to {}", opts.url);
                backoff = opts.reconnect_min;

                // Anything queued while we were away is stale.
                while out_rx.try_recv().is_ok() {}

                match serve(&opts, socket, &cmd_tx, &mut out_rx, &link_tx, &cancel).await {
                    Ok(()) => info!("Control channel closed"),
                    Err(e) => warn!("Control channel dropped: {e:#}"),
                }
                link_tx.send_replace(Link::default());
                if cancel.is_cancelled() || cmd_tx.is_closed() {
                    break;
                }
            }
            Err(e) => warn!("Cannot reach control server at {}: {e}", opts.url),
        }

        debug!("Reconnecting in {}ms", backoff.as_millis());
        let sleep = tokio::time::sleep(backoff);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = &mut sleep => break,
                out = out_rx.recv() => {
                    if out.is_none() {
                        return;
                    }
                }
            }
        }
        backoff = (backoff * 2).min(opts.reconnect_max);
    }
    info!("Control channel stopped");
}

/// Drive one connection until it closes.
async fn serve(
    opts: &ChannelOptions,
    socket: Socket,
    cmd_tx: &mpsc::Sender<Downstream>,
    out_rx: &mut mpsc::Receiver<Outbound>,
    link_tx: &watch::Sender<Link>,
    cancel: &CancellationToken,
) -> Result<()> {
    let (mut sink, mut stream) = socket.split();

    let hello = Upstream::Connected {
        device_id: opts.device_id.clone(),
        capabilities: opts.capabilities.clone(),
    };
    sink.send(Message::Text(protocol::encode(&hello)?.into()))
        .await?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return Ok(());
            }
            frame = stream.next() => {
                let Some(frame) = frame else {
                    return Ok(());
                };
                match frame? {
                    Message::Text(text) => match protocol::decode::<Downstream>(text.as_str()) {
                        Ok(Downstream::Session { sid, capabilities }) => {
                            info!("Control session {sid} (capabilities={capabilities:?})");
                            link_tx.send_replace(Link {
                                sid: Some(sid),
                                capabilities,
                            });
                        }
                        Ok(cmd) => {
                            debug!("Command received: {}", cmd.name());
                            if cmd_tx.send(cmd).await.is_err() {
                                return Ok(());
                            }
                        }
                        Err(e) => warn!("Ignoring control message: {e}"),
                    },
                    Message::Close(_) => return Ok(()),
                    _ => {}
                }
            }
            out = out_rx.recv() => {
                let Some(out) = out else {
                    return Ok(());
                };
                let msg = match out {
                    Outbound::Event(event) => Message::Text(protocol::encode(&event)?.into()),
                    Outbound::Preview(frame) => {
                        if !link_tx.borrow().granted(Capability::Preview) {
                            continue;
                        }
                        Message::Binary(frame)
                    }
                };
                sink.send(msg).await?;
            }
        }
    }
}
