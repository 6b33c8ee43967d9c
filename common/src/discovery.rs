//! mDNS service discovery for take nodes.
//!
//! The control server announces `_take-control._tcp`; each capture node
//! announces `_take-capture._tcp` under its device id (also published as
//! the `device_id` TXT property).  A capture node without `SERVER_URL`
//! looks the control server up here instead of relying on a fixed address.
//!
//! Every call blocks; async callers go through `spawn_blocking`.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tracing::{debug, info, warn};

const TXT_DEVICE_ID: &str = "device_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceRole {
    Control,
    Capture,
}

impl ServiceRole {
    pub fn service_type(self) -> &'static str {
        match self {
            Self::Control => "_take-control._tcp.local.",
            Self::Capture => "_take-capture._tcp.local.",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Capture => "capture",
        }
    }
}

/// A node found on the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Instance name, e.g. `capture-cam-a`.
    pub instance_name: String,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    pub device_id: Option<String>,
}

impl Peer {
    /// Routable addresses first, IPv4 before IPv6.
    fn preferred_address(&self) -> Option<IpAddr> {
        self.addresses
            .iter()
            .copied()
            .min_by_key(|a| (a.is_loopback(), !a.is_ipv4()))
    }

    pub fn http_url(&self) -> Option<String> {
        let addr = self.preferred_address()?;
        Some(format!("http://{}", SocketAddr::new(addr, self.port)))
    }
}

/// A live mDNS announcement.  Dropping it without [`withdraw`] leaves the
/// record to expire on its own.
///
/// [`withdraw`]: Announcement::withdraw
pub struct Announcement {
    daemon: ServiceDaemon,
    fullname: String,
}

impl Announcement {
    /// The first peer of `role` to answer within `timeout`, ignoring
    /// ourselves.
    pub fn find_first(&self, role: ServiceRole, timeout: Duration) -> Option<Peer> {
        browse(&self.daemon, role, timeout, &self.fullname)
    }

    pub fn withdraw(self) {
        if let Err(e) = self.daemon.unregister(&self.fullname) {
            debug!("mDNS unregister failed: {e}");
        }
        let _ = self.daemon.shutdown();
    }
}

/// Announce this node as `{role}-{name}` on `port`.
pub fn announce(
    role: ServiceRole,
    name: &str,
    port: u16,
    device_id: Option<&str>,
) -> Result<Announcement> {
    let daemon = ServiceDaemon::new().context("Cannot start mDNS daemon")?;

    let instance_name = format!("{}-{}", role.label(), dns_label(name));
    let host = format!("{instance_name}.local.");
    let mut txt = HashMap::new();
    if let Some(id) = device_id {
        txt.insert(TXT_DEVICE_ID.to_string(), id.to_string());
    }

    let service = ServiceInfo::new(role.service_type(), &instance_name, &host, "", port, txt)
        .context("Cannot create mDNS ServiceInfo")?
        .enable_addr_auto();
    let fullname = service.get_fullname().to_string();

    daemon
        .register(service)
        .context("Cannot register mDNS service")?;
    info!(
        "Announced on mDNS as '{instance_name}' (type={}, port={port})",
        role.service_type()
    );

    Ok(Announcement { daemon, fullname })
}

fn browse(
    daemon: &ServiceDaemon,
    role: ServiceRole,
    timeout: Duration,
    exclude: &str,
) -> Option<Peer> {
    let receiver = match daemon.browse(role.service_type()) {
        Ok(r) => r,
        Err(e) => {
            warn!("mDNS browse for {} failed: {e}", role.service_type());
            return None;
        }
    };
    debug!("mDNS: browsing for {} ({}ms)", role.service_type(), timeout.as_millis());

    let deadline = Instant::now() + timeout;
    let mut found = None;
    while found.is_none() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let Ok(event) = receiver.recv_timeout(remaining) else {
            break;
        };
        let ServiceEvent::ServiceResolved(resolved) = event else {
            continue;
        };
        if resolved.get_fullname() == exclude {
            continue;
        }

        let peer = Peer {
            instance_name: short_name(resolved.get_fullname()),
            addresses: resolved.get_addresses().iter().map(|a| a.to_ip_addr()).collect(),
            port: resolved.get_port(),
            device_id: resolved.get_property_val_str(TXT_DEVICE_ID).map(str::to_string),
        };
        info!(
            "mDNS: found {} at {:?}:{}",
            peer.instance_name, peer.addresses, peer.port
        );
        found = Some(peer);
    }

    let _ = daemon.stop_browse(role.service_type());
    found
}

/// `capture-cam-a._take-capture._tcp.local.` → `capture-cam-a`
fn short_name(fullname: &str) -> String {
    fullname.split('.').next().unwrap_or(fullname).to_string()
}

/// Lower-case letters, digits and single hyphens; anything else becomes a
/// hyphen.
fn dns_label(name: &str) -> String {
    let mut label = String::with_capacity(name.len());
    for c in name.trim().chars() {
        let c = if c.is_ascii_alphanumeric() {
            c.to_ascii_lowercase()
        } else {
            '-'
        };
        if c == '-' && (label.is_empty() || label.ends_with('-')) {
            continue;
        }
        label.push(c);
    }
    let label = label.trim_end_matches('-');
    if label.is_empty() {
        "node".to_string()
    } else {
        label.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(addresses: &[&str]) -> Peer {
        Peer {
            instance_name: "control-server".into(),
            addresses: addresses.iter().map(|a| a.parse().unwrap()).collect(),
            port: 5000,
            device_id: None,
        }
    }

    #[test]
    fn test_http_url_prefers_routable_ipv4() {
        let p = peer(&["127.0.0.1", "fe80::1", "192.168.1.20"]);
        assert_eq!(p.http_url().as_deref(), Some("http://192.168.1.20:5000"));

        let p = peer(&["::1", "fe80::1"]);
        assert_eq!(p.http_url().as_deref(), Some("http://[fe80::1]:5000"));

        assert!(peer(&[]).http_url().is_none());
    }

    #[test]
    fn test_dns_label() {
        assert_eq!(dns_label("Cam A"), "cam-a");
        assert_eq!(dns_label("  stage/left..2 "), "stage-left-2");
        assert_eq!(dns_label("___"), "node");
    }

    #[test]
    fn test_short_name() {
        assert_eq!(short_name("capture-cam-a._take-capture._tcp.local."), "capture-cam-a");
        assert_eq!(short_name("plain"), "plain");
    }
}
