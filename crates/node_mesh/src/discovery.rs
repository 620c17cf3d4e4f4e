//! mDNS-based LAN discovery using mdns-sd.
//!
//! Every node registers `0Xnet-<deviceId>` under `_0xnet._tcp.local.` with
//! TXT `deviceId`, `role` and `apiPort`. A relay advertises its relay port as
//! the service port; ordinary peers advertise their API port.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use node_proto::{Device, INSTANCE_PREFIX, SERVICE_TYPE, TXT_API_PORT, TXT_DEVICE_ID, TXT_ROLE};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::DeviceRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Relay,
    Peer,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Self::Relay => "relay",
            Self::Peer => "peer",
        }
    }

    fn parse(value: Option<&str>) -> Option<Self> {
        match value {
            // Records without a role predate role tagging and only relays advertised then.
            None | Some("relay") => Some(Self::Relay),
            Some("peer") => Some(Self::Peer),
            Some(_) => None,
        }
    }
}

/// What this node publishes on the local broadcast domain.
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub device_id: String,
    pub role: Role,
    pub port: u16,
    pub api_port: u16,
}

/// A peer advertisement seen while browsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub device_id: String,
    pub role: Role,
    pub host: Ipv4Addr,
    pub port: u16,
    pub api_port: u16,
}

impl DiscoveredPeer {
    /// Address of the peer's HTTP API, used for session sync.
    pub fn api_address(&self) -> String {
        format!("{}:{}", self.host, self.api_port)
    }
}

/// Where a relay accepts connections and serves its API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoint {
    pub device_id: String,
    pub host: Ipv4Addr,
    pub port: u16,
    pub api_port: u16,
}

impl From<DiscoveredPeer> for RelayEndpoint {
    fn from(peer: DiscoveredPeer) -> Self {
        Self {
            device_id: peer.device_id,
            host: peer.host,
            port: peer.port,
            api_port: peer.api_port,
        }
    }
}

fn host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "0xnet-node".into())
}

/// Build the service record for an advertisement.
pub fn service_info(ad: &Advertisement) -> Result<ServiceInfo> {
    let instance_name = format!("{INSTANCE_PREFIX}{}", ad.device_id);
    let properties = [
        (TXT_DEVICE_ID.to_string(), ad.device_id.clone()),
        (TXT_ROLE.to_string(), ad.role.as_str().to_string()),
        (TXT_API_PORT.to_string(), ad.api_port.to_string()),
    ];

    let info = ServiceInfo::new(
        SERVICE_TYPE,
        &instance_name,
        &format!("{}.local.", host_name()),
        "",
        ad.port,
        &properties[..],
    )
    .context("create mDNS service info")?
    .enable_addr_auto();
    Ok(info)
}

/// Register this node on mDNS. Returns the full service name for unregistering.
pub fn register_service(daemon: &ServiceDaemon, ad: &Advertisement) -> Result<String> {
    let info = service_info(ad)?;
    let fullname = info.get_fullname().to_string();
    daemon.register(info).context("register mDNS service")?;
    info!(
        "mDNS: advertising {} as {} on port {}",
        ad.device_id,
        ad.role.as_str(),
        ad.port
    );
    Ok(fullname)
}

pub fn unregister_service(daemon: &ServiceDaemon, fullname: &str) {
    if let Err(e) = daemon.unregister(fullname) {
        warn!("mDNS: failed to unregister {fullname}: {e}");
    }
}

/// Extract a peer from a resolved record. Records with a missing device id,
/// an unknown role or no IPv4 address yield `None`.
pub fn parse_service(info: &ServiceInfo) -> Option<DiscoveredPeer> {
    let device_id = info.get_property_val_str(TXT_DEVICE_ID)?.trim();
    if device_id.is_empty() {
        return None;
    }
    let role = Role::parse(info.get_property_val_str(TXT_ROLE))?;
    let host = info.get_addresses_v4().into_iter().min().copied()?;
    let port = info.get_port();
    let api_port = match info.get_property_val_str(TXT_API_PORT) {
        Some(v) => v.parse().ok()?,
        None => port,
    };

    Some(DiscoveredPeer {
        device_id: device_id.to_string(),
        role,
        host,
        port,
        api_port,
    })
}

/// Browse for `window` and collect every parseable advertisement, self excluded.
pub async fn scan(daemon: &ServiceDaemon, own_id: &str, window: Duration) -> Result<Vec<DiscoveredPeer>> {
    let receiver = daemon.browse(SERVICE_TYPE).context("start mDNS browse")?;
    let deadline = Instant::now() + window;
    let mut found: Vec<DiscoveredPeer> = Vec::new();

    loop {
        match tokio::time::timeout_at(deadline, receiver.recv_async()).await {
            Ok(Ok(ServiceEvent::ServiceResolved(info))) => {
                let Some(peer) = parse_service(&info) else {
                    continue;
                };
                if peer.device_id == own_id {
                    continue;
                }
                found.retain(|p| p.device_id != peer.device_id);
                found.push(peer);
            }
            Ok(Ok(ServiceEvent::SearchStarted(_))) => debug!("mDNS: browse started"),
            Ok(Ok(_)) => {}
            Ok(Err(_)) => {
                debug!("mDNS browse channel closed");
                break;
            }
            Err(_) => break,
        }
    }

    if let Err(e) = daemon.stop_browse(SERVICE_TYPE) {
        debug!("mDNS: stop browse failed: {e}");
    }
    Ok(found)
}

/// Probe the local domain for an advertised relay. Returns the first one seen
/// within `window`, or `None` once the window elapses.
pub async fn find_relay(daemon: &ServiceDaemon, own_id: &str, window: Duration) -> Result<Option<RelayEndpoint>> {
    let receiver = daemon.browse(SERVICE_TYPE).context("start mDNS browse")?;
    let deadline = Instant::now() + window;

    let relay = loop {
        match tokio::time::timeout_at(deadline, receiver.recv_async()).await {
            Ok(Ok(ServiceEvent::ServiceResolved(info))) => match parse_service(&info) {
                Some(peer) if peer.role == Role::Relay && peer.device_id != own_id => {
                    break Some(RelayEndpoint::from(peer));
                }
                _ => {}
            },
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => break None,
        }
    };

    if let Err(e) = daemon.stop_browse(SERVICE_TYPE) {
        debug!("mDNS: stop browse failed: {e}");
    }
    Ok(relay)
}

#[derive(Debug, Clone)]
pub struct LocalDiscoveryConfig {
    pub scan_interval: Duration,
    pub scan_timeout: Duration,
}

impl Default for LocalDiscoveryConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(10),
            scan_timeout: Duration::from_secs(3),
        }
    }
}

/// Advertises this node and periodically rescans the LAN, feeding the registry.
pub struct LocalDiscovery {
    daemon: ServiceDaemon,
    registry: Arc<DeviceRegistry>,
    config: LocalDiscoveryConfig,
}

impl LocalDiscovery {
    pub fn new(daemon: ServiceDaemon, registry: Arc<DeviceRegistry>, config: LocalDiscoveryConfig) -> Self {
        Self {
            daemon,
            registry,
            config,
        }
    }

    /// Upsert scan results. Returns how many devices were new.
    pub fn absorb(registry: &DeviceRegistry, peers: Vec<DiscoveredPeer>) -> usize {
        let mut added = 0;
        for peer in peers {
            let address = peer.api_address();
            if registry.upsert(Device::local(peer.device_id.clone(), address.clone())) {
                info!("mDNS: discovered new peer {} at {address}", peer.device_id);
                added += 1;
            } else {
                debug!("mDNS: refreshed peer {} at {address}", peer.device_id);
            }
        }
        added
    }

    /// Run until cancelled. Scans are sequential; each is bounded by `scan_timeout`.
    pub async fn run(self, advertisement: Option<Advertisement>, cancel: CancellationToken) {
        let fullname = match &advertisement {
            Some(ad) => match register_service(&self.daemon, ad) {
                Ok(name) => Some(name),
                Err(e) => {
                    warn!("mDNS register failed: {e:#}");
                    None
                }
            },
            None => None,
        };

        let own_id = self.registry.local_id().to_string();
        loop {
            let scan = scan(&self.daemon, &own_id, self.config.scan_timeout);
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = scan => result,
            };
            match result {
                Ok(peers) => {
                    Self::absorb(&self.registry, peers);
                }
                Err(e) => warn!("mDNS scan failed: {e:#}"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.scan_interval) => {}
            }
        }

        if let Some(name) = fullname {
            unregister_service(&self.daemon, &name);
        }
        info!("mDNS: local discovery stopped");
    }
}
