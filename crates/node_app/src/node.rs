//! Process wiring: store, registry, discovery workers, relay role, HTTP API.

use std::future::IntoFuture;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mdns_sd::ServiceDaemon;
use node_api::AppState;
use node_mesh::discovery::{Advertisement, Role};
use node_mesh::sync::serve_session_list;
use node_mesh::{
    DeviceRegistry, GlobalDiscovery, LocalDiscovery, Overlay, RendezvousOverlay,
    SessionSynchronizer,
};
use node_relay::rendezvous::{self, RendezvousDirectory};
use node_relay::{RelayClient, RelayClientError, RelayHub, RelayServer};
use node_storage::SessionStore;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::mode::{select_mode, MdnsLocator, Mode, RelayLocator};

const EXPIRY_SWEEP: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The IPv4 address this host uses for outbound traffic. No packet is sent;
/// connecting a UDP socket only selects a route.
pub fn local_ip() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(_) => None,
    }
}

/// Rendezvous directory to use: the configured one, else the relay's API
/// (our own when we are the relay).
pub fn rendezvous_url(config: &NodeConfig, mode: &Mode, ip: Ipv4Addr) -> String {
    if let Some(url) = &config.rendezvous_url {
        return url.clone();
    }
    match mode {
        Mode::Relay => format!("http://{ip}:{}", config.api_port),
        Mode::Client(relay) => format!("http://{}:{}", relay.host, relay.api_port),
    }
}

/// Run a node until `cancel` fires. Returns an error on startup failure or
/// when the relay connection of a client is lost.
pub async fn run(config: NodeConfig, cancel: CancellationToken) -> Result<()> {
    let device_id = uuid::Uuid::new_v4().to_string();
    let ip = local_ip().unwrap_or_else(|| {
        warn!("could not determine local IP, advertising loopback");
        Ipv4Addr::LOCALHOST
    });

    info!("0Xnet starting...");
    info!("device_id  = {device_id}");
    info!("local_ip   = {ip}");
    info!("data_dir   = {:?}", config.data_dir);

    let store = Arc::new(SessionStore::open(&config.db_path()).context("open session store")?);
    let registry = Arc::new(DeviceRegistry::new(device_id.clone()));
    let daemon = ServiceDaemon::new().context("start mDNS daemon")?;
    let locator = MdnsLocator::new(daemon.clone());

    let relay_ad = Advertisement {
        device_id: device_id.clone(),
        role: Role::Relay,
        port: config.relay_port,
        api_port: config.api_port,
    };
    let mode = select_mode(&locator, &relay_ad, config.relay_probe()).await;

    let node = Node {
        config,
        device_id,
        ip,
        store,
        registry,
        daemon: daemon.clone(),
        cancel: cancel.clone(),
        tasks: Vec::new(),
    };
    let result = node.run(mode).await;

    cancel.cancel();
    locator.withdraw();
    if let Err(e) = daemon.shutdown() {
        debug!("mDNS daemon shutdown: {e}");
    }
    result
}

struct Node {
    config: NodeConfig,
    device_id: String,
    ip: Ipv4Addr,
    store: Arc<SessionStore>,
    registry: Arc<DeviceRegistry>,
    daemon: ServiceDaemon,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    async fn run(mut self, mode: Mode) -> Result<()> {
        let overlay = self.start_overlay(&mode).await;
        self.start_local_discovery(&mode);

        let synchronizer = Arc::new(SessionSynchronizer::new(
            self.registry.clone(),
            overlay.clone().map(|o| o as Arc<dyn Overlay>),
            self.config.sync_timeout(),
        ));
        let state = Arc::new(AppState {
            device_id: self.device_id.clone(),
            address: Some(format!("{}:{}", self.ip, self.config.api_port)),
            store: self.store.clone(),
            registry: self.registry.clone(),
            synchronizer,
        });
        let mut app = node_api::build_router(state);

        let api_addr = SocketAddr::from(([0, 0, 0, 0], self.config.api_port));
        let listener = TcpListener::bind(api_addr)
            .await
            .with_context(|| format!("bind API to {api_addr}"))?;

        let link = match &mode {
            Mode::Relay => {
                app = app.merge(self.start_relay().await?);
                None
            }
            Mode::Client(relay) => {
                let addr = format!("{}:{}", relay.host, relay.port);
                let client = RelayClient::new(&self.device_id, addr, self.config.relay_client());
                let connected = client.connect(&self.cancel).await;
                match connected {
                    Ok(link) => Some(link),
                    Err(RelayClientError::Cancelled) => {
                        info!("shutdown requested before the relay answered");
                        self.shutdown().await;
                        return Ok(());
                    }
                    Err(e) => {
                        self.shutdown().await;
                        return Err(e).context("connect to relay");
                    }
                }
            }
        };

        info!("HTTP API listening on {api_addr}");
        let shutdown = self.cancel.clone();
        let server = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .into_future();

        let outcome = match link {
            None => server.await.context("serve API"),
            Some(mut link) => {
                let relay_lost = async move {
                    while let Some(frame) = link.recv().await {
                        info!(
                            "relay: {} bytes: {}",
                            frame.len(),
                            String::from_utf8_lossy(&frame)
                        );
                    }
                };
                tokio::select! {
                    served = server => served.context("serve API"),
                    _ = relay_lost => Err(anyhow::anyhow!("relay connection lost")),
                }
            }
        };

        self.shutdown().await;
        outcome
    }

    /// Bind the overlay, serve our session list on it and start global
    /// discovery. Failure here only disables the global path.
    async fn start_overlay(&mut self, mode: &Mode) -> Option<Arc<RendezvousOverlay>> {
        if !self.config.enable_global {
            info!("global discovery disabled");
            return None;
        }

        let url = rendezvous_url(&self.config, mode, self.ip);
        let listen = SocketAddr::from(([0, 0, 0, 0], self.config.overlay_port));
        let overlay = match RendezvousOverlay::bind(
            &self.device_id,
            &url,
            listen,
            &self.ip.to_string(),
            self.cancel.clone(),
        )
        .await
        {
            Ok(overlay) => Arc::new(overlay),
            Err(e) => {
                warn!("overlay unavailable, global discovery off: {e:#}");
                return None;
            }
        };
        info!(
            "overlay at {} using rendezvous {url}",
            overlay.advertised_addr()
        );

        let store = self.store.clone();
        serve_session_list(overlay.as_ref(), move || store.list().map_err(Into::into));

        let discovery = GlobalDiscovery::new(
            overlay.clone(),
            self.registry.clone(),
            self.config.global_discovery(),
        );
        self.tasks.push(tokio::spawn(discovery.run(self.cancel.clone())));
        Some(overlay)
    }

    /// A relay's record was announced by the election; a client announces
    /// itself as a peer here.
    fn start_local_discovery(&mut self, mode: &Mode) {
        let advertisement = match mode {
            Mode::Relay => None,
            Mode::Client(_) => Some(Advertisement {
                device_id: self.device_id.clone(),
                role: Role::Peer,
                port: self.config.api_port,
                api_port: self.config.api_port,
            }),
        };
        let discovery = LocalDiscovery::new(
            self.daemon.clone(),
            self.registry.clone(),
            self.config.local_discovery(),
        );
        self.tasks
            .push(tokio::spawn(discovery.run(advertisement, self.cancel.clone())));
    }

    /// Start the hub listener and the rendezvous directory. Returns the
    /// rendezvous routes to mount on the API.
    async fn start_relay(&mut self) -> Result<axum::Router> {
        let relay_addr = SocketAddr::from(([0, 0, 0, 0], self.config.relay_port));
        let listener = TcpListener::bind(relay_addr)
            .await
            .with_context(|| format!("bind relay to {relay_addr}"))?;

        let server = RelayServer::new(Arc::new(RelayHub::new()), self.registry.clone());
        let cancel = self.cancel.clone();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = server.serve(listener, cancel).await {
                warn!("relay server error: {e:#}");
            }
        }));

        let directory = Arc::new(RwLock::new(RendezvousDirectory::new()));
        self.tasks.push(rendezvous::spawn_expiry(
            directory.clone(),
            EXPIRY_SWEEP,
            self.cancel.clone(),
        ));
        info!("relay mode: hub on {relay_addr}, rendezvous on the API port");
        Ok(rendezvous::router(directory))
    }

    async fn shutdown(self) {
        self.cancel.cancel();
        let drain = async {
            for task in self.tasks {
                task.await.ok();
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("background tasks still running after {SHUTDOWN_GRACE:?}");
        }
        info!("node stopped");
    }
}
