//! Global discovery over the rendezvous overlay.
//!
//! Three independent loops share one cancellation token:
//! - connection events: connect -> upsert, disconnect -> remove (fast path)
//! - advertise: re-publish the topic before overlay records expire
//! - resolve: look up the topic and dial candidates not yet reachable

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use node_proto::{Device, Origin, GLOBAL_TOPIC};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::overlay::{ConnectionEvent, Overlay};
use crate::registry::DeviceRegistry;

#[derive(Debug, Clone)]
pub struct GlobalDiscoveryConfig {
    pub topic: String,
    pub advertise_interval: Duration,
    pub resolve_interval: Duration,
    pub backoff: Duration,
}

impl Default for GlobalDiscoveryConfig {
    fn default() -> Self {
        Self {
            topic: GLOBAL_TOPIC.to_string(),
            advertise_interval: Duration::from_secs(30),
            resolve_interval: Duration::from_secs(20),
            backoff: Duration::from_secs(5),
        }
    }
}

pub struct GlobalDiscovery {
    overlay: Arc<dyn Overlay>,
    registry: Arc<DeviceRegistry>,
    config: GlobalDiscoveryConfig,
}

/// Sleep for `period`. Returns false if cancelled first.
async fn pause(cancel: &CancellationToken, period: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(period) => true,
    }
}

impl GlobalDiscovery {
    pub fn new(
        overlay: Arc<dyn Overlay>,
        registry: Arc<DeviceRegistry>,
        config: GlobalDiscoveryConfig,
    ) -> Self {
        Self {
            overlay,
            registry,
            config,
        }
    }

    /// Apply one overlay link event to the registry.
    pub fn apply_event(registry: &DeviceRegistry, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected(peer) => {
                if registry.upsert(Device::global(peer.clone())) {
                    info!("global: peer {peer} connected");
                }
            }
            ConnectionEvent::Disconnected(peer) => {
                if registry.remove(&peer, Origin::Global) {
                    info!("global: peer {peer} disconnected");
                }
            }
        }
    }

    fn reachable(&self, peer: &str) -> bool {
        matches!(
            self.registry.get(peer).map(|d| d.origin),
            Some(Origin::Local | Origin::Global)
        )
    }

    /// Resolve the topic once and dial every candidate that is not yet
    /// reachable. Returns how many peers were newly connected.
    pub async fn resolve_once(&self) -> Result<usize> {
        let candidates = self.overlay.find_peers(&self.config.topic).await?;
        let own_id = self.overlay.local_peer_id().to_string();
        let mut connected = 0;

        for peer in candidates {
            if peer == own_id || self.reachable(&peer) {
                continue;
            }
            match self.overlay.connect(&peer).await {
                Ok(()) => {
                    if self.registry.upsert(Device::global(peer.clone())) {
                        info!("global: discovered peer {peer}");
                    }
                    connected += 1;
                }
                Err(e) => debug!("global: dial {peer} failed: {e:#}"),
            }
        }
        Ok(connected)
    }

    async fn track_connections(
        registry: Arc<DeviceRegistry>,
        mut events: broadcast::Receiver<ConnectionEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => Self::apply_event(&registry, event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("global: missed {n} connection events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn advertise_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let wait = match self.overlay.advertise(&self.config.topic).await {
                Ok(()) => {
                    debug!("global: advertised {}", self.config.topic);
                    self.config.advertise_interval
                }
                Err(e) => {
                    warn!("global: advertise failed: {e:#}");
                    self.config.backoff
                }
            };
            if !pause(&cancel, wait).await {
                break;
            }
        }
    }

    async fn resolve_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let wait = match self.resolve_once().await {
                Ok(n) => {
                    if n > 0 {
                        debug!("global: connected {n} new peers");
                    }
                    self.config.resolve_interval
                }
                Err(e) => {
                    warn!("global: resolve failed: {e:#}");
                    self.config.backoff
                }
            };
            if !pause(&cancel, wait).await {
                break;
            }
        }
    }

    /// Run until cancelled. Bootstrap failures are retried after `backoff`.
    pub async fn run(self, cancel: CancellationToken) {
        let this = Arc::new(self);
        let events = this.overlay.subscribe();

        loop {
            match this.overlay.bootstrap().await {
                Ok(()) => {
                    info!("global: overlay bootstrapped");
                    break;
                }
                Err(e) => {
                    warn!("global: bootstrap failed: {e:#}");
                    if !pause(&cancel, this.config.backoff).await {
                        return;
                    }
                }
            }
        }

        let tracker = tokio::spawn(Self::track_connections(
            this.registry.clone(),
            events,
            cancel.clone(),
        ));
        let advertiser = tokio::spawn(this.clone().advertise_loop(cancel.clone()));
        this.resolve_loop(cancel).await;

        tracker.await.ok();
        advertiser.await.ok();
        info!("global: discovery stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::StreamHandler;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeOverlay {
        id: String,
        candidates: Vec<String>,
        unreachable: HashSet<String>,
        fail_bootstraps: AtomicUsize,
        advertised: AtomicUsize,
        dialed: Mutex<Vec<String>>,
        events: broadcast::Sender<ConnectionEvent>,
    }

    impl FakeOverlay {
        fn new(candidates: &[&str]) -> Self {
            Self {
                id: "me".into(),
                candidates: candidates.iter().map(|s| s.to_string()).collect(),
                unreachable: HashSet::new(),
                fail_bootstraps: AtomicUsize::new(0),
                advertised: AtomicUsize::new(0),
                dialed: Mutex::new(Vec::new()),
                events: broadcast::channel(16).0,
            }
        }
    }

    #[async_trait::async_trait]
    impl Overlay for FakeOverlay {
        fn local_peer_id(&self) -> &str {
            &self.id
        }

        async fn bootstrap(&self) -> Result<()> {
            let left = self.fail_bootstraps.load(Ordering::SeqCst);
            if left > 0 {
                self.fail_bootstraps.store(left - 1, Ordering::SeqCst);
                anyhow::bail!("no bootstrap peers");
            }
            Ok(())
        }

        async fn advertise(&self, _topic: &str) -> Result<()> {
            self.advertised.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn find_peers(&self, _topic: &str) -> Result<Vec<String>> {
            Ok(self.candidates.clone())
        }

        async fn connect(&self, peer_id: &str) -> Result<()> {
            self.dialed.lock().push(peer_id.to_string());
            if self.unreachable.contains(peer_id) {
                anyhow::bail!("unreachable");
            }
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
            self.events.subscribe()
        }

        async fn request(&self, _: &str, _: &str, _: &[u8]) -> Result<Vec<u8>> {
            anyhow::bail!("not supported")
        }

        fn handle(&self, _: &str, _: StreamHandler) {}
    }

    #[tokio::test]
    async fn resolve_skips_self_known_and_failed_peers() {
        let mut fake = FakeOverlay::new(&["me", "p1", "p2", "p3", "p4"]);
        fake.unreachable.insert("p3".into());
        let overlay = Arc::new(fake);

        let registry = Arc::new(DeviceRegistry::new("me"));
        registry.upsert(Device::local("p2", "10.0.0.2:8080"));
        registry.upsert(Device::relay_registered("p4"));

        let discovery = GlobalDiscovery::new(
            overlay.clone(),
            registry.clone(),
            GlobalDiscoveryConfig::default(),
        );
        assert_eq!(discovery.resolve_once().await.unwrap(), 2);

        assert_eq!(
            *overlay.dialed.lock(),
            vec!["p1".to_string(), "p3".to_string(), "p4".to_string()]
        );
        assert_eq!(registry.get("p1").unwrap().origin, Origin::Global);
        assert_eq!(registry.get("p2").unwrap().origin, Origin::Local);
        assert!(!registry.contains("p3"));
        assert_eq!(registry.get("p4").unwrap().origin, Origin::Global);
    }

    #[test]
    fn connection_events_drive_registry() {
        let registry = DeviceRegistry::new("me");
        GlobalDiscovery::apply_event(&registry, ConnectionEvent::Connected("p1".into()));
        assert!(registry.contains("p1"));
        GlobalDiscovery::apply_event(&registry, ConnectionEvent::Disconnected("p1".into()));
        assert!(!registry.contains("p1"));
    }

    #[tokio::test]
    async fn run_retries_bootstrap_then_serves_events() {
        let fake = FakeOverlay::new(&[]);
        fake.fail_bootstraps.store(2, Ordering::SeqCst);
        let overlay = Arc::new(fake);
        let registry = Arc::new(DeviceRegistry::new("me"));
        let config = GlobalDiscoveryConfig {
            backoff: Duration::from_millis(10),
            advertise_interval: Duration::from_millis(20),
            resolve_interval: Duration::from_millis(20),
            ..Default::default()
        };

        let cancel = CancellationToken::new();
        let discovery = GlobalDiscovery::new(overlay.clone(), registry.clone(), config);
        let task = tokio::spawn(discovery.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        overlay
            .events
            .send(ConnectionEvent::Connected("p9".into()))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(registry.contains("p9"));
        assert!(overlay.advertised.load(Ordering::SeqCst) >= 1);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
