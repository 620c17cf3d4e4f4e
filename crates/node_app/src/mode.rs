//! One-time relay election at startup.
//!
//! Probe the local broadcast domain for an advertised relay. If one answers
//! within the window the node becomes its client; otherwise it announces
//! itself as the relay. The decision is never revisited.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use mdns_sd::ServiceDaemon;
use node_mesh::discovery::{self, Advertisement};
use node_mesh::RelayEndpoint;
use parking_lot::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Another device is the relay; connect to it.
    Client(RelayEndpoint),
    /// No relay answered; this device runs the hub.
    Relay,
}

/// The broadcast domain the election runs on.
#[async_trait]
pub trait RelayLocator: Send + Sync {
    /// First relay (other than `own_id`) seen within `window`.
    async fn find_relay(&self, own_id: &str, window: Duration) -> Result<Option<RelayEndpoint>>;

    /// Publish `ad` until [`RelayLocator::withdraw`].
    fn announce(&self, ad: &Advertisement) -> Result<()>;

    /// Remove everything this locator announced.
    fn withdraw(&self);
}

/// [`RelayLocator`] over mDNS.
pub struct MdnsLocator {
    daemon: ServiceDaemon,
    announced: Mutex<Vec<String>>,
}

impl MdnsLocator {
    pub fn new(daemon: ServiceDaemon) -> Self {
        Self {
            daemon,
            announced: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl RelayLocator for MdnsLocator {
    async fn find_relay(&self, own_id: &str, window: Duration) -> Result<Option<RelayEndpoint>> {
        discovery::find_relay(&self.daemon, own_id, window).await
    }

    fn announce(&self, ad: &Advertisement) -> Result<()> {
        let fullname = discovery::register_service(&self.daemon, ad)?;
        self.announced.lock().push(fullname);
        Ok(())
    }

    fn withdraw(&self) {
        for fullname in self.announced.lock().drain(..) {
            discovery::unregister_service(&self.daemon, &fullname);
        }
    }
}

/// Probe for `window`; become a client of the first relay found, or announce
/// `relay_ad` and become the relay. A failing probe counts as no relay found.
pub async fn select_mode(
    locator: &dyn RelayLocator,
    relay_ad: &Advertisement,
    window: Duration,
) -> Mode {
    info!("probing for a relay for {window:?}");
    match locator.find_relay(&relay_ad.device_id, window).await {
        Ok(Some(relay)) => {
            info!(
                "found relay {} at {}:{}",
                relay.device_id, relay.host, relay.port
            );
            return Mode::Client(relay);
        }
        Ok(None) => info!("no relay found, becoming the relay"),
        Err(e) => warn!("relay probe failed, becoming the relay: {e:#}"),
    }

    if let Err(e) = locator.announce(relay_ad) {
        warn!("could not announce relay: {e:#}");
    }
    Mode::Relay
}
