//! Session synchronizer: merges this node's sessions with every known peer's.
//!
//! Each peer is asked for its own list over its reachable channel, bounded by
//! a per-peer timeout. A failing peer only loses its own contribution.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use node_proto::{Device, Origin, Session, SESSION_SYNC_PROTOCOL};
use thiserror::Error;
use tracing::{debug, warn};

use crate::overlay::{Overlay, StreamHandler};
use crate::registry::DeviceRegistry;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("peer answered with status {0}")]
    Status(u16),
    #[error("undecodable session list: {0}")]
    Decode(String),
    #[error("no reachable channel")]
    NoRoute,
    #[error("overlay stream failed: {0}")]
    Overlay(String),
}

pub struct SessionSynchronizer {
    registry: Arc<DeviceRegistry>,
    http: reqwest::Client,
    overlay: Option<Arc<dyn Overlay>>,
    timeout: Duration,
}

impl SessionSynchronizer {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        overlay: Option<Arc<dyn Overlay>>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            http: reqwest::Client::new(),
            overlay,
            timeout,
        }
    }

    /// `local` followed by every peer's list in registry order. Peers that
    /// fail are skipped; the call itself never fails. No cross-peer dedup.
    pub async fn get_all_sessions(&self, local: Vec<Session>) -> Vec<Session> {
        let peers = self.registry.snapshot();
        let fetches = peers.iter().map(|device| self.fetch_from(device));
        let results = join_all(fetches).await;

        let mut all = local;
        for (device, result) in peers.iter().zip(results) {
            match result {
                Ok(sessions) => {
                    debug!(
                        "sync: {} sessions from {}",
                        sessions.len(),
                        device.device_id
                    );
                    all.extend(sessions);
                }
                Err(FetchError::NoRoute) => {
                    debug!("sync: skipping {} (no channel)", device.device_id);
                }
                Err(e) => warn!("sync: skipping {}: {e}", device.device_id),
            }
        }
        all
    }

    /// Fetch one peer's own session list within the per-peer timeout.
    pub async fn fetch_from(&self, device: &Device) -> Result<Vec<Session>, FetchError> {
        tokio::time::timeout(self.timeout, self.fetch_unbounded(device))
            .await
            .map_err(|_| FetchError::Timeout(self.timeout))?
    }

    async fn fetch_unbounded(&self, device: &Device) -> Result<Vec<Session>, FetchError> {
        match (device.origin, &device.address) {
            (Origin::Local, Some(address)) => self.fetch_http(address).await,
            (Origin::Global, _) => self.fetch_overlay(&device.device_id).await,
            _ => Err(FetchError::NoRoute),
        }
    }

    async fn fetch_http(&self, address: &str) -> Result<Vec<Session>, FetchError> {
        let resp = self
            .http
            .get(format!("http://{address}/session/list"))
            .query(&[("scope", "local")])
            .send()
            .await
            .map_err(|e| FetchError::Connect(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(FetchError::Status(resp.status().as_u16()));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| FetchError::Connect(e.to_string()))?;
        serde_json::from_slice(&body).map_err(|e| FetchError::Decode(e.to_string()))
    }

    async fn fetch_overlay(&self, peer_id: &str) -> Result<Vec<Session>, FetchError> {
        let overlay = self.overlay.as_ref().ok_or(FetchError::NoRoute)?;
        let body = overlay
            .request(peer_id, SESSION_SYNC_PROTOCOL, &[])
            .await
            .map_err(|e| FetchError::Overlay(format!("{e:#}")))?;
        serde_json::from_slice(&body).map_err(|e| FetchError::Decode(e.to_string()))
    }
}

/// Serve this node's own sessions on the session-sync protocol: one JSON
/// frame per request, then the stream closes.
pub fn serve_session_list<F>(overlay: &dyn Overlay, sessions: F)
where
    F: Fn() -> Result<Vec<Session>> + Send + Sync + 'static,
{
    let handler: StreamHandler = Arc::new(move |peer: &str, _request: Vec<u8>| {
        match sessions().and_then(|list| serde_json::to_vec(&list).map_err(Into::into)) {
            Ok(body) => Some(body),
            Err(e) => {
                warn!("sync: cannot serve session list to {peer}: {e:#}");
                None
            }
        }
    });
    overlay.handle(SESSION_SYNC_PROTOCOL, handler);
}
