//! Rendezvous directory served by the relay: peers publish themselves under a
//! topic and resolve the other live providers of that topic.
//!
//! Registrations expire after [`REGISTRATION_TTL`] unless re-advertised.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use node_proto::rendezvous::{AdvertiseRequest, AdvertiseResponse, ProviderRecord};
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const REGISTRATION_TTL: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
struct Registration {
    addr: String,
    last_seen: Instant,
}

pub struct RendezvousDirectory {
    topics: BTreeMap<String, BTreeMap<String, Registration>>,
    ttl: Duration,
}

impl Default for RendezvousDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl RendezvousDirectory {
    pub fn new() -> Self {
        Self::with_ttl(REGISTRATION_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            topics: BTreeMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Publish or refresh a provider. Rejects records missing any field.
    pub fn advertise(&mut self, req: &AdvertiseRequest) -> Result<AdvertiseResponse, &'static str> {
        if req.topic.is_empty() {
            return Err("topic required");
        }
        if req.peer_id.is_empty() {
            return Err("peer_id required");
        }
        if req.addr.is_empty() {
            return Err("addr required");
        }

        let previous = self.topics.entry(req.topic.clone()).or_default().insert(
            req.peer_id.clone(),
            Registration {
                addr: req.addr.clone(),
                last_seen: Instant::now(),
            },
        );
        if previous.is_none() {
            info!("rendezvous: {} provides {} at {}", req.peer_id, req.topic, req.addr);
        }

        Ok(AdvertiseResponse {
            ttl_secs: self.ttl.as_secs(),
        })
    }

    /// Live providers of `topic`, ordered by peer id.
    pub fn resolve(&self, topic: &str) -> Vec<ProviderRecord> {
        self.topics
            .get(topic)
            .map(|providers| {
                providers
                    .iter()
                    .filter(|(_, r)| r.last_seen.elapsed() <= self.ttl)
                    .map(|(peer_id, r)| ProviderRecord {
                        peer_id: peer_id.clone(),
                        addr: r.addr.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn remove_expired(&mut self) -> usize {
        let ttl = self.ttl;
        let mut removed = 0;
        for providers in self.topics.values_mut() {
            let before = providers.len();
            providers.retain(|_, r| r.last_seen.elapsed() <= ttl);
            removed += before - providers.len();
        }
        self.topics.retain(|_, providers| !providers.is_empty());
        removed
    }

    pub fn provider_count(&self) -> usize {
        self.topics.values().map(BTreeMap::len).sum()
    }
}

pub type SharedDirectory = Arc<RwLock<RendezvousDirectory>>;

/// Periodically drop expired registrations until `cancel` fires.
pub fn spawn_expiry(
    directory: SharedDirectory,
    every: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let removed = directory.write().await.remove_expired();
            if removed > 0 {
                debug!("rendezvous: removed {removed} expired registrations");
            }
        }
    })
}

#[derive(Debug, Deserialize)]
struct ResolveQuery {
    topic: String,
}

/// `GET /rendezvous/ping`, `POST /rendezvous/advertise`,
/// `GET /rendezvous/resolve?topic=`.
pub fn router(directory: SharedDirectory) -> Router {
    Router::new()
        .route("/rendezvous/ping", get(ping))
        .route("/rendezvous/advertise", post(advertise))
        .route("/rendezvous/resolve", get(resolve))
        .with_state(directory)
}

async fn ping() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn advertise(
    State(directory): State<SharedDirectory>,
    Json(req): Json<AdvertiseRequest>,
) -> Response {
    match directory.write().await.advertise(&req) {
        Ok(resp) => Json(resp).into_response(),
        Err(reason) => (StatusCode::BAD_REQUEST, reason).into_response(),
    }
}

async fn resolve(
    State(directory): State<SharedDirectory>,
    Query(query): Query<ResolveQuery>,
) -> Json<Vec<ProviderRecord>> {
    Json(directory.read().await.resolve(&query.topic))
}
