//! Rendezvous overlay abstraction.
//!
//! The overlay is the global peer-resolution primitive: peers advertise a
//! topic, resolve the topic into candidate peer ids, open direct links, and
//! exchange one-shot protocol streams. Discovery and sync drive it only
//! through this trait.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast;

/// Live link changes observed on the overlay transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected(String),
    Disconnected(String),
}

/// Serves one protocol: receives the requesting peer id and the request
/// payload, returns the single response frame. `None` closes the stream
/// without a response. Handlers run on the blocking pool and may do
/// synchronous I/O.
pub type StreamHandler = Arc<dyn Fn(&str, Vec<u8>) -> Option<Vec<u8>> + Send + Sync>;

#[async_trait::async_trait]
pub trait Overlay: Send + Sync {
    /// This node's id on the overlay.
    fn local_peer_id(&self) -> &str;

    /// Join the overlay. Safe to call again after a failure.
    async fn bootstrap(&self) -> Result<()>;

    /// Publish this node under `topic`. Records expire, so callers re-publish.
    async fn advertise(&self, topic: &str) -> Result<()>;

    /// Resolve `topic` into candidate peer ids, self excluded.
    async fn find_peers(&self, topic: &str) -> Result<Vec<String>>;

    /// Open a direct link to a previously resolved peer.
    async fn connect(&self, peer_id: &str) -> Result<()>;

    /// Stream of link up/down events.
    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Open a stream for `protocol`, send `payload`, and read one response frame.
    async fn request(&self, peer_id: &str, protocol: &str, payload: &[u8]) -> Result<Vec<u8>>;

    /// Install the responder for `protocol`, replacing any previous one.
    fn handle(&self, protocol: &str, handler: StreamHandler);
}
