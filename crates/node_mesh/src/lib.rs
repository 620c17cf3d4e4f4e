//! Peer discovery and session synchronization.
//!
//! - LAN discovery over mDNS
//! - global discovery over a rendezvous overlay
//! - a unified device registry fed by both
//! - best-effort session list merging across peers

pub mod discovery;
pub mod global;
pub mod overlay;
pub mod registry;
pub mod rendezvous_overlay;
pub mod sync;

pub use discovery::{LocalDiscovery, LocalDiscoveryConfig, RelayEndpoint};
pub use global::{GlobalDiscovery, GlobalDiscoveryConfig};
pub use overlay::{ConnectionEvent, Overlay, StreamHandler};
pub use registry::DeviceRegistry;
pub use rendezvous_overlay::RendezvousOverlay;
pub use sync::{FetchError, SessionSynchronizer};
