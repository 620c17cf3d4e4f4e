//! Shared data model, protocol constants, and wire framing for 0Xnet nodes.

pub mod frame;
pub mod model;
pub mod rendezvous;

pub use model::{Device, Origin, Session};

/// mDNS service type used for local advertisement and relay probing.
pub const SERVICE_TYPE: &str = "_0xnet._tcp.local.";

/// Prefix of the mDNS instance name; the device id follows it.
pub const INSTANCE_PREFIX: &str = "0Xnet-";

/// TXT attribute carrying the advertising device id.
pub const TXT_DEVICE_ID: &str = "deviceId";

/// TXT attribute carrying the advertised role (`relay` or `peer`).
pub const TXT_ROLE: &str = "role";

/// TXT attribute carrying the HTTP API port of the advertiser.
pub const TXT_API_PORT: &str = "apiPort";

/// Topic every node advertises on the rendezvous overlay.
pub const GLOBAL_TOPIC: &str = "0xnet-global-v1";

/// Overlay stream protocol serving a node's own session list.
pub const SESSION_SYNC_PROTOCOL: &str = "/0xnet/session-sync/1.0.0";
