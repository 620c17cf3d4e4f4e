//! Records exchanged with a rendezvous directory.

use serde::{Deserialize, Serialize};

/// Request to publish `peer_id` (reachable at `addr`) under `topic`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertiseRequest {
    pub topic: String,
    pub peer_id: String,
    pub addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertiseResponse {
    pub ttl_secs: u64,
}

/// One live provider of a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub peer_id: String,
    pub addr: String,
}
