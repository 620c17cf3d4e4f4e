//! Device and session records exchanged between nodes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The discovery mechanism a device entry was learned through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// mDNS advertisement on the local broadcast domain.
    Local,
    /// Rendezvous overlay resolution or a live overlay connection.
    Global,
    /// Explicit registration through the relay or the `/register` endpoint.
    RelayRegistered,
}

impl Origin {
    /// Lower ranks are more direct channels for reaching the peer.
    pub fn rank(self) -> u8 {
        match self {
            Self::Local => 0,
            Self::Global => 1,
            Self::RelayRegistered => 2,
        }
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Global => write!(f, "global"),
            Self::RelayRegistered => write!(f, "relay_registered"),
        }
    }
}

/// A known peer. Identity is `device_id`; `address` (`host:port`) is only
/// present for peers learned on the local broadcast domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub origin: Origin,
}

impl Device {
    pub fn new(device_id: impl Into<String>, address: Option<String>, origin: Origin) -> Self {
        Self {
            device_id: device_id.into(),
            address,
            origin,
        }
    }

    pub fn local(device_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self::new(device_id, Some(address.into()), Origin::Local)
    }

    pub fn global(device_id: impl Into<String>) -> Self {
        Self::new(device_id, None, Origin::Global)
    }

    pub fn relay_registered(device_id: impl Into<String>) -> Self {
        Self::new(device_id, None, Origin::RelayRegistered)
    }
}

/// A host-owned shared room. Created by the session store, never mutated by
/// the synchronizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub name: String,
    pub host_id: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_uses_camel_case_fields() {
        let session = Session {
            id: "s-1".into(),
            name: "standup".into(),
            host_id: "dev-a".into(),
            created_at: DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["hostId"], "dev-a");
        assert_eq!(json["createdAt"], "2024-05-01T10:00:00Z");
        assert!(json.get("host_id").is_none());
    }

    #[test]
    fn device_without_address_omits_field() {
        let json = serde_json::to_value(Device::global("peer-x")).unwrap();
        assert_eq!(json["deviceId"], "peer-x");
        assert_eq!(json["origin"], "global");
        assert!(json.get("address").is_none());
    }

    #[test]
    fn origin_rank_prefers_direct_channels() {
        assert!(Origin::Local.rank() < Origin::Global.rank());
        assert!(Origin::Global.rank() < Origin::RelayRegistered.rank());
        assert_eq!(Origin::RelayRegistered.to_string(), "relay_registered");
    }
}
