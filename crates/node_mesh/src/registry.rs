//! Device registry: one entry per device id, fed by every discovery mechanism.
//!
//! Local mDNS, the global overlay and relay registration all report
//! `(id, optional address, origin)` observations into [`DeviceRegistry::upsert`].
//! Entries remember which origins reported them, so a device seen both locally
//! and globally collapses to a single record. Snapshots list devices in the
//! order they were first observed.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use node_proto::{Device, Origin};
use parking_lot::RwLock;

#[derive(Debug, Clone)]
struct Entry {
    address: Option<String>,
    origins: BTreeSet<Origin>,
}

impl Entry {
    fn to_device(&self, device_id: &str) -> Option<Device> {
        let origin = *self.origins.iter().min_by_key(|o| o.rank())?;
        Some(Device {
            device_id: device_id.to_string(),
            address: self.address.clone(),
            origin,
        })
    }
}

pub struct DeviceRegistry {
    local_id: String,
    entries: RwLock<IndexMap<String, Entry>>,
}

impl DeviceRegistry {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            entries: RwLock::new(IndexMap::new()),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Record an observation. Returns true if the device was not known before.
    /// Observations of the local device or with an empty id are ignored.
    pub fn upsert(&self, observed: Device) -> bool {
        if observed.device_id.is_empty() || observed.device_id == self.local_id {
            return false;
        }

        let mut entries = self.entries.write();
        match entries.get_mut(&observed.device_id) {
            Some(entry) => {
                entry.origins.insert(observed.origin);
                if observed.address.is_some() {
                    entry.address = observed.address;
                }
                false
            }
            None => {
                entries.insert(
                    observed.device_id,
                    Entry {
                        address: observed.address,
                        origins: BTreeSet::from([observed.origin]),
                    },
                );
                true
            }
        }
    }

    /// Withdraw one origin's claim on a device. The entry is dropped once no
    /// origin reports it. Returns true if the origin was present.
    pub fn remove(&self, device_id: &str, origin: Origin) -> bool {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(device_id) else {
            return false;
        };
        let removed = entry.origins.remove(&origin);
        if origin == Origin::Local && removed {
            entry.address = None;
        }
        if entry.origins.is_empty() {
            entries.shift_remove(device_id);
        }
        removed
    }

    pub fn get(&self, device_id: &str) -> Option<Device> {
        self.entries
            .read()
            .get(device_id)
            .and_then(|e| e.to_device(device_id))
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.entries.read().contains_key(device_id)
    }

    /// Copy of every known device at call time.
    pub fn snapshot(&self) -> Vec<Device> {
        self.entries
            .read()
            .iter()
            .filter_map(|(id, e)| e.to_device(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn upsert_reports_new_devices() {
        let reg = DeviceRegistry::new("me");
        assert!(reg.upsert(Device::local("dev-1", "192.168.1.10:8080")));
        assert!(!reg.upsert(Device::local("dev-1", "192.168.1.10:8080")));
        assert_eq!(reg.len(), 1);

        let dev = reg.get("dev-1").unwrap();
        assert_eq!(dev.origin, Origin::Local);
        assert_eq!(dev.address.as_deref(), Some("192.168.1.10:8080"));
    }

    #[test]
    fn self_is_never_registered() {
        let reg = DeviceRegistry::new("me");
        assert!(!reg.upsert(Device::local("me", "127.0.0.1:8080")));
        assert!(!reg.upsert(Device::global("me")));
        assert!(!reg.upsert(Device::relay_registered("")));
        assert!(reg.is_empty());
    }

    #[test]
    fn origins_collapse_into_one_entry() {
        let reg = DeviceRegistry::new("me");
        reg.upsert(Device::global("dev-1"));
        reg.upsert(Device::relay_registered("dev-1"));
        reg.upsert(Device::local("dev-1", "10.0.0.5:8080"));

        let snapshot = reg.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].origin, Origin::Local);
        assert_eq!(snapshot[0].address.as_deref(), Some("10.0.0.5:8080"));
    }

    #[test]
    fn removing_one_origin_keeps_the_others() {
        let reg = DeviceRegistry::new("me");
        reg.upsert(Device::local("dev-1", "10.0.0.5:8080"));
        reg.upsert(Device::global("dev-1"));

        assert!(reg.remove("dev-1", Origin::Local));
        let dev = reg.get("dev-1").unwrap();
        assert_eq!(dev.origin, Origin::Global);
        assert!(dev.address.is_none());

        assert!(reg.remove("dev-1", Origin::Global));
        assert!(!reg.contains("dev-1"));
        assert!(!reg.remove("dev-1", Origin::Global));
    }

    #[test]
    fn global_disconnect_does_not_touch_other_devices() {
        let reg = DeviceRegistry::new("me");
        reg.upsert(Device::global("dev-1"));
        reg.upsert(Device::global("dev-2"));
        reg.remove("dev-1", Origin::Global);
        let ids: Vec<_> = reg.snapshot().into_iter().map(|d| d.device_id).collect();
        assert_eq!(ids, vec!["dev-2".to_string()]);
    }

    #[test]
    fn snapshot_keeps_first_seen_order() {
        let reg = DeviceRegistry::new("me");
        reg.upsert(Device::global("zeta"));
        reg.upsert(Device::local("alpha", "10.0.0.2:8080"));
        reg.upsert(Device::relay_registered("mid"));
        reg.upsert(Device::local("zeta", "10.0.0.9:8080"));
        reg.upsert(Device::global("beta"));
        reg.remove("mid", Origin::RelayRegistered);

        let ids: Vec<_> = reg.snapshot().into_iter().map(|d| d.device_id).collect();
        assert_eq!(ids, vec!["zeta", "alpha", "beta"]);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Upsert(u8, Origin),
        Remove(u8, Origin),
    }

    fn origin() -> impl Strategy<Value = Origin> {
        prop_oneof![
            Just(Origin::Local),
            Just(Origin::Global),
            Just(Origin::RelayRegistered),
        ]
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..6, origin()).prop_map(|(id, o)| Op::Upsert(id, o)),
            (0u8..6, origin()).prop_map(|(id, o)| Op::Remove(id, o)),
        ]
    }

    proptest! {
        #[test]
        fn snapshot_matches_net_presence(ops in proptest::collection::vec(op(), 0..64)) {
            let reg = DeviceRegistry::new("dev-0");
            let mut present: HashSet<(String, Origin)> = HashSet::new();

            for op in &ops {
                match op {
                    Op::Upsert(id, o) => {
                        let id = format!("dev-{id}");
                        let device = match o {
                            Origin::Local => Device::local(id.clone(), "10.0.0.1:8080"),
                            _ => Device::new(id.clone(), None, *o),
                        };
                        reg.upsert(device);
                        if id != "dev-0" {
                            present.insert((id, *o));
                        }
                    }
                    Op::Remove(id, o) => {
                        let id = format!("dev-{id}");
                        reg.remove(&id, *o);
                        present.remove(&(id, *o));
                    }
                }
            }

            let expected: HashSet<String> = present.into_iter().map(|(id, _)| id).collect();
            let snapshot = reg.snapshot();
            let ids: HashSet<String> = snapshot.iter().map(|d| d.device_id.clone()).collect();

            prop_assert_eq!(ids.len(), snapshot.len());
            prop_assert_eq!(ids, expected);
            prop_assert!(!reg.contains("dev-0"));
        }
    }
}
