//! Connection table of the relay: one live channel per device id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Identifies one accepted connection so a stale read loop cannot remove the
/// channel of a newer connection for the same device.
pub type ConnId = u64;

struct RelayConnection {
    id: ConnId,
    tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
}

#[derive(Default)]
pub struct RelayHub {
    conns: RwLock<HashMap<String, RelayConnection>>,
    next_id: AtomicU64,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `tx` as the channel for `device_id`, replacing any prior one.
    /// The replaced connection's token is cancelled and its sender dropped.
    pub fn register(
        &self,
        device_id: &str,
        tx: mpsc::Sender<Vec<u8>>,
        cancel: CancellationToken,
    ) -> ConnId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let replaced = self
            .conns
            .write()
            .insert(device_id.to_string(), RelayConnection { id, tx, cancel });

        match replaced {
            Some(old) => {
                old.cancel.cancel();
                info!("relay: {device_id} re-registered, dropped previous channel");
            }
            None => info!("relay: {device_id} joined"),
        }
        id
    }

    /// Remove `device_id` only if its current channel is still `conn`.
    pub fn remove(&self, device_id: &str, conn: ConnId) -> bool {
        let mut conns = self.conns.write();
        if conns.get(device_id).map(|c| c.id) != Some(conn) {
            return false;
        }
        conns.remove(device_id);
        info!("relay: {device_id} left");
        true
    }

    /// Queue `payload` for every registered device except `from`. A full or
    /// closed channel skips that device for this frame only; the device stays
    /// registered until its own read loop ends. Returns the number queued.
    pub fn broadcast(&self, from: &str, payload: &[u8]) -> usize {
        let conns = self.conns.read();
        let mut delivered = 0;
        for (device_id, conn) in conns.iter() {
            if device_id == from {
                continue;
            }
            match conn.tx.try_send(payload.to_vec()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!("relay: frame from {from} not queued for {device_id}: {e}"),
            }
        }
        delivered
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.conns.read().contains_key(device_id)
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.conns.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.conns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.read().is_empty()
    }
}
