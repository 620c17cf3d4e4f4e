//! Relay transport listener.
//!
//! Every accepted connection must first send its device id as one raw UTF-8
//! frame. After that, each frame it sends is forwarded verbatim to all other
//! registered devices. Connections that fail the identification step are
//! dropped without being registered.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use node_mesh::DeviceRegistry;
use node_proto::frame::{read_frame, write_frame};
use node_proto::Device;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hub::RelayHub;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound frames buffered per connection before broadcasts start skipping it.
pub const SEND_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("no identification frame within {0:?}")]
    Timeout(Duration),
    #[error("identification frame unreadable: {0}")]
    Read(String),
    #[error("empty device id")]
    Empty,
    #[error("device id is not valid UTF-8")]
    NotUtf8,
}

/// Read the identification frame that opens every relay connection.
pub async fn read_handshake<R>(reader: &mut R, timeout: Duration) -> Result<String, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let frame = tokio::time::timeout(timeout, read_frame(reader))
        .await
        .map_err(|_| HandshakeError::Timeout(timeout))?
        .map_err(|e| HandshakeError::Read(format!("{e:#}")))?;
    let device_id = String::from_utf8(frame).map_err(|_| HandshakeError::NotUtf8)?;
    if device_id.is_empty() {
        return Err(HandshakeError::Empty);
    }
    Ok(device_id)
}

/// Accepts relay connections and feeds them into a [`RelayHub`]. Joining
/// devices are also recorded in the registry as relay-registered.
#[derive(Clone)]
pub struct RelayServer {
    hub: Arc<RelayHub>,
    registry: Arc<DeviceRegistry>,
    handshake_timeout: Duration,
}

impl RelayServer {
    pub fn new(hub: Arc<RelayHub>, registry: Arc<DeviceRegistry>) -> Self {
        Self {
            hub,
            registry,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn hub(&self) -> &Arc<RelayHub> {
        &self.hub
    }

    /// Accept connections on `listener` until `cancel` fires.
    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        info!("relay listening on {}", listener.local_addr()?);
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer_addr)) => {
                    let server = self.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        server.handle_connection(stream, peer_addr, cancel).await;
                    });
                }
                Err(e) => warn!("relay: accept failed: {e}"),
            }
        }
        info!("relay listener stopped");
        Ok(())
    }

    async fn handle_connection(
        self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        shutdown: CancellationToken,
    ) {
        let (mut reader, mut writer) = stream.into_split();

        let device_id = match read_handshake(&mut reader, self.handshake_timeout).await {
            Ok(id) => id,
            Err(e) => {
                debug!("relay: dropping {peer_addr}: {e}");
                return;
            }
        };

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(SEND_QUEUE_DEPTH);
        let cancel = shutdown.child_token();
        let conn = self.hub.register(&device_id, tx, cancel.clone());
        self.registry.upsert(Device::relay_registered(device_id.clone()));
        debug!("relay: {device_id} identified from {peer_addr}");

        let writer_id = device_id.clone();
        let write_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    debug!("relay: write to {writer_id} failed: {e:#}");
                    break;
                }
            }
            writer.shutdown().await.ok();
        });

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = read_frame(&mut reader) => frame,
            };
            match frame {
                Ok(payload) => {
                    let queued = self.hub.broadcast(&device_id, &payload);
                    debug!(
                        "relay: {} bytes from {device_id} queued for {queued} peers",
                        payload.len()
                    );
                }
                Err(e) => {
                    debug!("relay: read from {device_id} ended: {e:#}");
                    break;
                }
            }
        }

        self.hub.remove(&device_id, conn);
        // The writer may be parked on a stalled socket.
        write_task.abort();
    }
}
