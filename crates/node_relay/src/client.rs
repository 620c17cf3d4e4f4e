//! Relay client: the persistent connection a non-relay node keeps to the hub.
//!
//! State machine:
//! `Disconnected -> Connecting { attempt } -> Connected -> Terminated`.
//! There is no reconnect once an established connection is lost; the owner
//! decides what termination means for the process.

use std::time::Duration;

use node_proto::frame::{read_frame, write_frame};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CHANNEL_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayClientState {
    Disconnected,
    Connecting { attempt: u32 },
    Connected,
    Terminated,
}

#[derive(Debug, Error)]
pub enum RelayClientError {
    #[error("relay {addr} unreachable after {attempts} attempts")]
    Exhausted { addr: String, attempts: u32 },
    #[error("relay connection closed")]
    Closed,
    #[error("relay connect cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            attempts: 10,
            backoff: Duration::from_secs(2),
        }
    }
}

pub struct RelayClient {
    device_id: String,
    addr: String,
    config: RelayClientConfig,
    state: watch::Sender<RelayClientState>,
}

impl RelayClient {
    pub fn new(device_id: impl Into<String>, addr: impl Into<String>, config: RelayClientConfig) -> Self {
        let (state, _) = watch::channel(RelayClientState::Disconnected);
        Self {
            device_id: device_id.into(),
            addr: addr.into(),
            config,
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<RelayClientState> {
        self.state.subscribe()
    }

    pub fn current_state(&self) -> RelayClientState {
        *self.state.borrow()
    }

    /// Dial the relay with a bounded number of attempts, identify, and start
    /// the read and write tasks. Exhausting the attempts is terminal, and so
    /// is `cancel` firing while dialing or backing off.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<RelayLink, RelayClientError> {
        let attempts = self.config.attempts.max(1);
        for attempt in 1..=attempts {
            self.state.send_replace(RelayClientState::Connecting { attempt });
            let dialed = tokio::select! {
                _ = cancel.cancelled() => return Err(self.cancelled()),
                dialed = self.dial_and_identify() => dialed,
            };
            match dialed {
                Ok(stream) => {
                    info!("relay client: connected to {} as {}", self.addr, self.device_id);
                    self.state.send_replace(RelayClientState::Connected);
                    return Ok(self.start(stream));
                }
                Err(e) => {
                    warn!(
                        "relay client: attempt {attempt}/{attempts} to {} failed: {e:#}",
                        self.addr
                    );
                    if attempt < attempts {
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(self.cancelled()),
                            _ = tokio::time::sleep(self.config.backoff) => {}
                        }
                    }
                }
            }
        }
        self.state.send_replace(RelayClientState::Terminated);
        Err(RelayClientError::Exhausted {
            addr: self.addr.clone(),
            attempts,
        })
    }

    fn cancelled(&self) -> RelayClientError {
        debug!("relay client: connect to {} cancelled", self.addr);
        self.state.send_replace(RelayClientState::Terminated);
        RelayClientError::Cancelled
    }

    async fn dial_and_identify(&self) -> anyhow::Result<TcpStream> {
        let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| anyhow::anyhow!("connect timed out"))??;
        write_frame(&mut stream, self.device_id.as_bytes()).await?;
        Ok(stream)
    }

    fn start(&self, stream: TcpStream) -> RelayLink {
        let (mut reader, mut writer) = stream.into_split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_DEPTH);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_DEPTH);

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    debug!("relay client: write failed: {e:#}");
                    break;
                }
            }
            writer.shutdown().await.ok();
        });

        let state = self.state.clone();
        let addr = self.addr.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(frame) => {
                        if inbound_tx.send(frame).await.is_err() {
                            debug!("relay client: inbound receiver dropped");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("relay client: connection to {addr} lost: {e:#}");
                        break;
                    }
                }
            }
            state.send_replace(RelayClientState::Terminated);
        });

        RelayLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
            tasks: [writer_task, reader_task],
        }
    }
}

/// An established relay connection. `recv` yields frames broadcast by other
/// devices and returns `None` once the connection has terminated.
pub struct RelayLink {
    outbound: mpsc::Sender<Vec<u8>>,
    inbound: mpsc::Receiver<Vec<u8>>,
    tasks: [JoinHandle<()>; 2],
}

impl RelayLink {
    /// Queue one frame for broadcast to every other device on the hub.
    pub async fn send(&self, payload: impl Into<Vec<u8>>) -> Result<(), RelayClientError> {
        self.outbound
            .send(payload.into())
            .await
            .map_err(|_| RelayClientError::Closed)
    }

    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.recv().await
    }
}

impl Drop for RelayLink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
