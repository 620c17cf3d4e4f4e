//! Overlay over an HTTP rendezvous directory and direct TCP links.
//!
//! Topics are published to and resolved from the directory at
//! `rendezvous_url`. Peers then talk directly over TCP using
//! [4-byte LE length][payload] frames. The first frame of every connection is
//! a JSON `OverlayFrame`:
//! - `hello`: open a persistent link; answered by `welcome`. Link loss emits
//!   `Disconnected`.
//! - `open`: one-shot stream; one request frame in, one response frame out,
//!   then the connection closes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use node_proto::frame::{read_frame, read_json, write_frame, write_json};
use node_proto::rendezvous::{AdvertiseRequest, ProviderRecord};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::overlay::{ConnectionEvent, Overlay, StreamHandler};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OverlayFrame {
    Hello { peer_id: String },
    Welcome { peer_id: String },
    Open { peer_id: String, protocol: String },
}

struct Link {
    id: u64,
    cancel: CancellationToken,
}

/// State shared with the accept loop and the per-link tasks.
struct Shared {
    peer_id: String,
    events: broadcast::Sender<ConnectionEvent>,
    links: Mutex<HashMap<String, Link>>,
    handlers: RwLock<HashMap<String, StreamHandler>>,
    next_link: AtomicU64,
    cancel: CancellationToken,
}

impl Shared {
    /// Track `stream` as the live link to `remote`. When both sides dial at
    /// once, each keeps the link dialled by the lower peer id so the two
    /// ends agree on which connection survives.
    fn attach(self: &Arc<Self>, remote: String, mut stream: TcpStream, dialed_here: bool) {
        let preferred = if dialed_here {
            self.peer_id < remote
        } else {
            remote < self.peer_id
        };

        let id = self.next_link.fetch_add(1, Ordering::Relaxed);
        let cancel = self.cancel.child_token();

        let replaced = {
            let mut links = self.links.lock();
            if links.contains_key(&remote) && !preferred {
                debug!("overlay: keeping existing link to {remote}");
                return;
            }
            links.insert(
                remote.clone(),
                Link {
                    id,
                    cancel: cancel.clone(),
                },
            )
        };
        match replaced {
            Some(old) => old.cancel.cancel(),
            None => {
                info!("overlay: connected to {remote}");
                let _ = self.events.send(ConnectionEvent::Connected(remote.clone()));
            }
        }

        let shared = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = async {
                    // Links carry no traffic after the handshake; any read result ends them.
                    while read_frame(&mut stream).await.is_ok() {}
                } => {}
            }
            stream.shutdown().await.ok();
            shared.detach(&remote, id);
        });
    }

    fn detach(&self, remote: &str, id: u64) {
        let mut links = self.links.lock();
        if links.get(remote).map(|l| l.id) == Some(id) {
            links.remove(remote);
            drop(links);
            info!("overlay: disconnected from {remote}");
            let _ = self
                .events
                .send(ConnectionEvent::Disconnected(remote.to_string()));
        }
    }

    async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, remote_addr)) => {
                    let shared = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = shared.handle_inbound(stream).await {
                            debug!("overlay: inbound from {remote_addr} failed: {e:#}");
                        }
                    });
                }
                Err(e) => {
                    warn!("overlay: accept failed: {e}");
                }
            }
        }
        debug!("overlay: listener stopped");
    }

    async fn handle_inbound(self: Arc<Self>, mut stream: TcpStream) -> Result<()> {
        let frame: OverlayFrame = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_json(&mut stream))
            .await
            .context("handshake timed out")??;

        match frame {
            OverlayFrame::Hello { peer_id } => {
                anyhow::ensure!(!peer_id.is_empty(), "empty peer id in hello");
                write_json(
                    &mut stream,
                    &OverlayFrame::Welcome {
                        peer_id: self.peer_id.clone(),
                    },
                )
                .await?;
                self.attach(peer_id, stream, false);
            }
            OverlayFrame::Open { peer_id, protocol } => {
                let request = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut stream))
                    .await
                    .context("stream request timed out")??;
                let handler = self.handlers.read().get(&protocol).cloned();
                match handler {
                    Some(handler) => {
                        let response =
                            tokio::task::spawn_blocking(move || handler(&peer_id, request))
                                .await
                                .context("stream handler panicked")?;
                        if let Some(response) = response {
                            write_frame(&mut stream, &response).await?;
                        }
                    }
                    None => debug!("overlay: no handler for {protocol} (from {peer_id})"),
                }
                stream.shutdown().await.ok();
            }
            OverlayFrame::Welcome { .. } => anyhow::bail!("unexpected welcome frame"),
        }
        Ok(())
    }
}

/// [`Overlay`] backed by an HTTP rendezvous directory.
pub struct RendezvousOverlay {
    shared: Arc<Shared>,
    rendezvous_url: String,
    advertised_addr: String,
    http: reqwest::Client,
    routes: RwLock<HashMap<String, String>>,
}

impl RendezvousOverlay {
    /// Bind the link listener on `listen` and start accepting. The node is
    /// published as `<advertise_host>:<bound port>`.
    pub async fn bind(
        peer_id: &str,
        rendezvous_url: &str,
        listen: SocketAddr,
        advertise_host: &str,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("bind overlay listener {listen}"))?;
        let port = listener.local_addr()?.port();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let shared = Arc::new(Shared {
            peer_id: peer_id.to_string(),
            events,
            links: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            next_link: AtomicU64::new(0),
            cancel: cancel.child_token(),
        });
        tokio::spawn(shared.clone().serve(listener));

        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("build rendezvous http client")?;

        let advertised_addr = format!("{advertise_host}:{port}");
        debug!("overlay: listening on {listen} as {advertised_addr}");

        Ok(Self {
            shared,
            rendezvous_url: rendezvous_url.trim_end_matches('/').to_string(),
            advertised_addr,
            http,
            routes: RwLock::new(HashMap::new()),
        })
    }

    pub fn advertised_addr(&self) -> &str {
        &self.advertised_addr
    }

    /// Seed a route without resolving it through the directory.
    pub fn add_route(&self, peer_id: &str, addr: &str) {
        self.routes
            .write()
            .insert(peer_id.to_string(), addr.to_string());
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.shared.links.lock().contains_key(peer_id)
    }

    fn route(&self, peer_id: &str) -> Result<String> {
        self.routes
            .read()
            .get(peer_id)
            .cloned()
            .ok_or_else(|| anyhow!("no route to peer {peer_id}"))
    }

    async fn dial(&self, peer_id: &str) -> Result<TcpStream> {
        let addr = self.route(peer_id)?;
        tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .with_context(|| format!("connect to {peer_id} at {addr} timed out"))?
            .with_context(|| format!("connect to {peer_id} at {addr}"))
    }
}

impl Drop for RendezvousOverlay {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

#[async_trait::async_trait]
impl Overlay for RendezvousOverlay {
    fn local_peer_id(&self) -> &str {
        &self.shared.peer_id
    }

    async fn bootstrap(&self) -> Result<()> {
        self.http
            .get(format!("{}/rendezvous/ping", self.rendezvous_url))
            .send()
            .await
            .with_context(|| format!("reach rendezvous {}", self.rendezvous_url))?
            .error_for_status()
            .context("rendezvous ping")?;
        Ok(())
    }

    async fn advertise(&self, topic: &str) -> Result<()> {
        let req = AdvertiseRequest {
            topic: topic.to_string(),
            peer_id: self.shared.peer_id.clone(),
            addr: self.advertised_addr.clone(),
        };
        self.http
            .post(format!("{}/rendezvous/advertise", self.rendezvous_url))
            .json(&req)
            .send()
            .await
            .context("send advertise")?
            .error_for_status()
            .context("advertise rejected")?;
        Ok(())
    }

    async fn find_peers(&self, topic: &str) -> Result<Vec<String>> {
        let records: Vec<ProviderRecord> = self
            .http
            .get(format!("{}/rendezvous/resolve", self.rendezvous_url))
            .query(&[("topic", topic)])
            .send()
            .await
            .context("send resolve")?
            .error_for_status()
            .context("resolve rejected")?
            .json()
            .await
            .context("decode resolve response")?;

        let mut routes = self.routes.write();
        let mut peers = Vec::with_capacity(records.len());
        for record in records {
            if record.peer_id.is_empty() || record.peer_id == self.shared.peer_id {
                continue;
            }
            routes.insert(record.peer_id.clone(), record.addr);
            peers.push(record.peer_id);
        }
        Ok(peers)
    }

    async fn connect(&self, peer_id: &str) -> Result<()> {
        if self.is_connected(peer_id) {
            return Ok(());
        }

        let mut stream = self.dial(peer_id).await?;
        write_json(
            &mut stream,
            &OverlayFrame::Hello {
                peer_id: self.shared.peer_id.clone(),
            },
        )
        .await?;
        let reply: OverlayFrame = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_json(&mut stream))
            .await
            .context("welcome timed out")??;

        match reply {
            OverlayFrame::Welcome { peer_id: remote } if remote == peer_id => {
                self.shared.attach(remote, stream, true);
                Ok(())
            }
            OverlayFrame::Welcome { peer_id: remote } => {
                Err(anyhow!("expected {peer_id}, reached {remote}"))
            }
            _ => Err(anyhow!("unexpected handshake reply from {peer_id}")),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    async fn request(&self, peer_id: &str, protocol: &str, payload: &[u8]) -> Result<Vec<u8>> {
        let mut stream = self.dial(peer_id).await?;
        write_json(
            &mut stream,
            &OverlayFrame::Open {
                peer_id: self.shared.peer_id.clone(),
                protocol: protocol.to_string(),
            },
        )
        .await?;
        write_frame(&mut stream, payload).await?;
        let response = read_frame(&mut stream)
            .await
            .with_context(|| format!("read {protocol} response from {peer_id}"))?;
        stream.shutdown().await.ok();
        Ok(response)
    }

    fn handle(&self, protocol: &str, handler: StreamHandler) {
        self.shared
            .handlers
            .write()
            .insert(protocol.to_string(), handler);
    }
}
