//! Relay hub over real sockets: devices join with their id and broadcast to
//! each other through the relay.

use std::sync::Arc;
use std::time::Duration;

use node_mesh::DeviceRegistry;
use node_proto::frame::{read_frame, write_frame};
use node_proto::Origin;
use node_relay::{RelayClient, RelayClientConfig, RelayHub, RelayLink, RelayServer};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

struct Relay {
    addr: String,
    hub: Arc<RelayHub>,
    registry: Arc<DeviceRegistry>,
    cancel: CancellationToken,
}

async fn start_relay() -> Relay {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let hub = Arc::new(RelayHub::new());
    let registry = Arc::new(DeviceRegistry::new("A"));
    let cancel = CancellationToken::new();

    let server = RelayServer::new(hub.clone(), registry.clone())
        .with_handshake_timeout(Duration::from_millis(200));
    tokio::spawn(server.serve(listener, cancel.clone()));

    Relay {
        addr,
        hub,
        registry,
        cancel,
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn join(relay: &Relay, id: &str) -> RelayLink {
    let config = RelayClientConfig {
        attempts: 3,
        backoff: Duration::from_millis(50),
    };
    let link = RelayClient::new(id, relay.addr.clone(), config)
        .connect(&CancellationToken::new())
        .await
        .unwrap();
    let hub = relay.hub.clone();
    let id = id.to_string();
    wait_until(move || hub.contains(&id)).await;
    link
}

async fn recv_within(link: &mut RelayLink) -> Option<Vec<u8>> {
    tokio::time::timeout(Duration::from_secs(2), link.recv())
        .await
        .ok()
        .flatten()
}

async fn nothing_arrives(link: &mut RelayLink) -> bool {
    tokio::time::timeout(Duration::from_millis(200), link.recv())
        .await
        .is_err()
}

#[tokio::test]
async fn broadcast_reaches_everyone_but_the_sender() {
    let relay = start_relay().await;
    let mut b = join(&relay, "B").await;
    let mut c = join(&relay, "C").await;
    let mut d = join(&relay, "D").await;

    b.send("hello").await.unwrap();

    assert_eq!(recv_within(&mut c).await.unwrap(), b"hello");
    assert_eq!(recv_within(&mut d).await.unwrap(), b"hello");
    assert!(nothing_arrives(&mut b).await);
    assert!(nothing_arrives(&mut c).await);

    relay.cancel.cancel();
}

#[tokio::test]
async fn joining_devices_are_relay_registered() {
    let relay = start_relay().await;
    let _b = join(&relay, "B").await;
    let _c = join(&relay, "C").await;

    let devices = relay.registry.snapshot();
    let ids: Vec<&str> = devices.iter().map(|d| d.device_id.as_str()).collect();
    assert_eq!(ids, vec!["B", "C"]);
    assert!(devices.iter().all(|d| d.origin == Origin::RelayRegistered));
    assert_eq!(relay.hub.device_ids(), vec!["B".to_string(), "C".to_string()]);

    relay.cancel.cancel();
}

#[tokio::test]
async fn leaving_device_is_removed_from_hub_but_stays_known() {
    let relay = start_relay().await;
    let b = join(&relay, "B").await;
    let _c = join(&relay, "C").await;

    drop(b);
    let hub = relay.hub.clone();
    wait_until(move || !hub.contains("B")).await;

    assert_eq!(relay.hub.len(), 1);
    assert!(relay.registry.contains("B"));

    relay.cancel.cancel();
}

#[tokio::test]
async fn reconnect_with_same_id_replaces_old_connection() {
    let relay = start_relay().await;
    let mut first = join(&relay, "B").await;
    let mut second = join(&relay, "B").await;
    let c = join(&relay, "C").await;

    // The replaced connection is closed by the relay.
    let closed = tokio::time::timeout(Duration::from_secs(2), first.recv())
        .await
        .unwrap();
    assert!(closed.is_none());

    c.send("to-b").await.unwrap();
    assert_eq!(recv_within(&mut second).await.unwrap(), b"to-b");
    assert_eq!(relay.hub.len(), 2);

    relay.cancel.cancel();
}

#[tokio::test]
async fn failed_handshake_is_never_registered() {
    let relay = start_relay().await;

    let mut bad_utf8 = TcpStream::connect(&relay.addr).await.unwrap();
    write_frame(&mut bad_utf8, &[0xff, 0xfe, 0xfd]).await.unwrap();
    assert!(read_frame(&mut bad_utf8).await.is_err());

    let mut silent = TcpStream::connect(&relay.addr).await.unwrap();
    let dropped = tokio::time::timeout(Duration::from_secs(2), read_frame(&mut silent))
        .await
        .unwrap();
    assert!(dropped.is_err());

    assert!(relay.hub.is_empty());
    assert!(relay.registry.is_empty());

    relay.cancel.cancel();
}
