//! Relay mode of a 0Xnet node.
//!
//! Provides two functions when no other relay was found on the local network:
//! 1. **Relay hub**: devices connect over TCP, identify with their device id,
//!    and every frame they send is forwarded to all other connected devices.
//! 2. **Rendezvous**: an HTTP topic directory the global overlay uses to
//!    advertise and resolve peers.
//!
//! Wire protocol: [4-byte LE length][payload] frames; the first frame of a
//! connection is the raw UTF-8 device id.

pub mod client;
pub mod hub;
pub mod rendezvous;
pub mod server;

pub use client::{RelayClient, RelayClientConfig, RelayClientError, RelayClientState, RelayLink};
pub use hub::{ConnId, RelayHub};
pub use rendezvous::{RendezvousDirectory, SharedDirectory};
pub use server::{HandshakeError, RelayServer};
