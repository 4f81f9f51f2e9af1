//! # Telemesh - Hashname Overlay Networking
//!
//! Telemesh gives every participant a stable address derived from its RSA
//! public key and moves application data between participants over encrypted,
//! ordered streams:
//!
//! - **Identity**: a hashname is `SHA1(public key PEM ‖ network)`
//! - **Lines**: per-peer AES-128-CTR channels set up by an RSA-signed `open`
//! - **Streams**: sequenced, acknowledged frames multiplexed over a line
//! - **Seek**: Kademlia-style iterative lookup over 160 XOR buckets
//! - **Mesh**: periodic reap/discover/elect/ping keeps the routing table fresh
//! - **NAT Traversal**: introductions through a mutual peer plus hole punching
//!
//! ## Architecture
//!
//! All mutable network state is owned by one actor task per node:
//! - [`Node`] is a cheap-to-clone handle that talks to it over channels
//! - Long-running work (seeks, pings, TCP bridges) runs in spawned tasks that
//!   report back through commands
//!
//! ## Wire Format
//!
//! Every datagram is `u16 BE header length ‖ JSON header ‖ body`. Outer frames
//! are `open` or `line`; stream frames travel encrypted inside `line` bodies.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | [`Node`] handle and the actor owning the network context |
//! | `identity` | Hashnames, XOR distance, RSA keypairs |
//! | `crypto` | RSA secret wrapping and signatures, AES-CTR |
//! | `messages` | Frame codec (`Header`, `Packet`) |
//! | `routing` | Peer registry and distance buckets |
//! | `line` | `open` handshake and `line` frame sealing |
//! | `stream` | Ordering, acks and retransmission; application handles |
//! | `protocols` | `SeekRpc` seam between lookup and node |
//! | `dht` | Iterative seek |
//! | `mesh` | Maintenance loop |
//! | `nat` | `peer` / `connect` introductions |
//! | `proxy` | `sock` streams bridged to TCP |
//! | `transport` | UDP socket |
//! | `config` | [`NodeConfig`] |

mod config;
mod crypto;
mod dht;
mod identity;
mod line;
mod mesh;
mod messages;
mod nat;
mod node;
mod protocols;
mod proxy;
mod routing;
mod stream;
mod transport;

pub use config::NodeConfig;
pub use crypto::CryptoError;
pub use identity::{DEFAULT_KEY_BITS, Distance, Hashname, Keypair, PublicKey};
pub use line::LineError;
pub use messages::{Header, Packet, WireError};
pub use node::{Node, PeerInfo};
pub use proxy::ProxyPolicy;
pub use routing::PeerState;
pub use stream::{StreamError, StreamHandle, StreamSender};
