//! # NAT Traversal
//!
//! Two peers behind NATs reach each other through an introducer `I` that
//! both already hold lines with:
//!
//! ```text
//! A ──{type:"peer", peer:[B]}──────────────► I
//! A ──{} (hole punch) ─────────────────────► B's advertised address
//! I ──{type:"connect", ip, port} + A's key ► B
//! B ──open──────────────────────────────────► A
//! ```
//!
//! B learns A's key and address from the `connect` and opens directly, which
//! also punches B's side.

use std::net::{IpAddr, SocketAddr};

use tracing::{debug, trace, warn};

use crate::identity::{Hashname, PublicKey};
use crate::messages::{Header, Packet};
use crate::node::NodeActor;
use crate::routing::Lookup;

impl NodeActor {
    /// `peer` request: forward a `connect` carrying the requester's address
    /// and key to each named peer we hold a line with.
    pub(crate) fn in_peer(&mut self, from: Hashname, packet: Packet) {
        let Some(targets) = packet.header.peer.filter(|peers| !peers.is_empty()) else {
            warn!(peer = %from, "invalid peer request");
            return;
        };
        let Some(requester) = self.registry.get(&from) else {
            return;
        };
        let (Some(addr), Some(key)) = (requester.address, requester.pubkey.clone()) else {
            debug!(peer = %from, "peer request before open");
            return;
        };

        for target in targets {
            let Some(hashname) = Hashname::parse(&target) else {
                trace!(peer = %from, target = %target, "skipping malformed peer entry");
                continue;
            };
            let live = self
                .registry
                .get(&hashname)
                .is_some_and(|peer| peer.line_in.is_some());
            if !live {
                trace!(peer = %from, target = %hashname, "no line to introduce through");
                continue;
            }
            debug!(from = %from, to = %hashname, "introducing");
            self.send_on_new_stream(
                hashname,
                connect_header(addr),
                Some(key.pem().as_bytes().to_vec()),
            );
        }
    }

    /// `connect` request: open directly to the peer whose key is in the body.
    pub(crate) fn in_connect(&mut self, from: Hashname, packet: Packet) {
        let Some(body) = packet.body else {
            warn!(peer = %from, "connect without a key");
            return;
        };
        let key = match String::from_utf8(body)
            .ok()
            .and_then(|pem| PublicKey::from_pem(&pem).ok())
        {
            Some(key) => key,
            None => {
                warn!(peer = %from, "connect with an invalid key");
                return;
            }
        };

        let Lookup::Peer(to) = self.registry.seen(key.hashname(&self.network)) else {
            debug!(peer = %from, "connect for ourselves");
            return;
        };
        let Some(peer) = self.registry.get_mut(&to) else {
            return;
        };
        if peer.address.is_none() {
            peer.address = advertised_addr(&packet.header);
        }
        if peer.connect_answered {
            warn!(peer = %to, via = %from, "redundant connect");
            return;
        }
        peer.connect_answered = true;
        peer.pubkey = Some(key);
        debug!(peer = %to, via = %from, addr = ?peer.address, "connect");
        self.send_open(to);
    }
}

fn connect_header(addr: SocketAddr) -> Header {
    let mut header = Header::typed("connect");
    header.ip = Some(addr.ip().to_string());
    header.port = Some(addr.port());
    header
}

fn advertised_addr(header: &Header) -> Option<SocketAddr> {
    let ip: IpAddr = header.ip.as_deref()?.parse().ok()?;
    let port = header.port.filter(|port| *port != 0)?;
    Some(SocketAddr::new(ip, port))
}
