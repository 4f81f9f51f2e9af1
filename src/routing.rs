//! # Peer Registry
//!
//! Everything the node knows about other hashnames lives here:
//!
//! - `seen`: hashname → [`Peer`] record, created on first reference
//! - `lines`: outgoing line id → hashname, used to route inbound `line` frames
//! - `buckets`: 160 lists indexed by XOR distance from the local hashname
//!
//! Records are created lazily by [`Registry::seen`] and destroyed only by the
//! mesh reaper through [`Registry::remove`].
//!
//! ## Peer State
//!
//! A record moves through `Unknown → Seeking → AwaitingOpen → LineEstablished`
//! as the node learns an address, sends an open and finally receives one. The
//! state is derived from the record's fields rather than stored, see
//! [`Peer::state`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use tracing::warn;

use crate::crypto::Secret;
use crate::identity::{BUCKET_COUNT, Distance, Hashname, PublicKey};
use crate::messages::Packet;
use crate::stream::Stream;

/// Packets held per peer while no line exists. Further packets are dropped.
pub const OUTQ_MAX: usize = 5;

/// Maximum number of records returned by [`Registry::nearby`].
pub const NEARBY_MAX: usize = 5;

/// Result of resolving a hashname against the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lookup {
    /// The argument is the local node's own hashname.
    Own,
    Peer(Hashname),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerState {
    Unknown,
    Seeking,
    AwaitingOpen,
    LineEstablished,
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PeerState::Unknown => "unknown",
            PeerState::Seeking => "seeking",
            PeerState::AwaitingOpen => "awaiting-open",
            PeerState::LineEstablished => "line",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Peer Record
// ============================================================================

#[derive(Debug)]
pub struct Peer {
    pub hashname: Hashname,
    pub created_at: Instant,
    pub pubkey: Option<PublicKey>,
    pub address: Option<SocketAddr>,
    pub bucket: Option<usize>,
    pub elected: bool,
    /// The application opened a stream to this peer.
    pub for_app: bool,

    // Outgoing half of the line, generated locally.
    pub line_out: Option<Hashname>,
    pub secret_out: Option<Secret>,
    // Incoming half, learned from the peer's open.
    pub line_in: Option<Hashname>,
    pub secret_in: Option<Secret>,
    pub open_sent: bool,
    /// `at` of the last accepted open, in the peer's milliseconds.
    pub open_at: Option<u64>,

    pub sent_at: Option<Instant>,
    pub recv_at: Option<Instant>,

    /// Set after a failed introduction so the next failure abandons the peer.
    pub retries: u32,
    pub seeking: bool,
    /// One-shot guard against repeated `connect` requests.
    pub connect_answered: bool,

    /// Introducer hashname → address it advertised for this peer.
    pub via: HashMap<Hashname, String>,
    pub outq: Vec<Packet>,
    pub streams: HashMap<Hashname, Stream>,
}

impl Peer {
    pub fn new(hashname: Hashname) -> Self {
        Self {
            hashname,
            created_at: Instant::now(),
            pubkey: None,
            address: None,
            bucket: None,
            elected: false,
            for_app: false,
            line_out: None,
            secret_out: None,
            line_in: None,
            secret_in: None,
            open_sent: false,
            open_at: None,
            sent_at: None,
            recv_at: None,
            retries: 0,
            seeking: false,
            connect_answered: false,
            via: HashMap::new(),
            outq: Vec::new(),
            streams: HashMap::new(),
        }
    }

    pub fn state(&self) -> PeerState {
        if self.line_in.is_some() {
            PeerState::LineEstablished
        } else if self.open_sent {
            PeerState::AwaitingOpen
        } else if self.seeking {
            PeerState::Seeking
        } else {
            PeerState::Unknown
        }
    }

    /// `hashname,ip,port` as carried in `see` lists.
    pub fn address_string(&self) -> Option<String> {
        self.address
            .map(|addr| format_address(&self.hashname, addr))
    }
}

pub fn format_address(hashname: &Hashname, addr: SocketAddr) -> String {
    format!("{},{},{}", hashname, addr.ip(), addr.port())
}

/// Split a `hashname,ip,port` address into its socket address.
pub fn parse_address(address: &str) -> Option<SocketAddr> {
    let mut parts = address.split(',');
    let _hashname = parts.next()?;
    let ip = parts.next()?.parse().ok()?;
    let port: u16 = parts.next()?.parse().ok()?;
    if port == 0 {
        return None;
    }
    Some(SocketAddr::new(ip, port))
}

// ============================================================================
// Registry
// ============================================================================

pub struct Registry {
    own: Hashname,
    seen: HashMap<Hashname, Peer>,
    lines: HashMap<Hashname, Hashname>,
    buckets: Vec<Vec<Hashname>>,
}

impl Registry {
    pub fn new(own: Hashname) -> Self {
        Self {
            own,
            seen: HashMap::new(),
            lines: HashMap::new(),
            buckets: vec![Vec::new(); BUCKET_COUNT],
        }
    }

    pub fn own(&self) -> Hashname {
        self.own
    }

    /// Resolve a hashname (or `hashname,ip,port` address), creating a record
    /// for it if this is the first reference. Malformed input yields `None`.
    pub fn lookup_or_create(&mut self, value: &str) -> Option<Lookup> {
        let Some(hashname) = Hashname::parse(value) else {
            warn!(value = %value, "seen called without a valid hashname");
            return None;
        };
        Some(self.seen(hashname))
    }

    pub fn seen(&mut self, hashname: Hashname) -> Lookup {
        if hashname == self.own {
            return Lookup::Own;
        }
        if !self.seen.contains_key(&hashname) {
            self.seen.insert(hashname, Peer::new(hashname));
            self.bucketize(&hashname, false);
        }
        Lookup::Peer(hashname)
    }

    pub fn get(&self, hashname: &Hashname) -> Option<&Peer> {
        self.seen.get(hashname)
    }

    pub fn get_mut(&mut self, hashname: &Hashname) -> Option<&mut Peer> {
        self.seen.get_mut(hashname)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.seen.values()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    // ------------------------------------------------------------------------
    // Line index
    // ------------------------------------------------------------------------

    pub fn register_line(&mut self, line_out: Hashname, peer: Hashname) {
        self.lines.insert(line_out, peer);
    }

    pub fn peer_for_line(&self, line: &Hashname) -> Option<Hashname> {
        self.lines.get(line).copied()
    }

    pub fn has_lines(&self) -> bool {
        !self.lines.is_empty()
    }

    /// Hashnames of every peer we have sent an open to.
    pub fn line_peers(&self) -> Vec<Hashname> {
        self.lines.values().copied().collect()
    }

    // ------------------------------------------------------------------------
    // Buckets
    // ------------------------------------------------------------------------

    /// Place a peer in the bucket for its distance. A peer that already has a
    /// bucket is left alone unless `force` is set.
    pub fn bucketize(&mut self, hashname: &Hashname, force: bool) {
        let own = self.own;
        let Some(peer) = self.seen.get_mut(hashname) else {
            return;
        };
        if peer.bucket.is_some() && !force {
            return;
        }
        let Some(index) = own.distance_to(hashname).bucket() else {
            return;
        };
        peer.bucket = Some(index);
        self.buckets[index].push(*hashname);
    }

    pub fn clear_buckets(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
    }

    pub fn bucket(&self, index: usize) -> &[Hashname] {
        self.buckets.get(index).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn occupied_buckets(&self) -> usize {
        self.buckets.iter().filter(|b| !b.is_empty()).count()
    }

    /// Up to [`NEARBY_MAX`] peers holding a live incoming line, scanning from
    /// the bucket `target` falls in outward to bucket 159.
    pub fn nearby(&self, target: &Hashname) -> Vec<Hashname> {
        let start = self.own.distance_to(target).bucket().unwrap_or(0);
        let mut found = Vec::with_capacity(NEARBY_MAX);
        for bucket in &self.buckets[start..] {
            for hashname in bucket {
                if found.len() >= NEARBY_MAX {
                    return found;
                }
                let live = self
                    .seen
                    .get(hashname)
                    .is_some_and(|peer| peer.line_in.is_some());
                if live && !found.contains(hashname) {
                    found.push(*hashname);
                }
            }
        }
        found
    }

    /// Where a lookup for `target` starts: [`nearby`](Self::nearby), or when
    /// that finds nothing, the live lines closest to `target` in any bucket.
    pub fn seek_seeds(&self, target: &Hashname) -> Vec<Hashname> {
        let nearby = self.nearby(target);
        if !nearby.is_empty() {
            return nearby;
        }
        let mut live: Vec<Hashname> = self
            .seen
            .values()
            .filter(|peer| peer.line_in.is_some() && peer.hashname != *target)
            .map(|peer| peer.hashname)
            .collect();
        live.sort_by_key(|hashname| (target.distance_to(hashname), *hashname));
        live.truncate(NEARBY_MAX);
        live
    }

    /// Every known record ordered by distance from the local hashname.
    pub fn by_distance(&self) -> Vec<Hashname> {
        let mut all: Vec<Hashname> = self.seen.keys().copied().collect();
        all.sort_by_key(|hashname| (self.own.distance_to(hashname), *hashname));
        all
    }

    /// Drop a record and every index entry pointing at it.
    pub fn remove(&mut self, hashname: &Hashname) -> Option<Peer> {
        let peer = self.seen.remove(hashname)?;
        if let Some(line_out) = peer.line_out {
            self.lines.remove(&line_out);
        }
        if let Some(index) = peer.bucket {
            self.buckets[index].retain(|h| h != hashname);
        }
        Some(peer)
    }
}
