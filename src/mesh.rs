//! # Mesh Maintenance
//!
//! Every `mesh_interval` (25 s by default) the node runs one maintenance
//! cycle over the registry:
//!
//! | Step | Effect |
//! |------|--------|
//! | reap | drop records whose liveness timestamps went stale |
//! | discover | send an open to the nearest records without a line |
//! | elect | rebuild buckets from the line index and pick who to keep warm |
//! | ping | `seek` our own hashname through elected lines |
//!
//! The selection logic is pure and takes `now` explicitly. The side effects
//! (opens and ping tasks) are issued by [`NodeActor::mesh_tick`].

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::identity::{BUCKET_COUNT, Hashname};
use crate::node::NodeActor;
use crate::routing::Registry;

/// Lines elected across all buckets.
pub const MESH_MAX: usize = 200;

/// Records considered by one discover pass.
pub const DISCOVER_MAX: usize = 100;

/// An elected line is pinged at most this often.
pub const PING_INTERVAL: Duration = Duration::from_secs(45);

/// Sent to, never heard from, and the record is older than this.
pub const UNANSWERED_LIMIT: Duration = Duration::from_secs(120);

/// Nothing sent for this long, or sends outrunning receives by this much.
pub const IDLE_LIMIT: Duration = Duration::from_secs(60);

/// Why a record was reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReapReason {
    NeverAnswered,
    Idle,
    Unresponsive,
}

impl std::fmt::Display for ReapReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReapReason::NeverAnswered => write!(f, "sent, never received, older than 2min"),
            ReapReason::Idle => write!(f, "stopped sending for more than 1min"),
            ReapReason::Unresponsive => write!(f, "no response for more than 1min"),
        }
    }
}

// ============================================================================
// Selection
// ============================================================================

/// Remove every record that violates a liveness rule.
///
/// Records we never sent to are left alone. Application-opened records are
/// exempt from the idle rule only.
pub fn reap(registry: &mut Registry, now: Instant) -> Vec<(Hashname, ReapReason)> {
    let doomed: Vec<(Hashname, ReapReason)> = registry
        .peers()
        .filter_map(|peer| {
            let sent_at = peer.sent_at?;
            let reason = match peer.recv_at {
                None if now.saturating_duration_since(peer.created_at) > UNANSWERED_LIMIT => {
                    ReapReason::NeverAnswered
                }
                None => return None,
                Some(_) if !peer.for_app && now.saturating_duration_since(sent_at) > IDLE_LIMIT => {
                    ReapReason::Idle
                }
                Some(recv_at) if sent_at.saturating_duration_since(recv_at) > IDLE_LIMIT => {
                    ReapReason::Unresponsive
                }
                Some(_) => return None,
            };
            Some((peer.hashname, reason))
        })
        .collect();

    for (hashname, _) in &doomed {
        registry.remove(hashname);
    }
    doomed
}

/// The nearest [`DISCOVER_MAX`] records that have no incoming line yet.
pub fn discover(registry: &Registry) -> Vec<Hashname> {
    registry
        .by_distance()
        .into_iter()
        .take(DISCOVER_MAX)
        .filter(|hashname| {
            registry
                .get(hashname)
                .is_some_and(|peer| peer.line_in.is_none())
        })
        .collect()
}

/// Rebuild the buckets from the line index and elect up to `spread` records
/// per bucket. Returns the spread used.
pub fn elect(registry: &mut Registry) -> usize {
    registry.clear_buckets();
    let mut lines = registry.line_peers();
    lines.sort();
    lines.dedup();
    for hashname in &lines {
        registry.bucketize(hashname, true);
    }

    let occupied = registry.occupied_buckets();
    if occupied == 0 {
        return MESH_MAX;
    }
    let spread = (MESH_MAX / occupied).max(1);

    for index in 0..BUCKET_COUNT {
        let members = registry.bucket(index).to_vec();
        for (position, hashname) in members.iter().enumerate() {
            if let Some(peer) = registry.get_mut(hashname) {
                peer.elected = position < spread;
            }
        }
    }
    spread
}

/// Lines due for a keepalive seek: elected or application-opened, and not
/// sent to within [`PING_INTERVAL`].
pub fn ping_targets(registry: &Registry, now: Instant) -> Vec<Hashname> {
    let mut targets: Vec<Hashname> = registry
        .line_peers()
        .into_iter()
        .filter(|hashname| {
            registry.get(hashname).is_some_and(|peer| {
                (peer.elected || peer.for_app)
                    && peer
                        .sent_at
                        .is_none_or(|at| now.saturating_duration_since(at) >= PING_INTERVAL)
            })
        })
        .collect();
    targets.sort();
    targets.dedup();
    targets
}

// ============================================================================
// Actor Integration
// ============================================================================

impl NodeActor {
    /// One maintenance cycle.
    pub(crate) fn mesh_tick(&mut self) {
        let now = Instant::now();

        for (hashname, reason) in reap(&mut self.registry, now) {
            debug!(peer = %hashname, reason = %reason, "reaping");
        }

        for hashname in discover(&self.registry) {
            self.send_open(hashname);
        }

        let spread = elect(&mut self.registry);
        trace!(spread, buckets = self.registry.occupied_buckets(), "elected lines");

        for hashname in ping_targets(&self.registry, now) {
            self.spawn_ping(hashname);
        }
    }

    /// Seek our own hashname through `peer` and record what it reports.
    fn spawn_ping(&self, peer: Hashname) {
        let Some(rpc) = self.rpc() else {
            return;
        };
        let own = self.hashname;
        tokio::spawn(async move {
            rpc.ping(peer, own).await;
        });
    }
}
