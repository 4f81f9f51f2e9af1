//! # DHT Seek
//!
//! Iterative closest-node lookup for a target hashname.
//!
//! ## Algorithm
//!
//! 1. The queue starts with the registry's [`nearby`](crate::routing::Registry::nearby)
//!    peers for the target.
//! 2. Up to [`SEEK_CONCURRENCY`] queries are in flight. Each asks one peer
//!    (never the same peer twice) for its `see` list.
//! 3. Every reported address is recorded as a `via` of the reporting peer.
//!    An address strictly closer to the target than the best so far goes to
//!    the front of the queue; anything else goes to the back.
//! 4. The lookup stops as soon as some peer reports the target itself, or
//!    when the queue and all in-flight queries are exhausted.
//!
//! A query that does not answer within the request timeout counts as
//! finished, so a lookup always drains.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::identity::{Distance, Hashname};
use crate::protocols::SeekRpc;

/// Parallel queries per lookup.
pub const SEEK_CONCURRENCY: usize = 3;

/// Summary of a finished lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeekOutcome {
    /// Some peer reported an address for the target.
    pub found: bool,
    /// Peers that were queried, in query order.
    pub asked: Vec<Hashname>,
}

/// Run an iterative seek for `target` on behalf of `own`.
pub async fn seek<N: SeekRpc>(
    network: Arc<N>,
    own: Hashname,
    target: Hashname,
    seeds: Vec<Hashname>,
    query_timeout: Duration,
) -> SeekOutcome {
    let mut queue: VecDeque<Hashname> = seeds.into_iter().collect();
    let mut asked: HashSet<Hashname> = HashSet::new();
    let mut order = Vec::new();
    let mut closest: Distance = own.distance_to(&target);
    let mut found = false;
    let mut in_flight = JoinSet::new();

    loop {
        while in_flight.len() < SEEK_CONCURRENCY {
            let Some(peer) = queue.pop_front() else {
                break;
            };
            if peer == own || !asked.insert(peer) {
                continue;
            }
            order.push(peer);
            let net = network.clone();
            in_flight.spawn(async move {
                let result = tokio::time::timeout(query_timeout, net.seek(peer, target)).await;
                (peer, result)
            });
        }

        let Some(joined) = in_flight.join_next().await else {
            break;
        };
        let Ok((peer, result)) = joined else {
            continue;
        };
        let see = match result {
            Ok(Ok(see)) => see,
            Ok(Err(e)) => {
                debug!(peer = %peer, error = %e, "seek query failed");
                continue;
            }
            Err(_) => {
                debug!(peer = %peer, "seek query timed out");
                continue;
            }
        };

        for address in see {
            let Some(seen) = Hashname::parse(&address) else {
                trace!(address = %address, "ignoring malformed see entry");
                continue;
            };
            if seen == own || asked.contains(&seen) {
                continue;
            }
            network.add_via(peer, address).await;
            if seen == target {
                found = true;
                continue;
            }
            let distance = seen.distance_to(&target);
            if distance > closest {
                queue.push_back(seen);
            } else {
                closest = distance;
                queue.push_front(seen);
            }
        }

        if found {
            break;
        }
    }

    in_flight.abort_all();
    SeekOutcome {
        found,
        asked: order,
    }
}
