//! Protocol trait definitions for telemesh's lookup layer.
//!
//! The iterative seek runs outside the node actor. It reaches the network and
//! the registry only through [`SeekRpc`], so the algorithm in [`crate::dht`]
//! can be driven by the real node or by an in-memory test network.
//!
//! | Operation | Node implementation |
//! |-----------|---------------------|
//! | `seek` | opens a `seek` stream to the peer and waits for its `see` reply |
//! | `add_via` | records provenance of an address on the registry record |

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::Hashname;

#[async_trait]
pub trait SeekRpc: Send + Sync + 'static {
    /// Ask `peer` for the addresses it knows nearest to `target`. Returns the
    /// `see` list of the first reply that carries one.
    async fn seek(&self, peer: Hashname, target: Hashname) -> Result<Vec<String>>;

    /// Remember that `from` advertised `address` (`hashname,ip,port`).
    async fn add_via(&self, from: Hashname, address: String);
}
