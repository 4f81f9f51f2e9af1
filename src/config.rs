//! Node configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// How long a single `seek` query (or seed probe) may go unanswered.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Period of the mesh maintenance loop.
pub const DEFAULT_MESH_INTERVAL: Duration = Duration::from_secs(25);

#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Local UDP address. Port 0 picks an ephemeral port.
    pub bind: SocketAddr,
    /// Address other peers should use to reach us, if known.
    pub public_ip: Option<IpAddr>,
    /// Force NAT mode even with a public IP.
    pub natted: bool,
    pub request_timeout: Duration,
    pub mesh_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            public_ip: None,
            natted: false,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            mesh_interval: DEFAULT_MESH_INTERVAL,
        }
    }
}

impl NodeConfig {
    /// Default configuration bound to `bind`.
    pub fn with_bind(bind: SocketAddr) -> Self {
        Self {
            bind,
            ..Self::default()
        }
    }

    /// NAT mode: hole punches accompany introductions.
    pub fn nat(&self) -> bool {
        self.public_ip.is_none() || self.natted
    }
}
