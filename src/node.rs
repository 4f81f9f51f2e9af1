//! # High-Level Node API
//!
//! A [`Node`] is one hashname on one network. It owns a UDP socket, the peer
//! registry and every line and stream, all held by a single actor task.
//!
//! ## Quick Start
//!
//! ```ignore
//! let keypair = Keypair::generate(DEFAULT_KEY_BITS)?;
//! let node = Node::bind("example", keypair, NodeConfig::default()).await?;
//!
//! node.add_seed(seed_ip, seed_port, &seed_pem).await?;
//! node.online().await?;
//!
//! let mut stream = node.stream(friend).await?;
//! stream.send(Header::typed("chat"), Some(b"hello".to_vec())).await?;
//! let reply = stream.recv().await;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Node (handle) ──cmd──► NodeActor ◄──datagrams── receive task ◄── UDP
//!      │                    │  ▲
//!      │                    │  └── FlushAck / SeekFinished / AddVia
//!      └── NodeRpc ─────────┘       (from spawned timer, seek and ping tasks)
//! ```
//!
//! The actor processes one input at a time, so handshake, stream and registry
//! state never need locks. Anything that waits (seeks, pings, delayed acks,
//! proxies) runs in its own task and talks back through [`Command`]s.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::config::NodeConfig;
use crate::crypto::{self, IV_HEX_LEN};
use crate::dht::{self, SeekOutcome};
use crate::identity::{Hashname, Keypair, PublicKey, now_ms};
use crate::line;
use crate::messages::{self, Header, Packet};
use crate::protocols::SeekRpc;
use crate::proxy::{self, ProxyPolicy};
use crate::routing::{
    Lookup, OUTQ_MAX, PeerState, Registry, format_address, parse_address,
};
use crate::stream::{ACK_DELAY, Handler, Rejection, Stream, StreamHandle};
use crate::transport::{self, Datagram, Transport};

/// Stream types handled by the node itself.
pub const BUILTIN_TYPES: [&str; 4] = ["sock", "peer", "connect", "seek"];

const COMMAND_CHANNEL_CAPACITY: usize = 1024;
const DATAGRAM_CHANNEL_CAPACITY: usize = 1024;

// ============================================================================
// Public Handle
// ============================================================================

/// Snapshot of one registry record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub hashname: Hashname,
    pub address: Option<SocketAddr>,
    pub state: PeerState,
    pub bucket: Option<usize>,
    pub elected: bool,
    pub for_app: bool,
}

#[derive(Clone)]
pub struct Node {
    cmd_tx: mpsc::Sender<Command>,
    rpc: NodeRpc,
    hashname: Hashname,
    network: String,
    address: String,
    public_pem: String,
    local_addr: SocketAddr,
}

impl Node {
    /// Bind a node for `network` with the given identity.
    pub async fn bind(network: &str, keypair: Keypair, config: NodeConfig) -> Result<Self> {
        if network.is_empty() {
            bail!("network name must not be empty");
        }

        let transport = Transport::bind(config.bind)
            .await
            .with_context(|| format!("failed to bind UDP socket on {}", config.bind))?;
        let local_addr = transport.local_addr();
        let hashname = keypair.hashname(network);

        let ip = match config.public_ip {
            Some(ip) => ip,
            None if local_addr.ip().is_unspecified() => {
                transport::discover_local_ip().unwrap_or(local_addr.ip())
            }
            None => local_addr.ip(),
        };
        let address = format_address(&hashname, SocketAddr::new(ip, local_addr.port()));

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (datagram_tx, datagram_rx) = mpsc::channel(DATAGRAM_CHANNEL_CAPACITY);
        let receiver = transport.spawn_receiver(datagram_tx);

        let rpc = NodeRpc {
            cmd_tx: cmd_tx.clone(),
            request_timeout: config.request_timeout,
        };
        let public_pem = keypair.public_pem().to_string();
        let actor = NodeActor::new(
            network.to_string(),
            keypair,
            address.clone(),
            transport,
            config,
            cmd_tx.downgrade(),
        );
        tokio::spawn(actor.run(cmd_rx, datagram_rx, receiver));

        info!(hashname = %hashname, address = %address, "node listening");
        Ok(Self {
            cmd_tx,
            rpc,
            hashname,
            network: network.to_string(),
            address,
            public_pem,
            local_addr,
        })
    }

    pub fn hashname(&self) -> Hashname {
        self.hashname
    }

    /// `hashname,ip,port` as advertised to other peers.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn public_pem(&self) -> &str {
        &self.public_pem
    }

    /// The bound UDP socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Register a bootstrap peer. Returns its hashname.
    pub async fn add_seed(&self, ip: IpAddr, port: u16, pubkey: &str) -> Result<Hashname> {
        if port == 0 {
            bail!("invalid args to add_seed: port must be non-zero");
        }
        let key = PublicKey::from_pem(pubkey).context("invalid seed public key")?;
        self.request(|reply| Command::AddSeed {
            addr: SocketAddr::new(ip, port),
            key,
            reply,
        })
        .await?
    }

    /// Join the network through the registered seeds.
    pub async fn online(&self) -> Result<()> {
        let (has_lines, seeds) = self.request(Command::OnlineStatus).await?;
        if has_lines {
            return Ok(());
        }
        if seeds.is_empty() {
            bail!("no seeds for {}", self.network);
        }

        for seed in seeds {
            let probe = self.rpc.query(seed, self.hashname, true);
            match tokio::time::timeout(self.rpc.request_timeout, probe).await {
                Ok(Ok(see)) => {
                    info!(seed = %seed, known = see.len(), "online");
                    self.cmd_tx
                        .send(Command::StartMesh)
                        .await
                        .map_err(|_| anyhow!("node has shut down"))?;
                    return Ok(());
                }
                Ok(Err(e)) => warn!(seed = %seed, error = %e, "seed failed"),
                Err(_) => warn!(seed = %seed, "seed timed out"),
            }
        }
        bail!("couldn't reach any seeds")
    }

    /// Open an application stream to `to`. The line is established on the
    /// first send.
    pub async fn stream(&self, to: Hashname) -> Result<StreamHandle> {
        self.rpc.open(to, false, true).await
    }

    /// Receive unsolicited streams whose first frame has `type: kind`.
    /// Registering a type again replaces the previous receiver.
    pub async fn listen(&self, kind: &str) -> Result<mpsc::UnboundedReceiver<StreamHandle>> {
        if kind.is_empty() {
            bail!("stream type must not be empty");
        }
        if BUILTIN_TYPES.contains(&kind) {
            bail!("stream type {:?} is handled by the node", kind);
        }
        self.request(|reply| Command::Listen {
            kind: kind.to_string(),
            reply,
        })
        .await
    }

    /// Decide which `sock` requests are bridged to TCP. The default denies all.
    pub async fn set_proxy_policy<F>(&self, policy: F) -> Result<()>
    where
        F: Fn(&str, u16, &Hashname) -> bool + Send + Sync + 'static,
    {
        self.cmd_tx
            .send(Command::SetProxyPolicy(Arc::new(policy)))
            .await
            .map_err(|_| anyhow!("node has shut down"))
    }

    /// Listen on `listen` and forward each TCP client through `to`, which
    /// connects it to `target` (`ip:port`). Returns the bound address.
    pub async fn tunnel(&self, to: Hashname, target: &str, listen: SocketAddr) -> Result<SocketAddr> {
        if proxy::parse_sock(target).is_none() {
            bail!("invalid tunnel target {:?}", target);
        }
        let listener = tokio::net::TcpListener::bind(listen)
            .await
            .with_context(|| format!("failed to listen on {}", listen))?;
        let bound = listener.local_addr().context("tunnel listener address")?;
        info!(peer = %to, target = %target, listen = %bound, "tunnel listening");
        tokio::spawn(proxy::serve_tunnel(
            listener,
            self.rpc.clone(),
            to,
            target.to_string(),
        ));
        Ok(bound)
    }

    /// Registry snapshot, nearest first.
    pub async fn peers(&self) -> Result<Vec<PeerInfo>> {
        self.request(Command::Peers).await
    }

    /// Stop the actor and the receive task. Open streams end.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| anyhow!("node has shut down"))?;
        rx.await.map_err(|_| anyhow!("node has shut down"))
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("hashname", &self.hashname)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Commands
// ============================================================================

pub(crate) enum Command {
    OpenStream {
        to: Hashname,
        manual: bool,
        for_app: bool,
        reply: oneshot::Sender<Result<StreamHandle>>,
    },
    StreamSend {
        peer: Hashname,
        stream: Hashname,
        header: Header,
        body: Option<Vec<u8>>,
        done: Option<oneshot::Sender<()>>,
    },
    FlushAck {
        peer: Hashname,
        stream: Hashname,
    },
    AddSeed {
        addr: SocketAddr,
        key: PublicKey,
        reply: oneshot::Sender<Result<Hashname>>,
    },
    OnlineStatus(oneshot::Sender<(bool, Vec<Hashname>)>),
    StartMesh,
    Listen {
        kind: String,
        reply: oneshot::Sender<mpsc::UnboundedReceiver<StreamHandle>>,
    },
    SetProxyPolicy(ProxyPolicy),
    AddVia {
        from: Hashname,
        address: String,
    },
    SeekFinished {
        target: Hashname,
        outcome: SeekOutcome,
    },
    Peers(oneshot::Sender<Vec<PeerInfo>>),
    Quit,
}

// ============================================================================
// RPC Seam
// ============================================================================

/// Stream-level requests issued from outside the actor.
#[derive(Clone)]
pub(crate) struct NodeRpc {
    cmd_tx: mpsc::Sender<Command>,
    request_timeout: Duration,
}

impl NodeRpc {
    pub(crate) async fn open(&self, to: Hashname, manual: bool, for_app: bool) -> Result<StreamHandle> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::OpenStream {
                to,
                manual,
                for_app,
                reply,
            })
            .await
            .map_err(|_| anyhow!("node has shut down"))?;
        rx.await.map_err(|_| anyhow!("node has shut down"))?
    }

    /// Send `{type:"seek"}` to `peer` and wait for a frame carrying `see`.
    pub(crate) async fn query(&self, peer: Hashname, target: Hashname, manual: bool) -> Result<Vec<String>> {
        let mut handle = self.open(peer, manual, false).await?;
        let mut header = Header::typed("seek");
        header.seek = Some(target.to_hex());
        handle.send(header, None).await?;

        while let Some(packet) = handle.recv().await {
            if let Some(see) = packet.header.see {
                return Ok(see);
            }
            if packet.header.is_end() {
                break;
            }
        }
        bail!("stream ended without a see list")
    }

    /// Keepalive: seek `own` through `peer` and harvest what it reports.
    pub(crate) async fn ping(&self, peer: Hashname, own: Hashname) {
        match tokio::time::timeout(self.request_timeout, self.query(peer, own, false)).await {
            Ok(Ok(see)) => {
                trace!(peer = %peer, known = see.len(), "ping answered");
                for address in see {
                    self.add_via(peer, address).await;
                }
            }
            Ok(Err(e)) => debug!(peer = %peer, error = %e, "ping failed"),
            Err(_) => debug!(peer = %peer, "ping timed out"),
        }
    }
}

#[async_trait]
impl SeekRpc for NodeRpc {
    async fn seek(&self, peer: Hashname, target: Hashname) -> Result<Vec<String>> {
        self.query(peer, target, false).await
    }

    async fn add_via(&self, from: Hashname, address: String) {
        let _ = self.cmd_tx.send(Command::AddVia { from, address }).await;
    }
}

// ============================================================================
// Actor
// ============================================================================

pub(crate) struct NodeActor {
    pub(crate) network: String,
    pub(crate) keypair: Keypair,
    pub(crate) hashname: Hashname,
    pub(crate) address: String,
    pub(crate) nat: bool,
    pub(crate) registry: Registry,
    pub(crate) transport: Transport,
    pub(crate) seeds: Vec<Hashname>,
    pub(crate) listeners: HashMap<String, mpsc::UnboundedSender<StreamHandle>>,
    pub(crate) proxy_policy: ProxyPolicy,
    pub(crate) config: NodeConfig,
    /// Weak so that dropping every handle stops the actor.
    cmd_tx: mpsc::WeakSender<Command>,
    meshing: bool,
    packet_counter: u64,
}

impl NodeActor {
    fn new(
        network: String,
        keypair: Keypair,
        address: String,
        transport: Transport,
        config: NodeConfig,
        cmd_tx: mpsc::WeakSender<Command>,
    ) -> Self {
        let hashname = keypair.hashname(&network);
        Self {
            nat: config.nat(),
            network,
            keypair,
            hashname,
            address,
            registry: Registry::new(hashname),
            transport,
            seeds: Vec::new(),
            listeners: HashMap::new(),
            proxy_policy: proxy::deny_all(),
            config,
            cmd_tx,
            meshing: false,
            packet_counter: 0,
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut datagrams: mpsc::Receiver<Datagram>,
        receiver: JoinHandle<()>,
    ) {
        let mut mesh = tokio::time::interval(self.config.mesh_interval);
        mesh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                datagram = datagrams.recv() => {
                    match datagram {
                        Some(datagram) => self.handle_datagram(datagram),
                        None => {
                            warn!("receive task stopped, actor quitting");
                            break;
                        }
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Quit) => {
                            debug!(hashname = %self.hashname, "node actor quitting");
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            debug!(hashname = %self.hashname, "all handles dropped, actor quitting");
                            break;
                        }
                    }
                }
                _ = mesh.tick() => {
                    if self.meshing {
                        self.mesh_tick();
                    }
                }
            }
        }

        receiver.abort();
    }

    pub(crate) fn rpc(&self) -> Option<NodeRpc> {
        self.cmd_tx.upgrade().map(|cmd_tx| NodeRpc {
            cmd_tx,
            request_timeout: self.config.request_timeout,
        })
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::OpenStream {
                to,
                manual,
                for_app,
                reply,
            } => {
                let _ = reply.send(self.open_stream(to, manual, for_app));
            }
            Command::StreamSend {
                peer,
                stream,
                header,
                body,
                done,
            } => self.stream_send(peer, stream, Some(header), body, done),
            Command::FlushAck { peer, stream: id } => {
                if let Some(stream) = self.stream_mut(&peer, &id) {
                    stream.flusher_fired();
                }
                self.stream_send(peer, id, None, None, None);
            }
            Command::AddSeed { addr, key, reply } => {
                let _ = reply.send(self.add_seed(addr, key));
            }
            Command::OnlineStatus(reply) => {
                let _ = reply.send((self.registry.has_lines(), self.seeds.clone()));
            }
            Command::StartMesh => {
                if !self.meshing {
                    self.meshing = true;
                    self.mesh_tick();
                }
            }
            Command::Listen { kind, reply } => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.listeners.insert(kind, tx);
                let _ = reply.send(rx);
            }
            Command::SetProxyPolicy(policy) => self.proxy_policy = policy,
            Command::AddVia { from, address } => self.add_via(from, address),
            Command::SeekFinished { target, outcome } => self.seek_finished(target, outcome),
            Command::Peers(reply) => {
                let _ = reply.send(self.peer_infos());
            }
            Command::Quit => {}
        }
    }

    fn add_seed(&mut self, addr: SocketAddr, key: PublicKey) -> Result<Hashname> {
        let Lookup::Peer(hashname) = self.registry.seen(key.hashname(&self.network)) else {
            bail!("seed key is our own key");
        };
        if let Some(peer) = self.registry.get_mut(&hashname) {
            peer.pubkey = Some(key);
            peer.address = Some(addr);
        }
        if !self.seeds.contains(&hashname) {
            self.seeds.push(hashname);
        }
        debug!(seed = %hashname, addr = %addr, "seed added");
        Ok(hashname)
    }

    fn peer_infos(&self) -> Vec<PeerInfo> {
        self.registry
            .by_distance()
            .iter()
            .filter_map(|hashname| self.registry.get(hashname))
            .map(|peer| PeerInfo {
                hashname: peer.hashname,
                address: peer.address,
                state: peer.state(),
                bucket: peer.bucket,
                elected: peer.elected,
                for_app: peer.for_app,
            })
            .collect()
    }

    fn add_via(&mut self, from: Hashname, address: String) {
        let Some(Lookup::Peer(seen)) = self.registry.lookup_or_create(&address) else {
            return;
        };
        if seen == from {
            return;
        }
        if let Some(peer) = self.registry.get_mut(&seen) {
            peer.via.entry(from).or_insert(address);
        }
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    fn handle_datagram(&mut self, datagram: Datagram) {
        let Datagram { bytes, from } = datagram;
        let mut packet = match messages::decode(&bytes) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(addr = %from, error = %e, "failed to decode a packet");
                return;
            }
        };
        if packet.header.is_empty() {
            trace!(addr = %from, "empty frame");
            return;
        }
        if packet.header.iv.as_ref().map(String::len) != Some(IV_HEX_LEN) {
            warn!(addr = %from, "missing initialization vector (iv)");
            return;
        }

        self.packet_counter += 1;
        packet.sender = Some(from);
        packet.id = self.packet_counter;
        packet.received_at = Some(Instant::now());

        match packet.header.kind.as_deref() {
            Some("open") => self.in_open(packet),
            Some("line") => self.in_line(packet),
            other => warn!(addr = %from, kind = ?other, "dropping incoming packet of unknown type"),
        }
    }

    fn in_open(&mut self, packet: Packet) {
        let sender = packet.sender;
        let open = match line::verify_open(&self.keypair, &self.hashname, &packet) {
            Ok(open) => open,
            Err(e) => {
                warn!(addr = ?sender, error = %e, "dropping open");
                return;
            }
        };

        let Lookup::Peer(from) = self.registry.seen(open.key.hashname(&self.network)) else {
            debug!(addr = ?sender, "dropping open from our own key");
            return;
        };
        let Some(peer) = self.registry.get_mut(&from) else {
            return;
        };
        if peer.open_at.is_some_and(|at| open.at <= at) {
            debug!(peer = %from, at = open.at, "dropping stale open");
            return;
        }

        peer.open_at = Some(open.at);
        peer.pubkey = Some(open.key);
        if sender.is_some() {
            peer.address = sender;
        }
        peer.recv_at = Some(Instant::now());
        if peer.line_in.is_some_and(|line| line != open.line) {
            // New line from the peer: it lost our open.
            peer.open_sent = false;
        }
        let reply = !peer.open_sent;
        peer.line_in = Some(open.line);
        peer.secret_in = Some(open.secret);
        debug!(peer = %from, addr = ?sender, "line in");

        if reply {
            self.send_open(from);
        }
        self.send(from, None);
    }

    fn in_line(&mut self, packet: Packet) {
        let Some(line) = packet.header.line.as_deref().and_then(|l| l.parse::<Hashname>().ok()) else {
            warn!(addr = ?packet.sender, "invalid line id");
            return;
        };
        let Some(from) = self.registry.peer_for_line(&line) else {
            warn!(addr = ?packet.sender, line = %line, "unknown line received");
            return;
        };
        let Some(peer) = self.registry.get_mut(&from) else {
            return;
        };
        let Some(secret) = peer.secret_in else {
            debug!(peer = %from, "line frame before open");
            return;
        };

        match line::open_line(&secret, &packet) {
            Ok(inner) => {
                peer.recv_at = Some(Instant::now());
                self.in_stream(from, inner);
            }
            Err(e) => warn!(peer = %from, error = %e, "failed to open line frame"),
        }
    }

    fn in_stream(&mut self, from: Hashname, packet: Packet) {
        let Some(id) = packet
            .header
            .stream
            .as_deref()
            .and_then(|s| s.parse::<Hashname>().ok())
        else {
            warn!(peer = %from, "invalid stream id");
            return;
        };
        let Some(peer) = self.registry.get_mut(&from) else {
            return;
        };
        let stream = peer
            .streams
            .entry(id)
            .or_insert_with(|| Stream::new(id, Handler::Unassigned));
        let received = stream.receive(packet, Instant::now());

        match &received.rejected {
            Some(Rejection::Duplicate(seq)) => trace!(peer = %from, stream = %id, seq, "duplicate"),
            Some(rejection) => warn!(peer = %from, stream = %id, reason = %rejection, "stream frame rejected"),
            None => {}
        }
        if received.ack_now {
            self.stream_send(from, id, None, None, None);
        }
        if received.start_flusher {
            self.schedule(ACK_DELAY, Command::FlushAck { peer: from, stream: id });
        }
        for packet in received.resend {
            self.send(from, Some(packet));
        }
        for packet in received.deliver {
            self.dispatch(from, id, packet);
        }
    }

    /// Hand an in-order frame to the stream's handler, or pick one from its
    /// `type` if the stream is new.
    fn dispatch(&mut self, from: Hashname, id: Hashname, packet: Packet) {
        if packet.header.is_ack_only() && packet.body.is_none() {
            return;
        }
        let Some(stream) = self.stream_mut(&from, &id) else {
            return;
        };
        match &stream.handler {
            Handler::App(tx) => {
                if tx.send(packet).is_err() {
                    stream.handler = Handler::Discard;
                }
                return;
            }
            Handler::Discard => return,
            Handler::Unassigned => {}
        }

        let Some(kind) = packet.header.kind.clone() else {
            warn!(peer = %from, stream = %id, "unknown stream packet");
            return;
        };
        match kind.as_str() {
            "sock" => self.in_sock(from, id, packet),
            "peer" => self.in_peer(from, packet),
            "connect" => self.in_connect(from, packet),
            "seek" => self.in_seek(from, id, packet),
            custom => self.in_custom(from, id, custom, packet),
        }

        let Some(stream) = self.stream_mut(&from, &id) else {
            return;
        };
        if matches!(stream.handler, Handler::Unassigned) && !stream.is_ended() {
            self.stream_send(from, id, Some(Header::ending(None)), None, None);
        }
    }

    fn in_seek(&mut self, from: Hashname, id: Hashname, packet: Packet) {
        let Some(target) = packet
            .header
            .seek
            .as_deref()
            .and_then(|s| s.parse::<Hashname>().ok())
        else {
            warn!(peer = %from, "invalid seek");
            return;
        };

        let mut see = Vec::new();
        if target == self.hashname {
            see.push(self.address.clone());
        }
        see.extend(
            self.registry
                .nearby(&target)
                .iter()
                .filter_map(|hashname| self.registry.get(hashname))
                .filter_map(|peer| peer.address_string()),
        );
        trace!(peer = %from, target = %target, count = see.len(), "answering seek");

        let mut header = Header::ending(None);
        header.see = Some(see);
        self.stream_send(from, id, Some(header), None, None);
    }

    fn in_custom(&mut self, from: Hashname, id: Hashname, kind: &str, packet: Packet) {
        if self.listeners.get(kind).is_some_and(|l| l.is_closed()) {
            self.listeners.remove(kind);
        }
        let Some(listener) = self.listeners.get(kind).cloned() else {
            debug!(peer = %from, kind = %kind, "no handler for stream type");
            self.stream_send(from, id, Some(Header::ending(Some("unknown type"))), None, None);
            return;
        };
        if let Some(handle) = self.attach(from, id, Some(packet)) {
            if listener.send(handle).is_err() {
                debug!(peer = %from, kind = %kind, "listener dropped");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Streams
    // ------------------------------------------------------------------------

    pub(crate) fn stream_mut(&mut self, peer: &Hashname, id: &Hashname) -> Option<&mut Stream> {
        self.registry.get_mut(peer)?.streams.get_mut(id)
    }

    fn open_stream(&mut self, to: Hashname, manual: bool, for_app: bool) -> Result<StreamHandle> {
        let Lookup::Peer(to) = self.registry.seen(to) else {
            bail!("cannot open a stream to our own hashname");
        };
        let cmd_tx = self
            .cmd_tx
            .upgrade()
            .ok_or_else(|| anyhow!("node has shut down"))?;
        let peer = self
            .registry
            .get_mut(&to)
            .ok_or_else(|| anyhow!("peer {} vanished", to))?;
        peer.for_app |= for_app;

        let id = Hashname::random();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut stream = Stream::new(id, Handler::App(tx));
        if manual {
            stream = stream.manual();
        }
        peer.streams.insert(id, stream);
        Ok(StreamHandle::new(to, id, cmd_tx, rx))
    }

    /// Give an unassigned inbound stream to the application, queueing
    /// `first` on the new handle.
    pub(crate) fn attach(&mut self, peer: Hashname, id: Hashname, first: Option<Packet>) -> Option<StreamHandle> {
        let cmd_tx = self.cmd_tx.upgrade()?;
        let stream = self.stream_mut(&peer, &id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(packet) = first {
            let _ = tx.send(packet);
        }
        stream.handler = Handler::App(tx);
        Some(StreamHandle::new(peer, id, cmd_tx, rx))
    }

    /// Open a fire-and-forget stream to `to` and send one frame on it.
    pub(crate) fn send_on_new_stream(&mut self, to: Hashname, header: Header, body: Option<Vec<u8>>) {
        let Some(peer) = self.registry.get_mut(&to) else {
            return;
        };
        let id = Hashname::random();
        peer.streams.insert(id, Stream::new(id, Handler::Discard));
        self.stream_send(to, id, Some(header), body, None);
    }

    /// Sequence a frame (or a bare ack when `header` is `None`) on a stream
    /// and send it.
    pub(crate) fn stream_send(
        &mut self,
        peer: Hashname,
        id: Hashname,
        header: Option<Header>,
        body: Option<Vec<u8>>,
        done: Option<oneshot::Sender<()>>,
    ) {
        let Some(stream) = self.stream_mut(&peer, &id) else {
            debug!(peer = %peer, stream = %id, "send on unknown stream");
            return;
        };
        match stream.prepare_send(header, body, done) {
            Ok(Some(packet)) => self.send(peer, Some(packet)),
            Ok(None) => {}
            Err(e) => warn!(peer = %peer, stream = %id, error = %e, "dropping stream frame"),
        }
    }

    fn schedule(&self, delay: Duration, cmd: Command) {
        let Some(cmd_tx) = self.cmd_tx.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = cmd_tx.send(cmd).await;
        });
    }

    // ------------------------------------------------------------------------
    // Lines
    // ------------------------------------------------------------------------

    /// Queue `packet` for `to` and push the peer one step towards a line:
    /// seek it, open to it, or flush the queue over the existing line.
    pub(crate) fn send(&mut self, to: Hashname, packet: Option<Packet>) {
        let Some(peer) = self.registry.get_mut(&to) else {
            debug!(peer = %to, "send to unknown peer");
            return;
        };
        if let Some(packet) = packet {
            if peer.outq.len() < OUTQ_MAX {
                peer.outq.push(packet);
            } else {
                warn!(peer = %to, "dropping packet, flooding not allowed");
            }
        }

        if peer.address.is_none() && peer.via.is_empty() {
            self.open_seek(to);
        } else if peer.line_in.is_none() {
            self.send_open(to);
        } else {
            self.flush(to);
        }
    }

    fn flush(&mut self, to: Hashname) {
        let Some(peer) = self.registry.get_mut(&to) else {
            return;
        };
        let (Some(line), Some(secret), Some(addr)) = (peer.line_in, peer.secret_out, peer.address) else {
            trace!(peer = %to, "line not ready");
            return;
        };
        let mut written = 0;
        for packet in std::mem::take(&mut peer.outq) {
            match line::seal_line(&line, &secret, &packet) {
                Ok(frame) => {
                    self.transport.send_to(&frame, addr);
                    written += 1;
                }
                Err(e) => warn!(peer = %to, error = %e, "failed to seal frame"),
            }
        }
        if written > 0 {
            peer.sent_at = Some(Instant::now());
        }
    }

    /// Send our open to `to`, or ask its introducers to connect us when we
    /// don't have its key yet.
    pub(crate) fn send_open(&mut self, to: Hashname) {
        let Some(peer) = self.registry.get_mut(&to) else {
            return;
        };
        let Some(key) = peer.pubkey.clone() else {
            self.introduce(to);
            return;
        };

        peer.open_sent = true;
        let secret = *peer.secret_out.get_or_insert_with(crypto::random_secret);
        let line_out = *peer.line_out.get_or_insert_with(Hashname::random);
        let address = peer.address;
        self.registry.register_line(line_out, to);
        self.registry.bucketize(&to, false);

        let Some(addr) = address else {
            debug!(peer = %to, "no address to send open to");
            return;
        };
        match line::build_open(&self.keypair, &to, &key, &line_out, &secret, now_ms()) {
            Ok(frame) => {
                trace!(peer = %to, addr = %addr, "sending open");
                self.transport.send_to(&frame, addr);
                if let Some(peer) = self.registry.get_mut(&to) {
                    peer.sent_at = Some(Instant::now());
                }
            }
            Err(e) => warn!(peer = %to, error = %e, "failed to build open"),
        }
    }

    /// Request a NAT introduction through every live introducer of `to`,
    /// falling back to one fresh seek.
    fn introduce(&mut self, to: Hashname) {
        let Some(peer) = self.registry.get(&to) else {
            return;
        };
        let vias: Vec<(Hashname, String)> = peer
            .via
            .iter()
            .map(|(via, address)| (*via, address.clone()))
            .collect();

        let mut peered = false;
        for (via, advertised) in vias {
            let live = self
                .registry
                .get(&via)
                .is_some_and(|introducer| introducer.line_in.is_some());
            if !live {
                continue;
            }
            if self.nat {
                if let Some(addr) = parse_address(&advertised) {
                    self.punch(addr);
                }
            }
            let mut header = Header::typed("peer");
            header.peer = Some(vec![to.to_hex()]);
            debug!(peer = %to, via = %via, "requesting introduction");
            self.send_on_new_stream(via, header, None);
            peered = true;
        }
        if peered {
            return;
        }

        let Some(peer) = self.registry.get_mut(&to) else {
            return;
        };
        peer.via.clear();
        if peer.retries > 0 {
            warn!(peer = %to, "no introducers left, abandoning");
            return;
        }
        peer.retries = 1;
        warn!(peer = %to, "no live introducers, re-seeking");
        self.open_seek(to);
    }

    /// An empty frame that opens our NAT mapping towards `addr`.
    fn punch(&self, addr: SocketAddr) {
        match messages::encode(&Header::default(), None) {
            Ok(frame) => self.transport.send_to(&frame, addr),
            Err(e) => debug!(addr = %addr, error = %e, "failed to encode hole punch"),
        }
    }

    // ------------------------------------------------------------------------
    // Seek
    // ------------------------------------------------------------------------

    /// Look `to` up through the DHT in the background.
    fn open_seek(&mut self, to: Hashname) {
        if to == self.hashname {
            return;
        }
        let Some(rpc) = self.rpc() else {
            return;
        };
        let seeds = self.registry.seek_seeds(&to);
        let Some(peer) = self.registry.get_mut(&to) else {
            return;
        };
        if peer.seeking {
            trace!(peer = %to, "seek already running");
            return;
        }
        peer.seeking = true;

        let own = self.hashname;
        let timeout = self.config.request_timeout;
        let cmd_tx = rpc.cmd_tx.clone();
        debug!(peer = %to, seeds = seeds.len(), "seeking");
        tokio::spawn(async move {
            let outcome = dht::seek(Arc::new(rpc), own, to, seeds, timeout).await;
            let _ = cmd_tx
                .send(Command::SeekFinished {
                    target: to,
                    outcome,
                })
                .await;
        });
    }

    fn seek_finished(&mut self, target: Hashname, outcome: SeekOutcome) {
        let Some(peer) = self.registry.get_mut(&target) else {
            return;
        };
        peer.seeking = false;
        debug!(peer = %target, found = outcome.found, asked = outcome.asked.len(), "seek finished");
        if peer.via.is_empty() {
            warn!(peer = %target, "seek failed");
            return;
        }
        self.send(target, None);
    }
}

// ============================================================================
// Test Support
// ============================================================================

#[cfg(test)]
pub(crate) struct TestActor {
    pub(crate) actor: NodeActor,
    pub(crate) cmd_tx: mpsc::Sender<Command>,
    pub(crate) cmd_rx: mpsc::Receiver<Command>,
}

/// An actor on a loopback socket that is driven by calling its methods
/// directly instead of running the loop.
#[cfg(test)]
pub(crate) async fn test_actor(key: usize) -> TestActor {
    let config = NodeConfig::with_bind("127.0.0.1:0".parse().unwrap());
    let transport = Transport::bind(config.bind).await.unwrap();
    let keypair = crate::identity::test_keypair(key);
    let address = format_address(&keypair.hashname("testnet"), transport.local_addr());
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let actor = NodeActor::new(
        "testnet".to_string(),
        keypair,
        address,
        transport,
        config,
        cmd_tx.downgrade(),
    );
    TestActor {
        actor,
        cmd_tx,
        cmd_rx,
    }
}
