//! # Socket Proxy
//!
//! A `sock` stream carries a TCP connection across a line.
//!
//! - **Inbound**: a peer opens a stream with `{type:"sock", sock:"ip:port"}`.
//!   If the proxy policy allows it, the node connects to that address and
//!   bridges the TCP connection with the stream.
//! - **Outbound**: [`Node::tunnel`](crate::node::Node::tunnel) listens locally
//!   and, per client, opens a `sock` stream through a chosen peer.
//!
//! Stream bodies carry raw TCP bytes. TCP EOF ends the stream; an `end` frame
//! shuts down the TCP write half.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::identity::Hashname;
use crate::messages::{Header, Packet};
use crate::node::{NodeActor, NodeRpc};
use crate::stream::StreamHandle;

/// Upper bound for one frame's header plus body.
pub const MAX_FRAME: usize = 1024;

/// Frames in flight before reading more from TCP.
const UNCONFIRMED_MAX: usize = 50;

/// Decides whether a peer may reach `ip:port`.
pub type ProxyPolicy = Arc<dyn Fn(&str, u16, &Hashname) -> bool + Send + Sync>;

pub fn deny_all() -> ProxyPolicy {
    Arc::new(|_: &str, _: u16, _: &Hashname| false)
}

/// Split `ip:port`. The port must be in `1..=65535`.
pub fn parse_sock(value: &str) -> Option<(String, u16)> {
    let (host, port) = value.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    if port == 0 {
        return None;
    }
    Some((host.to_string(), port))
}

/// Body bytes that fit in one frame next to `header`.
pub fn chunk_limit(header: &Header) -> usize {
    let header_len = serde_json::to_vec(header).map(|json| json.len()).unwrap_or(MAX_FRAME);
    MAX_FRAME.saturating_sub(header_len).max(1)
}

/// Pump bytes both ways between a stream and a TCP connection until both
/// directions finish.
pub async fn bridge(handle: StreamHandle, tcp: TcpStream) {
    let (sender, mut rx) = handle.into_parts();
    let (mut reader, mut writer) = tcp.into_split();
    let peer = sender.peer();

    let upstream = async {
        let mut buf = vec![0u8; chunk_limit(&Header::default())];
        let mut pending: VecDeque<oneshot::Receiver<()>> = VecDeque::new();
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => {
                    trace!(peer = %peer, "tcp eof");
                    let _ = sender.end().await;
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "tcp read failed");
                    let _ = sender
                        .send(Header::ending(Some(e.to_string().as_str())), None)
                        .await;
                    return;
                }
            };
            while pending.len() >= UNCONFIRMED_MAX {
                let Some(oldest) = pending.pop_front() else {
                    break;
                };
                if oldest.await.is_err() {
                    return;
                }
            }
            match sender.send_tracked(Header::default(), Some(buf[..n].to_vec())).await {
                Ok(done) => pending.push_back(done),
                Err(_) => return,
            }
        }
    };

    let downstream = async {
        while let Some(packet) = rx.recv().await {
            if let Some(body) = packet.body.as_deref() {
                if let Err(e) = writer.write_all(body).await {
                    debug!(peer = %peer, error = %e, "tcp write failed");
                    break;
                }
            }
            if packet.header.is_end() {
                if let Some(err) = packet.header.err.as_deref() {
                    debug!(peer = %peer, error = %err, "remote ended with error");
                }
                break;
            }
        }
        let _ = writer.shutdown().await;
    };

    tokio::join!(upstream, downstream);
}

async fn connect_and_bridge(handle: StreamHandle, host: String, port: u16) {
    match TcpStream::connect((host.as_str(), port)).await {
        Ok(tcp) => {
            debug!(peer = %handle.peer(), host = %host, port, "proxy connected");
            bridge(handle, tcp).await;
        }
        Err(e) => {
            warn!(peer = %handle.peer(), host = %host, port, error = %e, "proxy connect failed");
            let _ = handle.send(Header::ending(Some(e.to_string().as_str())), None).await;
        }
    }
}

/// Accept TCP clients and carry each one to `target` through `to`.
pub(crate) async fn serve_tunnel(listener: TcpListener, rpc: NodeRpc, to: Hashname, target: String) {
    loop {
        let (client, from) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "tunnel accept failed");
                return;
            }
        };
        let handle = match rpc.open(to, false, true).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(peer = %to, error = %e, "tunnel closed");
                return;
            }
        };
        debug!(peer = %to, client = %from, target = %target, "tunnel client");
        let mut header = Header::typed("sock");
        header.sock = Some(target.clone());
        tokio::spawn(async move {
            if handle.send(header, None).await.is_ok() {
                bridge(handle, client).await;
            }
        });
    }
}

impl NodeActor {
    /// `sock` request: bridge the stream to a TCP connection if allowed.
    pub(crate) fn in_sock(&mut self, from: Hashname, id: Hashname, packet: Packet) {
        let Some((host, port)) = packet.header.sock.as_deref().and_then(parse_sock) else {
            warn!(peer = %from, sock = ?packet.header.sock, "invalid sock address");
            self.stream_send(from, id, Some(Header::ending(Some("invalid address"))), None, None);
            return;
        };
        if !(self.proxy_policy)(&host, port, &from) {
            debug!(peer = %from, host = %host, port, "sock denied");
            self.stream_send(from, id, Some(Header::ending(Some("denied"))), None, None);
            return;
        }
        let Some(handle) = self.attach(from, id, None) else {
            return;
        };
        tokio::spawn(connect_and_bridge(handle, host, port));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;
    use crate::identity::test_keypair;
    use crate::node::test_actor;
    use crate::stream::{Handler, Stream};

    #[test]
    fn sock_addresses() {
        assert_eq!(parse_sock("127.0.0.1:80"), Some(("127.0.0.1".to_string(), 80)));
        assert_eq!(parse_sock("example.org:65535"), Some(("example.org".to_string(), 65535)));
        assert_eq!(parse_sock("127.0.0.1:0"), None);
        assert_eq!(parse_sock("127.0.0.1:65536"), None);
        assert_eq!(parse_sock("127.0.0.1"), None);
        assert_eq!(parse_sock(":80"), None);
    }

    #[test]
    fn chunks_leave_room_for_the_header() {
        assert_eq!(chunk_limit(&Header::default()), MAX_FRAME - 2);
        let mut header = Header::default();
        header.extra.insert("pad".to_string(), "x".repeat(2 * MAX_FRAME).into());
        assert_eq!(chunk_limit(&header), 1);
    }

    async fn sock_request(policy: Option<ProxyPolicy>, sock: &str) -> (crate::node::TestActor, Hashname, Hashname) {
        let mut test = test_actor(0).await;
        let actor = &mut test.actor;
        if let Some(policy) = policy {
            actor.proxy_policy = policy;
        }
        let keypair = test_keypair(1);
        let friend = keypair.hashname(&actor.network);
        actor.registry.seen(friend);
        let peer = actor.registry.get_mut(&friend).unwrap();
        peer.pubkey = Some(keypair.public());
        peer.address = Some("127.0.0.1:5001".parse().unwrap());
        peer.line_in = Some(Hashname::random());
        peer.secret_out = Some(crypto::random_secret());
        let id = Hashname::random();
        peer.streams.insert(id, Stream::new(id, Handler::Unassigned));

        let mut header = Header::typed("sock");
        header.sock = Some(sock.to_string());
        actor.in_sock(friend, id, Packet::new(header, None));
        (test, friend, id)
    }

    #[tokio::test]
    async fn invalid_address_ends_stream() {
        let allow_all: ProxyPolicy = Arc::new(|_: &str, _: u16, _: &Hashname| true);
        let (mut test, friend, id) = sock_request(Some(allow_all), "nowhere").await;
        let stream = test.actor.stream_mut(&friend, &id).unwrap();
        assert!(stream.is_ended());
        assert!(matches!(stream.handler, Handler::Unassigned));
    }

    #[tokio::test]
    async fn default_policy_denies() {
        let (mut test, friend, id) = sock_request(None, "127.0.0.1:80").await;
        assert!(test.actor.stream_mut(&friend, &id).unwrap().is_ended());
    }

    #[tokio::test]
    async fn allowed_request_attaches_a_bridge() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();
        let seen = Arc::new(std::sync::Mutex::new(None));
        let record = seen.clone();
        let policy: ProxyPolicy = Arc::new(move |host: &str, port: u16, who: &Hashname| {
            *record.lock().unwrap() = Some((host.to_string(), port, *who));
            true
        });

        let (mut test, friend, id) = sock_request(Some(policy), &target).await;
        let stream = test.actor.stream_mut(&friend, &id).unwrap();
        assert!(!stream.is_ended());
        assert!(matches!(stream.handler, Handler::App(_)));

        let (host, port, who) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(format!("{}:{}", host, port), target);
        assert_eq!(who, friend);

        let accepted = tokio::time::timeout(std::time::Duration::from_secs(2), listener.accept()).await;
        assert!(accepted.unwrap().is_ok(), "proxy dialled the target");
    }
}
