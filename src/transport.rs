//! # UDP Transport
//!
//! One UDP socket carries every frame.
//!
//! - **Outbound**: [`Transport::send_to`] queues the frame on a bounded
//!   channel and returns at once; a writer task awaits the socket for each
//!   frame. A full queue drops the frame, which the stream layer recovers
//!   from by retransmission.
//! - **Inbound**: a dedicated task reads datagrams and forwards them to the
//!   actor as [`Datagram`]s.

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Largest datagram we accept.
pub const MAX_DATAGRAM: usize = 64 * 1024;

/// Frames waiting for the writer task before new ones are dropped.
pub const OUTBOUND_QUEUE: usize = 1024;

#[derive(Debug)]
pub struct Datagram {
    pub bytes: Vec<u8>,
    pub from: SocketAddr,
}

#[derive(Clone, Debug)]
pub struct Transport {
    socket: Arc<UdpSocket>,
    outbound: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    local_addr: SocketAddr,
}

impl Transport {
    /// Bind the socket and start its writer task. The writer exits once
    /// every clone of the transport is dropped.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE);
        tokio::spawn(write_loop(socket.clone(), rx));
        Ok(Self {
            socket,
            outbound,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Queue `frame` for `addr` without waiting.
    pub fn send_to(&self, frame: &[u8], addr: SocketAddr) {
        match self.outbound.try_send((frame.to_vec(), addr)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(addr = %addr, "outbound queue full, dropping frame");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(addr = %addr, "writer stopped, dropping frame");
            }
        }
    }

    /// Forward every inbound datagram to `tx` until the receiver is dropped.
    pub fn spawn_receiver(&self, tx: mpsc::Sender<Datagram>) -> JoinHandle<()> {
        let socket = self.socket.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let (len, from) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        // ICMP port-unreachable surfaces here on some platforms.
                        debug!(error = %e, "receive failed");
                        continue;
                    }
                };
                let datagram = Datagram {
                    bytes: buf[..len].to_vec(),
                    from,
                };
                if tx.send(datagram).await.is_err() {
                    trace!("node stopped, receive task exiting");
                    break;
                }
            }
        })
    }
}

async fn write_loop(socket: Arc<UdpSocket>, mut rx: mpsc::Receiver<(Vec<u8>, SocketAddr)>) {
    while let Some((frame, addr)) = rx.recv().await {
        match socket.send_to(&frame, addr).await {
            Ok(sent) => trace!(addr = %addr, len = sent, "sent frame"),
            Err(e) => debug!(addr = %addr, error = %e, "send failed"),
        }
    }
    trace!("transport dropped, writer exiting");
}

/// The local interface address used for outbound traffic, found by
/// "connecting" a UDP socket. No packet is sent.
pub fn discover_local_ip() -> Option<IpAddr> {
    let probe = |bind: &str, target: &str| -> io::Result<IpAddr> {
        let socket = StdUdpSocket::bind(bind)?;
        socket.connect(target)?;
        Ok(socket.local_addr()?.ip())
    };
    match probe("0.0.0.0:0", "8.8.8.8:80") {
        Ok(ip) if !ip.is_loopback() && !ip.is_unspecified() => Some(ip),
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "could not determine local address");
            None
        }
    }
}
