//! Integration tests for multi-node overlay behaviour: introductions between
//! peers that only share a seed, and TCP tunnels over `sock` streams.
//!
//! Run with verbose output: RUST_LOG=debug cargo test --test overlay -- --nocapture

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Once, OnceLock};
use std::time::Duration;

use telemesh::{Header, Keypair, Node, NodeConfig, PeerState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const NETWORK: &str = "testnet";
const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const TEST_TIMEOUT: Duration = Duration::from_secs(15);

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("info")
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

fn keypair(index: usize) -> Keypair {
    static KEYS: OnceLock<Vec<Keypair>> = OnceLock::new();
    KEYS.get_or_init(|| {
        (0..3)
            .map(|_| Keypair::generate(1024).expect("key generation failed"))
            .collect()
    })[index]
        .clone()
}

/// A seed plus two nodes that joined through it and know nothing of each other.
struct Trio {
    seed: Node,
    alice: Node,
    bob: Node,
}

async fn trio() -> Trio {
    init_tracing();
    let config = || NodeConfig::with_bind(SocketAddr::new(LOOPBACK, 0));
    let seed = Node::bind(NETWORK, keypair(0), config()).await.unwrap();
    let alice = Node::bind(NETWORK, keypair(1), config()).await.unwrap();
    let bob = Node::bind(NETWORK, keypair(2), config()).await.unwrap();

    for node in [&bob, &alice] {
        node.add_seed(LOOPBACK, seed.local_addr().port(), seed.public_pem())
            .await
            .unwrap();
        timeout(TEST_TIMEOUT, node.online())
            .await
            .expect("online timed out")
            .expect("online failed");
    }
    Trio { seed, alice, bob }
}

async fn spawn_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind((LOOPBACK, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn peers_sharing_a_seed_are_introduced() {
    let Trio { seed, alice, bob } = trio().await;

    let before = alice.peers().await.unwrap();
    assert!(
        before
            .iter()
            .all(|p| p.hashname != bob.hashname() || p.state != PeerState::LineEstablished),
        "no line to bob yet"
    );

    let mut incoming = bob.listen("hello").await.unwrap();
    let stream = alice.stream(bob.hashname()).await.unwrap();
    stream
        .send(Header::typed("hello"), Some(b"hi bob".to_vec()))
        .await
        .unwrap();

    let mut handle = timeout(TEST_TIMEOUT, incoming.recv())
        .await
        .expect("introduction timed out")
        .expect("listener closed");
    assert_eq!(handle.peer(), alice.hashname());
    let first = handle.recv().await.unwrap();
    assert_eq!(first.header.kind.as_deref(), Some("hello"));
    assert_eq!(first.body.as_deref(), Some(&b"hi bob"[..]));

    // Both ends now hold a line; the seed knows about both.
    let alice_view = alice.peers().await.unwrap();
    let record = alice_view.iter().find(|p| p.hashname == bob.hashname()).unwrap();
    assert_eq!(record.state, PeerState::LineEstablished);
    assert_eq!(record.address, Some(bob.local_addr()));

    let seed_view = seed.peers().await.unwrap();
    for hashname in [alice.hashname(), bob.hashname()] {
        assert!(seed_view.iter().any(|p| p.hashname == hashname));
    }
}

#[tokio::test]
async fn tunnel_carries_tcp_through_allowed_peer() {
    let Trio { alice, bob, .. } = trio().await;
    let echo = spawn_tcp_echo().await;

    bob.set_proxy_policy(|host: &str, _port: u16, _from: &telemesh::Hashname| host == "127.0.0.1")
        .await
        .unwrap();
    let entry = alice
        .tunnel(bob.hashname(), &echo.to_string(), SocketAddr::new(LOOPBACK, 0))
        .await
        .unwrap();

    let mut client = TcpStream::connect(entry).await.unwrap();
    client.write_all(b"through the overlay").await.unwrap();

    let mut buf = vec![0u8; 19];
    timeout(TEST_TIMEOUT, client.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&buf, b"through the overlay");

    // Larger than one frame: split into chunks and reassembled in order.
    let payload: Vec<u8> = (0..8_000u32).map(|i| (i % 251) as u8).collect();
    client.write_all(&payload).await.unwrap();
    let mut back = vec![0u8; payload.len()];
    timeout(TEST_TIMEOUT, client.read_exact(&mut back))
        .await
        .expect("bulk echo timed out")
        .unwrap();
    assert_eq!(back, payload);
}

#[tokio::test]
async fn tunnel_to_denying_peer_is_closed() {
    let Trio { alice, bob, .. } = trio().await;
    let echo = spawn_tcp_echo().await;

    let entry = alice
        .tunnel(bob.hashname(), &echo.to_string(), SocketAddr::new(LOOPBACK, 0))
        .await
        .unwrap();

    let mut client = TcpStream::connect(entry).await.unwrap();
    let mut buf = [0u8; 16];
    let n = timeout(TEST_TIMEOUT, client.read(&mut buf))
        .await
        .expect("denial timed out")
        .unwrap_or(0);
    assert_eq!(n, 0, "connection closed without data");
}

#[tokio::test]
async fn tunnel_rejects_invalid_target() {
    let Trio { alice, bob, .. } = trio().await;
    for target in ["nowhere", "127.0.0.1:0", ":80"] {
        let result = alice
            .tunnel(bob.hashname(), target, SocketAddr::new(LOOPBACK, 0))
            .await;
        assert!(result.is_err(), "{:?} must be rejected", target);
    }
}
