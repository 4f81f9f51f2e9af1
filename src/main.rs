use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use telemesh::{DEFAULT_KEY_BITS, Keypair, Node, NodeConfig};

/// Port kept free for local tooling.
const RESERVED_PORT: u16 = 42420;

#[derive(Clone, Debug)]
struct SeedPeer {
    addr: SocketAddr,
    pubkey_path: PathBuf,
}

impl FromStr for SeedPeer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr_part, key_part) = s
            .split_once('/')
            .context("seed must include a public key file (format: IP:PORT/PUBKEY_PATH)")?;
        let addr: SocketAddr = addr_part.parse().context("invalid seed socket address")?;
        if key_part.is_empty() {
            bail!("seed public key path is empty");
        }
        Ok(SeedPeer {
            addr,
            pubkey_path: PathBuf::from(key_part),
        })
    }
}

#[derive(Parser, Debug)]
#[command(name = "telemesh")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Network name; hashnames are scoped to it.
    #[arg(short, long, default_value = "telehash.org")]
    network: String,

    #[arg(short, long, default_value = "42424")]
    port: u16,

    /// Public IP to advertise. Without it the node runs in NAT mode.
    #[arg(long)]
    ip: Option<IpAddr>,

    /// Run in NAT mode even with a public IP.
    #[arg(long)]
    natted: bool,

    /// Private key PEM; generated (with --pubkey) when missing.
    #[arg(long, default_value = "seed.key")]
    key: PathBuf,

    #[arg(long, default_value = "seed.pub")]
    pubkey: PathBuf,

    /// Seed to join through (repeatable).
    #[arg(short = 's', long = "seed", value_name = "IP:PORT/PUBKEY_PATH")]
    seeds: Vec<SeedPeer>,

    #[arg(long, default_value = "60")]
    status_interval: u64,

    /// Debug logging.
    #[arg(short, long)]
    verbose: bool,
}

fn load_or_generate_keypair(private: &Path, public: &Path) -> Result<Keypair> {
    if private.exists() && public.exists() {
        let private_pem = std::fs::read_to_string(private)
            .with_context(|| format!("failed to read {}", private.display()))?;
        let public_pem = std::fs::read_to_string(public)
            .with_context(|| format!("failed to read {}", public.display()))?;
        return Keypair::from_pem(&public_pem, &private_pem).context("invalid key files");
    }

    info!(bits = DEFAULT_KEY_BITS, "generating keypair");
    let keypair = Keypair::generate(DEFAULT_KEY_BITS).context("key generation failed")?;
    let private_pem = keypair.private_pem().context("failed to encode private key")?;
    std::fs::write(private, private_pem)
        .with_context(|| format!("failed to write {}", private.display()))?;
    std::fs::write(public, keypair.public_pem())
        .with_context(|| format!("failed to write {}", public.display()))?;
    Ok(keypair)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    if args.port == RESERVED_PORT {
        bail!("port {} is reserved", RESERVED_PORT);
    }

    let keypair = load_or_generate_keypair(&args.key, &args.pubkey)?;
    let config = NodeConfig {
        bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), args.port),
        public_ip: args.ip,
        natted: args.natted,
        ..NodeConfig::default()
    };
    let node = Node::bind(&args.network, keypair, config).await?;

    let info = serde_json::json!({
        "hashname": node.hashname().to_hex(),
        "address": node.address(),
        "pubkey": node.public_pem(),
    });
    println!("{}", serde_json::to_string_pretty(&info)?);

    for seed in &args.seeds {
        let pem = std::fs::read_to_string(&seed.pubkey_path)
            .with_context(|| format!("failed to read {}", seed.pubkey_path.display()))?;
        let hashname = node.add_seed(seed.addr.ip(), seed.addr.port(), &pem).await?;
        info!(seed = %hashname, addr = %seed.addr, "seed added");
    }
    if !args.seeds.is_empty() {
        match node.online().await {
            Ok(()) => info!("online"),
            Err(e) => warn!(error = %e, "failed to go online"),
        }
    }

    let mut interval = time::interval(Duration::from_secs(args.status_interval.max(1)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                match node.peers().await {
                    Ok(peers) => {
                        let lines = peers
                            .iter()
                            .filter(|p| p.state == telemesh::PeerState::LineEstablished)
                            .count();
                        info!(known = peers.len(), lines, "status");
                    }
                    Err(e) => {
                        warn!(error = %e, "node stopped");
                        break;
                    }
                }
            }
        }
    }

    node.shutdown().await;
    Ok(())
}
