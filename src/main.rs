use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use overmesh::{Keypair, Node, OverlayConfig};

#[derive(Parser, Debug)]
#[command(name = "overmesh")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind. Must be the address peers reach this node at.
    #[arg(short, long, default_value = "127.0.0.1:0")]
    bind: SocketAddr,

    #[arg(short = 'B', long = "bootstrap", value_name = "IP:PORT")]
    bootstrap: Option<SocketAddr>,

    /// Login for credential-derived identity (requires --password).
    #[arg(short, long, requires = "password")]
    login: Option<String>,

    #[arg(short, long, requires = "login")]
    password: Option<String>,

    /// Directory for the persisted friend table.
    #[arg(long, value_name = "DIR")]
    state_dir: Option<PathBuf>,

    /// Seconds between status log lines.
    #[arg(short, long, default_value = "60")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    if args.status_interval == 0 {
        bail!("--status-interval must be positive");
    }

    let keypair = match (&args.login, &args.password) {
        (Some(login), Some(password)) => Keypair::from_credentials(login, password),
        _ => {
            warn!("no credentials given, using an ephemeral identity");
            Keypair::generate()
        }
    };
    let config = OverlayConfig {
        state_dir: args.state_dir.clone(),
        ..OverlayConfig::default()
    };

    let node = Node::bind_with_config(&args.bind.to_string(), keypair, config).await?;
    info!("Node identity: {}", node.identity_hex());

    if let Some(peer) = args.bootstrap {
        info!("Bootstrapping from {}", peer);
        if let Err(e) = node.bootstrap(&peer.to_string()).await {
            warn!(error = %e, "Bootstrap failed");
        }
    }

    let mut interval = time::interval(Duration::from_secs(args.status_interval));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                match node.friend_count().await {
                    Ok(friends) => info!(friends, addr = %node.local_addr(), "status"),
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
