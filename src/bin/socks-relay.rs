use anyhow::{Result, bail};
use clap::Parser;
use socks_relay::{Endpoint, Relay, RelayConfig, SessionTable, auth::UserPass};
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A SOCKS5 relay with optional upstream chaining",
    long_about = None
)]
struct Args {
    /// Listener address
    #[arg(short, long, default_value = "127.0.0.1:1080")]
    listen: String,

    /// Username clients must present
    #[arg(short, long)]
    username: Option<String>,

    /// Password clients must present
    #[arg(short, long)]
    password: Option<String>,

    /// Upstream SOCKS5 proxy to tunnel through (IPv4 address:port)
    #[arg(long)]
    upstream: Option<SocketAddrV4>,

    /// Username for the upstream proxy
    #[arg(long, requires = "upstream")]
    upstream_username: Option<String>,

    /// Password for the upstream proxy
    #[arg(long, requires = "upstream")]
    upstream_password: Option<String>,

    /// Maximum concurrent clients, 0 for no limit
    #[arg(long, default_value_t = 0)]
    max_connections: u32,

    /// Idle seconds before a session is reaped, 0 disables reaping
    #[arg(long, default_value_t = 300)]
    session_timeout: u64,

    /// Seconds between reaper sweeps
    #[arg(long, default_value_t = 30)]
    reap_interval: u64,

    /// Seconds to wait for destination and upstream connects
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// credentials pairs a username and password, both or neither
fn credentials(
    username: Option<String>,
    password: Option<String>,
    what: &str,
) -> Result<Option<UserPass>> {
    match (username, password) {
        (Some(u), Some(p)) => Ok(Some(UserPass::new(u, p))),
        (None, None) => Ok(None),
        _ => bail!("[ERR] must provide both {what} username and password (or neither)"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();

    // Initialize tracing subscriber
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt().with_max_level(level).init();

    // Check for auth and grab it if present
    let auth = credentials(args.username, args.password, "listener")?;
    if auth.is_some() {
        info!("Authentication enabled");
    }

    let connect_timeout = Duration::from_secs(args.connect_timeout);

    let upstream = match args.upstream {
        Some(addr) => {
            let creds = credentials(args.upstream_username, args.upstream_password, "upstream")?;
            let endpoint = Endpoint::new(addr)
                .with_auth(creds)
                .with_connect_timeout(connect_timeout);
            endpoint.validate()?;
            Some(endpoint)
        }
        None => None,
    };

    let config = RelayConfig {
        session_timeout: Duration::from_secs(args.session_timeout),
        reap_interval: Duration::from_secs(args.reap_interval),
        ..RelayConfig::default()
    };
    let table = Arc::new(SessionTable::new(config)?);

    // Instantiate relay
    let mut relay = Relay::new(args.listen, table)
        .with_auth(auth)
        .with_max_connections(args.max_connections)
        .with_connect_timeout(connect_timeout)
        .with_upstream(upstream);

    // Run it
    info!("Starting SOCKS5 relay: {}", relay.listen_addr);
    relay.run().await
}
