//! Watch Clementine and publish the playing track as a Nostr user status
//! (kind 30315), signed locally or through a NIP-46 remote signer.

mod clementine;
mod config;
mod error;
mod keystore;
mod lifecycle;
mod proto;
mod relay;
mod signer;
mod status;
mod telemetry;
mod watch;

use std::path::PathBuf;

use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use clementine::ClementineRemote;
use config::{Overrides, Settings};
use lifecycle::{install_interrupt_handler, RunFlag};
use relay::RelayPool;
use signer::{npub, resolve_signer, Signer};
use watch::Watcher;

/// Command line interface entry point.
#[derive(Parser, Debug)]
#[command(
    name = "tunestr",
    author,
    version,
    about = "Publish the track playing in Clementine as a Nostr user status"
)]
struct Cli {
    /// Comma separated relays to publish to [default: ws://localhost:8081]
    #[arg(short = 'r', long = "relay", value_name = "URLS")]
    relays: Option<String>,
    /// bunker:// URI, nsec / hex secret key, or key store alias.
    #[arg(short, long)]
    user: Option<String>,
    /// Host running Clementine with the network remote enabled.
    #[arg(short = 'i', long = "ip", value_name = "HOST")]
    host: Option<String>,
    /// Clementine network remote port [default: 5500]
    #[arg(short, long)]
    port: Option<u16>,
    /// Clementine network remote auth code.
    #[arg(short, long, value_name = "CODE")]
    auth: Option<i32>,
    /// Enable debug output.
    #[arg(short, long)]
    debug: bool,
    /// Configuration file; a bare name is looked up in the work dir
    /// [default: tunestr.env]
    #[arg(short, long, value_name = "FILE")]
    conf: Option<PathBuf>,
    /// Base directory for the config file and key store [default: ~/.tunestr]
    #[arg(long, value_name = "DIR")]
    work_dir: Option<PathBuf>,
    /// Key store database [default: keystore.db in the work dir]
    #[arg(long, value_name = "FILE")]
    keystore: Option<PathBuf>,
    /// How often to poll the player [default: 1000]
    #[arg(long, value_name = "MS")]
    poll_interval_ms: Option<u64>,
    /// Remote signer response timeout [default: 30]
    #[arg(long, value_name = "SECS")]
    sign_timeout_secs: Option<u64>,
    /// SOCKS5 proxy (host:port) for relay connections.
    #[arg(long, value_name = "ADDR")]
    tor_socks: Option<String>,
}

impl From<Cli> for Overrides {
    fn from(cli: Cli) -> Self {
        Overrides {
            conf: cli.conf,
            work_dir: cli.work_dir,
            relays: cli.relays,
            user: cli.user,
            clementine_host: cli.host,
            clementine_port: cli.port,
            clementine_auth: cli.auth,
            keystore_file: cli.keystore,
            poll_interval_ms: cli.poll_interval_ms,
            sign_timeout_secs: cli.sign_timeout_secs,
            tor_socks: cli.tor_socks,
            debug: cli.debug,
        }
    }
}

/// Resolve settings and signer, connect to the player and relays, then
/// watch until interrupted.
async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = Settings::load(cli.into())?;
    init_tracing(settings.debug);
    debug!("starting with {settings:?}");

    let signer = resolve_signer(&settings).await?;
    let pubkey = signer.get_public_key().await?;
    info!("publishing statuses as {}", npub(&pubkey));

    let telemetry = ClementineRemote::connect(
        &settings.clementine_host,
        settings.clementine_port,
        settings.clementine_auth,
    )
    .await?;

    let mut pool = RelayPool::new(&settings.relays, settings.tor_socks.clone());
    pool.run();

    let flag = RunFlag::new();
    install_interrupt_handler(flag.clone());
    Watcher::new(telemetry, signer, pool, pubkey, settings.poll_interval)
        .run(&flag)
        .await;
    info!("stopped");
    Ok(())
}

fn init_tracing(debug: bool) {
    let default = if debug { "tunestr=debug" } else { "tunestr=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run(cli).await
}
