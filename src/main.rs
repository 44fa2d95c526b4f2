//! wsconsole CLI - WebSocket console proxy.
//!
//! This is the main binary entry point. See the `wsconsole` library for the
//! protocol engine and event loop.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use wsconsole::protocol::compute_accept_key;
use wsconsole::{Config, ConsoleRelay, DefaultConnector, ProxyServer, StaticTargets};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Set by SIGINT/SIGTERM/SIGHUP; polled by the event loop.
static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

// CLI
#[derive(Parser)]
#[command(name = "wsconsole")]
#[command(version)]
#[command(about = "WebSocket console proxy for container attach streams")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy
    Serve {
        /// Interface to listen on
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,
        /// JSON config file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Announce connects and disconnects to other clients
        #[arg(long)]
        announce: bool,
        /// Extra target as TOKEN=URL (repeatable)
        #[arg(long = "target", value_parser = parse_target)]
        targets: Vec<(String, String)>,
    },
    /// Print the Sec-WebSocket-Accept value for a key
    AcceptKey {
        /// Sec-WebSocket-Key sent by the client
        key: String,
    },
    /// Print the effective configuration as JSON
    Config {
        /// JSON config file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn parse_target(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(token, url)| !token.is_empty() && !url.is_empty())
        .map(|(token, url)| (token.to_string(), url.to_string()))
        .ok_or_else(|| format!("expected TOKEN=URL, got {raw:?}"))
}

/// Run the proxy until a termination signal arrives.
fn serve(mut config: Config) -> Result<()> {
    config.validate()?;

    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::flag;
    flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGHUP, Arc::clone(&SHUTDOWN_FLAG))?;

    let targets = StaticTargets::new(std::mem::take(&mut config.targets));
    if targets.is_empty() {
        log::warn!("No targets configured; every client will be refused");
    }
    let relay =
        ConsoleRelay::new(targets, DefaultConnector).announce_peers(config.announce_peers);

    let mut server = ProxyServer::bind(&config, relay)?;
    println!("wsconsole listening on {}", server.local_addr());

    server.run(&SHUTDOWN_FLAG)?;
    println!("Shutting down...");
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            host,
            port,
            config,
            announce,
            targets,
        } => {
            let mut cfg = Config::load(config.as_deref())?;
            if let Some(host) = host {
                cfg.host = host;
            }
            if let Some(port) = port {
                cfg.port = port;
            }
            cfg.announce_peers |= announce;
            cfg.targets.extend(targets);
            serve(cfg)?;
        }
        Commands::AcceptKey { key } => {
            println!("{}", compute_accept_key(key.trim()));
        }
        Commands::Config { config } => {
            let cfg = Config::load(config.as_deref())?;
            println!(
                "{}",
                serde_json::to_string_pretty(&cfg).context("Failed to serialize config")?
            );
        }
    }

    Ok(())
}
