//! Discord Scraper - Channel History to CSV
//!
//! A Discord bot that keeps one CSV ledger per server. It answers Discord
//! interactions over HTTP and offers:
//!
//! - `/scrap` - rebuild the server's CSV from the whole channel history and send it
//! - `/download` - send the server's CSV
//! - `/from_file` - append the rows of an uploaded CSV (its first row is dropped)
//! - "Add to CSV" - message context menu appending one message with an optional note
//!
//! Point the application's Interactions Endpoint URL at `--path` on this
//! server. The bot token is read from `TOKEN`, either from the environment
//! or from a `.env` file.
//!
//! # Usage
//!
//! ```bash
//! # Serve on the default port, ledgers in the current directory
//! TOKEN=... discord-scraper
//!
//! # Custom port and ledger directory
//! discord-scraper --port 3000 --ledger-dir /var/lib/ledgers
//!
//! # Store scraped history oldest message first
//! discord-scraper --oldest-first
//! ```

mod commands;
mod discord;
mod interaction;
mod server;
mod startup;
#[cfg(test)]
mod test_support;

use anyhow::Context;
use clap::Parser;
use commands::LedgerCommands;
use csv_ledger::LedgerStore;
use discord::{DEFAULT_API_BASE, DiscordClient, parse_public_key};
use server::AppState;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Discord bot scraping channels into per-server CSV ledgers.
#[derive(Parser, Debug)]
#[command(name = "discord-scraper")]
#[command(about = "Scrapes Discord channels into per-server CSV files")]
struct Args {
    /// Discord bot token.
    #[arg(long, env = "TOKEN", hide_env_values = true)]
    token: String,

    /// Port to listen on for interactions.
    #[arg(short, long, env = "SCRAPER_PORT", default_value = "8080")]
    port: u16,

    /// Host to bind to.
    #[arg(long, env = "SCRAPER_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Path Discord posts interactions to.
    #[arg(long, env = "SCRAPER_PATH", default_value = "/interactions")]
    path: String,

    /// Directory holding the `<server_id>.csv` ledgers.
    #[arg(short, long, env = "SCRAPER_LEDGER_DIR", default_value = ".")]
    ledger_dir: PathBuf,

    /// Discord REST API base URL.
    #[arg(long, env = "SCRAPER_API_BASE", default_value = DEFAULT_API_BASE)]
    api_base: String,

    /// Application public key (hex). Defaults to the key Discord reports.
    #[arg(long, env = "SCRAPER_PUBLIC_KEY")]
    public_key: Option<String>,

    /// Store scraped history oldest message first instead of newest first.
    #[arg(long, env = "SCRAPER_OLDEST_FIRST")]
    oldest_first: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before clap reads the environment
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    // One client for the whole process
    let discord = DiscordClient::new(&args.token, &args.api_base)?;
    let application = discord
        .current_application()
        .await
        .context("failed to load the Discord application")?;
    info!(application_id = application.id, "connected to Discord");

    let public_key = args.public_key.as_deref().unwrap_or(&application.verify_key);
    let verifying_key = parse_public_key(public_key)?;

    let store = Arc::new(
        LedgerStore::open(&args.ledger_dir)
            .with_context(|| format!("failed to open {}", args.ledger_dir.display()))?,
    );
    startup::prepare(&discord, application.id, &store).await?;

    let commands = LedgerCommands::new(discord, application.id, store, args.oldest_first);
    let state = Arc::new(AppState {
        verifying_key,
        commands: Arc::new(commands),
    });
    let app = server::router(&args.path, state);

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, path = %args.path, "listening for interactions");

    // Set up SIGTERM handler for graceful shutdown
    let mut sigterm = signal(SignalKind::terminate())?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        })
        .await?;

    info!("shut down");
    Ok(())
}
