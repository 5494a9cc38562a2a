//! tabsync: run simulated tabs of one origin against a realtime backend
//!
//! Every tab gets its own realtime connection, token manager and session
//! monitor. Tabs share one storage file and one broadcast hub, so logins,
//! refreshes and logouts propagate between them the way they do between
//! browser tabs.
//!
//! Usage:
//!   tabsync --ws-url wss://rt.example.com/ws --api-url https://api.example.com
//!   tabsync --config tabsync.jsonc --tabs 3 --channel lobby --channel news
//!   tabsync --token <jwt> --refresh-token <rt> --user 42   # seed a login

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use tabsync_core::config::RealtimeConfig;
use tabsync_core::{
    BroadcastHub, FileStorage, HttpApi, MemoryStateStore, SyncConfig, SystemClock, Tab, TabDeps,
};
use tabsync_transport::{WebSocketConfig, WebSocketTransport};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tabsync", about = "Multi-tab realtime connectivity and session sync")]
struct Cli {
    /// JSONC config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Realtime provider socket URL (overrides the config file)
    #[arg(long)]
    ws_url: Option<String>,

    /// Backend publish trigger URL
    #[arg(long)]
    trigger_url: Option<String>,

    /// Backend API base URL for token refresh and logout
    #[arg(long)]
    api_url: Option<String>,

    /// Number of simulated tabs
    #[arg(long, default_value = "1")]
    tabs: usize,

    /// Channel every tab subscribes to (repeatable)
    #[arg(long)]
    channel: Vec<String>,

    /// Access token to log in with
    #[arg(long)]
    token: Option<String>,

    /// Refresh token paired with --token
    #[arg(long, requires = "token")]
    refresh_token: Option<String>,

    /// User id for the seeded login
    #[arg(long, requires = "token")]
    user: Option<String>,

    /// Shared storage file (defaults to the user data dir)
    #[arg(long)]
    storage: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Write logs to a file (defaults to <data dir>/tabsync/logs/tabsync.log if no path given)
    #[arg(long, default_missing_value = "DEFAULT", num_args = 0..=1)]
    log_file: Option<String>,
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let Some(log_file_arg) = &cli.log_file else {
        if cli.json_logs {
            tracing_subscriber::fmt().json().with_env_filter(filter).init();
        } else {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        return Ok(());
    };

    let log_path = if log_file_arg == "DEFAULT" {
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("tabsync/logs/tabsync.log")
    } else {
        PathBuf::from(log_file_arg)
    };
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open log file {}", log_path.display()))?;

    let writer = std::sync::Mutex::new(file);
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(writer)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
    }
    eprintln!("Logging to {}", log_path.display());
    Ok(())
}

/// Config file (if any), then environment, then command-line flags.
fn load_config(cli: &Cli) -> anyhow::Result<SyncConfig> {
    let mut config = match &cli.config {
        Some(path) => SyncConfig::load(path)?,
        None => {
            let mut config = SyncConfig::default();
            config.apply_env();
            config
        }
    };

    if let Some(url) = &cli.ws_url {
        match &mut config.realtime {
            Some(realtime) => realtime.url = url.clone(),
            None => {
                config.realtime = Some(RealtimeConfig {
                    url: url.clone(),
                    trigger_url: None,
                })
            }
        }
    }
    if let Some(trigger) = &cli.trigger_url {
        match &mut config.realtime {
            Some(realtime) => realtime.trigger_url = Some(trigger.clone()),
            None => warn!("--trigger-url ignored without a realtime URL"),
        }
    }
    if let Some(api) = &cli.api_url {
        config.api_url = Some(api.clone());
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;
    let config = load_config(&cli)?;

    let storage_path = cli.storage.clone().unwrap_or_else(FileStorage::default_path);
    let storage = FileStorage::open(&storage_path)?;
    let hub = BroadcastHub::new();
    let api = Arc::new(HttpApi::from_config(&config));
    let ws_url = config.realtime.as_ref().map(|r| r.url.clone()).unwrap_or_default();

    println!();
    println!("  tabsync {}", env!("CARGO_PKG_VERSION"));
    println!();
    match &config.realtime {
        Some(realtime) => println!("  Realtime:   {}", realtime.url),
        None => println!("  Realtime:   (not configured, degraded mode)"),
    }
    println!("  API:        {}", config.api_url.as_deref().unwrap_or("(not configured)"));
    println!("  Storage:    {}", storage.path().display());
    println!("  Tabs:       {}", cli.tabs);
    println!();

    let mut tabs = Vec::with_capacity(cli.tabs);
    for index in 0..cli.tabs.max(1) {
        let transport = Arc::new(WebSocketTransport::new(WebSocketConfig::new(ws_url.clone())));
        let tab = Tab::new(
            config.clone(),
            TabDeps {
                storage: Arc::new(storage.clone()),
                hub: Some(hub.clone()),
                transport,
                api: api.clone(),
                publisher: api.clone(),
                state: Arc::new(MemoryStateStore::new()),
                clock: Arc::new(SystemClock),
            },
        );
        let id = tab.id().to_string();
        tab.on_user_event(move |event| {
            info!(tab = %id, event = %event.event, "user event: {}", event.data);
        });
        tab.start().await?;
        for channel in &cli.channel {
            let id = tab.id().to_string();
            tab.connection()
                .subscribe(channel, move |event| {
                    info!(
                        tab = %id,
                        channel = %event.channel,
                        event = %event.event,
                        "{}",
                        event.data
                    );
                })
                .await?;
        }
        info!("Tab {} ({}) started", index + 1, tab.id());
        tabs.push(tab);
    }

    if let (Some(token), Some(first)) = (&cli.token, tabs.first()) {
        let user = match &cli.user {
            Some(id) => json!({ "id": id }),
            None => json!({}),
        };
        first
            .login(token, cli.refresh_token.clone(), user)
            .await
            .context("login with --token failed")?;
    }

    println!("  Press Ctrl+C to stop.");
    println!();
    tokio::signal::ctrl_c().await?;

    println!();
    println!("  Shutting down...");
    for tab in &tabs {
        let stats = tab.connection().stats();
        info!(
            "Tab {}: {} ({} reconnect attempts, {} queued, {} bound channels)",
            tab.id(),
            stats.state.as_str(),
            stats.reconnect_attempts,
            stats.queue_length,
            stats.bindings.iter().filter(|b| b.bound).count()
        );
        tab.shutdown();
    }
    println!("  Stopped.");
    Ok(())
}
