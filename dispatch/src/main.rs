//! Queue watcher binary.
//!
//! Wires the core loop to file-backed collaborators: tickets are read from
//! a JSON file each poll, notifications print to stdout, and the config
//! document reloads from a JSON file. Deployments swap these for network
//! implementations behind the same traits; the core never knows.
//!
//! # Usage
//!
//! ```bash
//! # Watch a queue file, state under .dispatch-state/
//! dispatch --tickets-file queue.json
//!
//! # With a hot-reloadable config document
//! dispatch --tickets-file queue.json --config-file config.json
//!
//! # One cycle, print the status report, exit
//! dispatch --tickets-file queue.json --once
//! ```
//!
//! The tickets file holds an array of `{"id", "name", "attrs"}` objects;
//! `attrs` maps attribute names (for example `"ServiceId"`) to integers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use dispatch::{
    bootstrap, unix_now, ConfigManager, ConfigSource, Destination, FileStore, NotificationSink,
    PlainRenderer, PollLoop, PollSettings, ResilientStore, StatusReport, Ticket, TicketSource,
};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON file with the currently open tickets
    #[arg(long)]
    tickets_file: PathBuf,

    /// Optional JSON file with the runtime config document
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Directory for persisted state files
    #[arg(long, default_value = ".dispatch-state")]
    state_dir: PathBuf,

    /// Seconds between polls
    #[arg(long, default_value_t = 30.0)]
    interval: f64,

    /// Backoff ceiling in seconds after consecutive fetch failures
    #[arg(long, default_value_t = 300.0)]
    max_backoff: f64,

    /// Minimum seconds between two main-queue notifications
    #[arg(long, default_value_t = 60.0)]
    min_notify_interval: f64,

    /// Run one cycle, print the status report as JSON, exit
    #[arg(long, default_value_t = false)]
    once: bool,
}

/// Reads the open-ticket set from a JSON file on every poll.
struct FileTicketSource {
    path: PathBuf,
}

#[async_trait]
impl TicketSource for FileTicketSource {
    async fn fetch(&self, limit: usize) -> Result<Vec<Ticket>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("read tickets file {}", self.path.display()))?;
        let mut tickets: Vec<Ticket> =
            serde_json::from_str(&raw).context("parse tickets file")?;
        tickets.truncate(limit);
        Ok(tickets)
    }
}

/// Prints rendered notifications to stdout.
struct StdoutSink;

#[async_trait]
impl NotificationSink for StdoutSink {
    async fn deliver(&self, dest: &Destination, text: &str) -> Result<()> {
        println!("--- to {} ---", dest);
        println!("{}", text);
        Ok(())
    }
}

/// Reloads the config document from a JSON file.
///
/// Without a file the source serves an empty version-0 document, which the
/// manager treats as "nothing newer": the env bootstrap stays active and no
/// warnings are logged.
struct FileConfigSource {
    path: Option<PathBuf>,
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn fetch(&self, _force: bool) -> Result<serde_json::Value> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(serde_json::json!({ "version": 0 })),
        };
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("read config file {}", path.display()))?;
        serde_json::from_str(&raw).context("parse config file")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dispatch=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    if !args.tickets_file.exists() {
        bail!("tickets file {} does not exist", args.tickets_file.display());
    }

    let store = FileStore::open(&args.state_dir)
        .with_context(|| format!("open state dir {}", args.state_dir.display()))?;
    let store = ResilientStore::new(Arc::new(store)).shared();

    let initial = bootstrap::from_env();
    info!(
        version = initial.version,
        source = %initial.source,
        routing_rules = initial.routing_rules.len(),
        escalation_enabled = initial.escalation_enabled,
        "bootstrap config loaded"
    );
    let config = ConfigManager::new(initial, Arc::clone(&store), "escalation_state");

    let settings = PollSettings {
        base_interval_s: args.interval,
        max_backoff_s: args.max_backoff,
        min_notify_interval_s: args.min_notify_interval,
        ..PollSettings::default()
    };

    let (stop_tx, stop_rx) = watch::channel(false);

    let mut poll = PollLoop::new(
        Arc::new(FileTicketSource {
            path: args.tickets_file,
        }),
        Arc::new(StdoutSink),
        Arc::new(FileConfigSource {
            path: args.config_file,
        }),
        Arc::new(PlainRenderer::default()),
        Arc::clone(&store),
        config,
        settings,
        stop_rx,
    );

    if args.once {
        poll.cycle(unix_now()).await;
        let report = StatusReport::from_loop(&poll);
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("stop signal received");
            let _ = stop_tx.send(true);
        }
    });

    poll.run().await;
    info!("{}", StatusReport::from_loop(&poll).summary());
    Ok(())
}
