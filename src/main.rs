//! Blackouts - uptime monitoring for home internet connections.
//!
//! Devices report heartbeats to a secret URL; gaps longer than the expected
//! interval are recorded as downtime, owners are mailed about outages, and
//! open pages are told over a websocket to refresh.

mod config;
mod db;
mod devices;
mod heartbeat;
mod mailer;
mod scheduler;
mod tasks;
mod watch;
mod web;

use config::ServerConfig;
use db::Store;
use mailer::Mailer;
use scheduler::Scheduler;
use tasks::Background;
use web::{AppState, Server};

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Pending background jobs before new ones are dropped.
const QUEUE_CAPACITY: usize = 4096;
/// Background jobs running at once.
const WORKERS: usize = 64;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("blackouts=info".parse()?))
        .init();

    let cfg = ServerConfig::load();
    tracing::info!("Starting Blackouts on {}...", cfg.http_addr);
    tracing::info!("Using database at {}", cfg.db_path);

    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let background = Background::start(QUEUE_CAPACITY, WORKERS);
    let mailer = Mailer::from_config(cfg.mail.clone(), background.clone());
    if cfg.mail.smtp_host.is_none() {
        tracing::warn!("SMTP is not configured, letters will only be logged");
    }

    let scheduler = Scheduler::new(store.clone(), mailer.clone(), cfg.limits.clone());
    scheduler.start();

    let state = AppState::new(cfg, store, background, mailer);
    let server = Server::new(state);
    server.start().await?;

    scheduler.stop().await;
    Ok(())
}
