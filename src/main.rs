//! Dispatch Worker - batching and driver assignment for multi-order deliveries
//!
//! Connects to NATS, answers `dispatch.*` requests and publishes batch events.

mod cli;
mod config;
mod db;
mod defaults;
mod error;
mod handlers;
mod services;
mod types;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::cli::{Cli, Command};
use crate::config::Config;
use crate::db::postgres::PgStore;
use crate::handlers::DispatchEngine;
use crate::services::events::{EventPublisher, NatsEventPublisher};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs directory - use LOGS_DIR env var or default to ../logs (relative to worker)
    let logs_dir = std::env::var("LOGS_DIR")
        .unwrap_or_else(|_| "../logs".to_string());
    std::fs::create_dir_all(&logs_dir).ok();

    // File appender for persistent logs (daily rotation)
    let file_appender = RollingFileAppender::new(
        Rotation::DAILY,
        &logs_dir,
        "dispatch-worker.log",
    );
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,dispatch_worker=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())  // stdout
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))  // file
        .init();

    let config = Config::from_env()?;
    info!("Configuration loaded");

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Migrate => {
            let pool = connect_database(&config).await?;
            db::run_migrations(&pool).await
        }
        Command::Sweep => {
            let engine = build_engine(&config, false).await?;
            let report = handlers::sweep::run_sweep(&engine, Uuid::new_v4()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Rebalance { dry_run } => {
            let engine = build_engine(&config, false).await?;
            let output = if dry_run {
                serde_json::to_string_pretty(&engine.balancer.audit().await?)?
            } else {
                serde_json::to_string_pretty(&engine.balancer.rebalance().await?)?
            };
            println!("{}", output);
            Ok(())
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    info!("Starting Dispatch Worker...");

    let client = connect_nats(&config).await?;
    let engine = build_engine_with(&config, client.clone(), true).await?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received"),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
        signal.cancel();
    });

    let handler_result = handlers::start_handlers(client.clone(), engine, &config, shutdown).await;
    if let Err(e) = handler_result {
        error!("Handler error: {}", e);
        return Err(e);
    }

    // Push out buffered events before exiting
    if let Err(e) = client.flush().await {
        warn!("Failed to flush NATS client: {}", e);
    }
    info!("Dispatch Worker stopped");
    Ok(())
}

/// Engine for one-shot commands
async fn build_engine(config: &Config, migrate: bool) -> Result<DispatchEngine> {
    let client = connect_nats(config).await?;
    build_engine_with(config, client, migrate).await
}

async fn build_engine_with(config: &Config, client: async_nats::Client, migrate: bool) -> Result<DispatchEngine> {
    let events: Arc<dyn EventPublisher> = Arc::new(NatsEventPublisher::new(client));

    let pool = connect_database(config).await?;
    if migrate {
        db::run_migrations(&pool).await?;
    }
    let engine = DispatchEngine::new(Arc::new(PgStore::new(pool)), events, config.dispatch.clone());
    Ok(engine)
}

async fn connect_database(config: &Config) -> Result<sqlx::PgPool> {
    let pool = db::create_pool(&config.database_url).await.context("Failed to connect to PostgreSQL")?;
    info!("Connected to PostgreSQL");
    Ok(pool)
}

/// Connect to NATS (supports optional NATS_USER/NATS_PASSWORD auth)
async fn connect_nats(config: &Config) -> Result<async_nats::Client> {
    let client = match (std::env::var("NATS_USER"), std::env::var("NATS_PASSWORD")) {
        (Ok(user), Ok(password)) if !user.is_empty() => {
            async_nats::ConnectOptions::new()
                .user_and_password(user, password)
                .connect(&config.nats_url)
                .await?
        }
        _ => async_nats::connect(&config.nats_url).await?,
    };
    info!("Connected to NATS at {}", config.nats_url);
    Ok(client)
}
