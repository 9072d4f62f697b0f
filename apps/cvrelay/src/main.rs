use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{info, warn};

use cvrelay_common::parse_duration;
use cvrelay_core::bootstrap::{ConfigArgs, bootstrap, bootstrap_storage};
use cvrelay_core::{KeyManager, RelayEngine, relay_router};
use cvrelay_storage::{ApiKeyRecord, Storage};

mod cli;

use cli::{Cli, Command, KeyCommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config } => serve(config).await,
        Command::Key { command } => key_command(command).await,
    }
}

async fn serve(config: ConfigArgs) -> anyhow::Result<()> {
    let boot = bootstrap(config).await?;
    let engine = Arc::new(RelayEngine::new(boot.state.clone()));

    spawn_idempotency_sweeper(boot.state.clone());

    let app = relay_router(engine);
    let bind = format!("{}:{}", boot.config.host, boot.config.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(event = "relay_listening", bind = %bind, upstream = %boot.config.upstream_host);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    Ok(())
}

fn spawn_idempotency_sweeper(state: Arc<cvrelay_core::AppState>) {
    let period = state.config.idempotency_sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match state.idempotency.sweep(OffsetDateTime::now_utc()).await {
                Ok(0) => {}
                Ok(swept) => info!(event = "idempotency_sweep", swept),
                Err(err) => warn!(event = "idempotency_sweep_failed", error = %err),
            }
        }
    });
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!(event = "shutdown_requested");
}

async fn key_command(command: KeyCommand) -> anyhow::Result<()> {
    match command {
        KeyCommand::Create {
            config,
            description,
            expires_at,
        } => {
            let manager = key_manager(&config).await?;
            let expires_at = parse_expiry(expires_at)?;
            let created = manager.create(description, expires_at).await?;
            println!("id:         {}", created.record.id);
            println!("access key: {}", created.record.access_key);
            println!("secret key: {}  (shown once, store it now)", created.secret);
            Ok(())
        }
        KeyCommand::List { config } => {
            let manager = key_manager(&config).await?;
            let now = OffsetDateTime::now_utc();
            for record in manager.list().await? {
                println!("{}", format_key_row(&record, now));
            }
            Ok(())
        }
        KeyCommand::Revoke { config, id } => {
            let manager = key_manager(&config).await?;
            let record = manager.revoke(id).await?;
            println!("revoked key {} ({})", record.id, record.access_key);
            Ok(())
        }
        KeyCommand::Rotate {
            config,
            id,
            description,
            expires_at,
            grace_period,
        } => {
            let manager = key_manager(&config).await?;
            let expires_at = parse_expiry(expires_at)?;
            let grace = parse_duration(&grace_period)
                .map_err(|err| anyhow::anyhow!("invalid --grace-period: {err}"))?;
            let created = manager.rotate(id, description, expires_at, grace).await?;
            println!("id:         {}", created.record.id);
            println!("access key: {}", created.record.access_key);
            println!("secret key: {}  (shown once, store it now)", created.secret);
            if grace.is_zero() {
                println!("old key {id} revoked");
            } else {
                println!("old key {id} keeps working for {grace_period}");
            }
            Ok(())
        }
    }
}

async fn key_manager(config: &ConfigArgs) -> anyhow::Result<KeyManager> {
    let (storage, secrets) = bootstrap_storage(config).await?;
    let storage: Arc<dyn Storage> = storage;
    Ok(KeyManager::new(storage, secrets))
}

fn parse_expiry(raw: Option<String>) -> anyhow::Result<Option<OffsetDateTime>> {
    match raw {
        Some(raw) => {
            let parsed = OffsetDateTime::parse(&raw, &Rfc3339)
                .with_context(|| format!("invalid --expires-at (want RFC3339): {raw}"))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

fn format_key_row(record: &ApiKeyRecord, now: OffsetDateTime) -> String {
    let expires = record
        .expires_at
        .and_then(|at| at.format(&Rfc3339).ok())
        .unwrap_or_else(|| "-".to_string());
    let rotation = record
        .rotation_of
        .map(|id| format!(" rotation_of={id}"))
        .unwrap_or_default();
    let description = record.description.as_deref().unwrap_or("-");
    format!(
        "{:>4}  {}  {:<8} expires={}{}  {}",
        record.id,
        record.access_key,
        record.status(now),
        expires,
        rotation,
        description,
    )
}
