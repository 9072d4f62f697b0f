use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Args;

use cvrelay_common::{RelayConfig, RelayConfigPatch, parse_duration};
use cvrelay_sign::Credentials;
use cvrelay_storage::{SeaOrmStorage, Storage};

use crate::admission::{AdmissionConfig, AdmissionController};
use crate::audit::AuditRecorder;
use crate::auth::Authenticator;
use crate::dispatch::Dispatcher;
use crate::idempotency::IdempotencyResolver;
use crate::secrets::SecretBox;
use crate::state::AppState;
use crate::upstream_client::{UpstreamClient, UpstreamClientConfig, WreqUpstreamClient};

/// Every knob is a flag with an env fallback; flags win.
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigArgs {
    /// Bind host.
    #[arg(long, env = "RELAY_HOST")]
    pub host: Option<String>,

    /// Bind port.
    #[arg(long, env = "RELAY_PORT")]
    pub port: Option<String>,

    /// Relay's own upstream access key.
    #[arg(long, env = "UPSTREAM_ACCESS_KEY")]
    pub upstream_access_key: Option<String>,

    /// Relay's own upstream secret key.
    #[arg(long, env = "UPSTREAM_SECRET_KEY")]
    pub upstream_secret_key: Option<String>,

    /// Upstream signing region.
    #[arg(long, env = "UPSTREAM_REGION")]
    pub upstream_region: Option<String>,

    /// Upstream API host.
    #[arg(long, env = "UPSTREAM_HOST")]
    pub upstream_host: Option<String>,

    /// Per-attempt upstream timeout (e.g. `30s`).
    #[arg(long, env = "UPSTREAM_TIMEOUT")]
    pub upstream_timeout: Option<String>,

    /// Database backend: `sqlite` or `postgres`.
    #[arg(long, env = "DATABASE_TYPE")]
    pub database_type: Option<String>,

    /// Database URL / DSN.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Base64 of the 32-byte AES key protecting stored secrets.
    #[arg(long, env = "API_KEY_ENCRYPTION_KEY")]
    pub encryption_key: Option<String>,

    /// Bound on concurrent upstream dispatches.
    #[arg(long, env = "UPSTREAM_MAX_CONCURRENT")]
    pub max_concurrent: Option<String>,

    /// Bound on queued admission waiters.
    #[arg(long, env = "UPSTREAM_MAX_QUEUE")]
    pub max_queue: Option<String>,

    /// Minimum wall time between SubmitTask dispatch starts (e.g. `500ms`).
    #[arg(long, env = "UPSTREAM_SUBMIT_MIN_INTERVAL")]
    pub submit_min_interval: Option<String>,

    /// TTL for stored idempotency records (e.g. `24h`).
    #[arg(long, env = "IDEMPOTENCY_TTL")]
    pub idempotency_ttl: Option<String>,

    /// Cadence of the expired-record sweeper (e.g. `5m`).
    #[arg(long, env = "IDEMPOTENCY_SWEEP_INTERVAL")]
    pub idempotency_sweep_interval: Option<String>,
}

pub struct Bootstrap {
    pub config: RelayConfig,
    pub storage: Arc<SeaOrmStorage>,
    pub state: Arc<AppState>,
}

/// Build the full server state: storage, crypto, admission, dispatcher.
pub async fn bootstrap(args: ConfigArgs) -> anyhow::Result<Bootstrap> {
    let config = resolve_config(&args)?;

    let storage = connect_storage(&config.dsn).await?;
    let secrets = SecretBox::from_base64(&config.encryption_key)
        .context("API_KEY_ENCRYPTION_KEY must be base64 of 32 bytes")?;

    let storage_dyn: Arc<dyn Storage> = storage.clone();
    let authenticator = Authenticator::new(
        storage_dyn.clone(),
        secrets.clone(),
        config.upstream_region.clone(),
    );

    let admission = AdmissionController::new(AdmissionConfig {
        max_concurrent: config.max_concurrent,
        max_queue: config.max_queue,
        min_interval: config.submit_min_interval,
    });

    let upstream_client: Arc<dyn UpstreamClient> = Arc::new(
        WreqUpstreamClient::new(UpstreamClientConfig {
            request_timeout: config.upstream_timeout,
            ..UpstreamClientConfig::default()
        })
        .context("build upstream http client")?,
    );
    let dispatcher = Dispatcher::new(
        upstream_client,
        Credentials {
            access_key: config.upstream_access_key.clone(),
            secret_key: config.upstream_secret_key.clone(),
        },
        config.upstream_region.clone(),
        config.upstream_host.clone(),
        config.upstream_timeout,
    );

    let state = AppState {
        config: config.clone(),
        storage: storage_dyn.clone(),
        authenticator,
        admission,
        dispatcher,
        audit: AuditRecorder::new(storage_dyn.clone()),
        idempotency: IdempotencyResolver::new(storage_dyn, config.idempotency_ttl),
    };

    Ok(Bootstrap {
        config,
        storage,
        state: Arc::new(state),
    })
}

/// Storage plus secret box only, for key-management commands that never
/// talk to the upstream.
pub async fn bootstrap_storage(args: &ConfigArgs) -> anyhow::Result<(Arc<SeaOrmStorage>, SecretBox)> {
    let dsn = resolve_dsn(args)?;
    let storage = connect_storage(&dsn).await?;
    let key = sanitize(args.encryption_key.clone())
        .context("API_KEY_ENCRYPTION_KEY is required")?;
    let secrets =
        SecretBox::from_base64(&key).context("API_KEY_ENCRYPTION_KEY must be base64 of 32 bytes")?;
    Ok((storage, secrets))
}

async fn connect_storage(dsn: &str) -> anyhow::Result<Arc<SeaOrmStorage>> {
    ensure_sqlite_parent_dir(dsn)?;
    let storage = Arc::new(
        SeaOrmStorage::connect(dsn)
            .await
            .context("connect storage")?,
    );
    storage.sync().await.context("schema sync")?;
    Ok(storage)
}

fn resolve_config(args: &ConfigArgs) -> anyhow::Result<RelayConfig> {
    let patch = RelayConfigPatch {
        host: sanitize(args.host.clone()),
        port: parse_opt(args.port.clone(), "RELAY_PORT", |raw| {
            raw.parse::<u16>().ok()
        })?,
        upstream_access_key: sanitize(args.upstream_access_key.clone()),
        upstream_secret_key: sanitize(args.upstream_secret_key.clone()),
        upstream_region: sanitize(args.upstream_region.clone()),
        upstream_host: sanitize(args.upstream_host.clone()),
        upstream_timeout: parse_opt(args.upstream_timeout.clone(), "UPSTREAM_TIMEOUT", |raw| {
            parse_duration(raw).ok()
        })?,
        dsn: Some(resolve_dsn(args)?),
        encryption_key: sanitize(args.encryption_key.clone()),
        max_concurrent: parse_opt(args.max_concurrent.clone(), "UPSTREAM_MAX_CONCURRENT", |raw| {
            raw.parse::<usize>().ok()
        })?,
        max_queue: parse_opt(args.max_queue.clone(), "UPSTREAM_MAX_QUEUE", |raw| {
            raw.parse::<usize>().ok()
        })?,
        submit_min_interval: parse_opt(
            args.submit_min_interval.clone(),
            "UPSTREAM_SUBMIT_MIN_INTERVAL",
            |raw| parse_duration(raw).ok(),
        )?,
        idempotency_ttl: parse_opt(args.idempotency_ttl.clone(), "IDEMPOTENCY_TTL", |raw| {
            parse_duration(raw).ok()
        })?,
        idempotency_sweep_interval: parse_opt(
            args.idempotency_sweep_interval.clone(),
            "IDEMPOTENCY_SWEEP_INTERVAL",
            |raw| parse_duration(raw).ok(),
        )?,
    };
    patch.into_config().context("finalize relay config")
}

fn resolve_dsn(args: &ConfigArgs) -> anyhow::Result<String> {
    let database_type = sanitize(args.database_type.clone())
        .unwrap_or_else(|| "sqlite".to_string())
        .to_ascii_lowercase();
    let url = sanitize(args.database_url.clone());
    match database_type.as_str() {
        "sqlite" => Ok(url.unwrap_or_else(|| "sqlite://cvrelay.db?mode=rwc".to_string())),
        "postgres" => url.context("DATABASE_URL is required for the postgres backend"),
        other => anyhow::bail!("unsupported DATABASE_TYPE: {other}"),
    }
}

fn parse_opt<T>(
    value: Option<String>,
    name: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> anyhow::Result<Option<T>> {
    let Some(raw) = sanitize(value) else {
        return Ok(None);
    };
    match parse(&raw) {
        Some(parsed) => Ok(Some(parsed)),
        None => anyhow::bail!("invalid {name} value: {raw}"),
    }
}

fn sanitize(value: Option<String>) -> Option<String> {
    let trimmed = value?.trim().to_string();
    if trimmed.is_empty() {
        return None;
    }
    // Some PaaS systems inject unresolved placeholders like `${VAR}`.
    // Treat them as "not set" so startup doesn't fail on parsing.
    if trimmed.starts_with("${") && trimmed.ends_with('}') {
        return None;
    }
    Some(trimmed)
}

fn ensure_sqlite_parent_dir(dsn: &str) -> anyhow::Result<()> {
    let Some(db_path) = sqlite_file_path_from_dsn(dsn) else {
        return Ok(());
    };
    let Some(parent) = db_path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    std::fs::create_dir_all(parent)
        .with_context(|| format!("create sqlite parent dir {}", parent.display()))?;
    Ok(())
}

fn sqlite_file_path_from_dsn(dsn: &str) -> Option<PathBuf> {
    let rest = dsn.strip_prefix("sqlite:")?;
    let path_part = rest.split(['?', '#']).next()?.trim();
    if path_part.is_empty() {
        return None;
    }

    let mut normalized = path_part;
    if let Some(stripped) = normalized.strip_prefix("//") {
        normalized = stripped;
    }

    if normalized.to_ascii_lowercase() == ":memory:" {
        return None;
    }

    Some(PathBuf::from(normalized))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_dsn_resolves_relative_path() {
        let path = sqlite_file_path_from_dsn("sqlite://cvrelay.db?mode=rwc").unwrap();
        assert_eq!(path.to_string_lossy(), "cvrelay.db");
    }

    #[test]
    fn sqlite_memory_dsn_is_ignored() {
        assert!(sqlite_file_path_from_dsn("sqlite::memory:").is_none());
        assert!(sqlite_file_path_from_dsn("sqlite://:memory:").is_none());
    }

    #[test]
    fn placeholder_env_values_are_dropped() {
        assert_eq!(sanitize(Some("${DATABASE_URL}".to_string())), None);
        assert_eq!(sanitize(Some("  ".to_string())), None);
        assert_eq!(
            sanitize(Some(" value ".to_string())),
            Some("value".to_string())
        );
    }

    #[test]
    fn postgres_requires_a_url() {
        let args = ConfigArgs {
            database_type: Some("postgres".to_string()),
            ..ConfigArgs::default()
        };
        assert!(resolve_dsn(&args).is_err());

        let args = ConfigArgs {
            database_type: Some("postgres".to_string()),
            database_url: Some("postgres://localhost/cvrelay".to_string()),
            ..ConfigArgs::default()
        };
        assert_eq!(resolve_dsn(&args).unwrap(), "postgres://localhost/cvrelay");
    }

    #[test]
    fn sqlite_defaults_the_url() {
        let args = ConfigArgs::default();
        assert_eq!(resolve_dsn(&args).unwrap(), "sqlite://cvrelay.db?mode=rwc");
    }
}
