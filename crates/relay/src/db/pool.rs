use std::time::Duration;

use anyhow::{bail, Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;

const DEFAULT_MIN_CONNECTIONS: u32 = 2;
const DEFAULT_MAX_CONNECTIONS: u32 = 20;
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 10;
const LOOPBACK_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: DEFAULT_MIN_CONNECTIONS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        }
    }
}

impl PoolConfig {
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key).ok())
    }

    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse_u32 = |key: &str, default: u32| {
            env(key).and_then(|value| value.parse::<u32>().ok()).unwrap_or(default)
        };

        let min_connections = parse_u32("MURMUR_RELAY_DB_MIN_CONNECTIONS", DEFAULT_MIN_CONNECTIONS);
        let max_connections = parse_u32("MURMUR_RELAY_DB_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)
            .max(min_connections)
            .max(1);
        let acquire_timeout_secs = env("MURMUR_RELAY_DB_ACQUIRE_TIMEOUT_SECS")
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_SECS);

        Self {
            min_connections,
            max_connections,
            acquire_timeout: Duration::from_secs(acquire_timeout_secs),
        }
    }
}

pub async fn create_pg_pool(database_url: &str, config: PoolConfig) -> Result<PgPool> {
    let connect_options = database_url
        .parse::<PgConnectOptions>()
        .context("failed to parse chat store PostgreSQL connection options")?;
    ensure_postgres_tls(&connect_options)?;

    PgPoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect_with(connect_options)
        .await
        .context("failed to connect to chat store PostgreSQL")
}

/// Remote databases must use TLS; a loopback database may run without it.
fn ensure_postgres_tls(options: &PgConnectOptions) -> Result<()> {
    if LOOPBACK_HOSTS.contains(&options.get_host()) {
        return Ok(());
    }

    match options.get_ssl_mode() {
        PgSslMode::Require | PgSslMode::VerifyCa | PgSslMode::VerifyFull => Ok(()),
        mode => bail!(
            "chat store PostgreSQL at {} must require TLS; got sslmode={mode:?}",
            options.get_host()
        ),
    }
}

pub async fn check_pool_health(pool: &PgPool) -> Result<()> {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(pool)
        .await
        .context("chat store PostgreSQL health check failed")?;

    Ok(())
}
