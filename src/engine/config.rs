// Engine configuration loaded from defaults, an optional file and the environment

//! Settings are layered with the `config` crate:
//!
//! 1. built-in defaults ([`EngineConfig::default`])
//! 2. an optional TOML/YAML/JSON file
//! 3. `FLOWKEEPER__*` environment variables, e.g.
//!    `FLOWKEEPER__LOCK__BACKEND=nats` or `FLOWKEEPER__LOCK__ATTEMPTS=20`

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::lock::{CacheLock, LockRetryPolicy, NoLock, PgRowLocker, ProcessLock, RowLock, RowLocker};
use super::nats_lock::NatsLock;
use crate::{FlowError, Result};

/// Which [`ProcessLock`] implementation to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    None,
    /// Row lock on the engine's own storage
    Row,
    #[default]
    Cache,
    Nats,
    /// Row lock on a Postgres table
    Postgres,
}

impl std::str::FromStr for LockBackend {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(LockBackend::None),
            "row" => Ok(LockBackend::Row),
            "cache" => Ok(LockBackend::Cache),
            "nats" => Ok(LockBackend::Nats),
            "postgres" | "pg" => Ok(LockBackend::Postgres),
            other => Err(FlowError::Config(config::ConfigError::Message(format!(
                "unknown lock backend `{}`",
                other
            )))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    pub backend: LockBackend,
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Lifetime of cache and NATS lock entries
    pub ttl_secs: u64,
    pub nats_url: String,
    pub nats_bucket: String,
    pub postgres_url: Option<String>,
    pub postgres_table: String,
}

impl Default for LockSettings {
    fn default() -> Self {
        LockSettings {
            backend: LockBackend::Cache,
            attempts: 10,
            base_delay_ms: 10,
            max_delay_ms: 1000,
            ttl_secs: 60,
            nats_url: "nats://localhost:4222".to_string(),
            nats_bucket: "flowkeeper_locks".to_string(),
            postgres_url: None,
            postgres_table: "flowkeeper_process_lock".to_string(),
        }
    }
}

impl LockSettings {
    pub fn retry_policy(&self) -> LockRetryPolicy {
        LockRetryPolicy::bounded(self.attempts).with_delays(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Build the configured backend.
    ///
    /// `row_locker` is used for [`LockBackend::Row`]; it is normally the
    /// engine's storage.
    pub async fn build(&self, row_locker: Arc<dyn RowLocker>) -> Result<Arc<dyn ProcessLock>> {
        let policy = self.retry_policy();
        let lock: Arc<dyn ProcessLock> = match self.backend {
            LockBackend::None => Arc::new(NoLock),
            LockBackend::Row => Arc::new(RowLock::new(row_locker, policy)),
            LockBackend::Cache => Arc::new(CacheLock::new(self.ttl(), policy)),
            LockBackend::Nats => {
                Arc::new(NatsLock::connect(&self.nats_url, &self.nats_bucket, self.ttl(), policy).await?)
            }
            LockBackend::Postgres => {
                let url = self.postgres_url.as_deref().ok_or_else(|| {
                    FlowError::Config(config::ConfigError::NotFound("lock.postgres_url".to_string()))
                })?;
                let locker = PgRowLocker::connect(url, &self.postgres_table).await?;
                locker.ensure_schema().await?;
                Arc::new(RowLock::new(Arc::new(locker), policy))
            }
        };
        tracing::info!(backend = lock.name(), attempts = self.attempts, "process lock ready");
        Ok(lock)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub lock: LockSettings,
    /// Broadcast buffer of the event bus
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            lock: LockSettings::default(),
            event_buffer: 1000,
        }
    }
}

impl EngineConfig {
    /// Load defaults, then `path` if given, then `FLOWKEEPER__*` variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&EngineConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("FLOWKEEPER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }
}
