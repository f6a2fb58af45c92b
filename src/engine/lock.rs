// Process locks - serialise every mutation of one process's task graph

//! # Process Lock Protocol
//!
//! Every engine entry point that writes task or process state runs between
//! [`ProcessLock::acquire`] and [`LockLease::release`] for that process.
//! Two siblings of a split finishing at the same instant therefore cannot
//! both decide they were "the last branch" in front of a join.
//!
//! ## Backends
//!
//! | Backend        | Mechanism                                   | Safe for joins |
//! |----------------|---------------------------------------------|----------------|
//! | [`NoLock`]     | nothing                                     | no             |
//! | [`RowLock`]    | exclusive lock on the process's stored row  | yes            |
//! | [`CacheLock`]  | atomic add-if-absent with a TTL             | yes (1 node)   |
//! | `NatsLock`     | JetStream KV `create` with bucket max-age   | yes            |
//!
//! Acquisition is bounded: each backend retries with randomised exponential
//! backoff ([`LockRetryPolicy`]) and then fails with
//! [`FlowError::LockAcquisitionFailed`]. Callers must treat that as a failed
//! operation.
//!
//! ## Rust Learning Notes:
//!
//! ### Leases as Trait Objects
//! `acquire` returns `Box<dyn LockLease>` so the engine can hold any
//! backend's guard without knowing its concrete type. Release is an explicit
//! async call because most backends need I/O to let go of the lock.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use tracing::{debug, warn};

use crate::models::ProcessId;
use crate::{FlowError, Result};

/// Identity of a lock: flow type plus process id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub flow: String,
    pub process: ProcessId,
}

impl LockKey {
    pub fn new<F: Into<String>>(flow: F, process: ProcessId) -> Self {
        LockKey {
            flow: flow.into(),
            process,
        }
    }

    /// Flat key for cache and key-value backends.
    pub fn cache_key(&self) -> String {
        format!("flowkeeper.lock.{}.{}", self.flow.replace('/', "."), self.process)
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.flow, self.process)
    }
}

/// A held lock. Dropping a lease without releasing it is a bug for
/// backends that cannot release synchronously; they fall back to their TTL.
#[async_trait::async_trait]
pub trait LockLease: Send + Sync {
    async fn release(&mut self) -> Result<()>;
}

/// A pluggable mutual-exclusion backend keyed by process.
#[async_trait::async_trait]
pub trait ProcessLock: Send + Sync {
    async fn acquire(&self, key: &LockKey) -> Result<Box<dyn LockLease>>;

    fn name(&self) -> &'static str;
}

/// Backoff schedule shared by the retrying backends.
#[derive(Debug, Clone)]
pub struct LockRetryPolicy {
    /// Total acquisition attempts, including the first.
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Randomise each delay into `[delay / 2, delay]`.
    pub jitter: bool,
}

impl Default for LockRetryPolicy {
    fn default() -> Self {
        LockRetryPolicy {
            attempts: 10,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl LockRetryPolicy {
    /// Keep retrying until the lock is free.
    pub fn blocking() -> Self {
        LockRetryPolicy {
            attempts: u32::MAX,
            ..Self::default()
        }
    }

    /// Give up after `attempts` tries.
    pub fn bounded(attempts: u32) -> Self {
        LockRetryPolicy {
            attempts: attempts.max(1),
            ..Self::default()
        }
    }

    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max.max(base);
        self
    }

    /// Delay after the given failed attempt (1-indexed).
    ///
    /// `base * multiplier^(attempt - 1)`, capped at `max_delay`, then jittered.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let nanos = self.base_delay.as_nanos() as f64 * self.multiplier.powi(exponent);
        let delay = Duration::from_nanos(nanos.min(self.max_delay.as_nanos() as f64).round() as u64);
        if self.jitter && !delay.is_zero() {
            let low = delay / 2;
            rand::thread_rng().gen_range(low..=delay)
        } else {
            delay
        }
    }

    /// Run `try_once` until it yields a lease or the attempt budget is spent.
    pub async fn acquire<F, Fut>(&self, key: &LockKey, mut try_once: F) -> Result<Box<dyn LockLease>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<Box<dyn LockLease>>>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            if let Some(lease) = try_once().await? {
                debug!(lock = %key, attempt, "lock acquired");
                return Ok(lease);
            }
            if attempt >= attempts {
                break;
            }
            let delay = self.next_delay(attempt);
            debug!(lock = %key, attempt, delay_ms = delay.as_millis() as u64, "lock busy, backing off");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
        warn!(lock = %key, attempts, "lock acquisition failed");
        Err(FlowError::LockAcquisitionFailed {
            key: key.to_string(),
            attempts,
        })
    }
}

/// No mutual exclusion at all.
///
/// Only suitable for flows without joins, or for single-caller tests:
/// two concurrent branch completions may both advance past a join.
#[derive(Debug, Default, Clone)]
pub struct NoLock;

struct NoLease;

#[async_trait::async_trait]
impl LockLease for NoLease {
    async fn release(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl ProcessLock for NoLock {
    async fn acquire(&self, _key: &LockKey) -> Result<Box<dyn LockLease>> {
        Ok(Box::new(NoLease))
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Store-side pessimistic lock on a process record.
///
/// Implementations must not block: if the row is held elsewhere they
/// return `Ok(None)` and [`RowLock`] backs off.
#[async_trait::async_trait]
pub trait RowLocker: Send + Sync {
    async fn try_lock_row(&self, key: &LockKey) -> Result<Option<Box<dyn LockLease>>>;
}

/// Pessimistic row lock, retried with backoff.
#[derive(Clone)]
pub struct RowLock {
    locker: Arc<dyn RowLocker>,
    policy: LockRetryPolicy,
}

impl RowLock {
    pub fn new(locker: Arc<dyn RowLocker>, policy: LockRetryPolicy) -> Self {
        RowLock { locker, policy }
    }
}

#[async_trait::async_trait]
impl ProcessLock for RowLock {
    async fn acquire(&self, key: &LockKey) -> Result<Box<dyn LockLease>> {
        self.policy.acquire(key, || self.locker.try_lock_row(key)).await
    }

    fn name(&self) -> &'static str {
        "row"
    }
}

/// Atomic add-if-absent flag in a shared map, with a time-to-live.
///
/// Expired entries are taken over by the next caller, so a holder that
/// vanished without releasing blocks others for at most `ttl`.
#[derive(Clone)]
pub struct CacheLock {
    entries: Arc<DashMap<String, Instant>>,
    ttl: Duration,
    policy: LockRetryPolicy,
}

impl CacheLock {
    pub fn new(ttl: Duration, policy: LockRetryPolicy) -> Self {
        CacheLock {
            entries: Arc::new(DashMap::new()),
            ttl,
            policy,
        }
    }

    fn try_add(&self, key: &str) -> Option<Instant> {
        let now = Instant::now();
        let expires = now + self.ttl;
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut held) => {
                if *held.get() <= now {
                    held.insert(expires);
                    Some(expires)
                } else {
                    None
                }
            }
            Entry::Vacant(free) => {
                free.insert(expires);
                Some(expires)
            }
        }
    }
}

struct CacheLease {
    entries: Arc<DashMap<String, Instant>>,
    key: String,
    expires: Instant,
    released: bool,
}

impl CacheLease {
    fn remove(&mut self) {
        if !self.released {
            let expires = self.expires;
            self.entries.remove_if(&self.key, |_, held| *held == expires);
            self.released = true;
        }
    }
}

#[async_trait::async_trait]
impl LockLease for CacheLease {
    async fn release(&mut self) -> Result<()> {
        self.remove();
        Ok(())
    }
}

impl Drop for CacheLease {
    fn drop(&mut self) {
        self.remove();
    }
}

#[async_trait::async_trait]
impl ProcessLock for CacheLock {
    async fn acquire(&self, key: &LockKey) -> Result<Box<dyn LockLease>> {
        let cache_key = key.cache_key();
        self.policy
            .acquire(key, || {
                let lease = self.try_add(&cache_key).map(|expires| {
                    Box::new(CacheLease {
                        entries: self.entries.clone(),
                        key: cache_key.clone(),
                        expires,
                        released: false,
                    }) as Box<dyn LockLease>
                });
                async move { Ok(lease) }
            })
            .await
    }

    fn name(&self) -> &'static str {
        "cache"
    }
}

/// Postgres `SELECT ... FOR UPDATE NOWAIT` on the process table.
///
/// The lease keeps the transaction open; releasing commits it.
#[derive(Clone)]
pub struct PgRowLocker {
    pool: sqlx::PgPool,
    table: String,
}

const PG_LOCK_NOT_AVAILABLE: &str = "55P03";

impl PgRowLocker {
    pub async fn connect(url: &str, table: &str) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(8)
            .connect(url)
            .await
            .map_err(|e| FlowError::Storage(e.into()))?;
        Ok(PgRowLocker {
            pool,
            table: table.to_string(),
        })
    }

    /// Create the lock table if missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        let sql = format!("CREATE TABLE IF NOT EXISTS {} (id BIGINT PRIMARY KEY)", self.table);
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| FlowError::Storage(e.into()))?;
        Ok(())
    }

    /// Insert the row a process will be locked on.
    pub async fn register(&self, process: ProcessId) -> Result<()> {
        let sql = format!("INSERT INTO {} (id) VALUES ($1) ON CONFLICT DO NOTHING", self.table);
        sqlx::query(&sql)
            .bind(process.0 as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| FlowError::Storage(e.into()))?;
        Ok(())
    }
}

/// The open transaction holding the row lock. The mutex only makes the
/// lease `Sync`; it is never contended.
struct PgRowLease(std::sync::Mutex<Option<sqlx::Transaction<'static, sqlx::Postgres>>>);

#[async_trait::async_trait]
impl LockLease for PgRowLease {
    async fn release(&mut self) -> Result<()> {
        let tx = self.0.get_mut().unwrap_or_else(std::sync::PoisonError::into_inner).take();
        if let Some(tx) = tx {
            tx.commit().await.map_err(|e| FlowError::Storage(e.into()))?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl RowLocker for PgRowLocker {
    async fn try_lock_row(&self, key: &LockKey) -> Result<Option<Box<dyn LockLease>>> {
        self.register(key.process).await?;
        let mut tx = self.pool.begin().await.map_err(|e| FlowError::Storage(e.into()))?;
        let sql = format!("SELECT id FROM {} WHERE id = $1 FOR UPDATE NOWAIT", self.table);
        let row = sqlx::query(&sql)
            .bind(key.process.0 as i64)
            .fetch_optional(&mut *tx)
            .await;

        match row {
            Ok(Some(_)) => Ok(Some(Box::new(PgRowLease(std::sync::Mutex::new(Some(tx)))))),
            Ok(None) => Err(FlowError::NotFound(format!("lock row for process {}", key.process))),
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(PG_LOCK_NOT_AVAILABLE) => {
                tx.rollback().await.map_err(|e| FlowError::Storage(e.into()))?;
                Ok(None)
            }
            Err(e) => Err(FlowError::Storage(e.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick(attempts: u32) -> LockRetryPolicy {
        LockRetryPolicy::bounded(attempts).with_delays(Duration::from_millis(1), Duration::from_millis(5))
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = LockRetryPolicy {
            jitter: false,
            ..LockRetryPolicy::default().with_delays(Duration::from_millis(10), Duration::from_millis(50))
        };
        assert_eq!(policy.next_delay(1), Duration::from_millis(10));
        assert_eq!(policy.next_delay(2), Duration::from_millis(20));
        assert_eq!(policy.next_delay(3), Duration::from_millis(40));
        assert_eq!(policy.next_delay(4), Duration::from_millis(50));
        assert_eq!(policy.next_delay(40), Duration::from_millis(50));
    }

    #[test]
    fn jitter_stays_in_range() {
        let policy = LockRetryPolicy::default().with_delays(Duration::from_millis(100), Duration::from_secs(1));
        for _ in 0..50 {
            let delay = policy.next_delay(1);
            assert!(delay >= Duration::from_millis(50) && delay <= Duration::from_millis(100));
        }
    }

    #[tokio::test]
    async fn cache_lock_is_exclusive_and_bounded() {
        let lock = CacheLock::new(Duration::from_secs(30), quick(3));
        let key = LockKey::new("app/Flow", ProcessId(1));

        let mut held = lock.acquire(&key).await.unwrap();
        let second = lock.acquire(&key).await;
        assert!(matches!(
            second,
            Err(FlowError::LockAcquisitionFailed { attempts: 3, .. })
        ));

        held.release().await.unwrap();
        let mut again = lock.acquire(&key).await.unwrap();
        again.release().await.unwrap();
    }

    #[tokio::test]
    async fn cache_lock_is_freed_on_drop() {
        let lock = CacheLock::new(Duration::from_secs(30), quick(2));
        let key = LockKey::new("app/Flow", ProcessId(7));
        {
            let _lease = lock.acquire(&key).await.unwrap();
        }
        assert!(lock.acquire(&key).await.is_ok());
    }

    #[tokio::test]
    async fn expired_cache_entry_is_taken_over() {
        let lock = CacheLock::new(Duration::from_millis(1), quick(1));
        let key = LockKey::new("app/Flow", ProcessId(3));

        let stale = lock.acquire(&key).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let mut fresh = lock.acquire(&key).await.unwrap();

        // Dropping the stale lease must not remove the new holder's entry.
        drop(stale);
        assert!(lock.entries.contains_key(&key.cache_key()));
        fresh.release().await.unwrap();
    }

    #[tokio::test]
    async fn blocking_policy_waits_for_release() {
        let lock = CacheLock::new(
            Duration::from_secs(30),
            LockRetryPolicy::blocking().with_delays(Duration::from_millis(1), Duration::from_millis(5)),
        );
        let key = LockKey::new("app/Flow", ProcessId(2));
        let mut first = lock.acquire(&key).await.unwrap();

        let contender = {
            let lock = lock.clone();
            let key = key.clone();
            tokio::spawn(async move { lock.acquire(&key).await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        first.release().await.unwrap();
        assert!(contender.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn no_lock_never_blocks() {
        let key = LockKey::new("app/Flow", ProcessId(1));
        let _a = NoLock.acquire(&key).await.unwrap();
        let _b = NoLock.acquire(&key).await.unwrap();
    }

    #[test]
    fn cache_keys_are_flat() {
        let key = LockKey::new("shop/orders.OrderFlow", ProcessId(12));
        assert_eq!(key.cache_key(), "flowkeeper.lock.shop.orders.OrderFlow.12");
        assert_eq!(key.to_string(), "shop/orders.OrderFlow#12");
    }
}
