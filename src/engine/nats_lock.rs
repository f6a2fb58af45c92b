// NATS JetStream key-value lock backend

//! Distributed [`ProcessLock`] built on a JetStream KV bucket.
//!
//! Acquiring is a KV `create`, which only succeeds when the key is absent
//! (or its last entry is a delete marker). The value is a fresh UUID naming
//! the holder, and the lease keeps the revision `create` returned.
//! Releasing is a delete conditioned on that revision, so a holder that
//! outlived the TTL cannot free a lock someone else has taken since. The
//! bucket's `max_age` acts as the lock TTL: a crashed holder frees the
//! process once its entry ages out.

use std::time::Duration;

use async_nats::jetstream::{self, kv};
use bytes::Bytes;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::lock::{LockKey, LockLease, LockRetryPolicy, ProcessLock};
use crate::{FlowError, Result};

/// Process lock shared by every engine connected to the same NATS cluster.
#[derive(Clone)]
pub struct NatsLock {
    store: kv::Store,
    policy: LockRetryPolicy,
}

impl NatsLock {
    /// Connect and open (or create) the lock bucket.
    pub async fn connect(url: &str, bucket: &str, ttl: Duration, policy: LockRetryPolicy) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| FlowError::Storage(anyhow::anyhow!("failed to connect to NATS at {}: {}", url, e)))?;
        let js = jetstream::new(client);
        let store = Self::ensure_bucket(&js, bucket, ttl).await?;
        Ok(NatsLock { store, policy })
    }

    pub fn with_store(store: kv::Store, policy: LockRetryPolicy) -> Self {
        NatsLock { store, policy }
    }

    async fn ensure_bucket(js: &jetstream::Context, bucket: &str, ttl: Duration) -> Result<kv::Store> {
        match js.get_key_value(bucket).await {
            Ok(store) => {
                debug!(bucket, "using existing lock bucket");
                Ok(store)
            }
            Err(_) => {
                info!(bucket, ttl_secs = ttl.as_secs(), "creating lock bucket");
                js.create_key_value(kv::Config {
                    bucket: bucket.to_string(),
                    history: 1,
                    max_age: ttl,
                    storage: jetstream::stream::StorageType::Memory,
                    description: "flowkeeper process locks".to_string(),
                    ..Default::default()
                })
                .await
                .map_err(|e| FlowError::Storage(anyhow::anyhow!("failed to create KV bucket {}: {}", bucket, e)))
            }
        }
    }

    async fn try_create(&self, key: &str) -> Result<Option<Box<dyn LockLease>>> {
        let owner = Uuid::new_v4().to_string();
        match self.store.create(key, Bytes::from(owner.clone())).await {
            Ok(revision) => Ok(Some(Box::new(NatsLease {
                store: self.store.clone(),
                key: key.to_string(),
                owner,
                revision,
                held: true,
            }))),
            Err(e) if matches!(e.kind(), kv::CreateErrorKind::AlreadyExists) => Ok(None),
            Err(e) => Err(FlowError::Storage(anyhow::anyhow!("lock create failed for {}: {}", key, e))),
        }
    }
}

struct NatsLease {
    store: kv::Store,
    key: String,
    owner: String,
    revision: u64,
    held: bool,
}

#[async_trait::async_trait]
impl LockLease for NatsLease {
    async fn release(&mut self) -> Result<()> {
        if !self.held {
            return Ok(());
        }
        self.held = false;

        let deleted = self
            .store
            .delete_expect_revision(&self.key, Some(self.revision))
            .await;
        let Err(e) = deleted else {
            return Ok(());
        };

        // A newer revision means the entry expired and someone else holds it.
        let current = self
            .store
            .entry(self.key.as_str())
            .await
            .map_err(|e| FlowError::Storage(anyhow::anyhow!("lock lookup failed for {}: {}", self.key, e)))?;
        if current.map(|entry| entry.revision) != Some(self.revision) {
            warn!(key = %self.key, owner = %self.owner, revision = self.revision, "lock expired before release");
            return Ok(());
        }
        Err(FlowError::Storage(anyhow::anyhow!("lock release failed for {}: {}", self.key, e)))
    }
}

#[async_trait::async_trait]
impl ProcessLock for NatsLock {
    async fn acquire(&self, key: &LockKey) -> Result<Box<dyn LockLease>> {
        let kv_key = key.cache_key();
        self.policy.acquire(key, || self.try_create(&kv_key)).await
    }

    fn name(&self) -> &'static str {
        "nats"
    }
}
