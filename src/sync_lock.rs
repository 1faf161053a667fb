//! Advisory TTL lock backing the bootstrap/incremental sync state machine (spec §4.2).
//!
//! Grounded directly on `lock.py`'s `EmailSyncLock`: a thin SET/EXPIRE/GET/DEL wrapper over a
//! Redis-compatible store, keyed by a prefix plus the account id. Locks are advisory — a
//! stale lock just delays the next attempt until its TTL elapses, so there is no fencing
//! token here, same as the source.

use redis::AsyncCommands;
use uuid::Uuid;

use crate::error::{Result, SyncError};

pub const DEFAULT_PREFIX: &str = "SYNC_";
pub const FIRST_SYNC_PREFIX: &str = "FIRST_SYNC_";

pub struct SyncLock {
    client: redis::Client,
    prefix: &'static str,
    key: Uuid,
    value: String,
    expires_secs: u64,
}

impl SyncLock {
    pub fn new(kv_store_url: &str, prefix: &'static str, key: Uuid, value: impl Into<String>, expires_secs: u64) -> Result<Self> {
        let client = redis::Client::open(kv_store_url)
            .map_err(|e| SyncError::LockError(format!("failed to build redis client: {}", e)))?;
        Ok(Self {
            client,
            prefix,
            key,
            value: value.into(),
            expires_secs,
        })
    }

    /// A lock scoped to the incremental sync path (`SYNC_` prefix).
    pub fn for_sync(kv_store_url: &str, account_id: Uuid, expires_secs: u64) -> Result<Self> {
        Self::new(kv_store_url, DEFAULT_PREFIX, account_id, account_id.to_string(), expires_secs)
    }

    /// A lock scoped to the one-time bootstrap path (`FIRST_SYNC_` prefix).
    pub fn for_bootstrap(kv_store_url: &str, account_id: Uuid, expires_secs: u64) -> Result<Self> {
        Self::new(kv_store_url, FIRST_SYNC_PREFIX, account_id, account_id.to_string(), expires_secs)
    }

    fn redis_key(&self) -> String {
        format!("{}{}", self.prefix, self.key)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| SyncError::LockError(format!("failed to connect to lock store: {}", e)))
    }

    /// SET the lock value then EXPIRE it; acquisition always "succeeds" (last writer wins),
    /// matching the source's unconditional SET rather than a SETNX-based mutex.
    pub async fn acquire(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let key = self.redis_key();
        let _: () = conn
            .set(&key, &self.value)
            .await
            .map_err(|e| SyncError::LockError(format!("SET failed: {}", e)))?;
        let _: () = conn
            .expire(&key, self.expires_secs as i64)
            .await
            .map_err(|e| SyncError::LockError(format!("EXPIRE failed: {}", e)))?;
        Ok(())
    }

    pub async fn release(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = conn
            .del(self.redis_key())
            .await
            .map_err(|e| SyncError::LockError(format!("DEL failed: {}", e)))?;
        Ok(())
    }

    pub async fn get(&self) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        conn.get(self.redis_key())
            .await
            .map_err(|e| SyncError::LockError(format!("GET failed: {}", e)))
    }

    pub async fn is_set(&self) -> Result<bool> {
        Ok(self.get().await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redis_key_uses_prefix_and_account_id() {
        let account_id = Uuid::nil();
        let lock = SyncLock::for_sync("redis://127.0.0.1:6379", account_id, 3600).unwrap();
        assert_eq!(lock.redis_key(), format!("SYNC_{}", account_id));
    }

    #[test]
    fn bootstrap_lock_uses_first_sync_prefix() {
        let account_id = Uuid::nil();
        let lock = SyncLock::for_bootstrap("redis://127.0.0.1:6379", account_id, 3600).unwrap();
        assert_eq!(lock.redis_key(), format!("FIRST_SYNC_{}", account_id));
    }
}
