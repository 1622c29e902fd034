//! Named sets of file names, one per lifecycle status.
//!
//! The production backend is Redis. `move_member` maps onto `SMOVE`, which is
//! atomic on the server and is what makes claiming a file race-free across
//! processes.

use async_trait::async_trait;
use deadpool_redis::redis::{AsyncCommands, RedisError};
use deadpool_redis::{Config, CreatePoolError, Pool, PoolError, Runtime};
use parking_lot::Mutex;
use shared::retry::{RetryPolicy, retry};
use std::collections::{HashMap, HashSet};

#[derive(thiserror::Error, Debug)]
pub enum GroupStoreError {
    #[error("redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("redis pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("failed to create redis pool: {0}")]
    CreatePool(#[from] CreatePoolError),
}

impl GroupStoreError {
    pub fn is_transient(&self) -> bool {
        match self {
            GroupStoreError::Redis(e) => {
                e.is_io_error()
                    || e.is_timeout()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
            }
            GroupStoreError::Pool(PoolError::Backend(e)) => e.is_io_error() || e.is_timeout(),
            GroupStoreError::Pool(PoolError::Timeout(_)) => true,
            _ => false,
        }
    }

    /// True when the command cannot have reached the server, so sending it
    /// again cannot apply it twice.
    pub fn is_unsent(&self) -> bool {
        match self {
            GroupStoreError::Pool(_) => self.is_transient(),
            GroupStoreError::Redis(e) => e.is_connection_refusal(),
            GroupStoreError::CreatePool(_) => false,
        }
    }
}

#[async_trait]
pub trait GroupStore: Send + Sync {
    /// Adds `member` to `group`. Returns false if it was already present.
    async fn add(&self, group: &str, member: &str) -> Result<bool, GroupStoreError>;

    /// Atomically moves `member` from `from` to `to`. Returns 1 if the member was
    /// moved and 0 if it was not in `from`.
    async fn move_member(&self, from: &str, to: &str, member: &str)
    -> Result<u64, GroupStoreError>;

    async fn is_member(&self, group: &str, member: &str) -> Result<bool, GroupStoreError>;

    async fn members(&self, group: &str) -> Result<Vec<String>, GroupStoreError>;
}

pub struct RedisGroupStore {
    pool: Pool,
    key_prefix: String,
    retry_policy: RetryPolicy,
}

impl RedisGroupStore {
    pub fn new(
        url: &str,
        key_prefix: Option<&str>,
        retry_policy: RetryPolicy,
    ) -> Result<Self, GroupStoreError> {
        let pool = Config::from_url(url).create_pool(Some(Runtime::Tokio1))?;
        Ok(RedisGroupStore {
            pool,
            key_prefix: key_prefix.unwrap_or_default().to_string(),
            retry_policy,
        })
    }

    fn key(&self, group: &str) -> String {
        format!("{}{}", self.key_prefix, group)
    }
}

#[async_trait]
impl GroupStore for RedisGroupStore {
    async fn add(&self, group: &str, member: &str) -> Result<bool, GroupStoreError> {
        let key = self.key(group);
        retry(&self.retry_policy, GroupStoreError::is_transient, || async {
            let mut conn = self.pool.get().await?;
            let added: u64 = conn.sadd(&key, member).await?;
            Ok(added == 1)
        })
        .await
    }

    async fn move_member(
        &self,
        from: &str,
        to: &str,
        member: &str,
    ) -> Result<u64, GroupStoreError> {
        let (from, to) = (self.key(from), self.key(to));
        // SMOVE is not idempotent: a retry after a lost reply would report 0.
        retry(&self.retry_policy, GroupStoreError::is_unsent, || async {
            let mut conn = self.pool.get().await?;
            let moved: u64 = conn.smove(&from, &to, member).await?;
            Ok(moved)
        })
        .await
    }

    async fn is_member(&self, group: &str, member: &str) -> Result<bool, GroupStoreError> {
        let key = self.key(group);
        retry(&self.retry_policy, GroupStoreError::is_transient, || async {
            let mut conn = self.pool.get().await?;
            let found: bool = conn.sismember(&key, member).await?;
            Ok(found)
        })
        .await
    }

    async fn members(&self, group: &str) -> Result<Vec<String>, GroupStoreError> {
        let key = self.key(group);
        retry(&self.retry_policy, GroupStoreError::is_transient, || async {
            let mut conn = self.pool.get().await?;
            let members: Vec<String> = conn.smembers(&key).await?;
            Ok(members)
        })
        .await
    }
}

/// In-process sets behind a single lock, so `move_member` is atomic the same
/// way `SMOVE` is.
#[derive(Default)]
pub struct MemoryGroupStore {
    groups: Mutex<HashMap<String, HashSet<String>>>,
}

#[async_trait]
impl GroupStore for MemoryGroupStore {
    async fn add(&self, group: &str, member: &str) -> Result<bool, GroupStoreError> {
        Ok(self
            .groups
            .lock()
            .entry(group.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn move_member(
        &self,
        from: &str,
        to: &str,
        member: &str,
    ) -> Result<u64, GroupStoreError> {
        let mut groups = self.groups.lock();
        let removed = groups
            .get_mut(from)
            .is_some_and(|members| members.remove(member));
        if !removed {
            return Ok(0);
        }
        groups
            .entry(to.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(1)
    }

    async fn is_member(&self, group: &str, member: &str) -> Result<bool, GroupStoreError> {
        Ok(self
            .groups
            .lock()
            .get(group)
            .is_some_and(|members| members.contains(member)))
    }

    async fn members(&self, group: &str) -> Result<Vec<String>, GroupStoreError> {
        let mut members: Vec<String> = self
            .groups
            .lock()
            .get(group)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }
}
