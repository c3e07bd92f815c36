//! Per-user view of delivered and pending files

use async_trait::async_trait;
use serde::Serialize;
use spool_cache::FileCache;
use spool_relay::{DeliveredFiles, SnapshotSource};
use std::sync::Arc;

/// What an observer of one user is shown
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserSnapshot {
    pub user: String,
    /// Files known to be on the remote endpoint
    pub delivered: Vec<String>,
    /// Files still waiting in the spool
    pub pending: Vec<String>,
    pub cache_size: u64,
    pub max_cache_size: u64,
    /// Spool fill level in whole percent
    pub load_percent: u8,
}

/// Builds [`UserSnapshot`]s from the spool and the delivery record
pub struct SpoolSnapshots {
    cache: FileCache,
    delivered: Arc<DeliveredFiles>,
}

impl SpoolSnapshots {
    pub fn new(cache: FileCache, delivered: Arc<DeliveredFiles>) -> Self {
        Self { cache, delivered }
    }

    pub async fn build(&self, user: &str) -> UserSnapshot {
        let mut delivered = self.delivered.userfiles(user);
        delivered.sort();
        let mut pending = self.cache.userfiles(user).await;
        pending.sort();

        let cache_size = self.cache.size();
        let max_cache_size = self.cache.max_size();
        UserSnapshot {
            user: user.to_lowercase(),
            delivered,
            pending,
            cache_size,
            max_cache_size,
            load_percent: load_percent(cache_size, max_cache_size),
        }
    }
}

#[async_trait]
impl SnapshotSource for SpoolSnapshots {
    type Snapshot = UserSnapshot;

    async fn snapshot(&self, user: &str) -> UserSnapshot {
        self.build(user).await
    }
}

/// `size * 100 / max` in integer arithmetic, clamped to 100.
pub fn load_percent(size: u64, max: u64) -> u8 {
    if max == 0 {
        return 100;
    }
    let percent = u128::from(size) * 100 / u128::from(max);
    percent.min(100) as u8
}
