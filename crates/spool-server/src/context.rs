//! Application context shared with request handlers

use crate::config::Config;
use crate::error::Result;
use crate::snapshot::{SpoolSnapshots, UserSnapshot};
use chrono::{DateTime, Utc};
use spool_cache::{CachedEntry, CachedFile, FileCache};
use spool_relay::{encode_user, Connector, DeliveredFiles, Notifier, Subscription, Uploader};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tracing::{info, warn};

/// Everything the service runs on, built once at startup
pub struct AppContext {
    pub cache: FileCache,
    pub uploader: Uploader,
    pub notifier: Arc<Notifier<SpoolSnapshots>>,
    pub snapshots: Arc<SpoolSnapshots>,
    pub poll_timeout: Duration,
    pub started_at: DateTime<Utc>,
}

impl AppContext {
    /// Open the spool, start the relay and queue whatever survived the last
    /// run.
    pub async fn start(config: &Config, connector: Arc<dyn Connector>) -> Result<Arc<Self>> {
        let cache = FileCache::open(&config.cache_dir, config.max_cache_size).await?;
        let delivered = Arc::new(DeliveredFiles::new());
        let snapshots = Arc::new(SpoolSnapshots::new(cache.clone(), delivered.clone()));
        let notifier = Arc::new(Notifier::new(snapshots.clone()));

        let uploader = Uploader::start(
            config.relay_config(),
            connector,
            delivered,
            notifier.clone(),
        )
        .await?;

        let mut requeued = 0;
        for file in cache.files().await {
            if let Err(e) = uploader.enqueue(file.clone()) {
                warn!(
                    user = %file.user(),
                    filename = %file.filename(),
                    error = %e,
                    "Dropping cached file"
                );
                if let Err(e) = file.discard().await {
                    warn!(error = %e, "Discard failed");
                }
                continue;
            }
            requeued += 1;
        }
        if requeued > 0 {
            info!(files = requeued, "Re-queued cached files");
        }

        Ok(Arc::new(Self {
            cache,
            uploader,
            notifier,
            snapshots,
            poll_timeout: config.poll_timeout,
            started_at: Utc::now(),
        }))
    }

    /// Spool `reader` for `user` and queue it for delivery.
    pub async fn submit<R>(&self, user: &str, filename: &str, reader: &mut R) -> Result<Arc<CachedEntry>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        // Refuse before spending spool space on it
        encode_user(user)?;

        let entry = self.cache.add(user, filename, reader).await?;
        if let Err(e) = self.uploader.enqueue(entry.clone()) {
            if let Err(discard) = entry.discard().await {
                warn!(error = %discard, "Discard failed");
            }
            return Err(e.into());
        }
        self.notifier.notify(user);
        Ok(entry)
    }

    pub async fn snapshot(&self, user: &str) -> UserSnapshot {
        self.snapshots.build(user).await
    }

    pub fn listen(&self, user: &str) -> Subscription<UserSnapshot> {
        self.notifier.listen(user)
    }

    pub async fn shutdown(&self) {
        info!("Stopping relay");
        self.uploader.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServerError;
    use crate::testing::{test_config, MockRemote};
    use spool_cache::CacheError;
    use spool_relay::RelayError;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_submit_delivers_and_notifies() {
        let dir = tempdir().unwrap();
        let remote = MockRemote::default();
        let ctx = AppContext::start(&test_config(dir.path()), Arc::new(remote.clone()))
            .await
            .unwrap();

        let mut sub = ctx.listen("alice");
        ctx.submit("Alice", "a.txt", &mut &b"content"[..]).await.unwrap();

        // Delivered eventually, with at least one snapshot on the way
        remote.wait_for_stored(1).await;
        let first = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.user, "alice");

        let mut snapshot = ctx.snapshot("alice").await;
        for _ in 0..200 {
            if snapshot.pending.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            snapshot = ctx.snapshot("alice").await;
        }
        assert!(snapshot.pending.is_empty());
        assert_eq!(snapshot.delivered, vec!["a.txt"]);
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_user_is_refused_before_spooling() {
        let dir = tempdir().unwrap();
        let ctx = AppContext::start(&test_config(dir.path()), Arc::new(MockRemote::default()))
            .await
            .unwrap();

        let err = ctx.submit("", "a.txt", &mut &b"x"[..]).await.unwrap_err();
        assert!(matches!(err, ServerError::Relay(e) if matches!(*e, RelayError::InvalidUser(_))));
        assert!(ctx.cache.is_empty().await);
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_buffer_full_is_reported() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.max_cache_size = 1024;
        let ctx = AppContext::start(&config, Arc::new(MockRemote::default()))
            .await
            .unwrap();

        let err = ctx.submit("alice", "a.txt", &mut &b"x"[..]).await.unwrap_err();
        assert!(matches!(err, ServerError::Cache(e) if matches!(*e, CacheError::BufferFull)));
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_delivery_frees_spool_space() {
        const MIB: usize = 1024 * 1024;
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.max_cache_size = 12 * MIB as u64;
        let remote = MockRemote::held();
        let ctx = AppContext::start(&config, Arc::new(remote.clone()))
            .await
            .unwrap();

        let big = vec![1u8; 10 * MIB];
        let half = vec![2u8; 5 * MIB];
        ctx.submit("alice", "big.bin", &mut &big[..]).await.unwrap();
        assert_eq!(ctx.cache.size(), 10 * MIB as u64);

        // Still waiting for delivery, so there is no room
        let err = ctx.submit("alice", "half.bin", &mut &half[..]).await.unwrap_err();
        assert!(matches!(err, ServerError::Cache(e) if matches!(*e, CacheError::BufferFull)));
        assert_eq!(ctx.cache.size(), 10 * MIB as u64);

        remote.release(1);
        remote.wait_for_stored(1).await;
        for _ in 0..200 {
            if ctx.cache.size() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(ctx.cache.size(), 0);

        remote.release(1);
        ctx.submit("alice", "half.bin", &mut &half[..]).await.unwrap();
        remote.wait_for_stored(2).await;
        assert_eq!(remote.stored()[1].1.len(), 5 * MIB);
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_cached_files_are_requeued_on_start() {
        let dir = tempdir().unwrap();
        {
            let cache = FileCache::open(dir.path(), 10 * 1024 * 1024).await.unwrap();
            cache.add("alice", "left.txt", &mut &b"from last run"[..]).await.unwrap();
        }

        let remote = MockRemote::default();
        let ctx = AppContext::start(&test_config(dir.path()), Arc::new(remote.clone()))
            .await
            .unwrap();

        remote.wait_for_stored(1).await;
        assert_eq!(
            remote.stored(),
            vec![("/spool/uplood-alice/left.txt".to_string(), b"from last run".to_vec())]
        );
        ctx.shutdown().await;
    }
}
