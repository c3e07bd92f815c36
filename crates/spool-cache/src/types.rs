//! Cache types

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::AsyncRead;

/// Persisted description of one spooled file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub user: String,
    pub filename: String,
    /// Name of the backing file inside the cache directory
    pub locator: String,
    pub size: u64,
}

/// Statistics about the cache
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_size: u64,
    pub max_size: u64,
}

/// Spooled content that can be delivered and then thrown away
#[async_trait]
pub trait CachedFile: Send + Sync + fmt::Debug {
    fn user(&self) -> &str;

    fn filename(&self) -> &str;

    fn size(&self) -> u64;

    /// Open the content from the start.
    async fn open(&self) -> std::io::Result<Box<dyn AsyncRead + Send + Unpin>>;

    /// Drop the content. Irreversible.
    async fn discard(&self) -> Result<()>;
}
