//! In-memory remote endpoint for service tests

use crate::config::Config;
use async_trait::async_trait;
use spool_relay::{Connector, RelayError, RemoteSession, RemoteTarget, Result};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Semaphore;

pub(crate) fn test_config(cache_dir: &Path) -> Config {
    Config {
        port: 0,
        cache_dir: cache_dir.to_path_buf(),
        max_cache_size: 10 * 1024 * 1024,
        remote: RemoteTarget::parse("ftp://mock.invalid/spool").unwrap(),
        user_dir_prefix: "uplood-".to_string(),
        reconnect_delay: Duration::from_millis(10),
        idle_timeout: Duration::from_secs(30),
        fail_delay: Duration::from_millis(10),
        poll_timeout: Duration::from_millis(200),
    }
}

/// Accepts every upload and remembers it by full path
#[derive(Clone, Default)]
pub(crate) struct MockRemote {
    stored: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    gate: Option<Arc<Semaphore>>,
}

impl MockRemote {
    /// Uploads wait until [`MockRemote::release`] lets them through.
    pub(crate) fn held() -> Self {
        Self {
            stored: Arc::default(),
            gate: Some(Arc::new(Semaphore::new(0))),
        }
    }

    pub(crate) fn release(&self, uploads: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(uploads);
        }
    }

    pub(crate) fn stored(&self) -> Vec<(String, Vec<u8>)> {
        self.stored.lock().unwrap().clone()
    }

    pub(crate) async fn wait_for_stored(&self, count: usize) {
        for _ in 0..400 {
            if self.stored.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} stored files", count);
    }
}

#[async_trait]
impl Connector for MockRemote {
    async fn connect(&self) -> Result<Box<dyn RemoteSession>> {
        Ok(Box::new(MockSession {
            stored: self.stored.clone(),
            gate: self.gate.clone(),
            cwd: "/".to_string(),
        }))
    }
}

struct MockSession {
    stored: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    gate: Option<Arc<Semaphore>>,
    cwd: String,
}

#[async_trait]
impl RemoteSession for MockSession {
    async fn change_dir(&mut self, path: &str) -> Result<()> {
        self.cwd = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{}", self.cwd.trim_end_matches('/'), path)
        };
        Ok(())
    }

    async fn make_dir(&mut self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn store(
        &mut self,
        name: &str,
        content: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        let mut data = Vec::new();
        content
            .read_to_end(&mut data)
            .await
            .map_err(|e| RelayError::Remote(e.to_string()))?;
        let len = data.len() as u64;
        self.stored
            .lock()
            .unwrap()
            .push((format!("{}/{}", self.cwd, name), data));
        Ok(len)
    }

    async fn name_list(&mut self, _path: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn quit(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
