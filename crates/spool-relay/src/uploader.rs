//! Relay worker
//!
//! A single task drains the delivery queue into the remote endpoint. The
//! head of the queue is retried until it is delivered, so one stalled file
//! holds back everything behind it. Connections are opened lazily, dropped
//! after a period of inactivity, and re-established with a fixed delay
//! after failures.

use crate::delivered::DeliveredFiles;
use crate::error::{RelayError, Result};
use crate::notify::ChangeSink;
use crate::queue::DeliveryQueue;
use crate::remote::{Connector, RemoteSession};
use crate::username::{decode_user, encode_user};
use serde::Serialize;
use spool_cache::CachedFile;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Remote directory name tag in front of every encoded user name
pub const DEFAULT_USER_DIR_PREFIX: &str = "uplood-";

const DEFAULT_DELAY: Duration = Duration::from_secs(60);

/// Item type of the delivery queue
pub type QueuedFile = Arc<dyn CachedFile>;

/// Worker timing and remote layout
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Base directory holding the user directories
    pub remote_dir: String,
    pub user_dir_prefix: String,
    /// Wait between failed connection attempts
    pub reconnect_delay: Duration,
    /// Disconnect after this long with an empty queue
    pub idle_timeout: Duration,
    /// Wait after a failed delivery before trying again
    pub fail_delay: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            remote_dir: "/".to_string(),
            user_dir_prefix: DEFAULT_USER_DIR_PREFIX.to_string(),
            reconnect_delay: DEFAULT_DELAY,
            idle_timeout: DEFAULT_DELAY,
            fail_delay: DEFAULT_DELAY,
        }
    }
}

/// Connection state of the worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "message", rename_all = "lowercase")]
pub enum RelayStatus {
    Connecting,
    Connected,
    Error(String),
    Disconnecting,
    Inactive,
}

impl fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayStatus::Connecting => write!(f, "connecting"),
            RelayStatus::Connected => write!(f, "connected"),
            RelayStatus::Error(msg) => write!(f, "error: {}", msg),
            RelayStatus::Disconnecting => write!(f, "disconnecting"),
            RelayStatus::Inactive => write!(f, "inactive"),
        }
    }
}

/// Handle to the running relay worker
pub struct Uploader {
    queue: Arc<DeliveryQueue<QueuedFile>>,
    delivered: Arc<DeliveredFiles>,
    status: watch::Receiver<RelayStatus>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Uploader {
    /// Connect once, learn what the endpoint already holds and start the
    /// worker.
    ///
    /// Fails if the endpoint cannot be reached or its base directory cannot
    /// be listed.
    pub async fn start(
        config: RelayConfig,
        connector: Arc<dyn Connector>,
        delivered: Arc<DeliveredFiles>,
        notifier: Arc<dyn ChangeSink>,
    ) -> Result<Self> {
        let (status_tx, status_rx) = watch::channel(RelayStatus::Inactive);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue = Arc::new(DeliveryQueue::new());

        let mut worker = Worker {
            config,
            connector,
            session: None,
            queue: queue.clone(),
            delivered: delivered.clone(),
            notifier,
            status: status_tx,
            shutdown: shutdown_rx,
        };

        worker.connect().await?;
        if let Err(e) = worker.find_files().await {
            worker.disconnect(Some(&e)).await;
            return Err(e);
        }

        let task = tokio::spawn(worker.run());
        Ok(Self {
            queue,
            delivered,
            status: status_rx,
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
        })
    }

    /// Queue `file` for delivery.
    ///
    /// Fails when the owning user has no remote encoding; the caller still
    /// owns the file then and should discard it.
    pub fn enqueue(&self, file: QueuedFile) -> Result<()> {
        encode_user(file.user())?;
        debug!(user = %file.user(), filename = %file.filename(), "Queued");
        self.queue.push(file);
        Ok(())
    }

    /// Stop the worker and wait for it to disconnect.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Relay worker failed: {}", e);
            }
        }
    }

    pub fn status(&self) -> RelayStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<RelayStatus> {
        self.status.clone()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Files waiting for delivery, head first
    pub fn queued(&self) -> Vec<QueuedFile> {
        self.queue.snapshot()
    }

    /// Filenames delivered for `user`
    pub fn userfiles(&self, user: &str) -> Vec<String> {
        self.delivered.userfiles(user)
    }
}

enum Idle {
    Woken,
    TimedOut,
    Shutdown,
}

struct Worker {
    config: RelayConfig,
    connector: Arc<dyn Connector>,
    session: Option<Box<dyn RemoteSession>>,
    queue: Arc<DeliveryQueue<QueuedFile>>,
    delivered: Arc<DeliveredFiles>,
    notifier: Arc<dyn ChangeSink>,
    status: watch::Sender<RelayStatus>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        info!("Relay worker started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let Some(file) = self.queue.peek() else {
                match self.idle().await {
                    Idle::Woken => continue,
                    Idle::TimedOut => {
                        if self.session.is_some() {
                            debug!("Idle, closing connection");
                        }
                        self.disconnect(None).await;
                        continue;
                    }
                    Idle::Shutdown => break,
                }
            };

            let mut content = match file.open().await {
                Ok(content) => content,
                Err(e) => {
                    warn!(
                        user = %file.user(),
                        filename = %file.filename(),
                        error = %e,
                        "Can't open content, dropping"
                    );
                    self.queue.pop();
                    self.discard(file.as_ref()).await;
                    self.notifier.notify(file.user());
                    continue;
                }
            };

            if !self.ensure_connected().await {
                break;
            }

            match self.deliver(file.as_ref(), &mut *content).await {
                Ok(bytes) => {
                    drop(content);
                    self.delivered.record(file.user(), file.filename());
                    self.queue.pop();
                    self.discard(file.as_ref()).await;
                    self.notifier.notify(file.user());
                    info!(
                        user = %file.user(),
                        filename = %file.filename(),
                        bytes,
                        "Delivered"
                    );
                }
                Err(e) => {
                    warn!(
                        user = %file.user(),
                        filename = %file.filename(),
                        error = %e,
                        "Delivery failed"
                    );
                    drop(content);
                    self.disconnect(Some(&e)).await;
                    if !self.pause(self.config.fail_delay).await {
                        break;
                    }
                }
            }
        }

        self.disconnect(None).await;
        info!("Relay worker stopped");
    }

    async fn deliver(
        &mut self,
        file: &dyn CachedFile,
        content: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64> {
        let user_dir = format!(
            "{}{}",
            self.config.user_dir_prefix,
            encode_user(file.user())?
        );
        let session = self.session.as_mut().ok_or(RelayError::NotConnected)?;

        session.change_dir(&self.config.remote_dir).await?;
        // Usually exists already
        if let Err(e) = session.make_dir(&user_dir).await {
            debug!(dir = %user_dir, error = %e, "Make directory failed");
        }
        session.change_dir(&user_dir).await?;
        session.store(file.filename(), content).await
    }

    /// Seed the delivered-files record from the remote user directories.
    async fn find_files(&mut self) -> Result<()> {
        let session = self.session.as_mut().ok_or(RelayError::NotConnected)?;
        session.change_dir(&self.config.remote_dir).await?;
        let names = session.name_list(".").await?;

        let (mut users, mut files) = (0, 0);
        for name in names {
            let name = last_component(&name);
            let Some(label) = name.strip_prefix(self.config.user_dir_prefix.as_str()) else {
                continue;
            };
            let user = match decode_user(label) {
                Ok(user) => user,
                Err(e) => {
                    warn!(name, error = %e, "Unexpected remote entry");
                    continue;
                }
            };
            match session.name_list(name).await {
                Ok(listing) => {
                    users += 1;
                    for filename in &listing {
                        if self.delivered.record(&user, last_component(filename)) {
                            files += 1;
                        }
                    }
                }
                Err(e) => warn!(user = %user, error = %e, "Listing user directory failed"),
            }
        }

        info!(files, users, "Found delivered files");
        Ok(())
    }

    /// Keep trying to connect until connected or shut down.
    async fn ensure_connected(&mut self) -> bool {
        while self.session.is_none() {
            if self.connect().await.is_ok() {
                break;
            }
            if !self.pause(self.config.reconnect_delay).await {
                return false;
            }
        }
        true
    }

    async fn connect(&mut self) -> Result<()> {
        info!("Connecting");
        self.set_status(RelayStatus::Connecting);
        match self.connector.connect().await {
            Ok(session) => {
                self.session = Some(session);
                self.set_status(RelayStatus::Connected);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Connection failed");
                self.set_status(RelayStatus::Error(e.to_string()));
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self, cause: Option<&RelayError>) {
        if let Some(session) = self.session.take() {
            info!("Disconnecting");
            self.set_status(RelayStatus::Disconnecting);
            if let Err(e) = session.quit().await {
                warn!(error = %e, "Disconnect failed");
            }
            if cause.is_none() {
                self.set_status(RelayStatus::Inactive);
            }
        }
        if let Some(e) = cause {
            self.set_status(RelayStatus::Error(e.to_string()));
        }
    }

    async fn discard(&self, file: &dyn CachedFile) {
        if let Err(e) = file.discard().await {
            warn!(
                user = %file.user(),
                filename = %file.filename(),
                error = %e,
                "Discard failed"
            );
        }
    }

    async fn idle(&mut self) -> Idle {
        tokio::select! {
            _ = self.queue.wait() => Idle::Woken,
            _ = tokio::time::sleep(self.config.idle_timeout) => Idle::TimedOut,
            _ = stopped(&mut self.shutdown) => Idle::Shutdown,
        }
    }

    /// Sleep for `delay`. Returns false if shut down meanwhile.
    async fn pause(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = stopped(&mut self.shutdown) => false,
        }
    }

    fn set_status(&self, status: RelayStatus) {
        self.status.send_replace(status);
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender means the handle is gone; stop as well
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn last_component(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}
