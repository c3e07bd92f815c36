//! Per-user change notifications
//!
//! Each user that someone listens to gets a small actor task. Change
//! signals for that user are coalesced through a one-slot channel; when the
//! actor picks one up it builds a single snapshot and hands it to every
//! registered listener. A listener that goes away wakes its actor so it is
//! dropped without waiting for the next change.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Builds the state observers of one user are told about
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    type Snapshot: Send + Sync + 'static;

    async fn snapshot(&self, user: &str) -> Self::Snapshot;
}

/// Receives "something changed for this user" signals
pub trait ChangeSink: Send + Sync {
    fn notify(&self, user: &str);
}

struct Listener<T> {
    snapshots: mpsc::Sender<Arc<T>>,
    leaving: oneshot::Receiver<()>,
}

impl<T> Listener<T> {
    /// Hand over `snapshot` unless the listener leaves first.
    async fn deliver(&mut self, snapshot: Arc<T>) -> bool {
        tokio::select! {
            sent = self.snapshots.send(snapshot) => sent.is_ok(),
            _ = &mut self.leaving => false,
        }
    }

    fn has_left(&mut self) -> bool {
        !matches!(
            self.leaving.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ) || self.snapshots.is_closed()
    }
}

struct UserHandle<T> {
    register: mpsc::UnboundedSender<Listener<T>>,
    updates: mpsc::Sender<()>,
    departures: mpsc::Sender<()>,
    listeners: Arc<AtomicUsize>,
}

/// Handle returned by [`Notifier::listen`]
pub struct Subscription<T> {
    snapshots: mpsc::Receiver<Arc<T>>,
    leave: Option<oneshot::Sender<()>>,
    departures: mpsc::Sender<()>,
}

impl<T> Subscription<T> {
    /// Next snapshot, or `None` once the hub has dropped this listener.
    pub async fn next(&mut self) -> Option<Arc<T>> {
        self.snapshots.recv().await
    }

    /// Stop listening. Dropping the subscription has the same effect.
    pub fn leave(mut self) {
        self.signal_leave();
    }

    fn signal_leave(&mut self) {
        if let Some(leave) = self.leave.take() {
            let _ = leave.send(());
            // Coalesced: one pending wake-up prunes every departed listener
            let _ = self.departures.try_send(());
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.signal_leave();
    }
}

/// Publish/subscribe hub keyed by lowercased user name
pub struct Notifier<S: SnapshotSource> {
    source: Arc<S>,
    users: RwLock<HashMap<String, UserHandle<S::Snapshot>>>,
}

impl<S: SnapshotSource> Notifier<S> {
    pub fn new(source: Arc<S>) -> Self {
        Self {
            source,
            users: RwLock::new(HashMap::new()),
        }
    }

    /// Register a listener for `user`, starting the user's actor if needed.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn listen(&self, user: &str) -> Subscription<S::Snapshot> {
        let key = user.to_lowercase();
        let (snapshot_tx, snapshot_rx) = mpsc::channel(1);
        let (leave_tx, leave_rx) = oneshot::channel();
        let listener = Listener {
            snapshots: snapshot_tx,
            leaving: leave_rx,
        };

        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        let handle = users
            .entry(key.clone())
            .or_insert_with(|| spawn_actor(key, self.source.clone()));
        handle.listeners.fetch_add(1, Ordering::AcqRel);
        if let Err(mpsc::error::SendError(_)) = handle.register.send(listener) {
            handle.listeners.fetch_sub(1, Ordering::AcqRel);
        }

        Subscription {
            snapshots: snapshot_rx,
            leave: Some(leave_tx),
            departures: handle.departures.clone(),
        }
    }

    /// Signal a change for `user`. Users nobody has listened to are ignored.
    pub fn notify(&self, user: &str) {
        let users = self.users.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = users.get(&user.to_lowercase()) {
            // A full slot already guarantees a fresh snapshot
            let _ = handle.updates.try_send(());
        }
    }

    /// Listeners currently registered for `user`
    pub fn listener_count(&self, user: &str) -> usize {
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user.to_lowercase())
            .map(|h| h.listeners.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}

impl<S: SnapshotSource> ChangeSink for Notifier<S> {
    fn notify(&self, user: &str) {
        Notifier::notify(self, user);
    }
}

fn spawn_actor<S: SnapshotSource>(user: String, source: Arc<S>) -> UserHandle<S::Snapshot> {
    let (register_tx, register_rx) = mpsc::unbounded_channel();
    let (update_tx, update_rx) = mpsc::channel(1);
    let (departure_tx, departure_rx) = mpsc::channel(1);
    let listeners = Arc::new(AtomicUsize::new(0));

    debug!(user = %user, "Starting notification actor");
    tokio::spawn(run_actor(
        user,
        source,
        register_rx,
        update_rx,
        departure_rx,
        listeners.clone(),
    ));

    UserHandle {
        register: register_tx,
        updates: update_tx,
        departures: departure_tx,
        listeners,
    }
}

async fn run_actor<S: SnapshotSource>(
    user: String,
    source: Arc<S>,
    mut register: mpsc::UnboundedReceiver<Listener<S::Snapshot>>,
    mut updates: mpsc::Receiver<()>,
    mut departures: mpsc::Receiver<()>,
    count: Arc<AtomicUsize>,
) {
    let mut listeners: Vec<Listener<S::Snapshot>> = Vec::new();

    loop {
        tokio::select! {
            // Registrations first, so a listener added just before a
            // signal sees the resulting snapshot
            biased;
            Some(listener) = register.recv() => listeners.push(listener),
            Some(()) = departures.recv() => {
                let before = listeners.len();
                listeners.retain_mut(|l| !l.has_left());
                forget(&user, &count, before - listeners.len(), listeners.len());
            }
            Some(()) = updates.recv() => {
                let before = listeners.len();
                listeners.retain_mut(|l| !l.has_left());
                if !listeners.is_empty() {
                    let snapshot = Arc::new(source.snapshot(&user).await);
                    let mut kept = Vec::with_capacity(listeners.len());
                    for mut listener in listeners.drain(..) {
                        if listener.deliver(snapshot.clone()).await {
                            kept.push(listener);
                        }
                    }
                    listeners = kept;
                }
                forget(&user, &count, before - listeners.len(), listeners.len());
            }
            else => break,
        }
    }
}

fn forget(user: &str, count: &AtomicUsize, departed: usize, remaining: usize) {
    if departed > 0 {
        count.fetch_sub(departed, Ordering::AcqRel);
        debug!(user = %user, departed, remaining, "Listeners left");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use tokio::time::{sleep, timeout};

    /// Counts snapshot builds; each build waits for a permit.
    struct GatedSource {
        builds: AtomicUsize,
        gate: Semaphore,
    }

    impl GatedSource {
        fn open() -> Arc<Self> {
            let source = Self::closed();
            source.gate.add_permits(1000);
            source
        }

        fn closed() -> Arc<Self> {
            Arc::new(Self {
                builds: AtomicUsize::new(0),
                gate: Semaphore::new(0),
            })
        }

        fn builds(&self) -> usize {
            self.builds.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SnapshotSource for GatedSource {
        type Snapshot = (String, usize);

        async fn snapshot(&self, user: &str) -> Self::Snapshot {
            let n = self.builds.fetch_add(1, Ordering::SeqCst) + 1;
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            (user.to_string(), n)
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_listener_receives_snapshot() {
        let notifier = Notifier::new(GatedSource::open());
        let mut sub = notifier.listen("Alice");
        assert_eq!(notifier.listener_count("alice"), 1);

        notifier.notify("ALICE");
        let snapshot = timeout(Duration::from_secs(1), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.0, "alice");
    }

    #[tokio::test]
    async fn test_notify_without_listeners_is_ignored() {
        let source = GatedSource::open();
        let notifier = Notifier::new(source.clone());
        notifier.notify("nobody");
        sleep(Duration::from_millis(20)).await;
        assert_eq!(source.builds(), 0);
        assert_eq!(notifier.listener_count("nobody"), 0);
    }

    #[tokio::test]
    async fn test_bursts_are_coalesced() {
        let source = GatedSource::closed();
        let notifier = Notifier::new(source.clone());
        let mut sub = notifier.listen("alice");

        // First signal: the actor starts building and blocks on the gate
        notifier.notify("alice");
        eventually(|| source.builds() == 1).await;

        // Only one of these fits in the slot
        notifier.notify("alice");
        notifier.notify("alice");
        notifier.notify("alice");
        source.gate.add_permits(100);

        let first = timeout(Duration::from_secs(1), sub.next()).await.unwrap().unwrap();
        let second = timeout(Duration::from_secs(1), sub.next()).await.unwrap().unwrap();
        assert_eq!(first.1, 1);
        assert_eq!(second.1, 2);

        sleep(Duration::from_millis(30)).await;
        assert_eq!(source.builds(), 2);
    }

    #[tokio::test]
    async fn test_every_listener_gets_the_same_snapshot() {
        let source = GatedSource::open();
        let notifier = Notifier::new(source.clone());
        let mut a = notifier.listen("alice");
        let mut b = notifier.listen("alice");
        assert_eq!(notifier.listener_count("alice"), 2);

        notifier.notify("alice");
        let from_a = timeout(Duration::from_secs(1), a.next()).await.unwrap().unwrap();
        let from_b = timeout(Duration::from_secs(1), b.next()).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&from_a, &from_b));
        assert_eq!(source.builds(), 1);
    }

    #[tokio::test]
    async fn test_departed_listeners_are_dropped() {
        let source = GatedSource::open();
        let notifier = Notifier::new(source.clone());
        let mut stay = notifier.listen("alice");
        let gone = notifier.listen("alice");
        let dropped = notifier.listen("alice");
        assert_eq!(notifier.listener_count("alice"), 3);

        gone.leave();
        drop(dropped);
        notifier.notify("alice");

        timeout(Duration::from_secs(1), stay.next()).await.unwrap().unwrap();
        eventually(|| notifier.listener_count("alice") == 1).await;
    }

    #[tokio::test]
    async fn test_abandoned_listeners_are_released_without_changes() {
        let source = GatedSource::open();
        let notifier = Notifier::new(source.clone());

        for _ in 0..1000 {
            let sub = notifier.listen("alice");
            drop(sub);
        }
        notifier.listen("alice").leave();

        eventually(|| notifier.listener_count("alice") == 0).await;
        assert_eq!(source.builds(), 0);
    }

    #[tokio::test]
    async fn test_users_are_independent() {
        let source = GatedSource::open();
        let notifier = Notifier::new(source.clone());
        let mut alice = notifier.listen("alice");
        let mut bob = notifier.listen("bob");

        notifier.notify("bob");
        let snapshot = timeout(Duration::from_secs(1), bob.next()).await.unwrap().unwrap();
        assert_eq!(snapshot.0, "bob");
        assert!(timeout(Duration::from_millis(30), alice.next()).await.is_err());
    }
}
