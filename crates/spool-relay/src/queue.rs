//! In-memory delivery queue
//!
//! Holds references to spooled files in submission order. Producers push
//! from request handlers; the relay worker is the only consumer and parks on
//! [`DeliveryQueue::wait`] while the queue is empty.

use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

const INITIAL_CAPACITY: usize = 16;

/// Growable circular buffer
pub struct RingBuffer<T> {
    slots: Vec<Option<T>>,
    head: usize,
    len: usize,
}

impl<T> RingBuffer<T> {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    /// Capacity is rounded up to the next power of two, at least 16.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(INITIAL_CAPACITY).next_power_of_two();
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            head: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn push_back(&mut self, item: T) {
        if self.len == self.slots.len() {
            self.grow();
        }
        let tail = (self.head + self.len) % self.slots.len();
        self.slots[tail] = Some(item);
        self.len += 1;
    }

    pub fn front(&self) -> Option<&T> {
        if self.len == 0 {
            return None;
        }
        self.slots[self.head].as_ref()
    }

    pub fn pop_front(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.slots[self.head].take();
        self.len -= 1;
        self.head = if self.len == 0 {
            0
        } else {
            (self.head + 1) % self.slots.len()
        };
        item
    }

    /// Items from head to tail
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let cap = self.slots.len();
        (0..self.len).filter_map(move |i| self.slots[(self.head + i) % cap].as_ref())
    }

    /// Double the capacity, unwrapping the contents to start at slot 0.
    fn grow(&mut self) {
        let old_cap = self.slots.len();
        let mut slots = Vec::with_capacity(old_cap * 2);
        for i in 0..self.len {
            slots.push(self.slots[(self.head + i) % old_cap].take());
        }
        slots.resize_with(old_cap * 2, || None);
        self.slots = slots;
        self.head = 0;
    }
}

impl<T> Default for RingBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// FIFO of pending deliveries with a wake signal for the consumer
pub struct DeliveryQueue<T> {
    items: Mutex<RingBuffer<T>>,
    wake_tx: mpsc::Sender<()>,
    wake_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl<T: Clone> DeliveryQueue<T> {
    pub fn new() -> Self {
        // One slot: wake-ups coalesce while the consumer is busy
        let (wake_tx, wake_rx) = mpsc::channel(1);
        Self {
            items: Mutex::new(RingBuffer::new()),
            wake_tx,
            wake_rx: tokio::sync::Mutex::new(wake_rx),
        }
    }

    pub fn push(&self, item: T) {
        let mut items = self.lock();
        items.push_back(item);
        if items.len() == 1 {
            let _ = self.wake_tx.try_send(());
        }
    }

    pub fn peek(&self) -> Option<T> {
        self.lock().front().cloned()
    }

    /// Drop the head. Emptying the queue also clears a pending wake-up.
    pub fn pop(&self) -> Option<T> {
        let mut items = self.lock();
        let item = items.pop_front();
        if items.is_empty() {
            if let Ok(mut rx) = self.wake_rx.try_lock() {
                let _ = rx.try_recv();
            }
        }
        item
    }

    /// Wait until an item has been pushed onto an empty queue.
    ///
    /// Wake-ups are hints: the queue may already have been drained by the
    /// time this returns.
    pub async fn wait(&self) {
        let mut rx = self.wake_rx.lock().await;
        // The sender lives in `self`, so the channel never closes here
        let _ = rx.recv().await;
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.lock().iter().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, RingBuffer<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone> Default for DeliveryQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
