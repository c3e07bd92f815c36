//! Allocation-limited writer
//!
//! Content arrives as a stream of unknown length, so the spool reserves
//! space from a shared budget in chunks while the bytes are written and hands
//! back whatever was reserved but not used once the stream ends.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;

/// Smallest reservation requested from the budget at a time
pub const MIN_ALLOCATION: u64 = 1024 * 1024;

/// Owner of a bounded byte budget
pub trait WriteBudget: Send + Sync {
    /// Reserve `n` bytes. Returns false, without reserving anything, when
    /// the reservation would exceed the maximum.
    fn alloc_bytes(&self, n: u64) -> bool;

    /// Return `n` previously reserved bytes.
    fn free_bytes(&self, n: u64);
}

/// Lock-free byte budget with a fixed maximum
#[derive(Debug)]
pub struct ByteBudget {
    max: u64,
    current: AtomicU64,
}

impl ByteBudget {
    pub fn new(max: u64) -> Self {
        Self {
            max,
            current: AtomicU64::new(0),
        }
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    pub(crate) fn reset(&self, current: u64) {
        self.current.store(current, Ordering::Release);
    }
}

impl WriteBudget for ByteBudget {
    fn alloc_bytes(&self, n: u64) -> bool {
        self.current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(n).filter(|total| *total <= self.max)
            })
            .is_ok()
    }

    fn free_bytes(&self, n: u64) {
        let _ = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(n))
            });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Exhausted,
    Finished,
}

/// Writer that reserves budget before letting bytes through to `inner`
pub struct LimitWriter<W> {
    inner: W,
    budget: Arc<dyn WriteBudget>,
    avail: u64,
    alloc: u64,
    state: State,
}

impl<W> LimitWriter<W> {
    pub fn new(inner: W, budget: Arc<dyn WriteBudget>) -> Self {
        Self {
            inner,
            budget,
            avail: 0,
            alloc: 0,
            state: State::Open,
        }
    }

    /// True once the budget has refused a reservation
    pub fn is_exhausted(&self) -> bool {
        self.state == State::Exhausted
    }

    /// Bytes currently held from the budget on behalf of this writer
    pub fn allocated(&self) -> u64 {
        self.alloc
    }

    /// Hand back the unused part of the last reservation. No further writes
    /// are accepted afterwards.
    pub fn finish(&mut self) {
        if self.avail > 0 {
            self.budget.free_bytes(self.avail);
            self.alloc -= self.avail;
            self.avail = 0;
        }
        if self.state == State::Open {
            self.state = State::Finished;
        }
    }

    /// Hand back everything this writer ever reserved.
    pub fn free(&mut self) {
        if self.alloc > 0 {
            self.budget.free_bytes(self.alloc);
        }
        self.alloc = 0;
        self.avail = 0;
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn reserve(&mut self, len: usize) -> io::Result<()> {
        match self.state {
            State::Open => {}
            State::Exhausted => return Err(buffer_full()),
            State::Finished => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "write after limited writer was finished",
                ))
            }
        }
        let len = len as u64;
        if self.avail >= len {
            return Ok(());
        }
        let needed = len.max(MIN_ALLOCATION);
        if self.budget.alloc_bytes(needed) {
            self.alloc += needed;
            self.avail += needed;
            Ok(())
        } else {
            self.state = State::Exhausted;
            Err(buffer_full())
        }
    }
}

fn buffer_full() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "buffer full")
}

impl<W: AsyncWrite + Unpin> AsyncWrite for LimitWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Err(e) = this.reserve(buf.len()) {
            return Poll::Ready(Err(e));
        }
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.avail -= n as u64;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
