//! Object pools for the connection hot path.
//!
//! Every write, request, timer and inbound message would otherwise allocate.
//! Pools hand out recycled objects instead and count what they do:
//!
//! ```text
//!   acquire ──► reused (pool had one) or new (pool was empty)
//!   release ──► recycle() then push back; never refused
//!
//!   outstanding = new + reused - released
//! ```
//!
//! Counters are split into a per-interval part (`u32`, cheap to bump) and a
//! cumulative part (`u64`). A sampler task started with
//! [`Pools::start_sampler`] periodically folds the former into the latter.

use std::{
    ops::{Deref, DerefMut},
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{Instant, Sleep},
};

use crate::{
    context::Context,
    slot::{RequestSlot, WriteSlot},
};

/// Reset an object to its pristine state before it goes back to a pool.
pub trait Recycle {
    /// Drop whatever the previous user left behind.
    fn recycle(&mut self);
}

/// Acquire/release counters for one pool.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    new: AtomicU32,
    reused: AtomicU32,
    released: AtomicU32,
    total_new: AtomicU64,
    total_reused: AtomicU64,
    total_released: AtomicU64,
}

impl PoolMetrics {
    /// Move the interval counters into the cumulative totals.
    pub fn fold(&self) {
        let fold = |interval: &AtomicU32, total: &AtomicU64| {
            let n = interval.swap(0, Ordering::AcqRel);
            total.fetch_add(u64::from(n), Ordering::AcqRel);
        };
        fold(&self.new, &self.total_new);
        fold(&self.reused, &self.total_reused);
        fold(&self.released, &self.total_released);
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            new: self.new.load(Ordering::Acquire),
            reused: self.reused.load(Ordering::Acquire),
            released: self.released.load(Ordering::Acquire),
            total_new: self.total_new.load(Ordering::Acquire),
            total_reused: self.total_reused.load(Ordering::Acquire),
            total_released: self.total_released.load(Ordering::Acquire),
        }
    }
}

/// Snapshot of one pool's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Objects created since the last fold
    pub new: u32,
    /// Objects handed out again since the last fold
    pub reused: u32,
    /// Objects returned since the last fold
    pub released: u32,
    /// Objects created, folded
    pub total_new: u64,
    /// Objects handed out again, folded
    pub total_reused: u64,
    /// Objects returned, folded
    pub total_released: u64,
}

impl PoolStats {
    /// Objects currently checked out.
    pub fn outstanding(&self) -> u64 {
        let acquired = self.total_new
            + u64::from(self.new)
            + self.total_reused
            + u64::from(self.reused);
        acquired.saturating_sub(self.total_released + u64::from(self.released))
    }

    /// All acquisitions, interval and folded.
    pub fn acquired(&self) -> u64 {
        self.total_new + u64::from(self.new) + self.total_reused + u64::from(self.reused)
    }

    /// All releases, interval and folded.
    pub fn returned(&self) -> u64 {
        self.total_released + u64::from(self.released)
    }
}

/// Unbounded free list of recyclable objects.
#[derive(Debug)]
pub struct Pool<T> {
    free: Mutex<Vec<T>>,
    metrics: PoolMetrics,
}

impl<T: Recycle> Pool<T> {
    /// Empty pool.
    pub fn new() -> Self {
        Self { free: Mutex::new(Vec::new()), metrics: PoolMetrics::default() }
    }

    /// Take an object from the pool, or build one with `make`.
    pub fn acquire(&self, make: impl FnOnce() -> T) -> T {
        let recycled = self.free.lock().pop();
        match recycled {
            Some(obj) => {
                self.metrics.reused.fetch_add(1, Ordering::AcqRel);
                obj
            },
            None => {
                self.metrics.new.fetch_add(1, Ordering::AcqRel);
                make()
            },
        }
    }

    /// Like [`acquire`](Self::acquire), but the object goes back to the pool
    /// when the returned guard is dropped.
    pub fn lease(&self, make: impl FnOnce() -> T) -> Lease<'_, T> {
        Lease { pool: self, obj: Some(self.acquire(make)) }
    }

    /// Recycle `obj` and return it to the pool.
    pub fn release(&self, mut obj: T) {
        obj.recycle();
        self.metrics.released.fetch_add(1, Ordering::AcqRel);
        self.free.lock().push(obj);
    }

    /// Objects currently idle in the pool.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    /// Counters for this pool.
    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }
}

impl<T: Recycle> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Pooled object that returns itself on drop.
///
/// `obj` is `Some` from construction until `drop` moves it back into the
/// pool, so the `None` arms of `Deref`/`DerefMut` are unreachable. Pooled
/// types such as [`Timer`] have no cheap placeholder to swap in instead.
#[derive(Debug)]
pub struct Lease<'a, T: Recycle> {
    pool: &'a Pool<T>,
    /// `Some` for the whole life of the lease; taken only in `Drop`.
    obj: Option<T>,
}

impl<T: Recycle> Deref for Lease<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.obj {
            Some(obj) => obj,
            None => unreachable!("lease used after release"),
        }
    }
}

impl<T: Recycle> DerefMut for Lease<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.obj {
            Some(obj) => obj,
            None => unreachable!("lease used after release"),
        }
    }
}

impl<T: Recycle> Drop for Lease<'_, T> {
    fn drop(&mut self) {
        if let Some(obj) = self.obj.take() {
            self.pool.release(obj);
        }
    }
}

/// Reusable deadline.
///
/// Wraps a pinned [`Sleep`] so one allocation serves many timeouts.
#[derive(Debug)]
pub struct Timer {
    sleep: Pin<Box<Sleep>>,
    armed: bool,
}

impl Timer {
    /// Timer already armed for `deadline`.
    pub fn new(deadline: Instant) -> Self {
        Self { sleep: Box::pin(tokio::time::sleep_until(deadline)), armed: true }
    }

    /// Re-arm for `deadline`.
    pub fn arm(&mut self, deadline: Instant) {
        self.sleep.as_mut().reset(deadline);
        self.armed = true;
    }

    /// Whether the timer was armed since it was last recycled.
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Wait for the deadline.
    pub async fn expired(&mut self) {
        self.sleep.as_mut().await;
    }
}

impl Recycle for Timer {
    fn recycle(&mut self) {
        self.armed = false;
    }
}

/// Snapshot of every hot-path pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolsSnapshot {
    /// Deadline timers
    pub timers: PoolStats,
    /// Handler contexts
    pub contexts: PoolStats,
    /// Pending request slots
    pub requests: PoolStats,
    /// Pending write slots
    pub writes: PoolStats,
}

/// The pools shared by connections, servers and clients.
///
/// Built explicitly and injected as `Arc<Pools>`; nothing here is global.
#[derive(Debug, Default)]
pub struct Pools {
    /// Deadline timers
    pub timers: Pool<Timer>,
    /// Handler contexts
    pub contexts: Pool<Context>,
    /// Pending request slots
    pub requests: Pool<Arc<RequestSlot>>,
    /// Pending write slots
    pub writes: Pool<Arc<WriteSlot>>,
}

impl Pools {
    /// Fresh, empty pools.
    pub fn new() -> Self {
        Self::default()
    }

    /// Timer armed for `timeout` from now.
    pub fn timer(&self, timeout: Duration) -> Timer {
        let deadline = Instant::now() + timeout;
        let mut timer = self.timers.acquire(|| Timer::new(deadline));
        timer.arm(deadline);
        timer
    }

    /// Like [`timer`](Self::timer), released back to the pool on drop.
    pub fn lease_timer(&self, timeout: Duration) -> Lease<'_, Timer> {
        let deadline = Instant::now() + timeout;
        let mut timer = self.timers.lease(|| Timer::new(deadline));
        timer.arm(deadline);
        timer
    }

    /// Counters of all four pools.
    pub fn stats(&self) -> PoolsSnapshot {
        PoolsSnapshot {
            timers: self.timers.metrics().snapshot(),
            contexts: self.contexts.metrics().snapshot(),
            requests: self.requests.metrics().snapshot(),
            writes: self.writes.metrics().snapshot(),
        }
    }

    /// Fold interval counters into totals for all four pools.
    pub fn fold(&self) {
        self.timers.metrics().fold();
        self.contexts.metrics().fold();
        self.requests.metrics().fold();
        self.writes.metrics().fold();
    }

    /// Start a task folding the counters every `interval`.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn start_sampler(self: &Arc<Self>, interval: Duration) -> SamplerHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let pools = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => pools.fold(),
                    _ = &mut stop_rx => break,
                }
            }
        });
        tracing::debug!(?interval, "pool sampler started");

        SamplerHandle { stop: Some(stop_tx), task: Some(task), pools: Arc::clone(self) }
    }
}

/// Handle to a running pool sampler.
///
/// Dropping the handle stops the task without the final fold.
#[derive(Debug)]
pub struct SamplerHandle {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    pools: Arc<Pools>,
}

impl SamplerHandle {
    /// Stop the sampler, wait for it to exit, and fold once more.
    ///
    /// Later calls do nothing.
    pub async fn stop(&mut self) {
        let Some(stop) = self.stop.take() else {
            return;
        };
        let _ = stop.send(());
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "pool sampler task failed");
            }
        }
        self.pools.fold();
        tracing::debug!("pool sampler stopped");
    }

    /// Whether [`stop`](Self::stop) has run.
    pub fn is_stopped(&self) -> bool {
        self.stop.is_none()
    }
}

impl Drop for SamplerHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}
