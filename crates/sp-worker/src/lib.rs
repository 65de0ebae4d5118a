// SPDX-License-Identifier: Apache-2.0

//! Fixed-size worker pool.
//!
//! `N` [`WorkerSlot`]s are created once at startup and recycled for the life
//! of the process via [`WorkerPool::allocate`] / [`WorkerPool::release`]. A
//! counting semaphore bounds concurrency; an ordered free-index queue hands
//! out the lowest free slot first, matching the "fixed-position slot"
//! contract.
//!
//! The hard part is the timeout race: [`WorkerPool::submit`] detaches the
//! handler invocation onto its own task so that a caller racing it against a
//! deadline (see [`WorkerPool::timeout_worker`]) can walk away without
//! killing the in-flight handler. Whichever side — the handler completing, or
//! the caller declaring a timeout — observes the other's flag first decides
//! the outcome; see `timeout_worker` for the exact rule. Permits are returned
//! to the semaphore manually (via `OwnedSemaphorePermit::forget` at acquire
//! time) so that whichever side resolves the race last is the one that
//! credits the slot back, exactly once.

use fnmesh_event::{Event, Response};
use futures::FutureExt;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Duration;
use tracing::{debug, warn};

/// The pluggable handler runtime. Implementations may be a subprocess bridge,
/// an in-process closure, or anything else that can turn an `Event` into a
/// `Response`; the pool treats it as opaque and tolerates it panicking.
#[async_trait::async_trait]
pub trait Runtime: Send + Sync + 'static {
    async fn invoke(&self, event: Event) -> Result<Response, RuntimeError>;
}

/// Lets the processor root hand out a dynamically-selected runtime (e.g. a
/// subprocess bridge chosen by config) to [`WorkerPool::new`] without naming
/// a concrete type.
#[async_trait::async_trait]
impl Runtime for Arc<dyn Runtime> {
    async fn invoke(&self, event: Event) -> Result<Response, RuntimeError> {
        (**self).invoke(event).await
    }
}

#[derive(Debug, thiserror::Error)]
#[error("runtime error: {0}")]
pub struct RuntimeError(pub String);

impl RuntimeError {
    pub fn new(msg: impl Into<String>) -> Self {
        RuntimeError(msg.into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("no worker slot available within the allocation timeout")]
    Timeout,
    #[error("worker answered the request")]
    WorkerAnswered,
    #[error("handler process error: {0}")]
    Process(String),
    #[error("handler panicked: {0}")]
    Panic(String),
}

#[derive(Default)]
pub struct Stats {
    pub submits: AtomicU64,
    pub timeouts: AtomicU64,
    pub failures: AtomicU64,
}

impl Stats {
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.submits.load(Ordering::Relaxed),
            self.timeouts.load(Ordering::Relaxed),
            self.failures.load(Ordering::Relaxed),
        )
    }
}

struct SlotInner {
    timed_out: AtomicBool,
    answered: AtomicBool,
    released: AtomicBool,
}

/// A leased, fixed-position worker slot. Must eventually be passed to
/// [`WorkerPool::release`] (or abandoned via the timeout path, which releases
/// it on the caller's behalf once the handler actually returns).
pub struct SlotHandle {
    index: usize,
}

impl SlotHandle {
    pub fn index(&self) -> usize {
        self.index
    }
}

struct PoolInner {
    slots: Vec<Arc<SlotInner>>,
    free_indices: Mutex<VecDeque<usize>>,
    semaphore: Arc<Semaphore>,
}

impl PoolInner {
    /// Idempotently returns `index` to the free pool: safe to call twice for
    /// the same lease, since the second call is a no-op behind `released`.
    async fn release_index(&self, index: usize) {
        let slot = &self.slots[index];
        if slot
            .released
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.semaphore.add_permits(1);
        let mut free = self.free_indices.lock().await;
        free.push_back(index);
    }
}

/// A fixed-size pool of worker slots executing a shared [`Runtime`].
pub struct WorkerPool<R: Runtime> {
    runtime: Arc<R>,
    inner: Arc<PoolInner>,
    stats: Arc<Stats>,
}

impl<R: Runtime> Clone for WorkerPool<R> {
    fn clone(&self) -> Self {
        WorkerPool {
            runtime: self.runtime.clone(),
            inner: self.inner.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl<R: Runtime> WorkerPool<R> {
    pub fn new(num_workers: usize, runtime: R) -> Self {
        assert!(num_workers > 0, "a worker pool needs at least one slot");
        let slots: Vec<Arc<SlotInner>> = (0..num_workers)
            .map(|_| {
                Arc::new(SlotInner {
                    timed_out: AtomicBool::new(false),
                    answered: AtomicBool::new(false),
                    released: AtomicBool::new(true),
                })
            })
            .collect();
        let free_indices = (0..num_workers).collect();
        WorkerPool {
            runtime: Arc::new(runtime),
            inner: Arc::new(PoolInner {
                slots,
                free_indices: Mutex::new(free_indices),
                semaphore: Arc::new(Semaphore::new(num_workers)),
            }),
            stats: Arc::new(Stats::default()),
        }
    }

    pub fn num_workers(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn num_workers_available(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Blocks until a free slot is available, or returns `WorkerError::Timeout`.
    pub async fn allocate(&self, timeout: Duration) -> Result<SlotHandle, WorkerError> {
        let permit = tokio::time::timeout(timeout, self.inner.semaphore.clone().acquire_owned())
            .await
            .map_err(|_| WorkerError::Timeout)?
            .expect("semaphore is never closed");
        // We track slot lifetime via `free_indices` + `released`, not via the
        // permit's own RAII: forget it so the only place a permit is ever
        // credited back is `release_index`.
        permit.forget();

        let index = {
            let mut free = self.inner.free_indices.lock().await;
            free.pop_front().expect("permit implies a free index")
        };
        let slot = &self.inner.slots[index];
        slot.timed_out.store(false, Ordering::SeqCst);
        slot.answered.store(false, Ordering::SeqCst);
        slot.released.store(false, Ordering::SeqCst);

        Ok(SlotHandle { index })
    }

    /// Delivers `event` to the runtime and waits for the response. The
    /// handler runs on its own task so that a caller racing this future
    /// against a deadline can abandon it without killing the invocation; see
    /// [`WorkerPool::timeout_worker`].
    pub async fn submit(&self, slot: &SlotHandle, event: Event) -> Result<Response, WorkerError> {
        let slot_inner = self.inner.slots[slot.index].clone();
        let runtime = self.runtime.clone();
        let stats = self.stats.clone();
        let pool_inner = self.inner.clone();
        let index = slot.index;

        let join = tokio::spawn(async move {
            let result = AssertUnwindSafe(runtime.invoke(event)).catch_unwind().await;
            // Whichever of {this completion, a concurrent TimeoutWorker} is
            // observed second decides whether the response still matters.
            let already_timed_out = slot_inner.timed_out.load(Ordering::SeqCst);
            slot_inner.answered.store(true, Ordering::SeqCst);
            stats.submits.fetch_add(1, Ordering::Relaxed);

            let outcome = match result {
                Ok(Ok(resp)) => Ok(resp),
                Ok(Err(e)) => {
                    stats.failures.fetch_add(1, Ordering::Relaxed);
                    Err(WorkerError::Process(e.0))
                }
                Err(panic) => {
                    stats.failures.fetch_add(1, Ordering::Relaxed);
                    Err(WorkerError::Panic(panic_message(&panic)))
                }
            };

            if already_timed_out {
                // The dispatcher already gave up on us. Release the slot
                // ourselves, since the caller abandoned its handle.
                debug!(slot = index, "late worker response dropped after timeout");
                pool_inner.release_index(index).await;
                None
            } else {
                Some(outcome)
            }
        });

        match join.await {
            Ok(Some(outcome)) => outcome,
            Ok(None) => Err(WorkerError::Timeout),
            Err(join_err) => Err(WorkerError::Process(join_err.to_string())),
        }
    }

    /// Called by a caller who has given up waiting on [`WorkerPool::submit`].
    /// Marks the slot timed out, yields once to let an in-flight `submit`
    /// latch `answered` if it is about to finish, then resolves the race:
    /// if the worker answered first, its response must not be forwarded —
    /// return an error. Otherwise the timeout wins; the caller must abandon
    /// (not release) its `SlotHandle`, since the still-running handler's task
    /// will release the slot itself once it finally returns.
    pub async fn timeout_worker(&self, slot: &SlotHandle) -> Result<(), WorkerError> {
        let slot_inner = &self.inner.slots[slot.index];
        slot_inner.timed_out.store(true, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.stats.timeouts.fetch_add(1, Ordering::Relaxed);

        if slot_inner.answered.load(Ordering::SeqCst) {
            warn!(
                slot = slot.index,
                "worker answered the request after timeout was declared"
            );
            Err(WorkerError::WorkerAnswered)
        } else {
            Ok(())
        }
    }

    /// Returns a slot to the pool. Idempotent: safe even if the slot was
    /// already released by a late-completing `submit` task.
    ///
    /// After `timeout_worker` resolves in the timeout's favor, the caller
    /// should simply drop its `SlotHandle` instead of calling this: the
    /// still-running handler's task releases the slot itself once it
    /// finally returns (see `submit`). Calling `release` early would return
    /// the slot to the pool while the handler still holds it.
    pub async fn release(&self, slot: SlotHandle) {
        self.inner.release_index(slot.index).await;
    }
}

/// Object-safe view of a [`WorkerPool`], so trigger instances can hold one
/// behind `Arc<dyn WorkerAllocator>` without naming a concrete `Runtime` type.
/// Triggers reference allocators by name (`workerAllocatorName`); the
/// processor root resolves the name once at boot and hands out this trait
/// object.
#[async_trait::async_trait]
pub trait WorkerAllocator: Send + Sync {
    async fn allocate(&self, timeout: Duration) -> Result<SlotHandle, WorkerError>;
    async fn submit(&self, slot: &SlotHandle, event: Event) -> Result<Response, WorkerError>;
    async fn timeout_worker(&self, slot: &SlotHandle) -> Result<(), WorkerError>;
    async fn release(&self, slot: SlotHandle);
    fn num_workers(&self) -> usize;
    fn num_workers_available(&self) -> usize;
    fn stats(&self) -> &Stats;
}

#[async_trait::async_trait]
impl<R: Runtime> WorkerAllocator for WorkerPool<R> {
    async fn allocate(&self, timeout: Duration) -> Result<SlotHandle, WorkerError> {
        WorkerPool::allocate(self, timeout).await
    }

    async fn submit(&self, slot: &SlotHandle, event: Event) -> Result<Response, WorkerError> {
        WorkerPool::submit(self, slot, event).await
    }

    async fn timeout_worker(&self, slot: &SlotHandle) -> Result<(), WorkerError> {
        WorkerPool::timeout_worker(self, slot).await
    }

    async fn release(&self, slot: SlotHandle) {
        WorkerPool::release(self, slot).await
    }

    fn num_workers(&self) -> usize {
        WorkerPool::num_workers(self)
    }

    fn num_workers_available(&self) -> usize {
        WorkerPool::num_workers_available(self)
    }

    fn stats(&self) -> &Stats {
        WorkerPool::stats(self)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fnmesh_event::{Event, Response, TriggerInfo, TriggerVariant};
    use std::time::Duration;

    fn info() -> TriggerInfo {
        TriggerInfo {
            class: "trigger".into(),
            kind: "test".into(),
            name: "t".into(),
        }
    }

    struct EchoRuntime;
    #[async_trait::async_trait]
    impl Runtime for EchoRuntime {
        async fn invoke(&self, event: Event) -> Result<Response, RuntimeError> {
            Ok(Response::new().with_body(event.get_body().clone()))
        }
    }

    struct SlowRuntime(Duration);
    #[async_trait::async_trait]
    impl Runtime for SlowRuntime {
        async fn invoke(&self, _event: Event) -> Result<Response, RuntimeError> {
            tokio::time::sleep(self.0).await;
            Ok(Response::new().with_body("late"))
        }
    }

    struct PanicRuntime;
    #[async_trait::async_trait]
    impl Runtime for PanicRuntime {
        async fn invoke(&self, _event: Event) -> Result<Response, RuntimeError> {
            panic!("boom");
        }
    }

    #[tokio::test]
    async fn allocate_submit_release_round_trip() {
        let pool = WorkerPool::new(2, EchoRuntime);
        assert_eq!(pool.num_workers(), 2);
        assert_eq!(pool.num_workers_available(), 2);

        let slot = pool.allocate(Duration::from_secs(1)).await.unwrap();
        assert_eq!(pool.num_workers_available(), 1);
        let event = Event::new(TriggerVariant::Job, info()).with_body("hi");
        let resp = pool.submit(&slot, event).await.unwrap();
        assert_eq!(resp.body.as_ref(), b"hi");
        pool.release(slot).await;
        assert_eq!(pool.num_workers_available(), 2);
    }

    #[tokio::test]
    async fn allocate_times_out_when_exhausted() {
        let pool = WorkerPool::new(1, EchoRuntime);
        let slot = pool.allocate(Duration::from_millis(50)).await.unwrap();
        let err = pool.allocate(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, WorkerError::Timeout));
        pool.release(slot).await;
    }

    #[tokio::test]
    async fn panic_is_surfaced_as_process_error_and_slot_is_released() {
        let pool = WorkerPool::new(1, PanicRuntime);
        let slot = pool.allocate(Duration::from_secs(1)).await.unwrap();
        let event = Event::new(TriggerVariant::Job, info());
        let err = pool.submit(&slot, event).await.unwrap_err();
        assert!(matches!(err, WorkerError::Panic(_)));
        pool.release(slot).await;
        assert_eq!(pool.num_workers_available(), 1);
    }

    #[tokio::test]
    async fn timeout_wins_and_late_answer_releases_slot_without_being_awaited() {
        let pool = WorkerPool::new(1, SlowRuntime(Duration::from_millis(120)));
        let slot = pool.allocate(Duration::from_secs(1)).await.unwrap();
        let event = Event::new(TriggerVariant::Job, info());

        // Race submit() against a short deadline exactly as a trigger's
        // dispatcher loop would. submit() detaches the handler invocation
        // onto its own task on first poll, so dropping this select arm does
        // not kill the in-flight SlowRuntime call.
        tokio::select! {
            resp = pool.submit(&slot, event) => {
                panic!("handler should not have won the race: {:?}", resp.map(|_| ()));
            }
            _ = tokio::time::sleep(Duration::from_millis(20)) => {
                pool.timeout_worker(&slot).await.expect("timeout should win the race");
            }
        }

        // The slot is still "owned" by the abandoned handle here; the caller
        // must not release it — the handler's detached task will, once
        // SlowRuntime finally returns.
        drop(slot);
        assert_eq!(pool.num_workers_available(), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            pool.num_workers_available(),
            1,
            "late completion should self-release the slot"
        );
    }

    #[tokio::test]
    async fn timeout_then_answered_race_is_reported() {
        let pool = WorkerPool::new(1, EchoRuntime);
        let slot = pool.allocate(Duration::from_secs(1)).await.unwrap();
        let event = Event::new(TriggerVariant::Job, info());

        // Submit completes quickly (EchoRuntime is instant), so by the time
        // timeout_worker runs, `answered` is already latched.
        let resp = pool.submit(&slot, event).await;
        assert!(resp.is_ok());
        let err = pool.timeout_worker(&slot).await.unwrap_err();
        assert!(matches!(err, WorkerError::WorkerAnswered));
        pool.release(slot).await;
    }
}
