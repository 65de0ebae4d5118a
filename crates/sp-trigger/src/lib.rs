// SPDX-License-Identifier: Apache-2.0

//! The shared trigger contract: lifecycle, the allocate-and-submit dance over
//! a [`WorkerAllocator`], and the process-wide `kind -> factory` registry.
//!
//! Concrete triggers (MJPEG pull, RTSP pull, WebSocket, ext-proc, Job,
//! OpenInference) are built on top of [`TriggerCore`] by composition rather
//! than inheritance: a trigger owns a `TriggerCore` field and implements
//! [`Trigger`] by delegating the shared bits to it.

use async_trait::async_trait;
use fnmesh_event::{Event, Response};
use fnmesh_sink::Sink;
use fnmesh_worker::{WorkerAllocator, WorkerError};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("bind error: {0}")]
    Bind(String),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("unknown trigger kind: {0}")]
    UnknownKind(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerStatus {
    Initializing,
    Ready,
    Stopped,
}

impl TriggerStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TriggerStatus::Initializing,
            1 => TriggerStatus::Ready,
            _ => TriggerStatus::Stopped,
        }
    }
}

/// Opaque resume token handed back by `Trigger::stop` and re-supplied to the
/// next `Trigger::start` across a restart, e.g. a byte offset or a last-seen
/// sequence number. Triggers that have nothing to resume return `None`.
pub type Checkpoint = Option<serde_json::Value>;

/// The capability every trigger exposes to the factory registry and the
/// processor root.
#[async_trait]
pub trait Trigger: Send + Sync {
    async fn start(&self, checkpoint: Checkpoint) -> Result<(), TriggerError>;
    async fn stop(&self, force: bool) -> Result<Checkpoint, TriggerError>;
    fn get_config(&self) -> serde_json::Value;
    fn status(&self) -> TriggerStatus;
}

/// Constructs a [`Trigger`] instance from its declarative configuration.
/// Registered once per `kind` at process startup; looking up an unregistered
/// kind is a hard startup error.
pub trait TriggerFactory: Send + Sync {
    fn create(&self, ctx: TriggerFactoryContext) -> Result<Arc<dyn Trigger>, TriggerError>;
}

impl<F> TriggerFactory for F
where
    F: Fn(TriggerFactoryContext) -> Result<Arc<dyn Trigger>, TriggerError> + Send + Sync,
{
    fn create(&self, ctx: TriggerFactoryContext) -> Result<Arc<dyn Trigger>, TriggerError> {
        (self)(ctx)
    }
}

/// Everything a factory needs to build a trigger: its identity, the parsed
/// per-kind config blob, the named worker allocator it should submit
/// through, and a channel it can use to ask the processor root for a full
/// reinstantiation after an unrecoverable error.
pub struct TriggerFactoryContext {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub config: serde_json::Value,
    pub allocator: Arc<dyn WorkerAllocator>,
    pub restart_tx: mpsc::Sender<String>,
    /// The sink this trigger's `attributes.sink` names, already constructed
    /// and started by the processor root, if any.
    pub sink: Option<Arc<dyn Sink>>,
}

/// Process-wide `kind -> factory` map, write-once-then-read.
#[derive(Default)]
pub struct TriggerRegistry {
    factories: HashMap<String, Arc<dyn TriggerFactory>>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: impl Into<String>, factory: impl TriggerFactory + 'static) {
        let _ = self.factories.insert(kind.into(), Arc::new(factory));
    }

    pub fn create(&self, ctx: TriggerFactoryContext) -> Result<Arc<dyn Trigger>, TriggerError> {
        let factory = self
            .factories
            .get(&ctx.kind)
            .ok_or_else(|| TriggerError::UnknownKind(ctx.kind.clone()))?;
        factory.create(ctx)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

/// Shared plumbing embedded by every concrete trigger: identity, status,
/// a cancellation token for the Stop(force) escalation described by the
/// concurrency model, and the allocate-and-submit dance.
pub struct TriggerCore {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub config: serde_json::Value,
    pub allocator: Arc<dyn WorkerAllocator>,
    pub restart_tx: mpsc::Sender<String>,
    pub sink: Option<Arc<dyn Sink>>,
    pub cancellation: CancellationToken,
    status: AtomicU8,
}

/// Outcome of [`TriggerCore::allocate_worker_and_submit_event`]. Exactly one
/// of `response` or `submit_err` is populated when `timed_out` is false;
/// when `timed_out` is true both are `None` — the late response, if any, is
/// dropped by the worker pool itself.
pub struct SubmitOutcome {
    pub response: Option<Response>,
    pub timed_out: bool,
    pub submit_err: Option<WorkerError>,
}

impl TriggerCore {
    pub fn new(ctx: TriggerFactoryContext) -> Self {
        TriggerCore {
            id: ctx.id,
            name: ctx.name,
            kind: ctx.kind,
            config: ctx.config,
            allocator: ctx.allocator,
            restart_tx: ctx.restart_tx,
            sink: ctx.sink,
            cancellation: CancellationToken::new(),
            status: AtomicU8::new(0),
        }
    }

    pub fn status(&self) -> TriggerStatus {
        TriggerStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn set_status(&self, status: TriggerStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    /// Requests the processor root tear this trigger down and rebuild it from
    /// scratch, used after an unrecoverable error (e.g. a bind failure during
    /// a reconnect).
    pub async fn request_restart(&self) {
        if self.restart_tx.send(self.id.clone()).await.is_err() {
            warn!(trigger = %self.id, "restart channel closed, dropping restart request");
        }
    }

    /// Waits up to `deadline` for `self.cancellation` to fire; if it does
    /// not, logs a warning and returns anyway, matching the
    /// drain-in-10s-then-log-and-return contract.
    pub async fn drain(&self, deadline: Duration) {
        if tokio::time::timeout(deadline, self.cancellation.cancelled())
            .await
            .is_err()
        {
            warn!(trigger = %self.id, ?deadline, "drain timed out, stopping anyway");
        }
    }

    /// Wraps the worker pool's allocate/submit/timeout-worker trio,
    /// implementing the late-answer dance: if the caller's `timeout` elapses
    /// before the handler responds, `TimeoutWorker` is raced against the
    /// in-flight `submit`, and whichever side observes the other's flag
    /// second decides the outcome. A worker-pool `Timeout` on `allocate`
    /// itself (no free slot) is reported the same way as a submit timeout.
    pub async fn allocate_worker_and_submit_event(
        &self,
        event: Event,
        timeout: Duration,
    ) -> SubmitOutcome {
        let slot = match self.allocator.allocate(timeout).await {
            Ok(slot) => slot,
            Err(_) => {
                return SubmitOutcome {
                    response: None,
                    timed_out: true,
                    submit_err: None,
                };
            }
        };

        tokio::select! {
            result = self.allocator.submit(&slot, event) => {
                self.allocator.release(slot).await;
                match result {
                    Ok(resp) => SubmitOutcome { response: Some(resp), timed_out: false, submit_err: None },
                    Err(e) => SubmitOutcome { response: None, timed_out: false, submit_err: Some(e) },
                }
            }
            _ = tokio::time::sleep(timeout) => {
                match self.allocator.timeout_worker(&slot).await {
                    Ok(()) => {
                        // Timeout won the race. Abandon the handle: the
                        // handler's detached task releases it once it
                        // actually returns.
                        drop(slot);
                        SubmitOutcome { response: None, timed_out: true, submit_err: None }
                    }
                    Err(e @ WorkerError::WorkerAnswered) => {
                        // The worker answered first but we can no longer
                        // observe its response (submit()'s future was
                        // dropped); surface this as a submit error rather
                        // than silently succeeding.
                        self.allocator.release(slot).await;
                        SubmitOutcome { response: None, timed_out: false, submit_err: Some(e) }
                    }
                    Err(e) => {
                        self.allocator.release(slot).await;
                        SubmitOutcome { response: None, timed_out: false, submit_err: Some(e) }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fnmesh_event::TriggerInfo;
    use fnmesh_event::TriggerVariant;
    use fnmesh_worker::{Runtime, RuntimeError, WorkerPool};

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

    fn ctx(allocator: Arc<dyn WorkerAllocator>) -> TriggerFactoryContext {
        let (restart_tx, _restart_rx) = mpsc::channel(1);
        TriggerFactoryContext {
            id: "t1".into(),
            name: "t1".into(),
            kind: "job".into(),
            config: serde_json::json!({}),
            allocator,
            restart_tx,
            sink: None,
        }
    }

    fn info() -> TriggerInfo {
        TriggerInfo {
            class: "trigger".into(),
            kind: "job".into(),
            name: "t1".into(),
        }
    }

    #[tokio::test]
    async fn allocate_and_submit_returns_response_on_success() {
        let pool: Arc<dyn WorkerAllocator> = Arc::new(WorkerPool::new(1, EchoRuntime));
        let core = TriggerCore::new(ctx(pool));
        let event = Event::new(TriggerVariant::Job, info()).with_body("hi");
        let outcome = core
            .allocate_worker_and_submit_event(event, Duration::from_secs(1))
            .await;
        assert!(!outcome.timed_out);
        assert_eq!(outcome.response.unwrap().body.as_ref(), b"hi");
    }

    #[tokio::test]
    async fn slow_handler_surfaces_as_timeout() {
        let pool: Arc<dyn WorkerAllocator> =
            Arc::new(WorkerPool::new(1, SlowRuntime(Duration::from_millis(150))));
        let core = TriggerCore::new(ctx(pool));
        let event = Event::new(TriggerVariant::Job, info());
        let outcome = core
            .allocate_worker_and_submit_event(event, Duration::from_millis(20))
            .await;
        assert!(outcome.timed_out);
        assert!(outcome.response.is_none());
        assert!(outcome.submit_err.is_none());
    }

    #[test]
    fn registry_lookup_of_unknown_kind_fails() {
        let registry = TriggerRegistry::new();
        let pool: Arc<dyn WorkerAllocator> = Arc::new(WorkerPool::new(1, EchoRuntime));
        let err = match registry.create(ctx(pool)) {
            Err(e) => e,
            Ok(_) => panic!("expected registry.create to fail for unknown kind"),
        };
        assert!(matches!(err, TriggerError::UnknownKind(k) if k == "job"));
    }
}
