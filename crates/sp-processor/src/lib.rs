// SPDX-License-Identifier: Apache-2.0

//! The processor root: boots worker allocators, sinks, and triggers from a
//! [`ProcessorConfig`], owns the restart channel every trigger is handed at
//! construction, and coordinates a two-phase (triggers, then sinks)
//! graceful shutdown.

pub mod runtime;

use fnmesh_config::{ProcessorConfig, SinkSpec, TriggerSpec};
use fnmesh_sink::{Sink, SinkError, SinkRegistry};
use fnmesh_trigger::{Trigger, TriggerError, TriggerFactoryContext, TriggerRegistry};
use fnmesh_worker::{WorkerAllocator, WorkerPool};
use runtime::RuntimeRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Trigger(#[from] TriggerError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("unknown worker allocator: {0}")]
    UnknownAllocator(String),
    #[error("unknown sink: {0}")]
    UnknownSink(String),
}

const RESTART_CHANNEL_CAPACITY: usize = 64;

/// Everything the restart task needs to rebuild a trigger from scratch:
/// its original spec plus the allocator and sink it was wired to at boot.
/// These never change across a restart, only the trigger instance does.
struct TriggerRebuildCtx {
    spec: TriggerSpec,
    allocator: Arc<dyn WorkerAllocator>,
    sink: Option<Arc<dyn Sink>>,
}

pub struct ProcessorRoot {
    triggers: Arc<Mutex<HashMap<String, Arc<dyn Trigger>>>>,
    sinks: HashMap<String, Arc<dyn Sink>>,
    #[allow(dead_code)]
    allocators: HashMap<String, Arc<dyn WorkerAllocator>>,
    restart_task: JoinHandle<()>,
}

fn resolve_sink_name(attributes: &serde_json::Value) -> Option<String> {
    attributes
        .get("sink")
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned)
}

fn build_allocator(
    runtime_registry: &RuntimeRegistry,
    spec: &fnmesh_config::WorkerAllocatorSpec,
) -> Result<Arc<dyn WorkerAllocator>, ProcessorError> {
    let kind = spec
        .runtime
        .get("kind")
        .and_then(serde_json::Value::as_str)
        .unwrap_or(runtime::KIND_SUBPROCESS);
    let backing = runtime_registry
        .create(kind, &spec.runtime)
        .map_err(|e| ProcessorError::Config(format!("worker allocator `{}`: {e}", spec.name)))?;
    let pool = WorkerPool::new(spec.max_workers, backing);
    Ok(Arc::new(pool) as Arc<dyn WorkerAllocator>)
}

async fn start_sink(sink_registry: &SinkRegistry, spec: &SinkSpec) -> Result<Arc<dyn Sink>, ProcessorError> {
    let sink = sink_registry.create(&spec.kind, spec.attributes.clone())?;
    sink.start().await?;
    info!(sink = %spec.name, kind = %spec.kind, "sink started");
    Ok(sink)
}

async fn start_trigger(
    trigger_registry: &TriggerRegistry,
    spec: &TriggerSpec,
    allocator: Arc<dyn WorkerAllocator>,
    sink: Option<Arc<dyn Sink>>,
    restart_tx: mpsc::Sender<String>,
) -> Result<Arc<dyn Trigger>, ProcessorError> {
    let ctx = TriggerFactoryContext {
        id: spec.name.clone(),
        name: spec.name.clone(),
        kind: spec.kind.clone(),
        config: spec.attributes.clone(),
        allocator,
        restart_tx,
        sink,
    };
    let trigger = trigger_registry.create(ctx)?;
    trigger.start(None).await?;
    info!(trigger = %spec.name, kind = %spec.kind, "trigger started");
    Ok(trigger)
}

impl ProcessorRoot {
    /// Boots every worker allocator, then every sink, then every trigger, in
    /// that order — a trigger's `attributes.sink` and
    /// `worker_allocator_name` must already exist by the time it starts.
    pub async fn boot(
        config: ProcessorConfig,
        trigger_registry: Arc<TriggerRegistry>,
        sink_registry: Arc<SinkRegistry>,
    ) -> Result<Self, ProcessorError> {
        let runtime_registry = RuntimeRegistry::new();

        let mut allocators = HashMap::new();
        for spec in &config.worker_allocators {
            let allocator = build_allocator(&runtime_registry, spec)?;
            let _ = allocators.insert(spec.name.clone(), allocator);
        }

        let mut sinks = HashMap::new();
        for spec in &config.sinks {
            let sink = start_sink(&sink_registry, spec).await?;
            let _ = sinks.insert(spec.name.clone(), sink);
        }

        let (restart_tx, restart_rx) = mpsc::channel::<String>(RESTART_CHANNEL_CAPACITY);

        let mut triggers = HashMap::new();
        let mut rebuild_ctx = HashMap::new();
        for spec in &config.triggers {
            let allocator = allocators
                .get(&spec.worker_allocator_name)
                .ok_or_else(|| ProcessorError::UnknownAllocator(spec.worker_allocator_name.clone()))?
                .clone();
            let sink = match resolve_sink_name(&spec.attributes) {
                Some(name) => Some(
                    sinks
                        .get(&name)
                        .ok_or_else(|| ProcessorError::UnknownSink(name.clone()))?
                        .clone(),
                ),
                None => None,
            };
            let trigger = start_trigger(
                &trigger_registry,
                spec,
                allocator.clone(),
                sink.clone(),
                restart_tx.clone(),
            )
            .await?;
            let _ = triggers.insert(spec.name.clone(), trigger);
            let _ = rebuild_ctx.insert(
                spec.name.clone(),
                TriggerRebuildCtx {
                    spec: spec.clone(),
                    allocator,
                    sink,
                },
            );
        }

        let triggers = Arc::new(Mutex::new(triggers));
        let rebuild_ctx = Arc::new(rebuild_ctx);
        let restart_task = spawn_restart_task(
            triggers.clone(),
            rebuild_ctx,
            trigger_registry,
            restart_rx,
            restart_tx,
        );

        Ok(ProcessorRoot {
            triggers,
            sinks,
            allocators,
            restart_task,
        })
    }

    /// Cancels every trigger, waits up to 10s for each to drain (unless
    /// `force`), then stops every sink the same way, and finally the
    /// restart-listener task.
    pub async fn shutdown(self, force: bool) {
        let triggers: Vec<Arc<dyn Trigger>> = self.triggers.lock().await.values().cloned().collect();
        for trigger in triggers {
            if let Err(e) = trigger.stop(force).await {
                warn!(error = %e, "trigger failed to stop cleanly");
            }
        }
        for (name, sink) in &self.sinks {
            if let Err(e) = sink.stop(force).await {
                warn!(sink = %name, error = %e, "sink failed to stop cleanly");
            }
        }
        self.restart_task.abort();
    }

    pub fn list_runtime_kinds() -> Vec<String> {
        RuntimeRegistry::new().kinds()
    }
}

fn spawn_restart_task(
    triggers: Arc<Mutex<HashMap<String, Arc<dyn Trigger>>>>,
    rebuild_ctx: Arc<HashMap<String, TriggerRebuildCtx>>,
    trigger_registry: Arc<TriggerRegistry>,
    mut restart_rx: mpsc::Receiver<String>,
    restart_tx: mpsc::Sender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(id) = restart_rx.recv().await {
            let Some(ctx) = rebuild_ctx.get(&id) else {
                warn!(trigger = %id, "restart requested for unknown trigger id");
                continue;
            };

            if let Some(old) = triggers.lock().await.remove(&id) {
                if let Err(e) = old.stop(true).await {
                    warn!(trigger = %id, error = %e, "error stopping trigger before restart");
                }
            }

            match start_trigger(
                &trigger_registry,
                &ctx.spec,
                ctx.allocator.clone(),
                ctx.sink.clone(),
                restart_tx.clone(),
            )
            .await
            {
                Ok(trigger) => {
                    let _ = triggers.lock().await.insert(id.clone(), trigger);
                    info!(trigger = %id, "trigger restarted");
                }
                Err(e) => warn!(trigger = %id, error = %e, "failed to restart trigger"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fnmesh_config::WorkerAllocatorSpec;

    #[test]
    fn allocator_runtime_kind_defaults_to_subprocess() {
        let registry = RuntimeRegistry::new();
        let spec = WorkerAllocatorSpec {
            name: "default".into(),
            max_workers: 1,
            runtime: serde_json::json!({"command": "/bin/true"}),
        };
        assert!(build_allocator(&registry, &spec).is_ok());
    }

    #[test]
    fn unknown_runtime_kind_is_rejected() {
        let registry = RuntimeRegistry::new();
        let spec = WorkerAllocatorSpec {
            name: "bad".into(),
            max_workers: 1,
            runtime: serde_json::json!({"kind": "wasm"}),
        };
        assert!(build_allocator(&registry, &spec).is_err());
    }

    #[test]
    fn resolve_sink_name_reads_attributes_field() {
        assert_eq!(
            resolve_sink_name(&serde_json::json!({"sink": "preview"})),
            Some("preview".to_owned())
        );
        assert_eq!(resolve_sink_name(&serde_json::json!({})), None);
    }
}
