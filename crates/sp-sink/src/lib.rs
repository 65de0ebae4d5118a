// SPDX-License-Identifier: Apache-2.0

//! The shared sink contract: `created -> started -> draining -> stopped`
//! lifecycle, write metadata, and the process-wide `kind -> factory`
//! registry. Mirrors `fnmesh_trigger`'s registry shape.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("bind error: {0}")]
    Bind(String),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("sink not started")]
    NotStarted,
    #[error("unknown sink kind: {0}")]
    UnknownKind(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Created,
    Started,
    Draining,
    Stopped,
}

impl SinkState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SinkState::Created,
            1 => SinkState::Started,
            2 => SinkState::Draining,
            _ => SinkState::Stopped,
        }
    }
}

/// Metadata accompanying a single `Write`, e.g. an ingestion timestamp
/// carried alongside the bytes so a sink can stamp or order outgoing frames.
#[derive(Debug, Clone, Default)]
pub struct WriteMetadata {
    pub fields: HashMap<String, String>,
}

impl WriteMetadata {
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.fields.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
pub trait Sink: Send + Sync {
    async fn start(&self) -> Result<(), SinkError>;
    async fn stop(&self, force: bool) -> Result<(), SinkError>;
    async fn write(&self, data: Bytes, metadata: WriteMetadata) -> Result<(), SinkError>;
    fn kind(&self) -> &str;
    fn get_config(&self) -> serde_json::Value;
}

pub trait SinkFactory: Send + Sync {
    fn create(&self, config: serde_json::Value) -> Result<Arc<dyn Sink>, SinkError>;
}

impl<F> SinkFactory for F
where
    F: Fn(serde_json::Value) -> Result<Arc<dyn Sink>, SinkError> + Send + Sync,
{
    fn create(&self, config: serde_json::Value) -> Result<Arc<dyn Sink>, SinkError> {
        (self)(config)
    }
}

#[derive(Default)]
pub struct SinkRegistry {
    factories: HashMap<String, Arc<dyn SinkFactory>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: impl Into<String>, factory: impl SinkFactory + 'static) {
        let _ = self.factories.insert(kind.into(), Arc::new(factory));
    }

    pub fn create(
        &self,
        kind: &str,
        config: serde_json::Value,
    ) -> Result<Arc<dyn Sink>, SinkError> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| SinkError::UnknownKind(kind.to_owned()))?;
        factory.create(config)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

/// Shared state-machine plumbing embedded by every concrete sink.
/// `enter_started`/`enter_draining`/`enter_stopped` enforce the
/// `created -> started -> draining -> stopped` ordering; `guard_write`
/// enforces that writes are only accepted in the `started` state.
pub struct SinkCore {
    kind: String,
    config: serde_json::Value,
    state: AtomicU8,
}

impl SinkCore {
    pub fn new(kind: impl Into<String>, config: serde_json::Value) -> Self {
        SinkCore {
            kind: kind.into(),
            config,
            state: AtomicU8::new(SinkState::Created as u8),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn config(&self) -> serde_json::Value {
        self.config.clone()
    }

    pub fn state(&self) -> SinkState {
        SinkState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn enter_started(&self) {
        self.state.store(SinkState::Started as u8, Ordering::SeqCst);
    }

    pub fn enter_draining(&self) {
        self.state
            .store(SinkState::Draining as u8, Ordering::SeqCst);
    }

    pub fn enter_stopped(&self) {
        self.state.store(SinkState::Stopped as u8, Ordering::SeqCst);
    }

    /// Returns `Err(SinkError::NotStarted)` unless the sink is currently in
    /// the `started` state; `created`, `draining`, and `stopped` all reject
    /// writes, matching the universal invariant that writes outside
    /// `started` return "not started".
    pub fn guard_write(&self) -> Result<(), SinkError> {
        if self.state() == SinkState::Started {
            Ok(())
        } else {
            Err(SinkError::NotStarted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_before_start_is_rejected() {
        let core = SinkCore::new("webhook", serde_json::json!({}));
        assert!(matches!(core.guard_write(), Err(SinkError::NotStarted)));
        core.enter_started();
        assert!(core.guard_write().is_ok());
        core.enter_draining();
        assert!(matches!(core.guard_write(), Err(SinkError::NotStarted)));
        core.enter_stopped();
        assert!(matches!(core.guard_write(), Err(SinkError::NotStarted)));
    }

    #[test]
    fn registry_lookup_of_unknown_kind_fails() {
        let registry = SinkRegistry::new();
        let err = registry.create("mjpeg", serde_json::json!({})).unwrap_err();
        assert!(matches!(err, SinkError::UnknownKind(k) if k == "mjpeg"));
    }
}
