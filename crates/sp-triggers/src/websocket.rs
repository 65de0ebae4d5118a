// SPDX-License-Identifier: Apache-2.0

//! WebSocket trigger: serves `/ws`, upgrades one connection at a time (one
//! per worker slot, per the concurrency model), and frames inbound
//! messages either discretely (one message in, one event out) or as a
//! rolling byte stream shared with the RTSP audio path.

use crate::ringbuffer::{DiscreteLatch, RollingBuffer};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use fnmesh_config::WebSocketTriggerAttributes;
use fnmesh_event::{Event, TriggerInfo, TriggerVariant};
use fnmesh_trigger::{
    Trigger, TriggerCore, TriggerError, TriggerFactoryContext, TriggerRegistry, TriggerStatus,
};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, warn};

pub const KIND: &str = "websocket";
const ALLOCATION_TIMEOUT: Duration = Duration::from_secs(5);

enum Buffering {
    Discrete(DiscreteLatch),
    Stream(RollingBuffer),
}

struct Inner {
    core: TriggerCore,
    attrs: WebSocketTriggerAttributes,
    buffering: Mutex<Buffering>,
    /// The live connection's outbound half, so handler responses can be
    /// written back as a text frame. `None` when no client is connected.
    outbound: Mutex<Option<tokio::sync::mpsc::Sender<Message>>>,
    ingest_tx: tokio::sync::mpsc::Sender<Vec<u8>>,
}

pub struct WebSocketTrigger {
    inner: Arc<Inner>,
    server_task: Mutex<Option<JoinHandle<()>>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    ingest_rx: Mutex<Option<tokio::sync::mpsc::Receiver<Vec<u8>>>>,
}

impl WebSocketTrigger {
    pub fn new(core: TriggerCore, attrs: WebSocketTriggerAttributes) -> Self {
        let buffering = if attrs.is_stream {
            Buffering::Stream(RollingBuffer::new(
                attrs.chunk_bytes,
                attrs.max_bytes,
                attrs.trim_bytes,
            ))
        } else {
            Buffering::Discrete(DiscreteLatch::default())
        };
        let (ingest_tx, ingest_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(attrs.buffer_size.max(1));
        WebSocketTrigger {
            inner: Arc::new(Inner {
                core,
                attrs,
                buffering: Mutex::new(buffering),
                outbound: Mutex::new(None),
                ingest_tx,
            }),
            server_task: Mutex::new(None),
            dispatch_task: Mutex::new(None),
            ingest_rx: Mutex::new(Some(ingest_rx)),
        }
    }
}

impl Inner {
    async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let (mut sender, mut receiver) = socket.split();
        let (tx, mut rx) = tokio::sync::mpsc::channel::<Message>(8);
        *self.outbound.lock().await = Some(tx);

        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sender.send(msg).await.is_err() {
                    break;
                }
            }
        });

        while let Some(Ok(msg)) = receiver.next().await {
            let bytes = match msg {
                Message::Text(t) => t.as_bytes().to_vec(),
                Message::Binary(b) => b.to_vec(),
                Message::Close(_) => break,
                _ => continue,
            };
            if self.ingest_tx.send(bytes).await.is_err() {
                break;
            }
        }

        *self.outbound.lock().await = None;
        write_task.abort();
    }

    /// Ticker-driven dispatch: inbound bytes only update the latch/ring
    /// buffer as they arrive; a tick emits at most one event, iff new data
    /// accrued since the last one — the same cadence as the RTSP trigger's
    /// audio/video dispatch loop.
    async fn dispatch(self: Arc<Self>, rx: &mut tokio::sync::mpsc::Receiver<Vec<u8>>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(
            self.attrs.processing_interval_ms.max(1),
        ));
        loop {
            tokio::select! {
                data = rx.recv() => {
                    let Some(data) = data else { return };
                    let mut buffering = self.buffering.lock().await;
                    match &mut *buffering {
                        Buffering::Discrete(latch) => latch.push(data),
                        Buffering::Stream(rolling) => rolling.push(&data),
                    }
                }
                _ = ticker.tick() => {
                    let snapshot = {
                        let mut buffering = self.buffering.lock().await;
                        match &mut *buffering {
                            Buffering::Discrete(latch) => latch.take_if_new(),
                            Buffering::Stream(rolling) => rolling.snapshot_if_new(),
                        }
                    };
                    let Some(body) = snapshot else { continue };
                    self.emit(body).await;
                }
                _ = self.core.cancellation.cancelled() => return,
            }
        }
    }

    async fn emit(self: &Arc<Self>, body: Vec<u8>) {
        let info = TriggerInfo {
            class: "trigger".into(),
            kind: KIND.into(),
            name: self.core.name.clone(),
        };
        let event = Event::new(TriggerVariant::WebSocket, info).with_body(body);
        let outcome = self
            .core
            .allocate_worker_and_submit_event(event, ALLOCATION_TIMEOUT)
            .await;

        if let Some(resp) = outcome.response {
            let outbound = self.outbound.lock().await;
            match outbound.as_ref() {
                Some(tx) => {
                    let text = String::from_utf8_lossy(&resp.body).into_owned();
                    if tx.send(Message::Text(text.into())).await.is_err() {
                        warn!(trigger = %self.core.id, "dropping response, ws connection gone");
                    }
                }
                None => debug!(trigger = %self.core.id, "dropping response, no open ws connection"),
            }
        }
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(inner): State<Arc<Inner>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| inner.handle_socket(socket))
}

#[async_trait]
impl Trigger for WebSocketTrigger {
    async fn start(&self, _checkpoint: fnmesh_trigger::Checkpoint) -> Result<(), TriggerError> {
        self.inner.core.set_status(TriggerStatus::Initializing);
        let addr: SocketAddr = self
            .inner
            .attrs
            .websocket_addr
            .parse()
            .map_err(|e| TriggerError::Config(format!("invalid websocket_addr: {e}")))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TriggerError::Bind(e.to_string()))?;

        let app = axum::Router::new()
            .route("/ws", get(ws_handler))
            .with_state(self.inner.clone());
        let cancellation = self.inner.core.cancellation.clone();
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancellation.cancelled().await })
                .await;
        });
        *self.server_task.lock().await = Some(handle);

        let mut ingest_rx = self
            .ingest_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| TriggerError::Config("websocket trigger already started".into()))?;
        let dispatch_inner = self.inner.clone();
        let dispatch_handle =
            tokio::spawn(async move { dispatch_inner.dispatch(&mut ingest_rx).await });
        *self.dispatch_task.lock().await = Some(dispatch_handle);

        self.inner.core.set_status(TriggerStatus::Ready);
        Ok(())
    }

    async fn stop(&self, force: bool) -> Result<fnmesh_trigger::Checkpoint, TriggerError> {
        self.inner.core.cancellation.cancel();
        if !force {
            self.inner.core.drain(Duration::from_secs(10)).await;
        }
        if let Some(handle) = self.server_task.lock().await.take() {
            if force {
                handle.abort();
            }
        }
        if let Some(handle) = self.dispatch_task.lock().await.take() {
            handle.abort();
        }
        self.inner.core.set_status(TriggerStatus::Stopped);
        Ok(None)
    }

    fn get_config(&self) -> serde_json::Value {
        self.inner.core.config.clone()
    }

    fn status(&self) -> TriggerStatus {
        self.inner.core.status()
    }
}

pub fn register(registry: &mut TriggerRegistry) {
    registry.register(KIND, |ctx: TriggerFactoryContext| {
        let attrs = WebSocketTriggerAttributes::parse(&ctx.config)
            .map_err(|e| TriggerError::Config(e.to_string()))?;
        let core = TriggerCore::new(ctx);
        Ok(Arc::new(WebSocketTrigger::new(core, attrs)) as Arc<dyn Trigger>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn discrete_mode_emits_once_per_message() {
        let mut latch = DiscreteLatch::default();
        latch.push(b"a".to_vec());
        assert_eq!(latch.take_if_new(), Some(b"a".to_vec()));
        assert_eq!(latch.take_if_new(), None);
    }
}
