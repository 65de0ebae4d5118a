// SPDX-License-Identifier: Apache-2.0

//! WebSocket sink: dials and maintains one outbound client connection,
//! reconnecting on a timer after any send failure. `Write` pushes a text or
//! binary frame per `attrs.binary`.

use async_trait::async_trait;
use bytes::Bytes;
use fnmesh_config::WebSocketSinkAttributes;
use fnmesh_sink::{Sink, SinkCore, SinkError, SinkFactory, SinkRegistry, WriteMetadata};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

pub const KIND: &str = "websocket";
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
const OUTBOUND_CAPACITY: usize = 32;

struct Inner {
    attrs: WebSocketSinkAttributes,
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    cancellation: tokio_util::sync::CancellationToken,
}

pub struct WebSocketSink {
    core: SinkCore,
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketSink {
    pub fn new(core: SinkCore, attrs: WebSocketSinkAttributes) -> Self {
        WebSocketSink {
            core,
            inner: Arc::new(Inner {
                attrs,
                outbound: Mutex::new(None),
                cancellation: tokio_util::sync::CancellationToken::new(),
            }),
            task: Mutex::new(None),
        }
    }
}

async fn connection_loop(inner: Arc<Inner>) {
    loop {
        if inner.cancellation.is_cancelled() {
            return;
        }
        match tokio_tungstenite::connect_async(&inner.attrs.url).await {
            Ok((stream, _response)) => {
                let (mut write, mut read) = stream.split();
                let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
                *inner.outbound.lock().await = Some(tx);

                loop {
                    tokio::select! {
                        _ = inner.cancellation.cancelled() => {
                            let _ = write.close().await;
                            *inner.outbound.lock().await = None;
                            return;
                        }
                        msg = rx.recv() => {
                            match msg {
                                Some(m) => {
                                    if write.send(m).await.is_err() {
                                        break;
                                    }
                                }
                                None => break,
                            }
                        }
                        incoming = read.next() => {
                            match incoming {
                                Some(Ok(_)) => continue,
                                _ => break,
                            }
                        }
                    }
                }
                *inner.outbound.lock().await = None;
            }
            Err(e) => {
                warn!(error = %e, url = %inner.attrs.url, "websocket sink failed to connect");
            }
        }
        tokio::select! {
            _ = inner.cancellation.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
        }
    }
}

#[async_trait]
impl Sink for WebSocketSink {
    async fn start(&self) -> Result<(), SinkError> {
        let inner = self.inner.clone();
        *self.task.lock().await = Some(tokio::spawn(connection_loop(inner)));
        self.core.enter_started();
        Ok(())
    }

    async fn stop(&self, force: bool) -> Result<(), SinkError> {
        self.core.enter_draining();
        self.inner.cancellation.cancel();
        if let Some(handle) = self.task.lock().await.take() {
            if force {
                handle.abort();
            }
        }
        self.core.enter_stopped();
        Ok(())
    }

    async fn write(&self, data: Bytes, _metadata: WriteMetadata) -> Result<(), SinkError> {
        self.core.guard_write()?;
        let outbound = self.inner.outbound.lock().await;
        let Some(tx) = outbound.as_ref() else {
            return Err(SinkError::Remote("websocket sink is not connected".into()));
        };
        let message = if self.inner.attrs.binary {
            Message::Binary(data.to_vec().into())
        } else {
            Message::Text(String::from_utf8_lossy(&data).into_owned().into())
        };
        tx.send(message)
            .await
            .map_err(|_| SinkError::Remote("websocket sink connection loop gone".into()))
    }

    fn kind(&self) -> &str {
        self.core.kind()
    }

    fn get_config(&self) -> serde_json::Value {
        self.core.config()
    }
}

pub fn register(registry: &mut SinkRegistry) {
    registry.register(KIND, |config: serde_json::Value| {
        let attrs =
            WebSocketSinkAttributes::parse(&config).map_err(|e| SinkError::Config(e.to_string()))?;
        let core = SinkCore::new(KIND, config);
        Ok(Arc::new(WebSocketSink::new(core, attrs)) as Arc<dyn Sink>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_attribute_picks_message_variant() {
        let attrs = WebSocketSinkAttributes {
            url: "ws://localhost:9".into(),
            binary: true,
        };
        assert!(attrs.binary);
    }
}
