// SPDX-License-Identifier: Apache-2.0

//! MJPEG sink: an HTTP server that fans a single stream of frames out to
//! however many clients are connected. A global bounded channel (capacity
//! 10) is the sink's one `Write` entry point; a fan-out task drains it and
//! pushes non-blockingly into each client's own bounded channel (capacity
//! 5) so one slow client can never stall another or the writer.

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use bytes::Bytes;
use fnmesh_config::MjpegSinkAttributes;
use fnmesh_sink::{Sink, SinkCore, SinkError, SinkFactory, SinkRegistry, WriteMetadata};
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

pub const KIND: &str = "mjpeg";
const GLOBAL_CAPACITY: usize = 10;
const CLIENT_CAPACITY: usize = 5;

struct Inner {
    attrs: MjpegSinkAttributes,
    clients: Mutex<Vec<mpsc::Sender<Bytes>>>,
}

pub struct MjpegSink {
    core: SinkCore,
    inner: Arc<Inner>,
    input_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MjpegSink {
    pub fn new(core: SinkCore, attrs: MjpegSinkAttributes) -> Self {
        MjpegSink {
            core,
            inner: Arc::new(Inner {
                attrs,
                clients: Mutex::new(Vec::new()),
            }),
            input_tx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }
}

async fn fanout_loop(inner: Arc<Inner>, mut input_rx: mpsc::Receiver<Bytes>) {
    while let Some(frame) = input_rx.recv().await {
        let mut clients = inner.clients.lock().await;
        clients.retain(|tx| match tx.try_send(frame.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

async fn serve_frames(State(inner): State<Arc<Inner>>) -> Response {
    let (tx, rx) = mpsc::channel::<Bytes>(CLIENT_CAPACITY);
    inner.clients.lock().await.push(tx);
    let boundary = inner.attrs.boundary.clone();

    let stream = ReceiverStream::new(rx).map(move |frame| {
        let mut chunk = format!(
            "--{boundary}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            frame.len()
        )
        .into_bytes();
        chunk.extend_from_slice(&frame);
        chunk.extend_from_slice(b"\r\n");
        Ok::<_, std::io::Error>(Bytes::from(chunk))
    });

    Response::builder()
        .header(
            "Content-Type",
            format!("multipart/x-mixed-replace; boundary={}", inner.attrs.boundary),
        )
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| (axum::http::StatusCode::INTERNAL_SERVER_ERROR).into_response())
}

#[async_trait]
impl Sink for MjpegSink {
    async fn start(&self) -> Result<(), SinkError> {
        let addr: SocketAddr = self
            .inner
            .attrs
            .addr
            .parse()
            .map_err(|e| SinkError::Config(format!("invalid addr: {e}")))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SinkError::Bind(e.to_string()))?;

        let (input_tx, input_rx) = mpsc::channel::<Bytes>(GLOBAL_CAPACITY);
        *self.input_tx.lock().await = Some(input_tx);

        let app: Router = Router::new()
            .route("/", get(serve_frames))
            .with_state(self.inner.clone());

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        }));
        tasks.push(tokio::spawn(fanout_loop(self.inner.clone(), input_rx)));

        self.core.enter_started();
        Ok(())
    }

    async fn stop(&self, force: bool) -> Result<(), SinkError> {
        self.core.enter_draining();
        *self.input_tx.lock().await = None;
        let mut tasks = self.tasks.lock().await;
        if force {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        self.core.enter_stopped();
        Ok(())
    }

    async fn write(&self, data: Bytes, _metadata: WriteMetadata) -> Result<(), SinkError> {
        self.core.guard_write()?;
        let tx = self.input_tx.lock().await.clone();
        let Some(tx) = tx else {
            return Err(SinkError::NotStarted);
        };
        tx.send(data)
            .await
            .map_err(|_| SinkError::Remote("mjpeg fan-out task gone".into()))
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
        let attrs = MjpegSinkAttributes::parse(&config).map_err(|e| SinkError::Config(e.to_string()))?;
        let core = SinkCore::new(KIND, config);
        Ok(Arc::new(MjpegSink::new(core, attrs)) as Arc<dyn Sink>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fanout_drops_frame_for_full_client_only() {
        let inner = Arc::new(Inner {
            attrs: MjpegSinkAttributes {
                addr: "127.0.0.1:0".into(),
                boundary: "frame".into(),
            },
            clients: Mutex::new(Vec::new()),
        });
        let (slow_tx, mut slow_rx) = mpsc::channel::<Bytes>(1);
        let (fast_tx, mut fast_rx) = mpsc::channel::<Bytes>(5);
        inner.clients.lock().await.push(slow_tx);
        inner.clients.lock().await.push(fast_tx);

        let (input_tx, input_rx) = mpsc::channel::<Bytes>(GLOBAL_CAPACITY);
        let handle = tokio::spawn(fanout_loop(inner.clone(), input_rx));

        input_tx.send(Bytes::from_static(b"1")).await.unwrap();
        input_tx.send(Bytes::from_static(b"2")).await.unwrap();
        tokio::task::yield_now().await;

        assert_eq!(slow_rx.recv().await, Some(Bytes::from_static(b"1")));
        assert_eq!(fast_rx.recv().await, Some(Bytes::from_static(b"1")));
        assert_eq!(fast_rx.recv().await, Some(Bytes::from_static(b"2")));

        drop(input_tx);
        handle.abort();
    }
}
