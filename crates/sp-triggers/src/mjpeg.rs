// SPDX-License-Identifier: Apache-2.0

//! MJPEG pull trigger: connects to a `multipart/x-mixed-replace` HTTP
//! stream, frames it by hand (boundary line, CRLF headers, `Content-Length`
//! body), and emits one `Event` per `processing_factor`-th frame.

use async_trait::async_trait;
use fnmesh_config::MjpegTriggerAttributes;
use fnmesh_event::{Event, TriggerInfo, TriggerVariant};
use fnmesh_trigger::{
    Trigger, TriggerCore, TriggerError, TriggerFactoryContext, TriggerRegistry, TriggerStatus,
};
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, warn};

pub const KIND: &str = "mjpeg";

const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
const ALLOCATION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
enum FrameError {
    #[error("stream ended")]
    Eof,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

struct Inner {
    core: TriggerCore,
    attrs: MjpegTriggerAttributes,
    frame_count: AtomicU64,
}

pub struct MjpegTrigger {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MjpegTrigger {
    pub fn new(core: TriggerCore, attrs: MjpegTriggerAttributes) -> Self {
        MjpegTrigger {
            inner: Arc::new(Inner {
                core,
                attrs,
                frame_count: AtomicU64::new(0),
            }),
            task: Mutex::new(None),
        }
    }
}

impl Inner {
    async fn pull_loop(self: Arc<Self>) {
        loop {
            if self.core.cancellation.is_cancelled() {
                return;
            }
            if let Err(e) = self.connect_and_read().await {
                warn!(trigger = %self.core.id, %e, "mjpeg pull loop failed, reconnecting");
            }
            if self.core.cancellation.is_cancelled() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                _ = self.core.cancellation.cancelled() => return,
            }
        }
    }

    async fn connect_and_read(&self) -> Result<(), FrameError> {
        let client = reqwest::Client::builder()
            .build()
            .unwrap_or_default();
        let resp = client.get(&self.attrs.url).send().await?;
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_owned();
        let boundary = parse_boundary(&content_type).unwrap_or_else(|| "frame".to_owned());
        let marker = format!("--{boundary}");

        let mut stream = resp.bytes_stream();
        let mut buf: VecDeque<u8> = VecDeque::new();

        loop {
            if self.core.cancellation.is_cancelled() {
                return Ok(());
            }
            read_until(&mut buf, &mut stream, marker.as_bytes()).await?;
            let headers = read_headers(&mut buf, &mut stream).await?;
            let content_length: i64 = headers
                .get("content-length")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0);
            if content_length <= 0 {
                debug!(trigger = %self.core.id, "skipping mjpeg part with missing/invalid Content-Length");
                continue;
            }
            let frame = read_exact(&mut buf, &mut stream, content_length as usize).await?;

            let n = self.frame_count.fetch_add(1, Ordering::SeqCst) + 1;
            if n % self.attrs.processing_factor != 0 {
                continue;
            }

            let info = TriggerInfo {
                class: "trigger".into(),
                kind: KIND.into(),
                name: self.core.name.clone(),
            };
            let event = Event::new(TriggerVariant::Mjpeg, info)
                .with_body(frame.clone())
                .with_content_type("image/jpeg")
                .with_field("frame_num", n as i64)
                .with_field("url", self.attrs.url.as_str());

            let outcome = self
                .core
                .allocate_worker_and_submit_event(event, ALLOCATION_TIMEOUT)
                .await;
            if let Some(sink) = &self.core.sink {
                if let Some(resp) = outcome.response {
                    let meta = fnmesh_sink::WriteMetadata::default()
                        .with("frame_num", n.to_string());
                    if let Err(e) = sink.write(resp.body, meta).await {
                        warn!(trigger = %self.core.id, %e, "mjpeg sink write failed");
                    }
                }
            }
        }
    }
}

fn parse_boundary(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|part| {
        let part = part.trim();
        part.strip_prefix("boundary=")
            .map(|b| b.trim().trim_matches('"').to_owned())
    })
}

async fn pull_more(
    buf: &mut VecDeque<u8>,
    stream: &mut (impl futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Unpin),
) -> Result<(), FrameError> {
    match stream.next().await {
        Some(Ok(chunk)) => {
            buf.extend(chunk.iter().copied());
            Ok(())
        }
        Some(Err(e)) => Err(FrameError::Http(e)),
        None => Err(FrameError::Eof),
    }
}

async fn read_until(
    buf: &mut VecDeque<u8>,
    stream: &mut (impl futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Unpin),
    marker: &[u8],
) -> Result<(), FrameError> {
    loop {
        if let Some(pos) = find_subslice(buf, marker) {
            let end = pos + marker.len();
            // Drop everything up to and including the boundary marker, plus
            // the line ending that follows it.
            for _ in 0..end {
                let _ = buf.pop_front();
            }
            consume_line_ending(buf);
            return Ok(());
        }
        pull_more(buf, stream).await?;
    }
}

async fn read_headers(
    buf: &mut VecDeque<u8>,
    stream: &mut (impl futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Unpin),
) -> Result<HashMap<String, String>, FrameError> {
    loop {
        if let Some(pos) = find_subslice(buf, b"\r\n\r\n") {
            let header_bytes: Vec<u8> = buf.iter().take(pos).copied().collect();
            for _ in 0..pos + 4 {
                let _ = buf.pop_front();
            }
            let text = String::from_utf8_lossy(&header_bytes);
            let mut headers = HashMap::new();
            for line in text.split("\r\n") {
                if let Some((k, v)) = line.split_once(':') {
                    let _ = headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_owned());
                }
            }
            return Ok(headers);
        }
        pull_more(buf, stream).await?;
    }
}

async fn read_exact(
    buf: &mut VecDeque<u8>,
    stream: &mut (impl futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Unpin),
    n: usize,
) -> Result<Vec<u8>, FrameError> {
    while buf.len() < n {
        pull_more(buf, stream).await?;
    }
    Ok(buf.drain(..n).collect())
}

fn consume_line_ending(buf: &mut VecDeque<u8>) {
    if buf.front() == Some(&b'\r') {
        let _ = buf.pop_front();
    }
    if buf.front() == Some(&b'\n') {
        let _ = buf.pop_front();
    }
}

fn find_subslice(buf: &VecDeque<u8>, needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || buf.len() < needle.len() {
        return None;
    }
    'outer: for start in 0..=(buf.len() - needle.len()) {
        for (i, &b) in needle.iter().enumerate() {
            if buf[start + i] != b {
                continue 'outer;
            }
        }
        return Some(start);
    }
    None
}

#[async_trait]
impl Trigger for MjpegTrigger {
    async fn start(&self, _checkpoint: fnmesh_trigger::Checkpoint) -> Result<(), TriggerError> {
        self.inner.core.set_status(TriggerStatus::Initializing);
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.pull_loop().await });
        *self.task.lock().await = Some(handle);
        self.inner.core.set_status(TriggerStatus::Ready);
        Ok(())
    }

    async fn stop(&self, force: bool) -> Result<fnmesh_trigger::Checkpoint, TriggerError> {
        self.inner.core.cancellation.cancel();
        if !force {
            self.inner.core.drain(Duration::from_secs(10)).await;
        }
        if let Some(handle) = self.task.lock().await.take() {
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
        let attrs = MjpegTriggerAttributes::parse(&ctx.config)
            .map_err(|e| TriggerError::Config(e.to_string()))?;
        let core = TriggerCore::new(ctx);
        Ok(Arc::new(MjpegTrigger::new(core, attrs)) as Arc<dyn Trigger>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_parses_with_quotes_and_spaces() {
        assert_eq!(
            parse_boundary("multipart/x-mixed-replace; boundary=\"abc123\""),
            Some("abc123".to_owned())
        );
        assert_eq!(
            parse_boundary("multipart/x-mixed-replace;boundary=xyz"),
            Some("xyz".to_owned())
        );
    }

    #[tokio::test]
    async fn read_exact_waits_across_multiple_chunks() {
        let chunks: Vec<Result<bytes::Bytes, reqwest::Error>> = vec![
            Ok(bytes::Bytes::from_static(b"ab")),
            Ok(bytes::Bytes::from_static(b"cd")),
        ];
        let mut stream = futures::stream::iter(chunks);
        let mut buf = VecDeque::new();
        let got = read_exact(&mut buf, &mut stream, 4).await.unwrap();
        assert_eq!(got, b"abcd");
    }

    #[tokio::test]
    async fn read_until_finds_boundary_split_across_chunks() {
        let chunks: Vec<Result<bytes::Bytes, reqwest::Error>> = vec![
            Ok(bytes::Bytes::from_static(b"junk--boun")),
            Ok(bytes::Bytes::from_static(b"dary\r\nrest")),
        ];
        let mut stream = futures::stream::iter(chunks);
        let mut buf = VecDeque::new();
        read_until(&mut buf, &mut stream, b"--boundary").await.unwrap();
        let remaining: Vec<u8> = buf.into_iter().collect();
        assert_eq!(remaining, b"rest");
    }
}
