// SPDX-License-Identifier: Apache-2.0

//! RTSP sink: a minimal RTSP 1.0 server that answers `DESCRIBE` with a
//! session description for the configured media, attaches a client on
//! `SETUP`/`PLAY` over the same interleaved-TCP transport the RTSP trigger
//! uses, and fans written frames out as RTP over that connection.
//!
//! `Write` only accepts JPEG bytes for the video role; dimensions are
//! forced to a multiple of 8 by decoding and cropping down (rejected if
//! either dimension is already below 8), then RTP/JPEG-fragmented per
//! RFC 2435. The audio role treats written bytes as raw 16-bit PCM samples
//! and packetizes them as RTP/L16.

use async_trait::async_trait;
use bytes::Bytes;
use fnmesh_config::RtspSinkAttributes;
use fnmesh_sink::{Sink, SinkCore, SinkError, SinkFactory, SinkRegistry, WriteMetadata};
use image::GenericImageView;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

pub const KIND: &str = "rtsp";
const RTP_MTU: usize = 1400;
const SAMPLES_PER_PACKET: usize = 160;

struct Inner {
    attrs: RtspSinkAttributes,
    broadcast_tx: broadcast::Sender<Bytes>,
}

pub struct RtspSink {
    core: SinkCore,
    inner: Arc<Inner>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
}

impl RtspSink {
    pub fn new(core: SinkCore, attrs: RtspSinkAttributes) -> Self {
        let (broadcast_tx, _rx) = broadcast::channel(32);
        RtspSink {
            core,
            inner: Arc::new(Inner { attrs, broadcast_tx }),
            listener_task: Mutex::new(None),
        }
    }
}

fn session_description(attrs: &RtspSinkAttributes) -> String {
    if attrs.is_video {
        "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=fnmesh\r\nt=0 0\r\nm=video 0 RTP/AVP 26\r\na=rtpmap:26 JPEG/90000\r\na=control:trackID=0\r\n"
            .to_owned()
    } else {
        format!(
            "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=fnmesh\r\nt=0 0\r\nm=audio 0 RTP/AVP 96\r\na=rtpmap:96 L16/{}/{}\r\na=control:trackID=0\r\n",
            attrs.sample_rate, attrs.channels
        )
    }
}

/// Ensures both dimensions are a multiple of 8, cropping down from the
/// bottom-right corner if not. Rejects images where either dimension is
/// already below 8 — there is nothing left to crop to.
fn normalize_dimensions(jpeg: &[u8]) -> Result<Vec<u8>, SinkError> {
    let img = image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg)
        .map_err(|e| SinkError::Remote(format!("decoding jpeg frame: {e}")))?;
    let (w, h) = img.dimensions();
    if w < 8 || h < 8 {
        return Err(SinkError::Remote(format!(
            "frame {w}x{h} is smaller than the minimum 8x8"
        )));
    }
    let (cw, ch) = (w - (w % 8), h - (h % 8));
    if cw == w && ch == h {
        return Ok(jpeg.to_vec());
    }
    let cropped = img.crop_imm(0, 0, cw, ch);
    let mut out = Vec::new();
    cropped
        .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Jpeg)
        .map_err(|e| SinkError::Remote(format!("re-encoding cropped jpeg: {e}")))?;
    Ok(out)
}

fn rtp_header(seq: u16, timestamp: u32, ssrc: u32, payload_type: u8, marker: bool) -> [u8; 12] {
    let mut header = [0u8; 12];
    header[0] = 0x80; // version 2, no padding/extension/csrc
    header[1] = payload_type | if marker { 0x80 } else { 0 };
    header[2..4].copy_from_slice(&seq.to_be_bytes());
    header[4..8].copy_from_slice(&timestamp.to_be_bytes());
    header[8..12].copy_from_slice(&ssrc.to_be_bytes());
    header
}

/// RFC 2435 fragments a whole encoded JPEG into RTP/JPEG payloads. This
/// treats the JPEG holistically rather than reparsing out quantization
/// tables and scan segments per the RFC's full marker-aware layout — a
/// deliberate simplification that keeps the frame's width/height and
/// fragment offsets on the wire without a full JPEG-internals rewrite.
fn fragment_jpeg(jpeg: &[u8], width: u32, height: u32) -> Vec<Vec<u8>> {
    let mut packets = Vec::new();
    let mut offset = 0usize;
    while offset < jpeg.len() {
        let end = (offset + RTP_MTU).min(jpeg.len());
        let mut payload = Vec::with_capacity(8 + (end - offset));
        payload.push(0); // type-specific
        let off = (offset as u32).to_be_bytes();
        payload.extend_from_slice(&off[1..4]); // 24-bit fragment offset
        payload.push(1); // type: baseline progressive not signalled, use 1
        payload.push(50); // Q
        payload.push((width / 8) as u8);
        payload.push((height / 8) as u8);
        payload.extend_from_slice(&jpeg[offset..end]);
        packets.push(payload);
        offset = end;
    }
    packets
}

struct SessionRtpState {
    seq: AtomicU16,
    timestamp: AtomicU32,
    ssrc: u32,
}

impl SessionRtpState {
    fn new() -> Self {
        SessionRtpState {
            seq: AtomicU16::new(0),
            timestamp: AtomicU32::new(0),
            ssrc: rand::random(),
        }
    }

    fn next_seq(&self) -> u16 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }
}

async fn write_interleaved(
    writer: &mut (impl AsyncWriteExt + Unpin),
    channel: u8,
    payload: &[u8],
) -> std::io::Result<()> {
    let mut framed = vec![b'$', channel];
    framed.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    framed.extend_from_slice(payload);
    writer.write_all(&framed).await
}

async fn handle_connection(stream: TcpStream, inner: Arc<Inner>) -> std::io::Result<()> {
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut playing = false;

    loop {
        let Some((method, headers)) = read_request(&mut reader).await? else {
            return Ok(());
        };
        let cseq = headers.get("cseq").cloned().unwrap_or_else(|| "0".to_owned());
        match method.as_str() {
            "OPTIONS" => {
                write_half
                    .write_all(format!(
                        "RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\nPublic: OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN\r\n\r\n"
                    ).as_bytes())
                    .await?;
            }
            "DESCRIBE" => {
                let sdp = session_description(&inner.attrs);
                write_half
                    .write_all(
                        format!(
                            "RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\nContent-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{sdp}",
                            sdp.len()
                        )
                        .as_bytes(),
                    )
                    .await?;
            }
            "SETUP" => {
                write_half
                    .write_all(
                        format!(
                            "RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\nTransport: RTP/AVP/TCP;unicast;interleaved=0-1\r\nSession: 1\r\n\r\n"
                        )
                        .as_bytes(),
                    )
                    .await?;
            }
            "PLAY" => {
                write_half
                    .write_all(
                        format!("RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\nSession: 1\r\n\r\n").as_bytes(),
                    )
                    .await?;
                playing = true;
                break;
            }
            "TEARDOWN" => {
                write_half
                    .write_all(format!("RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\n\r\n").as_bytes())
                    .await?;
                return Ok(());
            }
            _ => {
                write_half
                    .write_all(format!("RTSP/1.0 501 Not Implemented\r\nCSeq: {cseq}\r\n\r\n").as_bytes())
                    .await?;
            }
        }
    }

    if !playing {
        return Ok(());
    }

    let mut rx = inner.broadcast_tx.subscribe();
    let state = SessionRtpState::new();
    let samples_per_packet = SAMPLES_PER_PACKET;
    loop {
        let frame = match rx.recv().await {
            Ok(f) => f,
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
        };
        if inner.attrs.is_video {
            send_video_frame(&mut write_half, &state, &frame).await?;
        } else {
            send_audio_frame(&mut write_half, &state, &frame, samples_per_packet).await?;
        }
    }
}

async fn send_video_frame(
    writer: &mut (impl AsyncWriteExt + Unpin),
    state: &SessionRtpState,
    jpeg: &[u8],
) -> std::io::Result<()> {
    let img = image::load_from_memory(jpeg).ok();
    let (w, h) = img.map(|i| i.dimensions()).unwrap_or((0, 0));
    let fragments = fragment_jpeg(jpeg, w, h);
    let count = fragments.len();
    let timestamp = state.timestamp.fetch_add(3000, Ordering::SeqCst);
    for (i, fragment) in fragments.into_iter().enumerate() {
        let marker = i == count - 1;
        let header = rtp_header(state.next_seq(), timestamp, state.ssrc, 26, marker);
        let mut packet = header.to_vec();
        packet.extend_from_slice(&fragment);
        write_interleaved(writer, 0, &packet).await?;
    }
    Ok(())
}

async fn send_audio_frame(
    writer: &mut (impl AsyncWriteExt + Unpin),
    state: &SessionRtpState,
    pcm: &[u8],
    samples_per_packet: usize,
) -> std::io::Result<()> {
    let bytes_per_packet = samples_per_packet * 2;
    for chunk in pcm.chunks(bytes_per_packet) {
        let network_order = to_network_order_16(chunk);
        let timestamp = state
            .timestamp
            .fetch_add(samples_per_packet as u32, Ordering::SeqCst);
        let header = rtp_header(state.next_seq(), timestamp, state.ssrc, 96, true);
        let mut packet = header.to_vec();
        packet.extend_from_slice(&network_order);
        write_interleaved(writer, 0, &packet).await?;
    }
    Ok(())
}

fn to_network_order_16(data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    let mut i = 0;
    while i + 1 < out.len() {
        out.swap(i, i + 1);
        i += 2;
    }
    out
}

async fn read_request(
    reader: &mut BufReader<tokio::io::ReadHalf<TcpStream>>,
) -> std::io::Result<Option<(String, std::collections::HashMap<String, String>)>> {
    let mut request_line = String::new();
    if read_line(reader, &mut request_line).await? == 0 {
        return Ok(None);
    }
    let method = request_line
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_owned();

    let mut headers = std::collections::HashMap::new();
    loop {
        let mut line = String::new();
        if read_line(reader, &mut line).await? == 0 || line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            let _ = headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_owned());
        }
    }
    Ok(Some((method, headers)))
}

async fn read_line(
    reader: &mut BufReader<tokio::io::ReadHalf<TcpStream>>,
    out: &mut String,
) -> std::io::Result<usize> {
    let mut total = 0;
    loop {
        let mut byte = [0u8; 1];
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            return Ok(total);
        }
        total += 1;
        if byte[0] == b'\n' {
            if out.ends_with('\r') {
                out.pop();
            }
            return Ok(total);
        }
        out.push(byte[0] as char);
    }
}

#[async_trait]
impl Sink for RtspSink {
    async fn start(&self) -> Result<(), SinkError> {
        let addr: std::net::SocketAddr = self
            .inner
            .attrs
            .addr
            .parse()
            .map_err(|e| SinkError::Config(format!("invalid addr: {e}")))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SinkError::Bind(e.to_string()))?;

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let inner = inner.clone();
                        tokio::spawn(async move {
                            let _ = handle_connection(stream, inner).await;
                        });
                    }
                    Err(_) => return,
                }
            }
        });
        *self.listener_task.lock().await = Some(handle);
        self.core.enter_started();
        Ok(())
    }

    async fn stop(&self, force: bool) -> Result<(), SinkError> {
        self.core.enter_draining();
        if let Some(handle) = self.listener_task.lock().await.take() {
            if force {
                handle.abort();
            }
        }
        self.core.enter_stopped();
        Ok(())
    }

    async fn write(&self, data: Bytes, _metadata: WriteMetadata) -> Result<(), SinkError> {
        self.core.guard_write()?;
        let payload = if self.inner.attrs.is_video {
            normalize_dimensions(&data)?
        } else {
            data.to_vec()
        };
        let _ = self.inner.broadcast_tx.send(Bytes::from(payload));
        Ok(())
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
        let attrs = RtspSinkAttributes::parse(&config).map_err(|e| SinkError::Config(e.to_string()))?;
        let core = SinkCore::new(KIND, config);
        Ok(Arc::new(RtspSink::new(core, attrs)) as Arc<dyn Sink>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtp_header_sets_version_and_marker_bit() {
        let header = rtp_header(7, 1000, 42, 26, true);
        assert_eq!(header[0], 0x80);
        assert_eq!(header[1], 26 | 0x80);
        assert_eq!(u16::from_be_bytes([header[2], header[3]]), 7);
    }

    #[test]
    fn fragment_jpeg_splits_on_mtu_boundaries() {
        let jpeg = vec![0xABu8; RTP_MTU * 2 + 10];
        let fragments = fragment_jpeg(&jpeg, 64, 48);
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0][7] as usize, 48 / 8);
    }

    #[test]
    fn to_network_order_16_swaps_pairs() {
        assert_eq!(to_network_order_16(&[1, 2, 3, 4]), vec![2, 1, 4, 3]);
    }

    #[test]
    fn session_description_reflects_audio_role() {
        let attrs = RtspSinkAttributes {
            addr: "127.0.0.1:0".into(),
            is_video: false,
            sample_rate: 16000,
            channels: 2,
        };
        let sdp = session_description(&attrs);
        assert!(sdp.contains("L16/16000/2"));
    }
}
