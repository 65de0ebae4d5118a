// SPDX-License-Identifier: Apache-2.0

//! RTSP pull trigger: speaks RTSP 1.0 (`DESCRIBE`/`SETUP`/`PLAY`) over a
//! single interleaved TCP connection (RFC 2326 §10.12) rather than opening
//! per-media UDP sockets, depacketizes RTP into JPEG frames (RFC 2435),
//! H.264 access units (RFC 6184), or LPCM audio samples, and feeds the
//! shared rolling buffer from [`crate::ringbuffer`].
//!
//! This trigger targets exactly one of the session's media streams per
//! instance, selected by `is_video`: the other stream's RTP channel is
//! still drained off the wire (the interleaved connection carries both),
//! its packets just aren't buffered or emitted. Pointing two trigger
//! instances at the same `rtsp_url`, one per media type, reconstructs the
//! source's "single client gets both streams" behavior.
//!
//! H.264/H.265 access units are IDR-gated (no frames emitted before the
//! first IDR NAL) and forwarded as raw Annex-B access units rather than
//! decoded to YUV/JPEG — full video decode is out of scope for this
//! rewrite; the gating invariant and event contract are preserved.

use crate::ringbuffer::{DiscreteLatch, RollingBuffer};
use async_trait::async_trait;
use base64::Engine;
use fnmesh_config::RtspTriggerAttributes;
use fnmesh_event::{Event, TriggerInfo, TriggerVariant};
use fnmesh_trigger::{
    Trigger, TriggerCore, TriggerError, TriggerFactoryContext, TriggerRegistry, TriggerStatus,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::warn;

pub const KIND: &str = "rtsp";
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
const ALLOCATION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
enum RtspError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed rtsp url: {0}")]
    BadUrl(String),
    #[error("unexpected rtsp response: {0}")]
    Protocol(String),
    #[error("connection closed")]
    Eof,
}

struct MediaDescription {
    media_type: String,
    payload_type: u8,
    codec: String,
    control: String,
    sprop_parameter_sets: Vec<Vec<u8>>,
}

enum Buffering {
    Video(DiscreteLatch),
    Audio(RollingBuffer),
}

struct Inner {
    core: TriggerCore,
    attrs: RtspTriggerAttributes,
    buffering: Mutex<Buffering>,
}

pub struct RtspTrigger {
    inner: Arc<Inner>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RtspTrigger {
    pub fn new(core: TriggerCore, attrs: RtspTriggerAttributes) -> Self {
        let buffering = if attrs.is_video {
            Buffering::Video(DiscreteLatch::default())
        } else {
            Buffering::Audio(RollingBuffer::new(
                attrs.chunk_bytes,
                attrs.max_bytes,
                attrs.trim_bytes,
            ))
        };
        RtspTrigger {
            inner: Arc::new(Inner {
                core,
                attrs,
                buffering: Mutex::new(buffering),
            }),
            task: Mutex::new(None),
        }
    }
}

fn parse_rtsp_url(url: &str) -> Result<(String, u16, String), RtspError> {
    let rest = url
        .strip_prefix("rtsp://")
        .ok_or_else(|| RtspError::BadUrl(url.to_owned()))?;
    let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
    let (host, port) = authority
        .split_once(':')
        .map(|(h, p)| (h, p.parse().unwrap_or(554)))
        .unwrap_or((authority, 554));
    Ok((host.to_owned(), port, format!("/{path}")))
}

impl Inner {
    async fn run_loop(self: Arc<Self>) {
        loop {
            if self.core.cancellation.is_cancelled() {
                return;
            }
            if let Err(e) = self.session().await {
                warn!(trigger = %self.core.id, %e, "rtsp session failed, reconnecting");
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

    async fn session(self: &Arc<Self>) -> Result<(), RtspError> {
        let (host, port, path) = parse_rtsp_url(&self.attrs.rtsp_url)?;
        let stream = TcpStream::connect((host.as_str(), port)).await?;
        let mut conn = RtspConnection::new(stream, self.attrs.rtsp_url.clone());

        let describe = conn.request("DESCRIBE", &path, &[("Accept", "application/sdp")]).await?;
        let sdp = describe.body;
        let medias = parse_sdp(&sdp, &path);

        let mut channel_media: HashMap<u8, usize> = HashMap::new();
        for (idx, media) in medias.iter().enumerate() {
            let channel = (idx as u8) * 2;
            let transport = format!(
                "RTP/AVP/TCP;unicast;interleaved={}-{}",
                channel,
                channel + 1
            );
            let _ = conn
                .request("SETUP", &media.control, &[("Transport", &transport)])
                .await?;
            let _ = channel_media.insert(channel, idx);
        }
        let _ = conn.request("PLAY", &path, &[("Range", "npt=0.000-")]).await?;

        let wants_video = self.attrs.is_video;
        let mut depacketizers: HashMap<usize, Depacketizer> = medias
            .iter()
            .enumerate()
            .map(|(idx, m)| (idx, Depacketizer::new(m)))
            .collect();

        let dispatch_inner = self.clone();
        let (tx, mut rx) = tokio::sync::mpsc::channel::<Vec<u8>>(self.attrs.buffer_size.max(1));
        let dispatcher = tokio::spawn(async move {
            dispatch_inner.dispatch(&mut rx).await;
        });

        loop {
            if self.core.cancellation.is_cancelled() {
                break;
            }
            let (channel, payload) = conn.read_interleaved_frame().await?;
            let Some(&media_idx) = channel_media.get(&channel) else {
                continue;
            };
            let is_video_media = medias[media_idx].media_type == "video";
            if is_video_media != wants_video {
                continue; // drain the other stream's channel, don't buffer it
            }
            let Some(depk) = depacketizers.get_mut(&media_idx) else {
                continue;
            };
            if let Some(unit) = depk.push(&payload) {
                if tx.send(unit).await.is_err() {
                    break;
                }
            }
        }

        dispatcher.abort();
        Ok(())
    }

    async fn dispatch(self: Arc<Self>, rx: &mut tokio::sync::mpsc::Receiver<Vec<u8>>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(
            self.attrs.processing_interval_ms.max(1),
        ));
        loop {
            tokio::select! {
                unit = rx.recv() => {
                    let Some(unit) = unit else { return };
                    let mut buffering = self.buffering.lock().await;
                    match &mut *buffering {
                        Buffering::Video(latch) => latch.push(unit),
                        Buffering::Audio(rolling) => rolling.push(&byte_swap_16(&unit)),
                    }
                }
                _ = ticker.tick() => {
                    let snapshot = {
                        let mut buffering = self.buffering.lock().await;
                        match &mut *buffering {
                            Buffering::Video(latch) => latch.take_if_new(),
                            Buffering::Audio(rolling) => rolling.snapshot_if_new(),
                        }
                    };
                    let Some(body) = snapshot else { continue };
                    self.emit(body).await;
                }
                _ = self.core.cancellation.cancelled() => return,
            }
        }
    }

    async fn emit(&self, body: Vec<u8>) {
        let info = TriggerInfo {
            class: "trigger".into(),
            kind: KIND.into(),
            name: self.core.name.clone(),
        };
        let event = Event::new(TriggerVariant::Rtsp, info).with_body(body);
        let outcome = self
            .core
            .allocate_worker_and_submit_event(event, ALLOCATION_TIMEOUT)
            .await;
        if let Some(sink) = &self.core.sink {
            if let Some(resp) = outcome.response {
                let meta = fnmesh_sink::WriteMetadata::default()
                    .with("timestamp", chrono::Utc::now().to_rfc3339());
                if let Err(e) = sink.write(resp.body, meta).await {
                    warn!(trigger = %self.core.id, %e, "rtsp sink write failed");
                }
            }
        }
    }
}

/// LPCM audio is reinterpreted from the wire's big-endian convention to
/// little-endian, per sample (16-bit samples assumed).
fn byte_swap_16(data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    let mut i = 0;
    while i + 1 < out.len() {
        out.swap(i, i + 1);
        i += 2;
    }
    out
}

struct RtspResponse {
    status: u16,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

struct RtspConnection {
    reader: BufReader<tokio::io::ReadHalf<TcpStream>>,
    writer: tokio::io::WriteHalf<TcpStream>,
    url: String,
    cseq: u32,
}

impl RtspConnection {
    fn new(stream: TcpStream, url: String) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        RtspConnection {
            reader: BufReader::new(read_half),
            writer: write_half,
            url,
            cseq: 0,
        }
    }

    async fn request(
        &mut self,
        method: &str,
        uri: &str,
        extra_headers: &[(&str, &str)],
    ) -> Result<RtspResponse, RtspError> {
        self.cseq += 1;
        let target = if uri.starts_with("rtsp://") {
            uri.to_owned()
        } else {
            format!("{}{}", self.url.trim_end_matches('/'), uri)
        };
        let mut request = format!("{method} {target} RTSP/1.0\r\nCSeq: {}\r\n", self.cseq);
        for (k, v) in extra_headers {
            request.push_str(&format!("{k}: {v}\r\n"));
        }
        request.push_str("\r\n");
        self.writer.write_all(request.as_bytes()).await?;
        self.read_response().await
    }

    async fn read_response(&mut self) -> Result<RtspResponse, RtspError> {
        let mut status_line = String::new();
        read_line(&mut self.reader, &mut status_line).await?;
        let status: u16 = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| RtspError::Protocol(status_line.clone()))?;

        let mut headers = HashMap::new();
        loop {
            let mut line = String::new();
            read_line(&mut self.reader, &mut line).await?;
            if line.is_empty() {
                break;
            }
            if let Some((k, v)) = line.split_once(':') {
                let _ = headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_owned());
            }
        }
        let content_length: usize = headers
            .get("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let mut body = vec![0u8; content_length];
        if content_length > 0 {
            self.reader.read_exact(&mut body).await?;
        }
        Ok(RtspResponse {
            status,
            headers,
            body,
        })
    }

    /// Reads one `$<channel:u8><len:u16be><payload>` interleaved frame,
    /// skipping any plain-text response that arrives out of band (some
    /// servers interleave `RTSP/1.0 200 OK` keep-alives on the same
    /// connection during PLAY).
    async fn read_interleaved_frame(&mut self) -> Result<(u8, Vec<u8>), RtspError> {
        loop {
            let mut marker = [0u8; 1];
            self.reader.read_exact(&mut marker).await?;
            if marker[0] != b'$' {
                continue;
            }
            let mut header = [0u8; 3];
            self.reader.read_exact(&mut header).await?;
            let channel = header[0];
            let len = u16::from_be_bytes([header[1], header[2]]) as usize;
            let mut payload = vec![0u8; len];
            self.reader.read_exact(&mut payload).await?;
            return Ok((channel, payload));
        }
    }
}

async fn read_line(
    reader: &mut BufReader<tokio::io::ReadHalf<TcpStream>>,
    out: &mut String,
) -> Result<(), RtspError> {
    loop {
        let mut byte = [0u8; 1];
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            return Err(RtspError::Eof);
        }
        if byte[0] == b'\n' {
            if out.ends_with('\r') {
                out.pop();
            }
            return Ok(());
        }
        out.push(byte[0] as char);
    }
}

fn parse_sdp(sdp: &[u8], base_path: &str) -> Vec<MediaDescription> {
    let text = String::from_utf8_lossy(sdp);
    let mut medias = Vec::new();
    let mut current: Option<MediaDescription> = None;

    for line in text.lines() {
        if let Some(m) = line.strip_prefix("m=") {
            if let Some(prev) = current.take() {
                medias.push(prev);
            }
            let mut parts = m.split_whitespace();
            let media_type = parts.next().unwrap_or("").to_owned();
            let _port = parts.next();
            let _proto = parts.next();
            let payload_type: u8 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
            current = Some(MediaDescription {
                media_type,
                payload_type,
                codec: String::new(),
                control: base_path.to_owned(),
                sprop_parameter_sets: Vec::new(),
            });
        } else if let Some(rtpmap) = line.strip_prefix("a=rtpmap:") {
            if let Some(media) = current.as_mut() {
                if let Some((_, codec)) = rtpmap.split_once(' ') {
                    media.codec = codec.split('/').next().unwrap_or("").to_owned();
                }
            }
        } else if let Some(control) = line.strip_prefix("a=control:") {
            if let Some(media) = current.as_mut() {
                media.control = control.to_owned();
            }
        } else if let Some(fmtp) = line.strip_prefix("a=fmtp:") {
            if let Some(media) = current.as_mut() {
                if let Some((_, params)) = fmtp.split_once(' ') {
                    for param in params.split(';') {
                        if let Some(value) = param.trim().strip_prefix("sprop-parameter-sets=") {
                            for b64 in value.split(',') {
                                if let Ok(bytes) =
                                    base64::engine::general_purpose::STANDARD.decode(b64)
                                {
                                    media.sprop_parameter_sets.push(bytes);
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    if let Some(prev) = current.take() {
        medias.push(prev);
    }
    medias
}

enum Depacketizer {
    Jpeg {
        current: Vec<u8>,
    },
    H264 {
        seen_idr: bool,
        fu_buffer: Vec<u8>,
        access_unit: Vec<u8>,
    },
    Raw,
}

const NAL_START_CODE: [u8; 4] = [0, 0, 0, 1];

impl Depacketizer {
    fn new(media: &MediaDescription) -> Self {
        match media.codec.as_str() {
            "JPEG" => Depacketizer::Jpeg { current: Vec::new() },
            "H264" | "H265" => {
                let mut access_unit = Vec::new();
                for param_set in &media.sprop_parameter_sets {
                    access_unit.extend_from_slice(&NAL_START_CODE);
                    access_unit.extend_from_slice(param_set);
                }
                Depacketizer::H264 {
                    seen_idr: false,
                    fu_buffer: Vec::new(),
                    access_unit,
                }
            }
            _ => Depacketizer::Raw,
        }
    }

    /// Feeds one RTP packet (header included); returns a complete frame /
    /// access unit when the packet marker bit completes one.
    fn push(&mut self, rtp_packet: &[u8]) -> Option<Vec<u8>> {
        let packet = RtpPacket::parse(rtp_packet)?;
        match self {
            Depacketizer::Raw => Some(packet.payload.to_vec()),
            Depacketizer::Jpeg { current } => {
                // RFC 2435 fixed header: type-specific, fragment offset(3),
                // type, Q, width, height — 8 bytes before the JPEG payload.
                if packet.payload.len() < 8 {
                    return None;
                }
                let fragment_offset =
                    u32::from_be_bytes([0, packet.payload[1], packet.payload[2], packet.payload[3]]);
                if fragment_offset == 0 {
                    current.clear();
                }
                current.extend_from_slice(&packet.payload[8..]);
                if packet.marker {
                    Some(std::mem::take(current))
                } else {
                    None
                }
            }
            Depacketizer::H264 {
                seen_idr,
                fu_buffer,
                access_unit,
            } => {
                if packet.payload.is_empty() {
                    return None;
                }
                let nal_type = packet.payload[0] & 0x1f;
                match nal_type {
                    28 => {
                        // FU-A fragmentation unit.
                        if packet.payload.len() < 2 {
                            return None;
                        }
                        let fu_header = packet.payload[1];
                        let start = fu_header & 0x80 != 0;
                        let end = fu_header & 0x40 != 0;
                        let original_nal_type = fu_header & 0x1f;
                        if start {
                            fu_buffer.clear();
                            let reconstructed_header =
                                (packet.payload[0] & 0xe0) | original_nal_type;
                            fu_buffer.push(reconstructed_header);
                        }
                        fu_buffer.extend_from_slice(&packet.payload[2..]);
                        if end {
                            append_nal(access_unit, seen_idr, original_nal_type, fu_buffer);
                            fu_buffer.clear();
                        }
                    }
                    _ => {
                        append_nal(access_unit, seen_idr, nal_type, packet.payload);
                    }
                }
                if packet.marker && *seen_idr && !access_unit.is_empty() {
                    Some(std::mem::take(access_unit))
                } else {
                    None
                }
            }
        }
    }
}

fn append_nal(access_unit: &mut Vec<u8>, seen_idr: &mut bool, nal_type: u8, nal: &[u8]) {
    if nal_type == 5 {
        *seen_idr = true;
    }
    if !*seen_idr {
        return;
    }
    access_unit.extend_from_slice(&NAL_START_CODE);
    access_unit.extend_from_slice(nal);
}

struct RtpPacket<'a> {
    marker: bool,
    payload: &'a [u8],
}

impl<'a> RtpPacket<'a> {
    fn parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < 12 {
            return None;
        }
        let version = data[0] >> 6;
        if version != 2 {
            return None;
        }
        let csrc_count = (data[0] & 0x0f) as usize;
        let marker = data[1] & 0x80 != 0;
        let mut offset = 12 + csrc_count * 4;
        if data[0] & 0x10 != 0 {
            // Extension header present: 4-byte header + N words.
            if data.len() < offset + 4 {
                return None;
            }
            let ext_len =
                u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4 + ext_len * 4;
        }
        if offset > data.len() {
            return None;
        }
        Some(RtpPacket {
            marker,
            payload: &data[offset..],
        })
    }
}

#[async_trait]
impl Trigger for RtspTrigger {
    async fn start(&self, _checkpoint: fnmesh_trigger::Checkpoint) -> Result<(), TriggerError> {
        self.inner.core.set_status(TriggerStatus::Initializing);
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.run_loop().await });
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
        let attrs = RtspTriggerAttributes::parse(&ctx.config)
            .map_err(|e| TriggerError::Config(e.to_string()))?;
        let core = TriggerCore::new(ctx);
        Ok(Arc::new(RtspTrigger::new(core, attrs)) as Arc<dyn Trigger>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtsp_url_parses_host_port_and_path() {
        let (host, port, path) = parse_rtsp_url("rtsp://cam.local:8554/stream1").unwrap();
        assert_eq!(host, "cam.local");
        assert_eq!(port, 8554);
        assert_eq!(path, "/stream1");
    }

    #[test]
    fn rtsp_url_defaults_to_port_554() {
        let (_, port, _) = parse_rtsp_url("rtsp://cam.local/stream1").unwrap();
        assert_eq!(port, 554);
    }

    #[test]
    fn sdp_parses_media_codec_and_control() {
        let sdp = b"v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=-\r\nm=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\na=control:trackID=0\r\nm=audio 0 RTP/AVP 97\r\na=rtpmap:97 L16/8000\r\na=control:trackID=1\r\n";
        let medias = parse_sdp(sdp, "/stream1");
        assert_eq!(medias.len(), 2);
        assert_eq!(medias[0].media_type, "video");
        assert_eq!(medias[0].codec, "H264");
        assert_eq!(medias[0].control, "trackID=0");
        assert_eq!(medias[1].media_type, "audio");
    }

    #[test]
    fn h264_depacketizer_gates_on_idr_and_assembles_fua() {
        let media = MediaDescription {
            media_type: "video".into(),
            payload_type: 96,
            codec: "H264".into(),
            control: String::new(),
            sprop_parameter_sets: Vec::new(),
        };
        let mut depk = Depacketizer::new(&media);

        // Non-IDR NAL (type 1) before any IDR: must be dropped.
        let non_idr = rtp_packet(true, &[0x21, 0xAA, 0xBB]);
        assert_eq!(depk.push(&non_idr), None);

        // IDR NAL (type 5), single packet, marker set: starts being kept.
        let idr = rtp_packet(true, &[0x65, 0x01, 0x02, 0x03]);
        let unit = depk.push(&idr).expect("idr completes an access unit");
        assert_eq!(&unit[..4], &NAL_START_CODE);
        assert_eq!(&unit[4..], &[0x65, 0x01, 0x02, 0x03]);
    }

    fn rtp_packet(marker: bool, payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![0x80, if marker { 0x80 } else { 0x00 }, 0, 1, 0, 0, 0, 1, 0, 0, 0, 1];
        packet.extend_from_slice(payload);
        packet
    }

    #[test]
    fn byte_swap_16_reverses_each_sample_pair() {
        assert_eq!(byte_swap_16(&[0x00, 0x01, 0x02, 0x03]), vec![0x01, 0x00, 0x03, 0x02]);
    }
}
