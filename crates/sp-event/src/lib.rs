// SPDX-License-Identifier: Apache-2.0

//! The [`Event`] and [`Response`] value types that flow between triggers, the
//! worker pool and sinks.
//!
//! An `Event` is produced by exactly one trigger instance and handed to the
//! worker pool unmodified. Per the pool's contract, its body bytes must not
//! be mutated after hand-off; callers that need a mutable scratch area own a
//! separate buffer and construct a fresh `Event` from it.

use bytes::Bytes;
use std::collections::HashMap;
use std::time::Instant;

mod value;
pub use value::{FieldValue, HeaderValue};

/// Which trigger variant produced an [`Event`]. Purely informational; the
/// handler sees the same accessor surface regardless of the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerVariant {
    Mjpeg,
    Rtsp,
    WebSocket,
    ExtProc,
    Job,
    OpenInference,
}

impl TriggerVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerVariant::Mjpeg => "mjpeg",
            TriggerVariant::Rtsp => "rtsp",
            TriggerVariant::WebSocket => "websocket",
            TriggerVariant::ExtProc => "extproc",
            TriggerVariant::Job => "job",
            TriggerVariant::OpenInference => "openinference",
        }
    }
}

/// Purely informational identity of the trigger instance that produced an
/// event. Never consulted for dispatch decisions.
#[derive(Debug, Clone)]
pub struct TriggerInfo {
    pub class: String,
    pub kind: String,
    pub name: String,
}

/// One unit of work handed from a trigger to the worker pool.
///
/// Construct with [`Event::new`] and the builder-style `with_*` methods;
/// once built, treat it as immutable.
#[derive(Debug, Clone)]
pub struct Event {
    variant: TriggerVariant,
    body: Bytes,
    headers: HashMap<String, HeaderValue>,
    fields: HashMap<String, FieldValue>,
    method: String,
    path: String,
    content_type: String,
    timestamp: Instant,
    trigger_info: TriggerInfo,
}

impl Event {
    pub fn new(variant: TriggerVariant, trigger_info: TriggerInfo) -> Self {
        Event {
            variant,
            body: Bytes::new(),
            headers: HashMap::new(),
            fields: HashMap::new(),
            method: String::new(),
            path: String::new(),
            content_type: String::new(),
            timestamp: Instant::now(),
            trigger_info,
        }
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        let _ = self.headers.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        let _ = self.fields.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn variant(&self) -> TriggerVariant {
        self.variant
    }

    pub fn get_body(&self) -> &Bytes {
        &self.body
    }

    /// Returns the header value, or `HeaderValue::Text("")` if absent.
    /// Missing keys never produce an error, per the event model's contract.
    pub fn get_header(&self, key: &str) -> HeaderValue {
        self.headers.get(key).cloned().unwrap_or_default()
    }

    pub fn get_headers(&self) -> &HashMap<String, HeaderValue> {
        &self.headers
    }

    /// Returns the field value, or `FieldValue::Text("")` if absent.
    pub fn get_field(&self, key: &str) -> FieldValue {
        self.fields.get(key).cloned().unwrap_or_default()
    }

    pub fn get_fields(&self) -> &HashMap<String, FieldValue> {
        &self.fields
    }

    /// Numeric accessor: parses a string field, or returns a raw numeric one.
    /// Returns `0` for missing keys and for values that do not parse.
    pub fn get_field_as_i64(&self, key: &str) -> i64 {
        match self.fields.get(key) {
            Some(FieldValue::Number(n)) => *n as i64,
            Some(FieldValue::Text(s)) => s.parse().unwrap_or(0),
            _ => 0,
        }
    }

    pub fn get_method(&self) -> &str {
        &self.method
    }

    pub fn get_path(&self) -> &str {
        &self.path
    }

    pub fn get_content_type(&self) -> &str {
        &self.content_type
    }

    pub fn get_timestamp(&self) -> Instant {
        self.timestamp
    }

    pub fn get_trigger_info(&self) -> &TriggerInfo {
        &self.trigger_info
    }
}

/// The handler's reply to an [`Event`].
///
/// `status_code == 0` means "unset, use the protocol default (200)"; a
/// response header named `X-Processing-Status` overrides the wire status
/// code when a trigger surfaces one (e.g. the ext-proc immediate response).
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub status_code: i16,
    pub headers: HashMap<String, HeaderValue>,
    pub body: Bytes,
}

impl Response {
    pub const STATUS_OVERRIDE_HEADER: &'static str = "X-Processing-Status";

    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: i16) -> Self {
        self.status_code = status;
        self
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        let _ = self.headers.insert(key.into(), value.into());
        self
    }

    /// Resolves the wire status code: the `X-Processing-Status` header wins
    /// over `status_code`, which itself defaults to 200 when unset.
    pub fn effective_status(&self) -> u16 {
        if let Some(HeaderValue::Text(s)) = self.headers.get(Self::STATUS_OVERRIDE_HEADER) {
            if let Ok(code) = s.parse() {
                return code;
            }
        }
        if self.status_code == 0 {
            200
        } else {
            self.status_code as u16
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> TriggerInfo {
        TriggerInfo {
            class: "trigger".into(),
            kind: "job".into(),
            name: "t1".into(),
        }
    }

    #[test]
    fn missing_header_and_field_yield_zero_values() {
        let ev = Event::new(TriggerVariant::Job, info());
        assert_eq!(ev.get_header("missing"), HeaderValue::Text(String::new()));
        assert_eq!(ev.get_field("missing"), FieldValue::Text(String::new()));
        assert_eq!(ev.get_field_as_i64("missing"), 0);
    }

    #[test]
    fn numeric_field_parses_from_text() {
        let ev = Event::new(TriggerVariant::Job, info()).with_field("frame_num", "42");
        assert_eq!(ev.get_field_as_i64("frame_num"), 42);
    }

    #[test]
    fn response_status_override_wins() {
        let resp = Response::new()
            .with_status(200)
            .with_header(Response::STATUS_OVERRIDE_HEADER, "503");
        assert_eq!(resp.effective_status(), 503);
    }

    #[test]
    fn response_default_status_is_200() {
        let resp = Response::new();
        assert_eq!(resp.effective_status(), 200);
    }
}
