// SPDX-License-Identifier: Apache-2.0

//! Declarative YAML configuration for the processor: worker allocators,
//! triggers, and sinks, plus an optional platform-config overlay merged on
//! top of the primary document before typed parsing.
//!
//! Per-kind attribute schemas (e.g. [`MjpegTriggerAttributes`],
//! [`ExtProcTriggerAttributes`]) are parsed lazily from the untyped
//! `attributes` blob on [`TriggerSpec`], after the top-level document has
//! already validated as YAML — this mirrors how the factory registry itself
//! only resolves a trigger's concrete shape once its `kind` is known.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("unknown trigger kind: {0}")]
    UnknownTriggerKind(String),
    #[error("unknown sink kind: {0}")]
    UnknownSinkKind(String),
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(deny_unknown_fields)]
pub struct WorkerAllocatorSpec {
    pub name: String,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Opaque runtime bridge config (e.g. interpreter path, wrapper script);
    /// the processor root treats this as a pass-through to the configured
    /// `Runtime` implementation.
    #[serde(default)]
    pub runtime: JsonValue,
}

fn default_max_workers() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TriggerSpec {
    pub kind: String,
    pub name: String,
    pub worker_allocator_name: String,
    #[serde(default = "default_worker_availability_timeout_ms")]
    pub worker_availability_timeout_ms: u64,
    #[serde(default)]
    pub attributes: JsonValue,
}

fn default_worker_availability_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SinkSpec {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub attributes: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(deny_unknown_fields)]
pub struct ProcessorConfig {
    #[serde(default)]
    pub worker_allocators: Vec<WorkerAllocatorSpec>,
    #[serde(default)]
    pub triggers: Vec<TriggerSpec>,
    #[serde(default)]
    pub sinks: Vec<SinkSpec>,
}

impl ProcessorConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Loads the primary config, then if `platform_config_path` is given,
    /// merges it on top field-by-field (scalars and maps overridden,
    /// sequences replaced wholesale) before typed-parsing the result.
    pub fn load_with_platform_overlay(
        path: &Path,
        platform_config_path: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        let base_raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut base: serde_yaml::Value =
            serde_yaml::from_str(&base_raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;

        if let Some(overlay_path) = platform_config_path {
            let overlay_raw =
                fs::read_to_string(overlay_path).map_err(|source| ConfigError::Read {
                    path: overlay_path.display().to_string(),
                    source,
                })?;
            let overlay: serde_yaml::Value =
                serde_yaml::from_str(&overlay_raw).map_err(|source| ConfigError::Parse {
                    path: overlay_path.display().to_string(),
                    source,
                })?;
            merge_yaml(&mut base, overlay);
        }

        serde_yaml::from_value(base).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Recursively merges `overlay` into `base`: matching map keys recurse,
/// scalars and sequences in `overlay` win outright ("last-one-wins").
fn merge_yaml(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(overlay_map)) => {
            for (key, overlay_val) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(base_val) => merge_yaml(base_val, overlay_val),
                    None => {
                        let _ = base_map.insert(key, overlay_val);
                    }
                }
            }
        }
        (base_slot, overlay_val) => {
            *base_slot = overlay_val;
        }
    }
}

fn required_str(attrs: &JsonValue, field: &'static str) -> Result<String, ConfigError> {
    attrs
        .get(field)
        .and_then(JsonValue::as_str)
        .map(str::to_owned)
        .ok_or(ConfigError::MissingField(field))
}

fn default_bool(attrs: &JsonValue, field: &str, default: bool) -> bool {
    attrs.get(field).and_then(JsonValue::as_bool).unwrap_or(default)
}

fn default_u64(attrs: &JsonValue, field: &str, default: u64) -> u64 {
    attrs.get(field).and_then(JsonValue::as_u64).unwrap_or(default)
}

fn default_i64(attrs: &JsonValue, field: &str, default: i64) -> i64 {
    attrs.get(field).and_then(JsonValue::as_i64).unwrap_or(default)
}

fn default_string(attrs: &JsonValue, field: &str, default: &str) -> String {
    attrs
        .get(field)
        .and_then(JsonValue::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| default.to_owned())
}

/// `attributes` schema for an MJPEG pull trigger (§6/§4.E).
#[derive(Debug, Clone)]
pub struct MjpegTriggerAttributes {
    pub url: String,
    pub processing_factor: u64,
    pub sink: Option<String>,
}

impl MjpegTriggerAttributes {
    pub fn parse(attrs: &JsonValue) -> Result<Self, ConfigError> {
        let processing_factor = default_u64(attrs, "processing_factor", 1).max(1);
        Ok(MjpegTriggerAttributes {
            url: required_str(attrs, "url")?,
            processing_factor,
            sink: attrs
                .get("sink")
                .and_then(JsonValue::as_str)
                .map(str::to_owned),
        })
    }
}

/// `attributes` schema for the RTSP pull trigger (§4.F).
#[derive(Debug, Clone)]
pub struct RtspTriggerAttributes {
    pub rtsp_url: String,
    pub buffer_size: usize,
    pub chunk_bytes: usize,
    pub max_bytes: usize,
    pub trim_bytes: usize,
    pub processing_interval_ms: u64,
    pub is_video: bool,
    pub sink: Option<String>,
}

impl RtspTriggerAttributes {
    pub fn parse(attrs: &JsonValue) -> Result<Self, ConfigError> {
        Ok(RtspTriggerAttributes {
            rtsp_url: required_str(attrs, "rtsp_url")?,
            buffer_size: default_u64(attrs, "buffer_size", 16) as usize,
            chunk_bytes: default_u64(attrs, "chunk_bytes", 4096) as usize,
            max_bytes: default_u64(attrs, "max_bytes", 65536) as usize,
            trim_bytes: default_u64(attrs, "trim_bytes", 4096) as usize,
            processing_interval_ms: default_u64(attrs, "processing_interval", 100),
            is_video: default_bool(attrs, "is_video", true),
            sink: attrs
                .get("sink")
                .and_then(JsonValue::as_str)
                .map(str::to_owned),
        })
    }
}

/// `attributes` schema for the WebSocket trigger (§4.G).
#[derive(Debug, Clone)]
pub struct WebSocketTriggerAttributes {
    pub websocket_addr: String,
    pub chunk_bytes: usize,
    pub max_bytes: usize,
    pub trim_bytes: usize,
    pub processing_interval_ms: u64,
    pub is_stream: bool,
    pub buffer_size: usize,
}

impl WebSocketTriggerAttributes {
    pub fn parse(attrs: &JsonValue) -> Result<Self, ConfigError> {
        Ok(WebSocketTriggerAttributes {
            websocket_addr: required_str(attrs, "websocket_addr")?,
            chunk_bytes: default_u64(attrs, "chunk_bytes", 4096) as usize,
            max_bytes: default_u64(attrs, "max_bytes", 65536) as usize,
            trim_bytes: default_u64(attrs, "trim_bytes", 4096) as usize,
            processing_interval_ms: default_u64(attrs, "processing_interval", 100),
            is_stream: default_bool(attrs, "is_stream", false),
            buffer_size: default_u64(attrs, "buffer_size", 16) as usize,
        })
    }
}

#[derive(Debug, Clone)]
pub enum ExtProcMode {
    Preprocessor,
    Postprocessor,
    Wrapprocessor,
    Observeprocessor,
}

impl ExtProcMode {
    fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "preprocessor" => Ok(ExtProcMode::Preprocessor),
            "postprocessor" => Ok(ExtProcMode::Postprocessor),
            "wrapprocessor" => Ok(ExtProcMode::Wrapprocessor),
            "observeprocessor" => Ok(ExtProcMode::Observeprocessor),
            other => Err(ConfigError::InvalidValue {
                field: "type",
                reason: format!("unrecognized ext-proc mode `{other}`"),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtProcProcessingOptions {
    pub request_id_header_name: String,
    pub request_id_fallback: bool,
    pub decompress_bodies: bool,
    pub buffer_streamed_bodies: bool,
    pub per_request_body_buffer_bytes: i64,
    pub log_stream: bool,
    pub log_phases: bool,
    pub update_ext_proc_header: bool,
    pub update_duration_header: bool,
}

impl ExtProcProcessingOptions {
    fn parse(attrs: &JsonValue) -> Self {
        let empty = JsonValue::Null;
        let opts = attrs.get("processingOptions").unwrap_or(&empty);
        ExtProcProcessingOptions {
            request_id_header_name: default_string(opts, "requestIdHeaderName", "x-request-id"),
            request_id_fallback: default_bool(opts, "requestIdFallback", true),
            decompress_bodies: default_bool(opts, "decompressBodies", true),
            buffer_streamed_bodies: default_bool(opts, "bufferStreamedBodies", false),
            per_request_body_buffer_bytes: default_i64(opts, "perRequestBodyBufferBytes", -1),
            log_stream: default_bool(opts, "logStream", false),
            log_phases: default_bool(opts, "logPhases", false),
            update_ext_proc_header: default_bool(opts, "updateExtProcHeader", false),
            update_duration_header: default_bool(opts, "updateDurationHeader", false),
        }
    }
}

/// `attributes` schema for the Envoy ext-proc trigger (§4.H).
#[derive(Debug, Clone)]
pub struct ExtProcTriggerAttributes {
    pub mode: ExtProcMode,
    pub port: u16,
    pub graceful_shutdown_timeout_s: u64,
    pub max_concurrent_streams: u32,
    pub processing_options: ExtProcProcessingOptions,
}

impl ExtProcTriggerAttributes {
    pub fn parse(attrs: &JsonValue) -> Result<Self, ConfigError> {
        let mode = ExtProcMode::parse(&required_str(attrs, "type")?)?;
        let port = attrs
            .get("port")
            .and_then(JsonValue::as_u64)
            .ok_or(ConfigError::MissingField("port"))? as u16;
        Ok(ExtProcTriggerAttributes {
            mode,
            port,
            graceful_shutdown_timeout_s: default_u64(attrs, "gracefulShutdownTimeout", 15),
            max_concurrent_streams: default_u64(attrs, "maxConcurrentStreams", 100) as u32,
            processing_options: ExtProcProcessingOptions::parse(attrs),
        })
    }
}

/// `attributes` schema for the Job trigger (§4.I).
#[derive(Debug, Clone)]
pub struct JobTriggerAttributes {
    pub input_path: Option<String>,
    pub output_path: Option<String>,
    pub body: Option<String>,
}

impl JobTriggerAttributes {
    pub fn parse(attrs: &JsonValue) -> Result<Self, ConfigError> {
        Ok(JobTriggerAttributes {
            input_path: attrs
                .get("input_path")
                .and_then(JsonValue::as_str)
                .map(str::to_owned),
            output_path: attrs
                .get("output_path")
                .and_then(JsonValue::as_str)
                .map(str::to_owned),
            body: attrs
                .get("body")
                .and_then(JsonValue::as_str)
                .map(str::to_owned),
        })
    }
}

/// `attributes` schema for the OpenInference (KServe v2) trigger (§4.J).
#[derive(Debug, Clone)]
pub struct OpenInferenceTriggerAttributes {
    pub model_name: String,
    pub model_version: String,
    pub rest_port: u16,
    pub grpc_port: u16,
    pub enable_rest: bool,
    pub enable_grpc: bool,
    pub input_tensors: Vec<String>,
    pub output_tensors: Vec<String>,
}

impl OpenInferenceTriggerAttributes {
    pub fn parse(attrs: &JsonValue) -> Result<Self, ConfigError> {
        let names = |field: &str| -> Vec<String> {
            attrs
                .get(field)
                .and_then(JsonValue::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(str::to_owned))
                        .collect()
                })
                .unwrap_or_default()
        };
        Ok(OpenInferenceTriggerAttributes {
            model_name: default_string(attrs, "model_name", "model"),
            model_version: default_string(attrs, "model_version", "1"),
            rest_port: default_u64(attrs, "rest_port", 8080) as u16,
            grpc_port: default_u64(attrs, "grpc_port", 9000) as u16,
            enable_rest: default_bool(attrs, "enable_rest", true),
            enable_grpc: default_bool(attrs, "enable_grpc", true),
            input_tensors: names("input_tensors"),
            output_tensors: names("output_tensors"),
        })
    }
}

/// `attributes` schema for the MJPEG sink (§4.K).
#[derive(Debug, Clone)]
pub struct MjpegSinkAttributes {
    pub addr: String,
    pub boundary: String,
}

impl MjpegSinkAttributes {
    pub fn parse(attrs: &JsonValue) -> Result<Self, ConfigError> {
        Ok(MjpegSinkAttributes {
            addr: required_str(attrs, "addr")?,
            boundary: default_string(attrs, "boundary", "frame"),
        })
    }
}

/// `attributes` schema for the RTSP sink (§4.L).
#[derive(Debug, Clone)]
pub struct RtspSinkAttributes {
    pub addr: String,
    pub is_video: bool,
    pub sample_rate: u32,
    pub channels: u16,
}

impl RtspSinkAttributes {
    pub fn parse(attrs: &JsonValue) -> Result<Self, ConfigError> {
        Ok(RtspSinkAttributes {
            addr: required_str(attrs, "addr")?,
            is_video: default_bool(attrs, "is_video", true),
            sample_rate: default_u64(attrs, "sample_rate", 8000) as u32,
            channels: default_u64(attrs, "channels", 1) as u16,
        })
    }
}

/// `attributes` schema for the WebSocket sink (§4.M).
#[derive(Debug, Clone)]
pub struct WebSocketSinkAttributes {
    pub url: String,
    pub binary: bool,
}

impl WebSocketSinkAttributes {
    pub fn parse(attrs: &JsonValue) -> Result<Self, ConfigError> {
        Ok(WebSocketSinkAttributes {
            url: required_str(attrs, "url")?,
            binary: default_bool(attrs, "binary", false),
        })
    }
}

/// `attributes` schema for the Webhook sink (§4.N).
#[derive(Debug, Clone)]
pub struct WebhookSinkAttributes {
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub timeout_s: u64,
    pub max_retries: u32,
    pub retry_delay_s: u64,
}

impl WebhookSinkAttributes {
    pub fn parse(attrs: &JsonValue) -> Result<Self, ConfigError> {
        let headers = attrs
            .get("headers")
            .and_then(JsonValue::as_object)
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_owned())))
                    .collect()
            })
            .unwrap_or_default();
        Ok(WebhookSinkAttributes {
            url: required_str(attrs, "url")?,
            method: default_string(attrs, "method", "POST"),
            headers,
            timeout_s: default_u64(attrs, "timeout", 10),
            max_retries: default_u64(attrs, "maxRetries", 3) as u32,
            retry_delay_s: default_u64(attrs, "retryDelay", 1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mjpeg_attributes_require_url() {
        let err = MjpegTriggerAttributes::parse(&serde_json::json!({})).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField("url")));
    }

    #[test]
    fn mjpeg_attributes_default_processing_factor_is_one() {
        let attrs =
            MjpegTriggerAttributes::parse(&serde_json::json!({"url": "http://x/mjpeg"})).unwrap();
        assert_eq!(attrs.processing_factor, 1);
    }

    #[test]
    fn extproc_requires_type_and_port() {
        let err = ExtProcTriggerAttributes::parse(&serde_json::json!({"type": "preprocessor"}))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingField("port")));
    }

    #[test]
    fn webhook_defaults_match_the_documented_contract() {
        let attrs =
            WebhookSinkAttributes::parse(&serde_json::json!({"url": "http://x"})).unwrap();
        assert_eq!(attrs.method, "POST");
        assert_eq!(attrs.max_retries, 3);
        assert_eq!(attrs.retry_delay_s, 1);
    }

    #[test]
    fn platform_overlay_merge_overrides_scalars_and_recurses_maps() {
        let mut base: serde_yaml::Value = serde_yaml::from_str(
            "triggers:\n  - kind: mjpeg\n    name: a\n    worker_allocator_name: w\n    attributes:\n      url: http://old\n      processing_factor: 1\n",
        )
        .unwrap();
        let overlay: serde_yaml::Value = serde_yaml::from_str(
            "triggers:\n  - kind: mjpeg\n    name: a\n    worker_allocator_name: w\n    attributes:\n      url: http://new\n",
        )
        .unwrap();
        merge_yaml(&mut base, overlay);
        let cfg: ProcessorConfig = serde_yaml::from_value(base).unwrap();
        assert_eq!(
            cfg.triggers[0].attributes.get("url").unwrap().as_str(),
            Some("http://new")
        );
    }
}
