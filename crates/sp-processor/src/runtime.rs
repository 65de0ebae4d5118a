// SPDX-License-Identifier: Apache-2.0

//! The handler runtime bridge. The handler process itself is an opaque
//! collaborator — this module only defines the narrow line-delimited-JSON
//! contract a `subprocess` runtime speaks over stdio, plus the `kind ->
//! constructor` registry `--list-runtimes` reads from.

use async_trait::async_trait;
use base64::Engine;
use fnmesh_event::{Event, HeaderValue, Response};
use fnmesh_worker::{Runtime, RuntimeError};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

pub const KIND_SUBPROCESS: &str = "subprocess";

/// Invokes a configured executable once per event: the event is serialized
/// as one JSON line on the child's stdin, and the child must reply with one
/// JSON line on stdout before exiting (or staying alive for the next line,
/// if it chooses to be long-lived — both are valid, since a fresh process is
/// spawned per invocation either way).
pub struct SubprocessRuntime {
    command: String,
    args: Vec<String>,
}

impl SubprocessRuntime {
    pub fn new(command: String, args: Vec<String>) -> Self {
        SubprocessRuntime { command, args }
    }
}

fn event_to_json(event: &Event) -> serde_json::Value {
    let headers: serde_json::Map<String, serde_json::Value> = event
        .get_headers()
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::String(v.to_string())))
        .collect();
    serde_json::json!({
        "variant": event.variant().as_str(),
        "method": event.get_method(),
        "path": event.get_path(),
        "contentType": event.get_content_type(),
        "headers": headers,
        "body": base64::engine::general_purpose::STANDARD.encode(event.get_body()),
    })
}

fn json_to_response(value: serde_json::Value) -> Result<Response, RuntimeError> {
    let status_code = value
        .get("statusCode")
        .and_then(serde_json::Value::as_i64)
        .unwrap_or(0) as i16;
    let body_field = value.get("body").and_then(serde_json::Value::as_str).unwrap_or("");
    let body = base64::engine::general_purpose::STANDARD
        .decode(body_field)
        .unwrap_or_else(|_| body_field.as_bytes().to_vec());
    let mut response = Response::new().with_status(status_code).with_body(body);
    if let Some(headers) = value.get("headers").and_then(serde_json::Value::as_object) {
        for (k, v) in headers {
            if let Some(s) = v.as_str() {
                response = response.with_header(k.clone(), HeaderValue::from(s.to_owned()));
            }
        }
    }
    Ok(response)
}

#[async_trait]
impl Runtime for SubprocessRuntime {
    async fn invoke(&self, event: Event) -> Result<Response, RuntimeError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| RuntimeError::new(format!("spawning {}: {e}", self.command)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| RuntimeError::new("child has no stdin"))?;
        let mut line = serde_json::to_vec(&event_to_json(&event))
            .map_err(|e| RuntimeError::new(format!("serializing event: {e}")))?;
        line.push(b'\n');
        stdin
            .write_all(&line)
            .await
            .map_err(|e| RuntimeError::new(format!("writing to child stdin: {e}")))?;
        drop(stdin);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::new("child has no stdout"))?;
        let mut reader = BufReader::new(stdout);
        let mut response_line = String::new();
        reader
            .read_line(&mut response_line)
            .await
            .map_err(|e| RuntimeError::new(format!("reading child stdout: {e}")))?;

        let status = child
            .wait()
            .await
            .map_err(|e| RuntimeError::new(format!("waiting for child: {e}")))?;
        if !status.success() && response_line.trim().is_empty() {
            return Err(RuntimeError::new(format!(
                "child exited with {status} and produced no response"
            )));
        }

        let parsed: serde_json::Value = serde_json::from_str(response_line.trim())
            .map_err(|e| RuntimeError::new(format!("parsing child response: {e}")))?;
        json_to_response(parsed)
    }
}

type RuntimeConstructor = dyn Fn(&serde_json::Value) -> Result<Arc<dyn Runtime>, RuntimeError> + Send + Sync;

/// Process-wide `kind -> constructor` map for handler runtimes. Populated
/// once at startup; `--list-runtimes` reads `kinds()` directly.
#[derive(Default)]
pub struct RuntimeRegistry {
    constructors: HashMap<String, Arc<RuntimeConstructor>>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        let mut registry = RuntimeRegistry::default();
        registry.register(KIND_SUBPROCESS, |config| {
            let command = config
                .get("command")
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| RuntimeError::new("subprocess runtime requires `command`"))?
                .to_owned();
            let args = config
                .get("args")
                .and_then(serde_json::Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(str::to_owned))
                        .collect()
                })
                .unwrap_or_default();
            Ok(Arc::new(SubprocessRuntime::new(command, args)) as Arc<dyn Runtime>)
        });
        registry
    }

    pub fn register(
        &mut self,
        kind: impl Into<String>,
        constructor: impl Fn(&serde_json::Value) -> Result<Arc<dyn Runtime>, RuntimeError> + Send + Sync + 'static,
    ) {
        let _ = self.constructors.insert(kind.into(), Arc::new(constructor));
    }

    pub fn create(&self, kind: &str, config: &serde_json::Value) -> Result<Arc<dyn Runtime>, RuntimeError> {
        let constructor = self
            .constructors
            .get(kind)
            .ok_or_else(|| RuntimeError::new(format!("unknown runtime kind: {kind}")))?;
        constructor(config)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.constructors.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lists_subprocess_kind_sorted() {
        let registry = RuntimeRegistry::new();
        assert_eq!(registry.kinds(), vec!["subprocess".to_owned()]);
    }

    #[test]
    fn event_to_json_base64_encodes_body() {
        let info = fnmesh_event::TriggerInfo {
            class: "trigger".into(),
            kind: "job".into(),
            name: "t".into(),
        };
        let event = Event::new(fnmesh_event::TriggerVariant::Job, info).with_body("hi");
        let json = event_to_json(&event);
        assert_eq!(json["body"], base64::engine::general_purpose::STANDARD.encode("hi"));
    }
}
