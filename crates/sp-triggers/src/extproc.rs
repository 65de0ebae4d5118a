// SPDX-License-Identifier: Apache-2.0

//! Envoy ext-proc trigger: hosts the `ExternalProcessor` bidirectional gRPC
//! stream, running a per-stream six-phase state machine
//! (`RequestHeaders -> RequestBody* -> RequestTrailers? -> ResponseHeaders
//! -> ResponseBody* -> ResponseTrailers?`) against a single [`RequestContext`]
//! that is thread-confined to the stream's task.
//!
//! Which phases call the handler, and what the handler's response is allowed
//! to do to the wire, is decided per [`ExtProcMode`] by [`ModeBehavior`]:
//! `preprocessor` only touches the request, `postprocessor` only the
//! response, `wrapprocessor` can short-circuit the request with an
//! immediate response and mutate the response, and `observeprocessor` calls
//! the handler on both phases but never lets it change anything on the
//! wire.

pub mod pb {
    tonic::include_proto!("envoy.service.ext_proc.v3");
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("ext_proc_descriptor");
}

use async_trait::async_trait;
use fnmesh_config::{ExtProcMode, ExtProcProcessingOptions, ExtProcTriggerAttributes};
use fnmesh_event::{Event, TriggerInfo, TriggerVariant};
use fnmesh_trigger::{
    Trigger, TriggerCore, TriggerError, TriggerFactoryContext, TriggerRegistry, TriggerStatus,
};
use futures::Stream;
use pb::body_mutation::Mutation as BodyMutationKind;
use pb::external_processor_server::{ExternalProcessor, ExternalProcessorServer};
use pb::header_value_option::HeaderAppendAction;
use pb::processing_request::Request as ReqPhase;
use pb::processing_response::Response as RespPhase;
use pb::{
    BodyMutation, BodyResponse, CommonResponse, HeaderMutation, HeaderValue, HeaderValueOption,
    HeadersResponse, HttpHeaders, ImmediateResponse, ProcessingRequest, ProcessingResponse,
    TrailersResponse,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::{error, warn};

pub const KIND: &str = "extproc";
const ALLOCATION_TIMEOUT: Duration = Duration::from_secs(5);

struct ModeBehavior {
    invoke_request: bool,
    invoke_response: bool,
    allow_request_mutate: bool,
    allow_request_immediate: bool,
    allow_response_mutate: bool,
    allow_response_immediate: bool,
}

impl ModeBehavior {
    fn for_mode(mode: ExtProcMode) -> Self {
        match mode {
            ExtProcMode::Preprocessor => ModeBehavior {
                invoke_request: true,
                invoke_response: false,
                allow_request_mutate: true,
                allow_request_immediate: false,
                allow_response_mutate: false,
                allow_response_immediate: false,
            },
            ExtProcMode::Postprocessor => ModeBehavior {
                invoke_request: false,
                invoke_response: true,
                allow_request_mutate: false,
                allow_request_immediate: false,
                allow_response_mutate: true,
                allow_response_immediate: true,
            },
            ExtProcMode::Wrapprocessor => ModeBehavior {
                invoke_request: true,
                invoke_response: true,
                allow_request_mutate: false,
                allow_request_immediate: true,
                allow_response_mutate: true,
                allow_response_immediate: false,
            },
            ExtProcMode::Observeprocessor => ModeBehavior {
                invoke_request: true,
                invoke_response: true,
                allow_request_mutate: false,
                allow_request_immediate: false,
                allow_response_mutate: false,
                allow_response_immediate: false,
            },
        }
    }
}

/// Per-Envoy-stream, per-request state. Lives entirely inside the task that
/// owns the stream, so it needs no internal synchronization.
struct RequestContext {
    pseudo_headers: HashMap<String, String>,
    query: HashMap<String, String>,
    request_id: String,
    headers: HashMap<String, String>,
    raw_headers: HashMap<String, Vec<u8>>,
    request_body: Vec<u8>,
    response_body: Vec<u8>,
    response_status: i32,
    data: HashMap<String, serde_json::Value>,
    duration: Duration,
    duration_header_sent: bool,
}

impl RequestContext {
    fn new() -> Self {
        RequestContext {
            pseudo_headers: HashMap::new(),
            query: HashMap::new(),
            request_id: String::new(),
            headers: HashMap::new(),
            raw_headers: HashMap::new(),
            request_body: Vec::new(),
            response_body: Vec::new(),
            response_status: 0,
            data: HashMap::new(),
            duration: Duration::ZERO,
            duration_header_sent: false,
        }
    }

    /// Populates the headers view from an incoming `HttpHeaders` message,
    /// splitting pseudo-headers (`:method`, `:path`, ...) from the rest and
    /// routing non-UTF-8 values into the raw view. Resets the per-direction
    /// headers view; `data` survives untouched.
    fn ingest_headers(&mut self, msg: &HttpHeaders, opts: &ExtProcProcessingOptions) {
        self.pseudo_headers.clear();
        self.headers.clear();
        self.raw_headers.clear();
        let Some(map) = &msg.headers else { return };
        for hv in &map.headers {
            let (key, raw) = if !hv.raw_value.is_empty() {
                (hv.key.clone(), hv.raw_value.clone())
            } else {
                (hv.key.clone(), hv.value.clone().into_bytes())
            };
            match String::from_utf8(raw.clone()) {
                Ok(text) if key.starts_with(':') => {
                    let _ = self.pseudo_headers.insert(key, text);
                }
                Ok(text) => {
                    let _ = self.headers.insert(key, text);
                }
                Err(_) => {
                    let _ = self.raw_headers.insert(key, raw);
                }
            }
        }
        if let Some(path) = self.pseudo_headers.get(":path") {
            self.query = parse_query(path);
        }
        if let Some(status) = self.pseudo_headers.get(":status") {
            self.response_status = status.parse().unwrap_or(0);
        }
        let header_name = opts.request_id_header_name.to_ascii_lowercase();
        if self.request_id.is_empty() {
            self.request_id = self
                .headers
                .get(&header_name)
                .cloned()
                .unwrap_or_default();
            if self.request_id.is_empty() && opts.request_id_fallback {
                self.request_id = uuid::Uuid::new_v4().to_string();
            }
        }
    }

    /// Stringifies a header value for the handler-facing event, base64
    /// encoding any raw value that failed UTF-8 validation.
    fn all_headers_stringified(&self) -> HashMap<String, String> {
        let mut out = self.headers.clone();
        for (k, v) in &self.raw_headers {
            use base64::Engine;
            let _ = out.insert(k.clone(), base64::engine::general_purpose::STANDARD.encode(v));
        }
        out
    }
}

fn parse_query(path: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let Some((_, query)) = path.split_once('?') else {
        return out;
    };
    for pair in query.split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            let _ = out.insert(k.to_owned(), v.to_owned());
        }
    }
    out
}

fn header_mutation_set(key: &str, value: &str, action: HeaderAppendAction) -> HeaderValueOption {
    HeaderValueOption {
        header: Some(HeaderValue {
            key: key.to_owned(),
            value: value.to_owned(),
            raw_value: Vec::new(),
        }),
        append_action: action as i32,
    }
}

struct Inner {
    core: TriggerCore,
    attrs: ExtProcTriggerAttributes,
    behavior: ModeBehavior,
}

impl Inner {
    async fn invoke_handler(&self, ctx: &mut RequestContext, body: Vec<u8>) -> Option<fnmesh_event::Response> {
        let info = TriggerInfo {
            class: "trigger".into(),
            kind: KIND.into(),
            name: self.core.name.clone(),
        };
        let mut event = Event::new(TriggerVariant::ExtProc, info).with_body(body);
        for (k, v) in ctx.all_headers_stringified() {
            event = event.with_field(k, v);
        }
        let started = std::time::Instant::now();
        let outcome = self
            .core
            .allocate_worker_and_submit_event(event, ALLOCATION_TIMEOUT)
            .await;
        ctx.duration += started.elapsed();

        if outcome.timed_out {
            warn!(trigger = %self.core.id, request_id = %ctx.request_id, "ext-proc handler timed out");
            return Some(fnmesh_event::Response::new().with_status(408));
        }
        if let Some(err) = outcome.submit_err {
            error!(trigger = %self.core.id, request_id = %ctx.request_id, %err, "ext-proc handler failed");
            return None;
        }
        outcome.response
    }

    fn build_mutate_response(
        &self,
        ctx: &mut RequestContext,
        resp: fnmesh_event::Response,
        end_of_stream: bool,
    ) -> CommonResponse {
        let mut header_mutation = HeaderMutation::default();
        for (k, v) in &resp.headers {
            header_mutation.set_headers.push(header_mutation_set(
                k,
                &v.to_string(),
                HeaderAppendAction::OverwriteIfExistsOrAdd,
            ));
        }
        let body_mutation = if resp.body.is_empty() {
            None
        } else {
            header_mutation.set_headers.push(header_mutation_set(
                "content-length",
                &resp.body.len().to_string(),
                HeaderAppendAction::OverwriteIfExistsOrAdd,
            ));
            Some(BodyMutation {
                mutation: Some(BodyMutationKind::Body(resp.body.to_vec())),
            })
        };
        if end_of_stream && self.attrs.processing_options.update_duration_header && !ctx.duration_header_sent {
            ctx.duration_header_sent = true;
            header_mutation.set_headers.push(header_mutation_set(
                "x-extproc-duration-ns",
                &ctx.duration.as_nanos().to_string(),
                HeaderAppendAction::OverwriteIfExistsOrAdd,
            ));
        }
        CommonResponse {
            header_mutation: Some(header_mutation),
            body_mutation,
        }
    }

    fn immediate_from(&self, resp: &fnmesh_event::Response) -> ImmediateResponse {
        let mut headers = HeaderMutation::default();
        for (k, v) in &resp.headers {
            headers.set_headers.push(header_mutation_set(
                k,
                &v.to_string(),
                HeaderAppendAction::OverwriteIfExistsOrAdd,
            ));
        }
        ImmediateResponse {
            status: resp.status_code as i32,
            headers: Some(headers),
            body: resp.body.to_vec(),
        }
    }

    async fn handle_phase(&self, ctx: &mut RequestContext, phase: ReqPhase) -> ProcessingResponse {
        match phase {
            ReqPhase::RequestHeaders(h) => {
                *ctx = RequestContext::new();
                ctx.ingest_headers(&h, &self.attrs.processing_options);
                if h.end_of_stream && self.behavior.invoke_request {
                    return self.finish_request(ctx, Vec::new()).await;
                }
                ProcessingResponse {
                    response: Some(RespPhase::RequestHeaders(HeadersResponse {
                        response: Some(CommonResponse::default()),
                    })),
                }
            }
            ReqPhase::RequestBody(b) => {
                ctx.request_body.extend_from_slice(&b.body);
                if b.end_of_stream && self.behavior.invoke_request {
                    let body = std::mem::take(&mut ctx.request_body);
                    let body = maybe_decompress(body, &self.attrs.processing_options);
                    return self.finish_request(ctx, body).await;
                }
                ProcessingResponse {
                    response: Some(RespPhase::RequestBody(BodyResponse {
                        response: Some(CommonResponse::default()),
                    })),
                }
            }
            ReqPhase::RequestTrailers(_) => ProcessingResponse {
                response: Some(RespPhase::RequestTrailers(TrailersResponse {
                    header_mutation: None,
                })),
            },
            ReqPhase::ResponseHeaders(h) => {
                ctx.ingest_headers(&h, &self.attrs.processing_options);
                if h.end_of_stream && self.behavior.invoke_response {
                    return self.finish_response(ctx, Vec::new(), true).await;
                }
                ProcessingResponse {
                    response: Some(RespPhase::ResponseHeaders(HeadersResponse {
                        response: Some(CommonResponse::default()),
                    })),
                }
            }
            ReqPhase::ResponseBody(b) => {
                ctx.response_body.extend_from_slice(&b.body);
                if b.end_of_stream && self.behavior.invoke_response {
                    let body = std::mem::take(&mut ctx.response_body);
                    let body = maybe_decompress(body, &self.attrs.processing_options);
                    return self.finish_response(ctx, body, true).await;
                }
                ProcessingResponse {
                    response: Some(RespPhase::ResponseBody(BodyResponse {
                        response: Some(CommonResponse::default()),
                    })),
                }
            }
            ReqPhase::ResponseTrailers(_) => {
                let mut header_mutation = HeaderMutation::default();
                if self.attrs.processing_options.update_duration_header && !ctx.duration_header_sent {
                    ctx.duration_header_sent = true;
                    header_mutation.set_headers.push(header_mutation_set(
                        "x-extproc-duration-ns",
                        &ctx.duration.as_nanos().to_string(),
                        HeaderAppendAction::OverwriteIfExistsOrAdd,
                    ));
                }
                ProcessingResponse {
                    response: Some(RespPhase::ResponseTrailers(TrailersResponse {
                        header_mutation: Some(header_mutation),
                    })),
                }
            }
        }
    }

    async fn finish_request(&self, ctx: &mut RequestContext, body: Vec<u8>) -> ProcessingResponse {
        let Some(resp) = self.invoke_handler(ctx, body).await else {
            return ProcessingResponse {
                response: Some(RespPhase::RequestHeaders(HeadersResponse {
                    response: Some(CommonResponse::default()),
                })),
            };
        };
        if self.behavior.allow_request_immediate && resp.status_code > 0 {
            return ProcessingResponse {
                response: Some(RespPhase::ImmediateResponse(self.immediate_from(&resp))),
            };
        }
        let common = if self.behavior.allow_request_mutate {
            self.build_mutate_response(ctx, resp, false)
        } else {
            CommonResponse::default()
        };
        ProcessingResponse {
            response: Some(RespPhase::RequestHeaders(HeadersResponse {
                response: Some(common),
            })),
        }
    }

    async fn finish_response(
        &self,
        ctx: &mut RequestContext,
        body: Vec<u8>,
        end_of_stream: bool,
    ) -> ProcessingResponse {
        let Some(resp) = self.invoke_handler(ctx, body).await else {
            return ProcessingResponse {
                response: Some(RespPhase::ResponseHeaders(HeadersResponse {
                    response: Some(CommonResponse::default()),
                })),
            };
        };
        if self.behavior.allow_response_immediate && resp.status_code > 0 {
            return ProcessingResponse {
                response: Some(RespPhase::ImmediateResponse(self.immediate_from(&resp))),
            };
        }
        let common = if self.behavior.allow_response_mutate {
            self.build_mutate_response(ctx, resp, end_of_stream)
        } else {
            CommonResponse::default()
        };
        ProcessingResponse {
            response: Some(RespPhase::ResponseHeaders(HeadersResponse {
                response: Some(common),
            })),
        }
    }
}

fn maybe_decompress(body: Vec<u8>, opts: &ExtProcProcessingOptions) -> Vec<u8> {
    if !opts.decompress_bodies {
        return body;
    }
    use std::io::Read;
    let mut decoder = flate2::read::GzDecoder::new(&body[..]);
    let mut out = Vec::new();
    match decoder.read_to_end(&mut out) {
        Ok(_) => out,
        Err(_) => body,
    }
}

#[derive(Clone)]
struct ExtProcService {
    inner: Arc<Inner>,
}

#[async_trait]
impl ExternalProcessor for ExtProcService {
    type ProcessStream =
        Pin<Box<dyn Stream<Item = Result<ProcessingResponse, Status>> + Send + 'static>>;

    async fn process(
        &self,
        request: Request<Streaming<ProcessingRequest>>,
    ) -> Result<Response<Self::ProcessStream>, Status> {
        let inner = self.inner.clone();
        let mut inbound = request.into_inner();
        let output = async_stream::try_stream! {
            let mut ctx = RequestContext::new();
            while let Some(msg) = inbound.message().await? {
                let Some(phase) = msg.request else { continue };
                yield inner.handle_phase(&mut ctx, phase).await;
            }
        };
        Ok(Response::new(Box::pin(output)))
    }
}

pub struct ExtProcTrigger {
    inner: Arc<Inner>,
    server_task: Mutex<Option<JoinHandle<()>>>,
}

impl ExtProcTrigger {
    pub fn new(core: TriggerCore, attrs: ExtProcTriggerAttributes) -> Self {
        let behavior = ModeBehavior::for_mode(attrs.mode.clone());
        ExtProcTrigger {
            inner: Arc::new(Inner {
                core,
                attrs,
                behavior,
            }),
            server_task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Trigger for ExtProcTrigger {
    async fn start(&self, _checkpoint: fnmesh_trigger::Checkpoint) -> Result<(), TriggerError> {
        self.inner.core.set_status(TriggerStatus::Initializing);
        let addr: SocketAddr = ([0, 0, 0, 0], self.inner.attrs.port).into();

        let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
        health_reporter
            .set_serving::<ExternalProcessorServer<ExtProcService>>()
            .await;
        let reflection_service = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(pb::FILE_DESCRIPTOR_SET)
            .build_v1()
            .map_err(|e| TriggerError::Bind(format!("reflection service: {e}")))?;

        let service = ExternalProcessorServer::new(ExtProcService {
            inner: self.inner.clone(),
        });
        let cancellation = self.inner.core.cancellation.clone();
        let handle = tokio::spawn(async move {
            let result = Server::builder()
                .add_service(health_service)
                .add_service(reflection_service)
                .add_service(service)
                .serve_with_shutdown(addr, async move { cancellation.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(%e, "ext-proc gRPC server exited with error");
            }
        });
        *self.server_task.lock().await = Some(handle);
        self.inner.core.set_status(TriggerStatus::Ready);
        Ok(())
    }

    async fn stop(&self, force: bool) -> Result<fnmesh_trigger::Checkpoint, TriggerError> {
        self.inner.core.cancellation.cancel();
        if !force {
            self.inner
                .core
                .drain(Duration::from_secs(self.inner.attrs.graceful_shutdown_timeout_s))
                .await;
        }
        if let Some(handle) = self.server_task.lock().await.take() {
            if force {
                handle.abort();
            }
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
        let attrs = ExtProcTriggerAttributes::parse(&ctx.config)
            .map_err(|e| TriggerError::Config(e.to_string()))?;
        let core = TriggerCore::new(ctx);
        Ok(Arc::new(ExtProcTrigger::new(core, attrs)) as Arc<dyn Trigger>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_parses_pairs_after_question_mark() {
        let q = parse_query("/infer?model=a&version=2");
        assert_eq!(q.get("model"), Some(&"a".to_owned()));
        assert_eq!(q.get("version"), Some(&"2".to_owned()));
    }

    #[test]
    fn query_is_empty_without_question_mark() {
        assert!(parse_query("/infer").is_empty());
    }

    #[test]
    fn mode_behavior_wrapprocessor_allows_request_immediate_and_response_mutate() {
        let b = ModeBehavior::for_mode(ExtProcMode::Wrapprocessor);
        assert!(b.allow_request_immediate);
        assert!(!b.allow_request_mutate);
        assert!(b.allow_response_mutate);
        assert!(!b.allow_response_immediate);
    }

    #[test]
    fn mode_behavior_observeprocessor_never_mutates_or_shortcircuits() {
        let b = ModeBehavior::for_mode(ExtProcMode::Observeprocessor);
        assert!(b.invoke_request && b.invoke_response);
        assert!(!b.allow_request_mutate && !b.allow_response_mutate);
        assert!(!b.allow_request_immediate && !b.allow_response_immediate);
    }

    #[test]
    fn ingest_headers_splits_pseudo_and_regular_and_resolves_request_id() {
        let mut ctx = RequestContext::new();
        let msg = HttpHeaders {
            headers: Some(pb::HeaderMap {
                headers: vec![
                    HeaderValue { key: ":method".into(), value: "GET".into(), raw_value: vec![] },
                    HeaderValue { key: ":path".into(), value: "/v2/models/m/infer".into(), raw_value: vec![] },
                    HeaderValue { key: "x-request-id".into(), value: "abc-123".into(), raw_value: vec![] },
                ],
            }),
            end_of_stream: true,
        };
        let opts = ExtProcProcessingOptions {
            request_id_header_name: "x-request-id".into(),
            request_id_fallback: true,
            decompress_bodies: true,
            buffer_streamed_bodies: false,
            per_request_body_buffer_bytes: -1,
            log_stream: false,
            log_phases: false,
            update_ext_proc_header: false,
            update_duration_header: false,
        };
        ctx.ingest_headers(&msg, &opts);
        assert_eq!(ctx.pseudo_headers.get(":method"), Some(&"GET".to_owned()));
        assert_eq!(ctx.request_id, "abc-123");
    }
}
