// SPDX-License-Identifier: Apache-2.0

//! OpenInference (KServe v2) trigger: hosts the v2 REST surface
//! (`/v2`, `/v2/health/{live,ready}`, `/v2/models/{name}[/versions/{v}]`)
//! via axum and the `GRPCInferenceService` via tonic, side by side on two
//! ports. Both paths parse their wire tensors into the same internal
//! [`Tensor`] representation, submit one event carrying that representation
//! as JSON, and parse the handler's JSON response back into tensors before
//! re-encoding on whichever wire the request arrived on — REST and gRPC
//! share one conversion, so a round trip through either is lossless as long
//! as the handler echoes the same shape back.

pub mod pb {
    tonic::include_proto!("inference");
}

use async_trait::async_trait;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use fnmesh_config::OpenInferenceTriggerAttributes;
use fnmesh_event::{Event, TriggerInfo, TriggerVariant};
use fnmesh_trigger::{
    Trigger, TriggerCore, TriggerError, TriggerFactoryContext, TriggerRegistry, TriggerStatus,
};
use pb::grpc_inference_service_server::{GrpcInferenceService, GrpcInferenceServiceServer};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tonic::transport::Server;
use tracing::{error, warn};

pub const KIND: &str = "openinference";
const ALLOCATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Internal tensor representation both wire formats convert through.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorValues {
    Bool(Vec<bool>),
    Int8(Vec<i32>),
    Int16(Vec<i32>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    UInt8(Vec<u32>),
    UInt16(Vec<u32>),
    UInt32(Vec<u32>),
    UInt64(Vec<u64>),
    Fp32(Vec<f32>),
    Fp64(Vec<f64>),
    Bytes(Vec<Vec<u8>>),
}

impl TensorValues {
    fn datatype(&self) -> &'static str {
        match self {
            TensorValues::Bool(_) => "BOOL",
            TensorValues::Int8(_) => "INT8",
            TensorValues::Int16(_) => "INT16",
            TensorValues::Int32(_) => "INT32",
            TensorValues::Int64(_) => "INT64",
            TensorValues::UInt8(_) => "UINT8",
            TensorValues::UInt16(_) => "UINT16",
            TensorValues::UInt32(_) => "UINT32",
            TensorValues::UInt64(_) => "UINT64",
            TensorValues::Fp32(_) => "FP32",
            TensorValues::Fp64(_) => "FP64",
            TensorValues::Bytes(_) => "BYTES",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub name: String,
    pub shape: Vec<i64>,
    pub values: TensorValues,
}

/// Wire-agnostic JSON shape used both as the v2 REST tensor encoding and as
/// the body handed to/received from the handler. `BYTES` elements are
/// base64-encoded strings; every other datatype carries its values as a
/// plain JSON number/bool array.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TensorDto {
    name: String,
    shape: Vec<i64>,
    datatype: String,
    data: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
enum TensorError {
    #[error("unknown datatype: {0}")]
    UnknownDatatype(String),
    #[error("malformed tensor data for {0}")]
    MalformedData(String),
}

impl Tensor {
    fn to_dto(&self) -> TensorDto {
        let data = match &self.values {
            TensorValues::Bool(v) => serde_json::json!(v),
            TensorValues::Int8(v) | TensorValues::Int16(v) | TensorValues::Int32(v) => {
                serde_json::json!(v)
            }
            TensorValues::Int64(v) => serde_json::json!(v),
            TensorValues::UInt8(v) | TensorValues::UInt16(v) | TensorValues::UInt32(v) => {
                serde_json::json!(v)
            }
            TensorValues::UInt64(v) => serde_json::json!(v),
            TensorValues::Fp32(v) => serde_json::json!(v),
            TensorValues::Fp64(v) => serde_json::json!(v),
            TensorValues::Bytes(v) => {
                use base64::Engine;
                let encoded: Vec<String> = v
                    .iter()
                    .map(|b| base64::engine::general_purpose::STANDARD.encode(b))
                    .collect();
                serde_json::json!(encoded)
            }
        };
        TensorDto {
            name: self.name.clone(),
            shape: self.shape.clone(),
            datatype: self.values.datatype().to_owned(),
            data,
        }
    }

    fn from_dto(dto: TensorDto) -> Result<Self, TensorError> {
        let malformed = || TensorError::MalformedData(dto.name.clone());
        let nums = |v: &serde_json::Value| -> Result<Vec<f64>, TensorError> {
            v.as_array()
                .ok_or_else(malformed)?
                .iter()
                .map(|n| n.as_f64().ok_or_else(malformed))
                .collect()
        };
        let values = match dto.datatype.as_str() {
            "BOOL" => TensorValues::Bool(
                dto.data
                    .as_array()
                    .ok_or_else(malformed)?
                    .iter()
                    .map(|b| b.as_bool().unwrap_or(false))
                    .collect(),
            ),
            "INT8" => TensorValues::Int8(nums(&dto.data)?.into_iter().map(|n| n as i32).collect()),
            "INT16" => {
                TensorValues::Int16(nums(&dto.data)?.into_iter().map(|n| n as i32).collect())
            }
            "INT32" => {
                TensorValues::Int32(nums(&dto.data)?.into_iter().map(|n| n as i32).collect())
            }
            "INT64" => {
                TensorValues::Int64(nums(&dto.data)?.into_iter().map(|n| n as i64).collect())
            }
            "UINT8" => {
                TensorValues::UInt8(nums(&dto.data)?.into_iter().map(|n| n as u32).collect())
            }
            "UINT16" => {
                TensorValues::UInt16(nums(&dto.data)?.into_iter().map(|n| n as u32).collect())
            }
            "UINT32" => {
                TensorValues::UInt32(nums(&dto.data)?.into_iter().map(|n| n as u32).collect())
            }
            "UINT64" => {
                TensorValues::UInt64(nums(&dto.data)?.into_iter().map(|n| n as u64).collect())
            }
            "FP32" => TensorValues::Fp32(nums(&dto.data)?.into_iter().map(|n| n as f32).collect()),
            "FP64" => TensorValues::Fp64(nums(&dto.data)?),
            "BYTES" => {
                use base64::Engine;
                let strings: Vec<String> = dto
                    .data
                    .as_array()
                    .ok_or_else(malformed)?
                    .iter()
                    .map(|s| s.as_str().unwrap_or("").to_owned())
                    .collect();
                let mut decoded = Vec::with_capacity(strings.len());
                for s in strings {
                    decoded.push(
                        base64::engine::general_purpose::STANDARD
                            .decode(&s)
                            .map_err(|_| malformed())?,
                    );
                }
                TensorValues::Bytes(decoded)
            }
            other => return Err(TensorError::UnknownDatatype(other.to_owned())),
        };
        Ok(Tensor {
            name: dto.name,
            shape: dto.shape,
            values,
        })
    }

    fn to_proto_contents(&self) -> pb::InferTensorContents {
        let mut c = pb::InferTensorContents::default();
        match &self.values {
            TensorValues::Bool(v) => c.bool_contents = v.clone(),
            TensorValues::Int8(v) | TensorValues::Int16(v) | TensorValues::Int32(v) => {
                c.int_contents = v.clone()
            }
            TensorValues::Int64(v) => c.int64_contents = v.clone(),
            TensorValues::UInt8(v) | TensorValues::UInt16(v) | TensorValues::UInt32(v) => {
                c.uint_contents = v.clone()
            }
            TensorValues::UInt64(v) => c.uint64_contents = v.clone(),
            TensorValues::Fp32(v) => c.fp32_contents = v.clone(),
            TensorValues::Fp64(v) => c.fp64_contents = v.clone(),
            TensorValues::Bytes(v) => c.bytes_contents = v.clone(),
        }
        c
    }

    fn from_proto(name: String, datatype: &str, shape: Vec<i64>, c: pb::InferTensorContents) -> Result<Self, TensorError> {
        let values = match datatype {
            "BOOL" => TensorValues::Bool(c.bool_contents),
            "INT8" => TensorValues::Int8(c.int_contents),
            "INT16" => TensorValues::Int16(c.int_contents),
            "INT32" => TensorValues::Int32(c.int_contents),
            "INT64" => TensorValues::Int64(c.int64_contents),
            "UINT8" => TensorValues::UInt8(c.uint_contents),
            "UINT16" => TensorValues::UInt16(c.uint_contents),
            "UINT32" => TensorValues::UInt32(c.uint_contents),
            "UINT64" => TensorValues::UInt64(c.uint64_contents),
            "FP32" => TensorValues::Fp32(c.fp32_contents),
            "FP64" => TensorValues::Fp64(c.fp64_contents),
            "BYTES" => TensorValues::Bytes(c.bytes_contents),
            other => return Err(TensorError::UnknownDatatype(other.to_owned())),
        };
        Ok(Tensor { name, shape, values })
    }
}

struct Inner {
    core: TriggerCore,
    attrs: OpenInferenceTriggerAttributes,
    ready: AtomicBool,
}

pub struct OpenInferenceTrigger {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl OpenInferenceTrigger {
    pub fn new(core: TriggerCore, attrs: OpenInferenceTriggerAttributes) -> Self {
        OpenInferenceTrigger {
            inner: Arc::new(Inner {
                core,
                attrs,
                ready: AtomicBool::new(false),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }
}

impl Inner {
    async fn run_inference(&self, inputs: Vec<Tensor>) -> Result<Vec<Tensor>, TriggerError> {
        let dtos: Vec<TensorDto> = inputs.iter().map(Tensor::to_dto).collect();
        let body = serde_json::to_vec(&dtos)
            .map_err(|e| TriggerError::Remote(format!("encoding tensors: {e}")))?;

        let info = TriggerInfo {
            class: "trigger".into(),
            kind: KIND.into(),
            name: self.core.name.clone(),
        };
        let event = Event::new(TriggerVariant::OpenInference, info)
            .with_body(body)
            .with_field("model_name", self.attrs.model_name.as_str())
            .with_field("model_version", self.attrs.model_version.as_str());

        let outcome = self
            .core
            .allocate_worker_and_submit_event(event, ALLOCATION_TIMEOUT)
            .await;
        if outcome.timed_out {
            return Err(TriggerError::Remote("inference handler timed out".into()));
        }
        if let Some(err) = outcome.submit_err {
            return Err(TriggerError::Remote(err.to_string()));
        }
        let Some(resp) = outcome.response else {
            return Ok(Vec::new());
        };
        let dtos: Vec<TensorDto> = serde_json::from_slice(&resp.body)
            .map_err(|e| TriggerError::Remote(format!("decoding handler response: {e}")))?;
        dtos.into_iter()
            .map(Tensor::from_dto)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TriggerError::Remote(e.to_string()))
    }
}

// ---- REST surface ----

#[derive(Serialize)]
struct ServerMetadataDto {
    name: &'static str,
    version: &'static str,
    extensions: Vec<&'static str>,
}

#[derive(Serialize)]
struct ModelMetadataDto {
    name: String,
    versions: Vec<String>,
    platform: &'static str,
    inputs: Vec<ModelTensorMetadataDto>,
    outputs: Vec<ModelTensorMetadataDto>,
}

#[derive(Serialize)]
struct ModelTensorMetadataDto {
    name: String,
}

#[derive(Deserialize)]
struct InferRequestDto {
    inputs: Vec<TensorDto>,
    #[serde(default)]
    #[allow(dead_code)]
    outputs: Vec<serde_json::Value>,
}

#[derive(Serialize)]
struct InferResponseDto {
    model_name: String,
    model_version: String,
    outputs: Vec<TensorDto>,
}

async fn server_metadata() -> Json<ServerMetadataDto> {
    Json(ServerMetadataDto {
        name: "fnmeshd",
        version: "2",
        extensions: Vec::new(),
    })
}

async fn live() -> StatusCode {
    StatusCode::OK
}

async fn ready(State(inner): State<Arc<Inner>>) -> StatusCode {
    if inner.ready.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn model_metadata(
    State(inner): State<Arc<Inner>>,
    Path(name): Path<String>,
) -> Json<ModelMetadataDto> {
    Json(ModelMetadataDto {
        name,
        versions: vec![inner.attrs.model_version.clone()],
        platform: "fnmesh",
        inputs: inner
            .attrs
            .input_tensors
            .iter()
            .map(|n| ModelTensorMetadataDto { name: n.clone() })
            .collect(),
        outputs: inner
            .attrs
            .output_tensors
            .iter()
            .map(|n| ModelTensorMetadataDto { name: n.clone() })
            .collect(),
    })
}

async fn model_ready() -> StatusCode {
    StatusCode::OK
}

async fn infer(
    State(inner): State<Arc<Inner>>,
    Path(name): Path<String>,
    Json(req): Json<InferRequestDto>,
) -> axum::response::Response {
    let inputs: Result<Vec<Tensor>, _> = req.inputs.into_iter().map(Tensor::from_dto).collect();
    let inputs = match inputs {
        Ok(t) => t,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    match inner.run_inference(inputs).await {
        Ok(outputs) => Json(InferResponseDto {
            model_name: name,
            model_version: inner.attrs.model_version.clone(),
            outputs: outputs.iter().map(Tensor::to_dto).collect(),
        })
        .into_response(),
        Err(e) => {
            warn!(trigger = %inner.core.id, %e, "openinference rest handler failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

fn rest_router(inner: Arc<Inner>) -> axum::Router {
    axum::Router::new()
        .route("/v2", get(server_metadata))
        .route("/v2/health/live", get(live))
        .route("/v2/health/ready", get(ready))
        .route("/v2/models/{name}", get(model_metadata))
        .route("/v2/models/{name}/ready", get(model_ready))
        .route("/v2/models/{name}/infer", post(infer))
        .with_state(inner)
}

// ---- gRPC surface ----

struct GrpcService {
    inner: Arc<Inner>,
}

#[async_trait]
impl GrpcInferenceService for GrpcService {
    async fn server_live(
        &self,
        _request: tonic::Request<pb::ServerLiveRequest>,
    ) -> Result<tonic::Response<pb::ServerLiveResponse>, tonic::Status> {
        Ok(tonic::Response::new(pb::ServerLiveResponse { live: true }))
    }

    async fn server_ready(
        &self,
        _request: tonic::Request<pb::ServerReadyRequest>,
    ) -> Result<tonic::Response<pb::ServerReadyResponse>, tonic::Status> {
        Ok(tonic::Response::new(pb::ServerReadyResponse {
            ready: self.inner.ready.load(Ordering::SeqCst),
        }))
    }

    async fn model_ready(
        &self,
        _request: tonic::Request<pb::ModelReadyRequest>,
    ) -> Result<tonic::Response<pb::ModelReadyResponse>, tonic::Status> {
        Ok(tonic::Response::new(pb::ModelReadyResponse { ready: true }))
    }

    async fn model_infer(
        &self,
        request: tonic::Request<pb::ModelInferRequest>,
    ) -> Result<tonic::Response<pb::ModelInferResponse>, tonic::Status> {
        let req = request.into_inner();
        let mut inputs = Vec::with_capacity(req.inputs.len());
        for t in req.inputs {
            let contents = t.contents.unwrap_or_default();
            let tensor = Tensor::from_proto(t.name, &t.datatype, t.shape, contents)
                .map_err(|e| tonic::Status::invalid_argument(e.to_string()))?;
            inputs.push(tensor);
        }
        let outputs = self
            .inner
            .run_inference(inputs)
            .await
            .map_err(|e| tonic::Status::internal(e.to_string()))?;
        let outputs = outputs
            .into_iter()
            .map(|t| {
                let contents = Some(t.to_proto_contents());
                pb::model_infer_response::InferOutputTensor {
                    name: t.name,
                    datatype: t.values.datatype().to_owned(),
                    shape: t.shape.clone(),
                    contents,
                }
            })
            .collect();
        Ok(tonic::Response::new(pb::ModelInferResponse {
            model_name: self.inner.attrs.model_name.clone(),
            model_version: self.inner.attrs.model_version.clone(),
            id: String::new(),
            outputs,
        }))
    }
}

#[async_trait]
impl Trigger for OpenInferenceTrigger {
    async fn start(&self, _checkpoint: fnmesh_trigger::Checkpoint) -> Result<(), TriggerError> {
        self.inner.core.set_status(TriggerStatus::Initializing);
        let mut tasks = self.tasks.lock().await;

        if self.inner.attrs.enable_rest {
            let addr: SocketAddr = ([0, 0, 0, 0], self.inner.attrs.rest_port).into();
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| TriggerError::Bind(e.to_string()))?;
            let app = rest_router(self.inner.clone());
            let cancellation = self.inner.core.cancellation.clone();
            tasks.push(tokio::spawn(async move {
                let _ = axum::serve(listener, app)
                    .with_graceful_shutdown(async move { cancellation.cancelled().await })
                    .await;
            }));
        }

        if self.inner.attrs.enable_grpc {
            let addr: SocketAddr = ([0, 0, 0, 0], self.inner.attrs.grpc_port).into();
            let service = GrpcInferenceServiceServer::new(GrpcService {
                inner: self.inner.clone(),
            });
            let cancellation = self.inner.core.cancellation.clone();
            tasks.push(tokio::spawn(async move {
                let result = Server::builder()
                    .add_service(service)
                    .serve_with_shutdown(addr, async move { cancellation.cancelled().await })
                    .await;
                if let Err(e) = result {
                    error!(%e, "openinference gRPC server exited with error");
                }
            }));
        }

        self.inner.ready.store(true, Ordering::SeqCst);
        self.inner.core.set_status(TriggerStatus::Ready);
        Ok(())
    }

    async fn stop(&self, force: bool) -> Result<fnmesh_trigger::Checkpoint, TriggerError> {
        self.inner.ready.store(false, Ordering::SeqCst);
        self.inner.core.cancellation.cancel();
        if !force {
            self.inner.core.drain(Duration::from_secs(10)).await;
        }
        let mut tasks = self.tasks.lock().await;
        if force {
            for task in tasks.drain(..) {
                task.abort();
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
        let attrs = OpenInferenceTriggerAttributes::parse(&ctx.config)
            .map_err(|e| TriggerError::Config(e.to_string()))?;
        let core = TriggerCore::new(ctx);
        Ok(Arc::new(OpenInferenceTrigger::new(core, attrs)) as Arc<dyn Trigger>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_dto_round_trips_fp32() {
        let tensor = Tensor {
            name: "x".into(),
            shape: vec![1, 3],
            values: TensorValues::Fp32(vec![1.0, 2.5, -3.0]),
        };
        let dto = tensor.to_dto();
        assert_eq!(dto.datatype, "FP32");
        let back = Tensor::from_dto(dto).unwrap();
        assert_eq!(back, tensor);
    }

    #[test]
    fn tensor_dto_round_trips_bytes_via_base64() {
        let tensor = Tensor {
            name: "raw".into(),
            shape: vec![2],
            values: TensorValues::Bytes(vec![vec![0, 1, 2], vec![255]]),
        };
        let dto = tensor.to_dto();
        assert_eq!(dto.datatype, "BYTES");
        let back = Tensor::from_dto(dto).unwrap();
        assert_eq!(back, tensor);
    }

    #[test]
    fn tensor_proto_round_trips_int64() {
        let tensor = Tensor {
            name: "ids".into(),
            shape: vec![3],
            values: TensorValues::Int64(vec![1, 2, 3]),
        };
        let contents = tensor.to_proto_contents();
        let back = Tensor::from_proto(tensor.name.clone(), "INT64", tensor.shape.clone(), contents).unwrap();
        assert_eq!(back, tensor);
    }

    #[test]
    fn unknown_datatype_is_rejected() {
        let dto = TensorDto {
            name: "x".into(),
            shape: vec![1],
            datatype: "COMPLEX128".into(),
            data: serde_json::json!([1]),
        };
        assert!(Tensor::from_dto(dto).is_err());
    }
}
