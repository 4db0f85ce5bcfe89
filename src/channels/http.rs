//! HTTP API 通道（axum）
//!
//! - `GET /health`：存活检查
//! - `POST /run-task`：任务信封，失败写在响应体里，始终 200
//! - `POST /analyze`：简单查询，失败用 HTTP 状态码表达
//! - `POST /webhook`：记录请求头与请求体后确认收到

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::channels::{ChannelKind, ChannelRunner};
use crate::core::AgentError;
use crate::dispatch::{
    normalize, AnalyzeRequest, CanonicalResult, ChannelPayload, Dispatcher, TaskInput, TaskVariable,
};

/// 任务输出中回答的 MIME 类型
pub const RESPONSE_MIME_TYPE: &str = "text/markdown";

pub struct HttpState {
    pub dispatcher: Arc<Dispatcher>,
    pub started_at: Instant,
}

impl HttpState {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunTaskRequest {
    pub agent_id: String,
    pub task_id: String,
    pub inputs: TaskInput,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub allow_trace: Option<bool>,
    #[serde(default)]
    pub allow_retry: Option<bool>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub task_retry_id: Option<String>,
    /// 仅作提示，不会取消进行中的引擎调用
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub response_format: Option<String>,
    #[serde(default)]
    pub max_scan_size: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOutput {
    #[serde(default)]
    pub variables: HashMap<String, TaskVariable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTaskResponse {
    pub agent_id: String,
    pub task_id: String,
    pub trace_id: String,
    pub state: TaskState,
    pub outputs: TaskOutput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnalyzeResponse {
    pub response: String,
}

/// 调用方未给 trace_id 时生成 `trace_<unix 秒>`
pub fn trace_id_or_generate(trace_id: Option<&str>) -> String {
    match trace_id.filter(|t| !t.trim().is_empty()) {
        Some(t) => t.to_string(),
        None => {
            let now = chrono::Utc::now();
            let secs = now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1e6;
            format!("trace_{}", secs)
        }
    }
}

/// `/run-task` 的响应构造：失败写进响应体
pub fn task_response(request: &RunTaskRequest, result: Result<CanonicalResult, AgentError>) -> RunTaskResponse {
    let trace_id = trace_id_or_generate(request.trace_id.as_deref());
    match result {
        Ok(CanonicalResult::Success { text }) => {
            let mut variables = HashMap::new();
            variables.insert(
                "response".to_string(),
                TaskVariable::text(text, Some(RESPONSE_MIME_TYPE)),
            );
            RunTaskResponse {
                agent_id: request.agent_id.clone(),
                task_id: request.task_id.clone(),
                trace_id,
                state: TaskState::Completed,
                outputs: TaskOutput {
                    variables,
                    error: None,
                },
                error: None,
            }
        }
        Ok(CanonicalResult::Failure { error }) => failed_task(request, trace_id, error),
        Err(e) => failed_task(request, trace_id, e.to_string()),
    }
}

fn failed_task(request: &RunTaskRequest, trace_id: String, error: String) -> RunTaskResponse {
    tracing::error!("Error processing task request: {}", error);
    RunTaskResponse {
        agent_id: request.agent_id.clone(),
        task_id: request.task_id.clone(),
        trace_id,
        state: TaskState::Failed,
        outputs: TaskOutput::default(),
        error: Some(error),
    }
}

/// `/analyze` 的响应构造：归一化错误 400，引擎失败 500
pub fn analyze_response(
    result: Result<CanonicalResult, AgentError>,
) -> Result<Json<AnalyzeResponse>, (StatusCode, Json<serde_json::Value>)> {
    match result {
        Ok(CanonicalResult::Success { text }) => Ok(Json(AnalyzeResponse { response: text })),
        Ok(CanonicalResult::Failure { error }) => {
            tracing::error!("Error processing API request: {}", error);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "detail": format!("Error processing request: {}", error) })),
            ))
        }
        Err(e) => Err((StatusCode::BAD_REQUEST, Json(json!({ "detail": e.to_string() })))),
    }
}

async fn health(State(state): State<Arc<HttpState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs_f64(),
    })
}

/// 请求体无法解析为任务信封时，仍返回任务形状的失败响应（尽量带回 agent_id / task_id / trace_id）
fn rejected_task(body: &[u8], err: serde_json::Error) -> RunTaskResponse {
    let raw: serde_json::Value = serde_json::from_slice(body).unwrap_or_default();
    let field = |key: &str| raw.get(key).and_then(|v| v.as_str()).map(str::to_string);
    let error = format!("Invalid task request: {}", err);
    tracing::warn!("{}", error);
    RunTaskResponse {
        agent_id: field("agent_id").unwrap_or_default(),
        task_id: field("task_id").unwrap_or_default(),
        trace_id: trace_id_or_generate(field("trace_id").as_deref()),
        state: TaskState::Failed,
        outputs: TaskOutput::default(),
        error: Some(error),
    }
}

async fn run_task(State(state): State<Arc<HttpState>>, body: Bytes) -> Json<RunTaskResponse> {
    let req: RunTaskRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => return Json(rejected_task(&body, e)),
    };
    tracing::info!(
        "Received task request for agent: {}, task: {}",
        req.agent_id,
        req.task_id
    );
    if let Some(ms) = req.timeout_ms {
        tracing::debug!("run-task timeout hint: {}ms", ms);
    }
    let result = state
        .dispatcher
        .dispatch_payload(
            "http",
            ChannelPayload::Task {
                inputs: &req.inputs,
                conversation_id: req.conversation_id.as_deref(),
            },
        )
        .await;
    Json(task_response(&req, result))
}

async fn analyze(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<AnalyzeRequest>,
) -> Result<Json<AnalyzeResponse>, (StatusCode, Json<serde_json::Value>)> {
    let result = match normalize(ChannelPayload::Analyze(&req)) {
        Ok(request) => Ok(state.dispatcher.dispatch("http", request).await),
        Err(e) => Err(e),
    };
    analyze_response(result)
}

async fn webhook(headers: HeaderMap, body: Bytes) -> Json<serde_json::Value> {
    let headers: HashMap<&str, &str> = headers
        .iter()
        .map(|(k, v)| (k.as_str(), v.to_str().unwrap_or("<binary>")))
        .collect();
    tracing::info!("Received webhook with headers: {:?}", headers);
    tracing::info!("Received webhook payload: {}", String::from_utf8_lossy(&body));
    Json(json!({ "status": "received" }))
}

pub fn create_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/run-task", post(run_task))
        .route("/analyze", post(analyze))
        .route("/webhook", post(webhook))
        .with_state(state)
}

pub struct HttpRunner {
    dispatcher: Arc<Dispatcher>,
    host: String,
    port: u16,
}

impl HttpRunner {
    pub fn new(dispatcher: Arc<Dispatcher>, host: impl Into<String>, port: u16) -> Self {
        Self {
            dispatcher,
            host: host.into(),
            port,
        }
    }

    /// 绑定监听地址；host 可以是主机名、IPv4 或 IPv6 字面量
    pub async fn bind(&self) -> Result<tokio::net::TcpListener, AgentError> {
        let listener = tokio::net::TcpListener::bind((self.host.as_str(), self.port))
            .await
            .map_err(|e| {
                tracing::error!("Failed to bind API server to {}:{}: {}", self.host, self.port, e);
                e
            })?;
        Ok(listener)
    }
}

#[async_trait]
impl ChannelRunner for HttpRunner {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Http
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<(), AgentError> {
        let listener = self.bind().await?;
        tracing::info!("Starting API server on {}", listener.local_addr()?);
        let app = create_router(Arc::new(HttpState::new(self.dispatcher.clone())));
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        tracing::info!("API server stopped");
        Ok(())
    }
}
