//! Dispatcher：调用共享引擎并把结果统一为 CanonicalResult
//!
//! 这里是引擎侧故障隔离的唯一边界：引擎返回的错误和引擎调用中的 panic 都在此转换为
//! `CanonicalResult::Failure`，不会以 panic / Err 的形式到达通道。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde::Serialize;
use tracing::Instrument;

use crate::core::{AgentError, LifecycleManager, ResourceHandle};
use crate::dispatch::request::{normalize, CanonicalRequest, ChannelPayload};

/// 规范化结果：成功文本或失败描述，二者必居其一
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CanonicalResult {
    Success { text: String },
    Failure { error: String },
}

impl CanonicalResult {
    pub fn failure(error: impl std::fmt::Display) -> Self {
        CanonicalResult::Failure {
            error: error.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CanonicalResult::Success { .. })
    }
}

/// 从 panic 载荷中取出可读信息
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub struct Dispatcher {
    lifecycle: Arc<LifecycleManager>,
    /// 为 true 时按调用方拆分会话；默认所有通道共用一个会话
    per_caller_sessions: bool,
}

impl Dispatcher {
    pub fn new(lifecycle: Arc<LifecycleManager>) -> Self {
        Self {
            lifecycle,
            per_caller_sessions: false,
        }
    }

    pub fn with_per_caller_sessions(mut self, enabled: bool) -> Self {
        self.per_caller_sessions = enabled;
        self
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    fn session_for(&self, handle: &ResourceHandle, request: &CanonicalRequest) -> String {
        match (&request.caller_id, self.per_caller_sessions) {
            (Some(caller), true) => format!("{}:{}", handle.session_id, caller),
            _ => handle.session_id.clone(),
        }
    }

    /// 归一化后分发；归一化失败以 Err 返回，此时引擎不会被调用
    pub async fn dispatch_payload(
        &self,
        channel: &'static str,
        payload: ChannelPayload<'_>,
    ) -> Result<CanonicalResult, AgentError> {
        let request = normalize(payload)?;
        Ok(self.dispatch(channel, request).await)
    }

    /// 分发一个规范化请求
    pub async fn dispatch(&self, channel: &'static str, request: CanonicalRequest) -> CanonicalResult {
        let span = tracing::info_span!("dispatch", channel, caller = ?request.caller_id);
        self.dispatch_inner(request).instrument(span).await
    }

    async fn dispatch_inner(&self, request: CanonicalRequest) -> CanonicalResult {
        if request.query.trim().is_empty() {
            return CanonicalResult::failure(AgentError::Normalization(
                "query must not be empty".to_string(),
            ));
        }

        let handle = match self.lifecycle.acquire().await {
            Ok(h) => h,
            Err(e) => return CanonicalResult::failure(e),
        };
        let session_id = self.session_for(&handle, &request);
        tracing::debug!("Processing query: {}", request.query);

        let outcome = AssertUnwindSafe(handle.engine.run(&session_id, &request.query))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(response)) => CanonicalResult::Success {
                text: response.into_text(),
            },
            Ok(Err(e)) => {
                tracing::error!("Error in agent processing: {}", e);
                CanonicalResult::failure(e)
            }
            Err(panic) => {
                let err = AgentError::Unhandled(panic_message(panic.as_ref()));
                tracing::error!("Engine panicked: {}", err);
                CanonicalResult::failure(err)
            }
        }
    }
}
