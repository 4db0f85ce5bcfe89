//! 引擎：回答规范化查询的推理协作方
//!
//! 引擎可能返回纯文本，也可能返回带元数据的运行结果；两种形态都只在 Dispatcher 处
//! 被转换成 `CanonicalResult`，下游不会看到 EngineResponse。

pub mod analyst;

use async_trait::async_trait;

use crate::core::AgentError;

pub use analyst::{AnalystEngine, DEFAULT_INSTRUCTIONS};

/// 引擎 trait：同一实例被所有通道共享，需自行保证并发安全
#[async_trait]
pub trait Engine: Send + Sync {
    async fn run(&self, session_id: &str, query: &str) -> Result<EngineResponse, AgentError>;
}

/// 引擎原始返回
#[derive(Debug, Clone)]
pub enum EngineResponse {
    Text(String),
    Run(RunResponse),
}

/// 一次运行的结构化结果
#[derive(Debug, Clone, Default)]
pub struct RunResponse {
    pub content: Option<String>,
    pub model: String,
    pub run_id: Option<String>,
}

impl RunResponse {
    /// 以纯文本形式输出内容；没有内容时为空串
    pub fn content_as_string(&self) -> String {
        self.content.clone().unwrap_or_default()
    }
}

impl EngineResponse {
    pub fn into_text(self) -> String {
        match self {
            EngineResponse::Text(text) => text,
            EngineResponse::Run(run) => run.content_as_string(),
        }
    }
}
