//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock）

pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;
use std::time::Duration;

pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::LlmClient;

use crate::config::AppConfig;

/// 根据配置与环境变量选择 LLM 后端（OpenAI 兼容 / Mock）
///
/// provider 为 `mock` 时强制 Mock；为 `openai` 或留空且存在 OPENAI_API_KEY 时走 OpenAI 兼容端点；
/// 其余情况退回 Mock 并告警。
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.trim().to_lowercase();
    let has_key = std::env::var("OPENAI_API_KEY").is_ok();

    let use_openai = match provider.as_str() {
        "mock" => false,
        "openai" => true,
        "" => has_key,
        other => {
            tracing::warn!("Unknown LLM provider '{}'", other);
            false
        }
    };

    if use_openai {
        if !has_key {
            tracing::warn!("OPENAI_API_KEY not set; requests to the LLM endpoint will likely fail");
        }
        tracing::info!("Using OpenAI-compatible LLM ({})", cfg.llm.model);
        Arc::new(
            OpenAiClient::new(cfg.llm.base_url.as_deref(), &cfg.llm.model, None)
                .with_timeout(Duration::from_secs(cfg.llm.request_timeout_secs)),
        )
    } else {
        tracing::warn!("No API key set or provider is mock, using Mock LLM");
        Arc::new(MockLlmClient)
    }
}
