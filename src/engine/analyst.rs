//! 仓库分析引擎
//!
//! 组装上下文（固定指令 + 相关长期记忆 + 会话最近 N 次运行）后调用 LLM，
//! 并把本次问答写回存储与长期记忆。仓库 / NPM 查询工具由外部协作方提供，不在此实现。

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::AgentError;
use crate::engine::{Engine, EngineResponse, RunResponse};
use crate::llm::LlmClient;
use crate::memory::{ConversationMemory, LongTermMemory, Message, SqliteStore};

/// 默认系统指令
pub const DEFAULT_INSTRUCTIONS: &[&str] = &[
    "Use your tools to answer questions about any GitHub repository.",
    "If the user question does not specify a repository in the format <owner>/<repo>, ask them to clarify.",
    "You can analyze contributors, repositories, issues, and more.",
    "Do not create any issues or pull requests unless explicitly asked to do so.",
    "You can also search for NPM packages and their information.",
    "Please liven up the response with emojis and other visual elements.",
    "Format your answer as Markdown.",
];

pub struct AnalystEngine {
    llm: Arc<dyn LlmClient>,
    memory: Arc<dyn LongTermMemory>,
    storage: Arc<SqliteStore>,
    instructions: Vec<String>,
    history_runs: usize,
    memory_hits: usize,
}

impl AnalystEngine {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        memory: Arc<dyn LongTermMemory>,
        storage: Arc<SqliteStore>,
    ) -> Self {
        Self {
            llm,
            memory,
            storage,
            instructions: DEFAULT_INSTRUCTIONS.iter().map(|s| s.to_string()).collect(),
            history_runs: 3,
            memory_hits: 3,
        }
    }

    pub fn with_history_runs(mut self, n: usize) -> Self {
        self.history_runs = n;
        self
    }

    pub fn with_instructions(mut self, instructions: Vec<String>) -> Self {
        self.instructions = instructions;
        self
    }

    fn system_prompt(&self, memories: &[String]) -> String {
        let mut prompt = self
            .instructions
            .iter()
            .map(|i| format!("- {}", i))
            .collect::<Vec<_>>()
            .join("\n");
        if !memories.is_empty() {
            prompt.push_str("\n\nThings you remember about this user:\n");
            for m in memories {
                prompt.push_str("- ");
                prompt.push_str(m);
                prompt.push('\n');
            }
        }
        prompt
    }

    /// 组装发送给 LLM 的消息列表
    fn build_messages(&self, session_id: &str, query: &str) -> Result<Vec<Message>, AgentError> {
        let runs = self.storage.recent_runs(session_id, self.history_runs)?;
        let history = ConversationMemory::from_runs(&runs, self.history_runs);
        let memories = self.memory.search(session_id, query, self.memory_hits);

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(Message::system(self.system_prompt(&memories)));
        messages.extend(history.messages().iter().cloned());
        messages.push(Message::user(query));
        Ok(messages)
    }
}

#[async_trait]
impl Engine for AnalystEngine {
    async fn run(&self, session_id: &str, query: &str) -> Result<EngineResponse, AgentError> {
        let messages = self.build_messages(session_id, query)?;
        tracing::debug!(
            session_id,
            context_messages = messages.len(),
            "Running analyst engine"
        );

        let content = self.llm.complete(&messages).await.map_err(AgentError::Llm)?;

        let run = self.storage.append_run(session_id, query, &content)?;
        self.memory.add(session_id, query);

        Ok(EngineResponse::Run(RunResponse {
            content: Some(content),
            model: self.llm.model_name().to_string(),
            run_id: Some(run.run_id),
        }))
    }
}
