//! 请求归一化：把各通道的原生请求转换为 CanonicalRequest
//!
//! 支持三种形态：简单的 `{query, repository?}`、携带命名变量的任务信封，以及控制台 / 机器人的纯文本。
//! 仓库上下文以 `"<repository>: <query>"` 的形式前置到查询中。缺少 query 属于归一化错误，
//! 在调用引擎之前就报告给调用方。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::AgentError;

/// 规范化后的请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRequest {
    /// 发送给引擎的完整查询（已带仓库前缀）
    pub query: String,
    pub repository_context: Option<String>,
    /// 调用方标识（机器人 chat id、HTTP conversation_id），仅在启用按调用方分会话时使用
    pub caller_id: Option<String>,
}

impl CanonicalRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            repository_context: None,
            caller_id: None,
        }
    }

    pub fn with_caller(mut self, caller_id: Option<String>) -> Self {
        self.caller_id = caller_id.filter(|c| !c.trim().is_empty());
        self
    }
}

/// `/analyze` 的请求体
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnalyzeRequest {
    pub query: String,
    #[serde(default)]
    pub repository: Option<String>,
}

/// 任务变量：值可以是字符串、对象或对象列表
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskVariable {
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl TaskVariable {
    pub fn text(value: impl Into<String>, mime_type: Option<&str>) -> Self {
        Self {
            value: serde_json::Value::String(value.into()),
            mime_type: mime_type.map(String::from),
            name: None,
        }
    }

    /// 变量值的文本形式：字符串原样返回，其他 JSON 值序列化为紧凑文本
    pub fn value_text(&self) -> String {
        match &self.value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// 任务输入：name -> 变量
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TaskInput {
    #[serde(default)]
    pub variables: HashMap<String, TaskVariable>,
}

/// 各通道的原生请求
#[derive(Debug, Clone)]
pub enum ChannelPayload<'a> {
    Analyze(&'a AnalyzeRequest),
    Task {
        inputs: &'a TaskInput,
        conversation_id: Option<&'a str>,
    },
    Text {
        text: &'a str,
        caller_id: Option<&'a str>,
    },
}

/// 把仓库上下文前置到查询：`"<repository>: <query>"`
pub fn with_repository_prefix(query: &str, repository: Option<&str>) -> String {
    match repository {
        Some(repo) => format!("{}: {}", repo, query),
        None => query.to_string(),
    }
}

fn non_blank(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// 归一化（纯函数，无副作用）
pub fn normalize(payload: ChannelPayload<'_>) -> Result<CanonicalRequest, AgentError> {
    let (query, repository, caller_id) = match payload {
        ChannelPayload::Analyze(req) => (
            non_blank(Some(req.query.clone())),
            non_blank(req.repository.clone()),
            None,
        ),
        ChannelPayload::Task {
            inputs,
            conversation_id,
        } => {
            let query = non_blank(inputs.variables.get("query").map(TaskVariable::value_text));
            let repository =
                non_blank(inputs.variables.get("repository").map(TaskVariable::value_text));
            if query.is_none() {
                return Err(AgentError::Normalization(
                    "Missing 'query' variable in inputs".to_string(),
                ));
            }
            (query, repository, conversation_id.map(String::from))
        }
        ChannelPayload::Text { text, caller_id } => (
            non_blank(Some(text.to_string())),
            None,
            caller_id.map(String::from),
        ),
    };

    let query = query.ok_or_else(|| AgentError::Normalization("query must not be empty".to_string()))?;

    Ok(CanonicalRequest {
        query: with_repository_prefix(&query, repository.as_deref()),
        repository_context: repository,
        caller_id: None,
    }
    .with_caller(caller_id))
}
