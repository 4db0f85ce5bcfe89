//! 错误类型
//!
//! 各通道共享的错误分类：配置、请求归一化、引擎、存储、传输冲突与兜底故障。
//! 错误只以数据形式跨越通道边界（`CanonicalResult::Failure` 或 HTTP 错误体），
//! 唯一例外是 `TransportConflict`：出现时整个进程退出。

use thiserror::Error;

/// 运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 缺少必需的凭证或配置非法，仅影响所属通道
    #[error("Config error: {0}")]
    Config(String),

    /// 请求缺少必需字段，未调用引擎
    #[error("Normalization error: {0}")]
    Normalization(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// 独占资源被其他进程持有（目前只有 Telegram 轮询冲突）
    #[error("Transport conflict: {0}")]
    TransportConflict(String),

    /// 通道边界上捕获的意外故障（如 panic）
    #[error("Unhandled fault: {0}")]
    Unhandled(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// 是否需要终止整个进程
    pub fn is_fatal_to_process(&self) -> bool {
        matches!(self, AgentError::TransportConflict(_))
    }
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::Storage(e.to_string())
    }
}
