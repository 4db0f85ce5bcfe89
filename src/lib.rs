//! OSS Boss - GitHub 仓库 / NPM 包分析助手
//!
//! 同一个分析 Agent 通过三个通道对外服务，所有通道共享一个惰性构建的引擎实例与会话。
//!
//! 模块划分：
//! - **channels**: 控制台、HTTP API（axum）、Telegram 机器人
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、资源生命周期、关闭信号、进程编排
//! - **dispatch**: 请求归一化与分发
//! - **engine**: 分析引擎（LLM + 历史 + 长期记忆）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 对话消息、长期记忆、SQLite 存储

pub mod channels;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod engine;
pub mod llm;
pub mod memory;
pub mod observability;

#[cfg(test)]
mod testing;
