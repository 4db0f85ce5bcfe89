//! 通道层：控制台、HTTP API、Telegram 机器人
//!
//! 每个通道由一个 [`ChannelDescriptor`] 描述，编排器只看 `execution_constraint`，
//! 不看通道名称。

pub mod console;
pub mod http;
pub mod telegram;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::AgentError;

pub use console::ConsoleRunner;
pub use http::{create_router, HttpRunner, HttpState};
pub use telegram::{split_message, BotTransport, TelegramApi, TelegramRunner};

/// 通道种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Console,
    Http,
    Bot,
}

impl ChannelKind {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelKind::Console => "console",
            ChannelKind::Http => "http",
            ChannelKind::Bot => "bot",
        }
    }

    /// 机器人的轮询循环需要占用主执行上下文，其余通道可放到后台任务
    pub fn execution_constraint(&self) -> ExecutionConstraint {
        match self {
            ChannelKind::Bot => ExecutionConstraint::MainContext,
            ChannelKind::Console | ChannelKind::Http => ExecutionConstraint::Background,
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// 执行约束
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionConstraint {
    /// 可在派生的后台任务中运行
    Background,
    /// 必须在调用方任务上运行，其返回决定进程生命周期
    MainContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelDescriptor {
    pub kind: ChannelKind,
    pub execution_constraint: ExecutionConstraint,
    pub enabled: bool,
}

impl ChannelDescriptor {
    pub fn new(kind: ChannelKind, enabled: bool) -> Self {
        Self {
            kind,
            execution_constraint: kind.execution_constraint(),
            enabled,
        }
    }
}

/// 命令行选择的通道
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelSelection {
    pub console: bool,
    pub http: bool,
    pub bot: bool,
}

impl ChannelSelection {
    /// `--all` 打开全部；一个都没选时默认控制台
    pub fn from_flags(cli: bool, api: bool, telegram: bool, all: bool) -> Self {
        if all {
            return Self {
                console: true,
                http: true,
                bot: true,
            };
        }
        if !(cli || api || telegram) {
            return Self {
                console: true,
                ..Self::default()
            };
        }
        Self {
            console: cli,
            http: api,
            bot: telegram,
        }
    }
}

/// 按选择与配置生成描述符；请求了机器人但没有 token 时记录配置错误并禁用
pub fn build_descriptors(selection: ChannelSelection, cfg: &AppConfig) -> Vec<ChannelDescriptor> {
    let bot_enabled = if selection.bot && cfg.telegram_token().is_none() {
        tracing::error!(
            "{}",
            AgentError::Config("TELEGRAM_BOT_TOKEN environment variable not set.".to_string())
        );
        false
    } else {
        selection.bot
    };

    vec![
        ChannelDescriptor::new(ChannelKind::Console, selection.console),
        ChannelDescriptor::new(ChannelKind::Http, selection.http),
        ChannelDescriptor::new(ChannelKind::Bot, bot_enabled),
    ]
}

/// 通道运行器：消费自身并运行到结束或收到关闭信号
#[async_trait]
pub trait ChannelRunner: Send {
    fn kind(&self) -> ChannelKind;

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<(), AgentError>;
}
