//! Telegram 机器人通道
//!
//! 通过 Bot API 长轮询 getUpdates。`/start` 回复固定问候，其他命令忽略，普通文本作为查询。
//! 每条查询在独立任务中处理，轮询循环不会被单次查询阻塞；回复按 4096 字符分段顺序发送。
//! getUpdates 返回 409 表示另一实例在轮询同一 token，此时整个进程退出。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::channels::{ChannelKind, ChannelRunner};
use crate::config::AppConfig;
use crate::core::AgentError;
use crate::dispatch::{CanonicalResult, ChannelPayload, Dispatcher};

/// Telegram 单条消息长度上限（字符）
pub const MAX_MESSAGE_LEN: usize = 4096;
pub const GREETING: &str =
    "Hello! I am the GitHub Repo Analyzer bot. Ask me anything about GitHub repositories!";
pub const ERROR_REPLY: &str = "Sorry, an error occurred while processing your request.";

/// 按字符切分为有序分段，每段至多 `max_len` 个字符；空文本得到一个空分段
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    if text.chars().count() <= max_len {
        return vec![text.to_string()];
    }
    text.chars()
        .collect::<Vec<_>>()
        .chunks(max_len)
        .map(|c| c.iter().collect())
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<BotMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotMessage {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
struct BotUser {
    #[serde(default)]
    username: Option<String>,
}

/// Bot API 的统一响应外壳
#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// HTTP 409：另一实例正在轮询
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// 机器人传输层
#[async_trait]
pub trait BotTransport: Send + Sync {
    /// 校验 token，返回机器人用户名
    async fn get_me(&self) -> Result<String, TransportError>;

    async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_secs: u64,
    ) -> Result<Vec<Update>, TransportError>;

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), TransportError>;

    async fn send_chat_action(&self, chat_id: i64, action: &str) -> Result<(), TransportError>;
}

/// 基于 reqwest 的 Bot API 客户端
pub struct TelegramApi {
    client: reqwest::Client,
    endpoint: String,
}

impl TelegramApi {
    pub fn new(api_base: &str, token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}/bot{}", api_base.trim_end_matches('/'), token),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
        timeout: Duration,
    ) -> Result<T, TransportError> {
        let url = format!("{}/{}", self.endpoint, method);
        // 错误信息中去掉 URL，避免 token 进入日志
        let resp = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.without_url())
            .with_context(|| format!("Telegram {} request failed", method))?;

        let status = resp.status();
        if status == reqwest::StatusCode::CONFLICT {
            let text = resp.text().await.unwrap_or_default();
            return Err(TransportError::Conflict(text));
        }
        if status == reqwest::StatusCode::UNAUTHORIZED {
            let text = resp.text().await.unwrap_or_default();
            return Err(TransportError::Unauthorized(text));
        }

        let envelope: ApiEnvelope<T> = resp
            .json()
            .await
            .map_err(|e| e.without_url())
            .with_context(|| format!("Telegram {} returned invalid JSON (HTTP {})", method, status))?;
        if !envelope.ok {
            return Err(anyhow::anyhow!(
                "Telegram {} failed: {}",
                method,
                envelope.description.unwrap_or_else(|| status.to_string())
            )
            .into());
        }
        envelope
            .result
            .ok_or_else(|| anyhow::anyhow!("Telegram {} returned no result", method).into())
    }
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
impl BotTransport for TelegramApi {
    async fn get_me(&self) -> Result<String, TransportError> {
        let me: BotUser = self.call("getMe", json!({}), REQUEST_TIMEOUT).await?;
        Ok(me.username.unwrap_or_default())
    }

    async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_secs: u64,
    ) -> Result<Vec<Update>, TransportError> {
        let mut body = json!({ "timeout": timeout_secs, "allowed_updates": ["message"] });
        if let Some(offset) = offset {
            body["offset"] = json!(offset);
        }
        // 长轮询：HTTP 超时需长于服务端等待时间
        let timeout = Duration::from_secs(timeout_secs) + Duration::from_secs(10);
        self.call("getUpdates", body, timeout).await
    }

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), TransportError> {
        let _: serde_json::Value = self
            .call(
                "sendMessage",
                json!({ "chat_id": chat_id, "text": text }),
                REQUEST_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    async fn send_chat_action(&self, chat_id: i64, action: &str) -> Result<(), TransportError> {
        let _: serde_json::Value = self
            .call(
                "sendChatAction",
                json!({ "chat_id": chat_id, "action": action }),
                REQUEST_TIMEOUT,
            )
            .await?;
        Ok(())
    }
}

/// 收到的一条消息归类
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotEvent {
    Start,
    /// 其他 `/command`，不处理
    Command(String),
    Query(String),
    /// 无文本（贴纸、图片等）
    Empty,
}

pub fn classify(text: Option<&str>) -> BotEvent {
    let Some(text) = text.map(str::trim).filter(|t| !t.is_empty()) else {
        return BotEvent::Empty;
    };
    if let Some(rest) = text.strip_prefix('/') {
        let command = rest
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .split('@')
            .next()
            .unwrap_or_default();
        if command == "start" {
            return BotEvent::Start;
        }
        return BotEvent::Command(command.to_string());
    }
    BotEvent::Query(text.to_string())
}

/// 配置的重试间隔下限
pub const MIN_RETRY_BACKOFF: Duration = Duration::from_secs(1);

pub struct TelegramRunner {
    transport: Arc<dyn BotTransport>,
    dispatcher: Arc<Dispatcher>,
    poll_timeout_secs: u64,
    retry_backoff: Duration,
}

impl TelegramRunner {
    pub fn new(transport: Arc<dyn BotTransport>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            transport,
            dispatcher,
            poll_timeout_secs: 30,
            retry_backoff: Duration::from_secs(5),
        }
    }

    /// 由配置创建真实 Bot API 客户端；缺少 token 为配置错误
    pub fn from_config(dispatcher: Arc<Dispatcher>, cfg: &AppConfig) -> Result<Self, AgentError> {
        let token = cfg.telegram_token().ok_or_else(|| {
            AgentError::Config("TELEGRAM_BOT_TOKEN environment variable not set.".to_string())
        })?;
        let api = TelegramApi::new(&cfg.telegram.api_base, token);
        Ok(Self::new(Arc::new(api), dispatcher)
            .with_poll_timeout(cfg.telegram.poll_timeout_secs)
            .with_retry_backoff(
                Duration::from_secs(cfg.telegram.retry_backoff_secs).max(MIN_RETRY_BACKOFF),
            ))
    }

    pub fn with_poll_timeout(mut self, secs: u64) -> Self {
        self.poll_timeout_secs = secs;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    async fn poll_loop(&self, shutdown: &CancellationToken) -> Result<(), AgentError> {
        let me = self.transport.get_me().await.map_err(|e| {
            AgentError::Config(format!("Telegram bot token rejected (getMe failed): {}", e))
        })?;
        tracing::info!("Starting Telegram bot @{}", me);

        let mut offset: Option<i64> = None;
        let mut handlers = JoinSet::new();
        let result = loop {
            // 回收已完成的处理任务
            while let Some(Some(joined)) = handlers.join_next().now_or_never() {
                if let Err(e) = joined {
                    tracing::error!("Telegram message handler aborted: {}", e);
                }
            }
            if shutdown.is_cancelled() {
                break Ok(());
            }

            let polled = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                polled = self.transport.get_updates(offset, self.poll_timeout_secs) => polled,
            };

            match polled {
                Ok(updates) => {
                    for update in updates {
                        offset = Some(update.update_id + 1);
                        let Some(message) = update.message else {
                            continue;
                        };
                        let transport = Arc::clone(&self.transport);
                        let dispatcher = Arc::clone(&self.dispatcher);
                        handlers.spawn(async move {
                            handle_message(transport.as_ref(), &dispatcher, message).await;
                        });
                    }
                }
                Err(TransportError::Conflict(detail)) => {
                    tracing::error!("Telegram conflict error: Another instance is already running!");
                    break Err(AgentError::TransportConflict(detail));
                }
                Err(TransportError::Unauthorized(detail)) => {
                    break Err(AgentError::Config(format!(
                        "Telegram bot token rejected: {}",
                        detail
                    )));
                }
                Err(TransportError::Other(e)) => {
                    tracing::warn!(
                        "Telegram polling error: {:#}, retrying in {:?}",
                        e,
                        self.retry_backoff
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break Ok(()),
                        _ = tokio::time::sleep(self.retry_backoff) => {}
                    }
                }
            }
        };

        // 让进行中的回复发送完
        while let Some(joined) = handlers.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Telegram message handler aborted: {}", e);
            }
        }
        result
    }
}

async fn handle_message(transport: &dyn BotTransport, dispatcher: &Dispatcher, message: BotMessage) {
    let chat_id = message.chat.id;
    match classify(message.text.as_deref()) {
        BotEvent::Start => {
            if let Err(e) = transport.send_message(chat_id, GREETING).await {
                tracing::error!("Telegram send failed for chat {}: {}", chat_id, e);
            }
        }
        BotEvent::Command(cmd) => tracing::debug!("Ignoring Telegram command /{}", cmd),
        BotEvent::Empty => {}
        BotEvent::Query(text) => {
            if let Err(e) = transport.send_chat_action(chat_id, "typing").await {
                tracing::debug!("Telegram typing action failed: {}", e);
            }
            let caller = chat_id.to_string();
            let outcome = dispatcher
                .dispatch_payload(
                    "bot",
                    ChannelPayload::Text {
                        text: &text,
                        caller_id: Some(&caller),
                    },
                )
                .await;
            let chunks = match outcome {
                Ok(CanonicalResult::Success { text }) => split_message(&text, MAX_MESSAGE_LEN),
                Ok(CanonicalResult::Failure { error }) => {
                    tracing::error!("Error handling message: {}", error);
                    vec![ERROR_REPLY.to_string()]
                }
                Err(e) => {
                    tracing::error!("Error handling message: {}", e);
                    vec![ERROR_REPLY.to_string()]
                }
            };
            for chunk in chunks {
                if let Err(e) = transport.send_message(chat_id, &chunk).await {
                    tracing::error!("Telegram send failed for chat {}: {}", chat_id, e);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ChannelRunner for TelegramRunner {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Bot
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<(), AgentError> {
        self.poll_loop(&shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{stub_dispatch, Behavior};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// 按脚本返回 getUpdates 结果；脚本耗尽后触发关闭
    struct FakeTransport {
        me: Mutex<Option<TransportError>>,
        polls: Mutex<VecDeque<Result<Vec<Update>, TransportError>>>,
        offsets: Mutex<Vec<Option<i64>>>,
        sent: Mutex<Vec<(i64, String)>>,
        actions: Mutex<Vec<(i64, String)>>,
        shutdown: CancellationToken,
    }

    impl FakeTransport {
        fn new(polls: Vec<Result<Vec<Update>, TransportError>>, shutdown: CancellationToken) -> Self {
            Self {
                me: Mutex::new(None),
                polls: Mutex::new(polls.into()),
                offsets: Mutex::new(Vec::new()),
                sent: Mutex::new(Vec::new()),
                actions: Mutex::new(Vec::new()),
                shutdown,
            }
        }

        fn sent_to(&self, chat_id: i64) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _)| *id == chat_id)
                .map(|(_, t)| t.clone())
                .collect()
        }
    }

    #[async_trait]
    impl BotTransport for FakeTransport {
        async fn get_me(&self) -> Result<String, TransportError> {
            match self.me.lock().unwrap().take() {
                Some(err) => Err(err),
                None => Ok("oss_boss_bot".into()),
            }
        }

        async fn get_updates(
            &self,
            offset: Option<i64>,
            _timeout_secs: u64,
        ) -> Result<Vec<Update>, TransportError> {
            self.offsets.lock().unwrap().push(offset);
            let next = self.polls.lock().unwrap().pop_front();
            match next {
                Some(result) => result,
                None => {
                    self.shutdown.cancel();
                    Ok(Vec::new())
                }
            }
        }

        async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push((chat_id, text.to_string()));
            Ok(())
        }

        async fn send_chat_action(&self, chat_id: i64, action: &str) -> Result<(), TransportError> {
            self.actions.lock().unwrap().push((chat_id, action.to_string()));
            Ok(())
        }
    }

    fn update(update_id: i64, chat_id: i64, text: &str) -> Update {
        Update {
            update_id,
            message: Some(BotMessage {
                message_id: update_id,
                chat: Chat { id: chat_id },
                text: Some(text.to_string()),
            }),
        }
    }

    async fn run_bot(
        behavior: Behavior,
        polls: Vec<Result<Vec<Update>, TransportError>>,
    ) -> (Arc<FakeTransport>, Result<(), AgentError>) {
        let token = CancellationToken::new();
        let transport = Arc::new(FakeTransport::new(polls, token.clone()));
        let stub = stub_dispatch(behavior);
        let runner = TelegramRunner::new(transport.clone(), Arc::new(stub.dispatcher))
            .with_retry_backoff(Duration::from_millis(1));
        let result = Box::new(runner).run(token).await;
        (transport, result)
    }

    #[test]
    fn test_split_message_boundaries() {
        assert_eq!(split_message("", MAX_MESSAGE_LEN), vec![String::new()]);
        assert_eq!(split_message(&"a".repeat(4096), MAX_MESSAGE_LEN).len(), 1);
        let chunks = split_message(&"a".repeat(4097), MAX_MESSAGE_LEN);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1], "a");
    }

    #[test]
    fn test_split_message_counts_characters_not_bytes() {
        let text = "仓库".repeat(3000);
        let chunks = split_message(&text, MAX_MESSAGE_LEN);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.chars().count() <= MAX_MESSAGE_LEN));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(Some("/start")), BotEvent::Start);
        assert_eq!(classify(Some("/start@oss_boss_bot hi")), BotEvent::Start);
        assert_eq!(classify(Some("/help")), BotEvent::Command("help".into()));
        assert_eq!(classify(Some(" o/r: stars ")), BotEvent::Query("o/r: stars".into()));
        assert_eq!(classify(Some("  ")), BotEvent::Empty);
        assert_eq!(classify(None), BotEvent::Empty);
    }

    #[tokio::test]
    async fn test_start_command_and_query() {
        let (transport, result) = run_bot(
            Behavior::Text,
            vec![
                Ok(vec![update(10, 1, "/start"), update(11, 2, "/help")]),
                Ok(vec![update(12, 3, "o/r: open issues")]),
            ],
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(transport.sent_to(1), vec![GREETING.to_string()]);
        assert!(transport.sent_to(2).is_empty());
        assert_eq!(transport.sent_to(3), vec!["text:o/r: open issues".to_string()]);
        assert_eq!(
            transport.actions.lock().unwrap().clone(),
            vec![(3, "typing".to_string())]
        );
        let offsets = transport.offsets.lock().unwrap().clone();
        assert_eq!(&offsets[..3], &[None, Some(12), Some(13)]);
    }

    #[tokio::test]
    async fn test_long_reply_is_chunked_in_order() {
        let (transport, result) =
            run_bot(Behavior::Sized(10_000), vec![Ok(vec![update(1, 7, "big")])]).await;
        assert!(result.is_ok());
        let sent = transport.sent_to(7);
        assert_eq!(sent.len(), 3);
        assert_eq!(
            sent.iter().map(|c| c.chars().count()).collect::<Vec<_>>(),
            vec![4096, 4096, 1808]
        );
        assert_eq!(sent.concat(), "x".repeat(10_000));
    }

    #[tokio::test]
    async fn test_dispatch_failure_sends_generic_reply() {
        let (transport, result) =
            run_bot(Behavior::Fail, vec![Ok(vec![update(1, 5, "q")])]).await;
        assert!(result.is_ok());
        assert_eq!(transport.sent_to(5), vec![ERROR_REPLY.to_string()]);
    }

    #[tokio::test]
    async fn test_conflict_is_transport_conflict() {
        let (_, result) = run_bot(
            Behavior::Text,
            vec![Err(TransportError::Conflict("terminated by other getUpdates request".into()))],
        )
        .await;
        let err = result.unwrap_err();
        assert!(matches!(err, AgentError::TransportConflict(_)));
        assert!(err.is_fatal_to_process());
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let (transport, result) = run_bot(
            Behavior::Text,
            vec![
                Err(TransportError::Other(anyhow::anyhow!("connection reset"))),
                Ok(vec![update(3, 9, "after retry")]),
            ],
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(transport.sent_to(9), vec!["text:after retry".to_string()]);
    }

    #[tokio::test]
    async fn test_rejected_token_is_config_error() {
        let token = CancellationToken::new();
        let transport = Arc::new(FakeTransport::new(Vec::new(), token.clone()));
        *transport.me.lock().unwrap() = Some(TransportError::Unauthorized("Unauthorized".into()));
        let stub = stub_dispatch(Behavior::Text);
        let runner = TelegramRunner::new(transport.clone(), Arc::new(stub.dispatcher));
        let err = Box::new(runner).run(token).await.unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
        assert!(!err.is_fatal_to_process());
        assert!(transport.offsets.lock().unwrap().is_empty());
    }

    #[test]
    fn test_from_config_requires_token() {
        let stub = stub_dispatch(Behavior::Text);
        let dispatcher = Arc::new(stub.dispatcher);
        let mut cfg = AppConfig::default();
        cfg.telegram.token = None;
        assert!(matches!(
            TelegramRunner::from_config(dispatcher.clone(), &cfg),
            Err(AgentError::Config(_))
        ));
        cfg.telegram.token = Some("123:abc".into());
        assert!(TelegramRunner::from_config(dispatcher, &cfg).is_ok());
    }

    #[test]
    fn test_zero_backoff_from_config_is_clamped() {
        let stub = stub_dispatch(Behavior::Text);
        let mut cfg = AppConfig::default();
        cfg.telegram.token = Some("123:abc".into());
        cfg.telegram.retry_backoff_secs = 0;
        let runner = TelegramRunner::from_config(Arc::new(stub.dispatcher), &cfg).unwrap();
        assert_eq!(runner.retry_backoff, MIN_RETRY_BACKOFF);

        cfg.telegram.retry_backoff_secs = 7;
        let stub = stub_dispatch(Behavior::Text);
        let runner = TelegramRunner::from_config(Arc::new(stub.dispatcher), &cfg).unwrap();
        assert_eq!(runner.retry_backoff, Duration::from_secs(7));
    }
}
