//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `OSSBOSS__*` 覆盖（双下划线表示嵌套，如 `OSSBOSS__HTTP__PORT=9000`），
//! 最后应用约定俗成的裸环境变量：`STORE_URL`、`TELEGRAM_BOT_TOKEN`、`API_HOST`、`API_PORT`。

use std::path::PathBuf;

use serde::Deserialize;

/// 未配置 STORE_URL 时使用的本地存储
pub const DEFAULT_STORE_URL: &str = "sqlite://workspace/ossboss.db";

/// 所有通道共用的会话 ID
pub const DEFAULT_SESSION_ID: &str = "github_repo_analysis";

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub store: StoreSection,
    pub session: SessionSection,
    pub http: HttpSection,
    pub telegram: TelegramSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppSection {
    /// 启动日志中显示的名称
    pub name: Option<String>,
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：openai / mock；为空时按 OPENAI_API_KEY 是否存在自动选择
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 单次请求超时（秒）
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: String::new(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            request_timeout_secs: 120,
        }
    }
}

/// [store] 段：会话历史与长期记忆的连接串
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// `sqlite://<path>`、`<path>` 或 `:memory:`
    pub url: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            url: DEFAULT_STORE_URL.to_string(),
        }
    }
}

/// [session] 段：会话 ID 与历史轮数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub id: String,
    /// 为 true 时，携带调用方标识的请求使用 `<id>:<caller>` 作为会话；默认所有通道共享一个会话
    pub per_caller: bool,
    /// 组装上下文时带上的最近运行数
    pub history_runs: usize,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            id: DEFAULT_SESSION_ID.to_string(),
            per_caller: false,
            history_runs: 3,
        }
    }
}

/// [http] 段：监听地址
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    pub host: String,
    pub port: u16,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

/// [telegram] 段：机器人令牌与轮询参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelegramSection {
    /// 缺失时 Telegram 通道不启动
    pub token: Option<String>,
    pub api_base: String,
    /// getUpdates 长轮询超时（秒）
    pub poll_timeout_secs: u64,
    /// 轮询出错后的等待时间（秒）
    pub retry_backoff_secs: u64,
}

impl Default for TelegramSection {
    fn default() -> Self {
        Self {
            token: None,
            api_base: "https://api.telegram.org".to_string(),
            poll_timeout_secs: 30,
            retry_backoff_secs: 5,
        }
    }
}

impl AppConfig {
    /// Telegram 令牌（空字符串视为未配置）
    pub fn telegram_token(&self) -> Option<&str> {
        self.telegram
            .token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

/// 从 config 目录加载配置，环境变量 OSSBOSS__* 与裸环境变量可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 则追加该文件（可覆盖前面的键），文件不存在时返回错误
/// 3. 叠加环境变量 OSSBOSS__*（双下划线表示嵌套键）
/// 4. 应用 STORE_URL / TELEGRAM_BOT_TOKEN / API_HOST / API_PORT
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        builder = builder.add_source(config::File::from(path.clone()).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("OSSBOSS")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    let mut cfg: AppConfig = c.try_deserialize()?;
    apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
    Ok(cfg)
}

/// 应用裸环境变量覆盖；`lookup` 便于测试时注入
pub fn apply_env_overrides<F>(cfg: &mut AppConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = lookup("STORE_URL").filter(|s| !s.trim().is_empty()) {
        cfg.store.url = url;
    }
    if let Some(token) = lookup("TELEGRAM_BOT_TOKEN") {
        cfg.telegram.token = Some(token);
    }
    if let Some(host) = lookup("API_HOST").filter(|s| !s.trim().is_empty()) {
        cfg.http.host = host;
    }
    if let Some(port) = lookup("API_PORT") {
        match port.trim().parse::<u16>() {
            Ok(p) => cfg.http.port = p,
            Err(_) => tracing::warn!("Ignoring invalid API_PORT value: {}", port),
        }
    }
}
