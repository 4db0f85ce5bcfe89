//! 资源生命周期：引擎与记忆 / 存储的唯一实例
//!
//! 首次 acquire 时通过 ResourceFactory 构建 ResourceHandle，之后所有通道拿到同一个 Arc。
//! 构建过程由 OnceCell 串行化：并发的首批调用只会触发一次构建；构建失败时不发布任何句柄，
//! 下一次 acquire 会重新尝试。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::config::AppConfig;
use crate::core::AgentError;
use crate::engine::{AnalystEngine, Engine};
use crate::llm::create_llm_from_config;
use crate::memory::{LongTermMemory, SqliteLongTerm, SqliteStore};

/// 共享资源句柄：引擎 + 长期记忆 + 存储 + 会话 ID，发布后只读
pub struct ResourceHandle {
    pub engine: Arc<dyn Engine>,
    pub memory: Arc<dyn LongTermMemory>,
    pub storage: Arc<SqliteStore>,
    pub session_id: String,
}

impl std::fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("storage", &self.storage)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// 构建 ResourceHandle 的工厂
#[async_trait]
pub trait ResourceFactory: Send + Sync {
    async fn build(&self) -> Result<ResourceHandle, AgentError>;
}

/// 默认工厂：按配置打开 SQLite 存储、创建 LLM 客户端与分析引擎
pub struct DefaultResourceFactory {
    config: AppConfig,
}

impl DefaultResourceFactory {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ResourceFactory for DefaultResourceFactory {
    async fn build(&self) -> Result<ResourceHandle, AgentError> {
        let url = self.config.store.url.clone();
        tracing::info!("Connecting to store: {}", url);
        // rusqlite 打开文件是阻塞操作
        let storage = tokio::task::spawn_blocking(move || SqliteStore::open(&url))
            .await
            .map_err(|e| AgentError::Unhandled(format!("store open task failed: {}", e)))??;
        let storage = Arc::new(storage);

        let session_id = self.config.session.id.clone();
        let memory: Arc<dyn LongTermMemory> = Arc::new(SqliteLongTerm::new(storage.clone()));

        let llm = create_llm_from_config(&self.config);
        let engine = AnalystEngine::new(llm, memory.clone(), storage.clone())
            .with_history_runs(self.config.session.history_runs);

        Ok(ResourceHandle {
            engine: Arc::new(engine),
            memory,
            storage,
            session_id,
        })
    }
}

/// 生命周期管理器：持有唯一的 ResourceHandle
pub struct LifecycleManager {
    factory: Box<dyn ResourceFactory>,
    handle: OnceCell<Arc<ResourceHandle>>,
    /// 构建尝试次数（含失败）
    attempts: AtomicUsize,
}

impl LifecycleManager {
    pub fn new(factory: impl ResourceFactory + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            handle: OnceCell::new(),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn from_config(config: AppConfig) -> Self {
        Self::new(DefaultResourceFactory::new(config))
    }

    /// 获取共享句柄；首次调用时构建
    pub async fn acquire(&self) -> Result<Arc<ResourceHandle>, AgentError> {
        let handle = self
            .handle
            .get_or_try_init(|| async {
                let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::info!("Initializing shared engine resources (attempt {})", attempt);
                match self.factory.build().await {
                    Ok(h) => {
                        tracing::info!("Shared engine resources ready (session {})", h.session_id);
                        Ok(Arc::new(h))
                    }
                    Err(e) => {
                        tracing::error!("Failed to initialize engine resources: {}", e);
                        Err(e)
                    }
                }
            })
            .await?;
        Ok(Arc::clone(handle))
    }

    /// 不触发构建，仅查看是否已有句柄
    pub fn get(&self) -> Option<Arc<ResourceHandle>> {
        self.handle.get().cloned()
    }

    pub fn is_initialized(&self) -> bool {
        self.handle.initialized()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}
