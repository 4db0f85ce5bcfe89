//! 单元测试共用的桩：可控行为的引擎与对应的 Dispatcher

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::core::{AgentError, LifecycleManager, ResourceFactory, ResourceHandle};
use crate::dispatch::Dispatcher;
use crate::engine::{Engine, EngineResponse, RunResponse};
use crate::memory::{InMemoryLongTerm, SqliteStore};

#[derive(Clone, Copy, Debug)]
pub enum Behavior {
    /// 返回纯文本 `text:<query>`
    Text,
    /// 返回运行结果 `run:<query>`
    Run,
    /// 返回固定长度的文本
    Sized(usize),
    Fail,
    Panic,
}

/// 记录调用次数与会话 ID 的桩引擎
pub struct StubEngine {
    pub behavior: Behavior,
    pub calls: Arc<AtomicUsize>,
    pub sessions: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Engine for StubEngine {
    async fn run(&self, session_id: &str, query: &str) -> Result<EngineResponse, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.sessions
            .lock()
            .map_err(|_| AgentError::Unhandled("poisoned".into()))?
            .push(session_id.to_string());
        match self.behavior {
            Behavior::Text => Ok(EngineResponse::Text(format!("text:{}", query))),
            Behavior::Run => Ok(EngineResponse::Run(RunResponse {
                content: Some(format!("run:{}", query)),
                model: "stub".into(),
                run_id: None,
            })),
            Behavior::Sized(n) => Ok(EngineResponse::Text("x".repeat(n))),
            Behavior::Fail => Err(AgentError::Engine("rate limited".into())),
            Behavior::Panic => panic!("engine exploded"),
        }
    }
}

pub struct StubFactory {
    pub behavior: Behavior,
    pub calls: Arc<AtomicUsize>,
    pub sessions: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ResourceFactory for StubFactory {
    async fn build(&self) -> Result<ResourceHandle, AgentError> {
        Ok(ResourceHandle {
            engine: Arc::new(StubEngine {
                behavior: self.behavior,
                calls: self.calls.clone(),
                sessions: self.sessions.clone(),
            }),
            memory: Arc::new(InMemoryLongTerm::default()),
            storage: Arc::new(SqliteStore::in_memory()?),
            session_id: "shared".into(),
        })
    }
}

pub struct StubDispatch {
    pub dispatcher: Dispatcher,
    pub calls: Arc<AtomicUsize>,
    pub sessions: Arc<Mutex<Vec<String>>>,
}

impl StubDispatch {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn stub_dispatch(behavior: Behavior) -> StubDispatch {
    let calls = Arc::new(AtomicUsize::new(0));
    let sessions = Arc::new(Mutex::new(Vec::new()));
    let lifecycle = Arc::new(LifecycleManager::new(StubFactory {
        behavior,
        calls: calls.clone(),
        sessions: sessions.clone(),
    }));
    StubDispatch {
        dispatcher: Dispatcher::new(lifecycle),
        calls,
        sessions,
    }
}
