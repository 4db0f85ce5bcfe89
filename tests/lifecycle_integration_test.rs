//! 生命周期集成测试：并发首次分发只构建一次；构建失败不发布句柄，之后可重试

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use ossboss::core::{AgentError, LifecycleManager, ResourceFactory, ResourceHandle};
    use ossboss::dispatch::{CanonicalRequest, CanonicalResult, Dispatcher};
    use ossboss::engine::{Engine, EngineResponse};
    use ossboss::memory::{InMemoryLongTerm, SqliteStore};

    struct UpperEngine;

    #[async_trait]
    impl Engine for UpperEngine {
        async fn run(&self, _session_id: &str, query: &str) -> Result<EngineResponse, AgentError> {
            Ok(EngineResponse::Text(query.to_uppercase()))
        }
    }

    /// 前 `fail_first` 次构建失败，每次构建都较慢以放大并发窗口
    struct SlowFactory {
        builds: Arc<AtomicUsize>,
        fail_first: usize,
    }

    #[async_trait]
    impl ResourceFactory for SlowFactory {
        async fn build(&self) -> Result<ResourceHandle, AgentError> {
            let n = self.builds.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if n < self.fail_first {
                return Err(AgentError::Storage("store unreachable".into()));
            }
            Ok(ResourceHandle {
                engine: Arc::new(UpperEngine),
                memory: Arc::new(InMemoryLongTerm::default()),
                storage: Arc::new(SqliteStore::in_memory()?),
                session_id: "shared".into(),
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_dispatches_build_once() {
        let builds = Arc::new(AtomicUsize::new(0));
        let lifecycle = Arc::new(LifecycleManager::new(SlowFactory {
            builds: builds.clone(),
            fail_first: 0,
        }));
        let dispatcher = Arc::new(Dispatcher::new(lifecycle.clone()));

        let mut tasks = Vec::new();
        for (i, channel) in ["console", "http", "bot"].into_iter().cycle().take(12).enumerate() {
            let d = dispatcher.clone();
            tasks.push(tokio::spawn(async move {
                d.dispatch(channel, CanonicalRequest::new(format!("q{}", i))).await
            }));
        }
        for (i, task) in tasks.into_iter().enumerate() {
            assert_eq!(
                task.await.unwrap(),
                CanonicalResult::Success {
                    text: format!("Q{}", i)
                }
            );
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(lifecycle.is_initialized());
    }

    #[tokio::test]
    async fn test_failed_build_is_retried_on_next_request() {
        let builds = Arc::new(AtomicUsize::new(0));
        let lifecycle = Arc::new(LifecycleManager::new(SlowFactory {
            builds: builds.clone(),
            fail_first: 1,
        }));
        let dispatcher = Dispatcher::new(lifecycle.clone());

        let first = dispatcher.dispatch("http", CanonicalRequest::new("a")).await;
        match first {
            CanonicalResult::Failure { error } => assert!(error.contains("store unreachable")),
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(!lifecycle.is_initialized());

        let second = dispatcher.dispatch("http", CanonicalRequest::new("b")).await;
        assert_eq!(second, CanonicalResult::Success { text: "B".into() });
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        let a = lifecycle.acquire().await.unwrap();
        let b = lifecycle.acquire().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
