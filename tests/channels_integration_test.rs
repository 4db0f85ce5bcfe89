//! 多通道集成测试：真实的默认资源工厂（Mock LLM + 内存 SQLite），经 HTTP 与控制台共享同一引擎

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use ossboss::channels::{create_router, ConsoleRunner, HttpState};
    use ossboss::config::AppConfig;
    use ossboss::core::LifecycleManager;
    use ossboss::dispatch::{CanonicalRequest, Dispatcher};
    use ossboss::memory::LongTermMemory;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn mock_config(store_url: &str) -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "mock".to_string();
        cfg.store.url = store_url.to_string();
        cfg
    }

    async fn post(app: axum::Router, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_http_and_console_share_one_engine_and_session() {
        let lifecycle = Arc::new(LifecycleManager::from_config(mock_config(":memory:")));
        let dispatcher = Arc::new(Dispatcher::new(lifecycle.clone()));
        assert!(!lifecycle.is_initialized());

        let app = create_router(Arc::new(HttpState::new(dispatcher.clone())));
        let (status, body) = post(
            app.clone(),
            "/analyze",
            json!({ "query": "how many stars?", "repository": "tokio-rs/tokio" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["response"], "Echo from Mock: tokio-rs/tokio: how many stars?");

        let (status, body) = post(
            app,
            "/run-task",
            json!({
                "agent_id": "oss-boss",
                "task_id": "t-1",
                "inputs": { "variables": {
                    "query": { "value": "list issues" },
                    "repository": { "value": "o/r" }
                }}
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "completed");
        assert_eq!(
            body["outputs"]["variables"]["response"]["value"],
            "Echo from Mock: o/r: list issues"
        );

        let mut console = ConsoleRunner::new(dispatcher, "serde downloads\nexit\n".as_bytes(), Vec::new());
        console.repl(&CancellationToken::new()).await.unwrap();
        let out = String::from_utf8(console.into_writer()).unwrap();
        assert!(out.contains("Echo from Mock: serde downloads"));
        assert!(out.ends_with("Goodbye!\n"));

        // 三次请求只构建一次，并写入同一个会话
        assert_eq!(lifecycle.attempts(), 1);
        let handle = lifecycle.get().unwrap();
        assert_eq!(handle.session_id, "github_repo_analysis");
        assert_eq!(handle.storage.count_runs(&handle.session_id).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_history_survives_restart_with_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("runs.db").display());

        for query in ["first question", "second question"] {
            let lifecycle = Arc::new(LifecycleManager::from_config(mock_config(&url)));
            let dispatcher = Dispatcher::new(lifecycle);
            let result = dispatcher
                .dispatch("test", CanonicalRequest::new(query))
                .await;
            assert!(result.is_success());
        }

        let lifecycle = LifecycleManager::from_config(mock_config(&url));
        let handle = lifecycle.acquire().await.unwrap();
        let runs = handle.storage.recent_runs(&handle.session_id, 10).unwrap();
        let queries: Vec<_> = runs.iter().map(|r| r.query.as_str()).collect();
        assert_eq!(queries, vec!["first question", "second question"]);
    }

    #[tokio::test]
    async fn test_per_caller_sessions_keep_memories_apart() {
        let lifecycle = Arc::new(LifecycleManager::from_config(mock_config(":memory:")));
        let dispatcher = Dispatcher::new(lifecycle.clone()).with_per_caller_sessions(true);

        for (caller, query) in [
            ("alice", "alice secret-project/internal roadmap"),
            ("bob", "secret-project/internal roadmap?"),
        ] {
            let request = CanonicalRequest::new(query).with_caller(Some(caller.to_string()));
            assert!(dispatcher.dispatch("bot", request).await.is_success());
        }

        let handle = lifecycle.get().unwrap();
        let alice = handle
            .memory
            .search("github_repo_analysis:alice", "secret-project/internal roadmap", 5);
        let bob = handle
            .memory
            .search("github_repo_analysis:bob", "secret-project/internal roadmap", 5);
        assert_eq!(alice, vec!["alice secret-project/internal roadmap".to_string()]);
        assert_eq!(bob, vec!["secret-project/internal roadmap?".to_string()]);
        assert!(handle
            .memory
            .search("github_repo_analysis", "secret-project/internal roadmap", 5)
            .is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_store_fails_every_request_without_publishing() {
        let lifecycle = Arc::new(LifecycleManager::from_config(mock_config(
            "mongodb://localhost:27017",
        )));
        let dispatcher = Arc::new(Dispatcher::new(lifecycle.clone()));
        let app = create_router(Arc::new(HttpState::new(dispatcher)));

        let (status, body) = post(app.clone(), "/analyze", json!({ "query": "hi" })).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["detail"].as_str().unwrap().contains("Error processing request"));

        let (status, body) = post(
            app,
            "/run-task",
            json!({ "agent_id": "a", "task_id": "t",
                    "inputs": { "variables": { "query": { "value": "hi" } } } }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "failed");

        assert!(!lifecycle.is_initialized());
        assert_eq!(lifecycle.attempts(), 2);
    }
}
