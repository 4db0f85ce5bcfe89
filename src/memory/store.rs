//! SQLite 存储：会话运行历史 + 长期记忆
//!
//! 连接串支持 `sqlite://<path>`、裸路径与 `:memory:`。连接由 Mutex 保护，
//! 单条语句很短，直接在调用线程上执行。

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection};

use crate::core::AgentError;
use crate::memory::long_term::{rank_by_overlap, LongTermMemory};

/// 一次已完成的运行（一问一答）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRun {
    pub run_id: String,
    pub session_id: String,
    pub query: String,
    pub response: String,
    pub created_at: String,
}

/// 解析后的存储位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    Memory,
    File(PathBuf),
}

/// 解析连接串；不支持的 scheme 返回配置错误
pub fn parse_store_url(url: &str) -> Result<StoreLocation, AgentError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(AgentError::Config("store url is empty".to_string()));
    }
    let rest = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:"));
    let path = match rest {
        Some(p) => p,
        None if url.contains("://") => {
            return Err(AgentError::Config(format!(
                "unsupported store url (expected sqlite://<path>): {}",
                url
            )))
        }
        None => url,
    };
    if path == ":memory:" {
        return Ok(StoreLocation::Memory);
    }
    if path.is_empty() {
        return Err(AgentError::Config(format!("store url has no path: {}", url)));
    }
    Ok(StoreLocation::File(PathBuf::from(path)))
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
    location: StoreLocation,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("location", &self.location)
            .finish()
    }
}

impl SqliteStore {
    /// 按连接串打开；文件不存在时创建（含父目录）
    pub fn open(url: &str) -> Result<Self, AgentError> {
        let location = parse_store_url(url)?;
        let conn = match &location {
            StoreLocation::Memory => Connection::open_in_memory()?,
            StoreLocation::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                Connection::open(path)?
            }
        };
        let store = Self {
            conn: Mutex::new(conn),
            location,
        };
        store.init_tables()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, AgentError> {
        Self::open(":memory:")
    }

    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, AgentError> {
        self.conn
            .lock()
            .map_err(|_| AgentError::Storage("store connection poisoned".to_string()))
    }

    fn init_tables(&self) -> Result<(), AgentError> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS runs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL UNIQUE,
                session_id TEXT NOT NULL,
                query TEXT NOT NULL,
                response TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_runs_session ON runs(session_id, seq);
            CREATE TABLE IF NOT EXISTS memories (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                text TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_memories_session ON memories(session_id, seq);",
        )?;
        Ok(())
    }

    /// 记录一次运行
    pub fn append_run(
        &self,
        session_id: &str,
        query: &str,
        response: &str,
    ) -> Result<StoredRun, AgentError> {
        let run = StoredRun {
            run_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            query: query.to_string(),
            response: response.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        self.conn()?.execute(
            "INSERT INTO runs (run_id, session_id, query, response, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run.run_id, run.session_id, run.query, run.response, run.created_at],
        )?;
        Ok(run)
    }

    /// 最近 limit 次运行，按时间正序返回
    pub fn recent_runs(&self, session_id: &str, limit: usize) -> Result<Vec<StoredRun>, AgentError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, session_id, query, response, created_at FROM runs
             WHERE session_id = ?1 ORDER BY seq DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![session_id, limit as i64], |row| {
            Ok(StoredRun {
                run_id: row.get(0)?,
                session_id: row.get(1)?,
                query: row.get(2)?,
                response: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        let mut runs = rows.collect::<Result<Vec<_>, _>>()?;
        runs.reverse();
        Ok(runs)
    }

    pub fn count_runs(&self, session_id: &str) -> Result<usize, AgentError> {
        let n: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM runs WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    pub fn add_memory(&self, session_id: &str, text: &str) -> Result<(), AgentError> {
        self.conn()?.execute(
            "INSERT INTO memories (session_id, text, created_at) VALUES (?1, ?2, ?3)",
            params![session_id, text, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// 最近 limit 条记忆，新的在前
    pub fn memories(&self, session_id: &str, limit: usize) -> Result<Vec<String>, AgentError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT text FROM memories WHERE session_id = ?1 ORDER BY seq DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![session_id, limit as i64], |row| row.get::<_, String>(0))?;
        let texts = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(texts)
    }
}

/// 基于 SqliteStore 的长期记忆，`memories` 表按 session_id 隔离
pub struct SqliteLongTerm {
    store: Arc<SqliteStore>,
    /// 检索时扫描的最近条目数
    scan_limit: usize,
}

impl SqliteLongTerm {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self {
            store,
            scan_limit: 500,
        }
    }
}

impl LongTermMemory for SqliteLongTerm {
    fn add(&self, session_id: &str, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if let Err(e) = self.store.add_memory(session_id, text) {
            tracing::warn!("Failed to persist memory: {}", e);
        }
    }

    fn search(&self, session_id: &str, query: &str, k: usize) -> Vec<String> {
        match self.store.memories(session_id, self.scan_limit) {
            Ok(candidates) => rank_by_overlap(query, candidates, k),
            Err(e) => {
                tracing::warn!("Failed to read memories: {}", e);
                Vec::new()
            }
        }
    }
}
