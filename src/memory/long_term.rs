//! 长期记忆：跨运行保存的用户关注点，按关键词重叠检索
//!
//! 记忆按会话隔离：add 与 search 都带会话 ID，某会话只能检索到自己写入的条目。
//! InMemoryLongTerm 供测试与无存储场景，SqliteLongTerm（见 store.rs）写入同一个 SQLite 数据库。

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

/// 长期记忆 trait：支持写入与相似度检索
pub trait LongTermMemory: Send + Sync {
    /// 为会话存入一段文本（可后续按 query 检索）
    fn add(&self, session_id: &str, text: &str);

    /// 在会话内按查询检索最相关的 k 条，返回文本片段
    fn search(&self, session_id: &str, query: &str, k: usize) -> Vec<String>;
}

/// 将文本切分为小写词集合，用于简单相似度（词重叠数）
pub(crate) fn tokenize_lower(s: &str) -> HashSet<String> {
    s.split(|c: char| c.is_whitespace() || c == ':' || c == ',' || c == '?')
        .map(|w| w.to_lowercase())
        .filter(|w| w.chars().count() > 1)
        .collect()
}

/// 按词重叠对候选文本排序，取前 k 条
pub(crate) fn rank_by_overlap<I>(query: &str, candidates: I, k: usize) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let query_tokens = tokenize_lower(query);
    if query_tokens.is_empty() || k == 0 {
        return Vec::new();
    }
    let mut scored: Vec<(usize, String)> = candidates
        .into_iter()
        .map(|text| (tokenize_lower(&text).intersection(&query_tokens).count(), text))
        .filter(|(s, _)| *s > 0)
        .collect();
    // 稳定排序：同分时保留原有（较新优先的）顺序
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.into_iter().take(k).map(|(_, t)| t).collect()
}

/// 简单内存实现：按关键词重叠检索
#[derive(Clone)]
pub struct InMemoryLongTerm {
    /// (会话 ID, 文本)，按写入顺序
    store: Arc<RwLock<Vec<(String, String)>>>,
    max_entries: usize,
}

impl InMemoryLongTerm {
    pub fn new(max_entries: usize) -> Self {
        Self {
            store: Arc::new(RwLock::new(Vec::new())),
            max_entries,
        }
    }

    pub fn len(&self) -> usize {
        self.store.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LongTermMemory for InMemoryLongTerm {
    fn add(&self, session_id: &str, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let Ok(mut store) = self.store.write() else {
            return;
        };
        store.push((session_id.to_string(), text.to_string()));
        let n = store.len();
        if n > self.max_entries {
            store.drain(0..n - self.max_entries);
        }
    }

    fn search(&self, session_id: &str, query: &str, k: usize) -> Vec<String> {
        let Ok(store) = self.store.read() else {
            return Vec::new();
        };
        let candidates = store
            .iter()
            .rev()
            .filter(|(s, _)| s == session_id)
            .map(|(_, t)| t.clone());
        rank_by_overlap(query, candidates, k)
    }
}

impl Default for InMemoryLongTerm {
    fn default() -> Self {
        Self::new(1000)
    }
}
