//! 记忆层：短期（对话）、长期（检索）、SQLite 持久化

pub mod conversation;
pub mod long_term;
pub mod store;

pub use conversation::{ConversationMemory, Message, Role};
pub use long_term::{InMemoryLongTerm, LongTermMemory};
pub use store::{parse_store_url, SqliteLongTerm, SqliteStore, StoreLocation, StoredRun};
