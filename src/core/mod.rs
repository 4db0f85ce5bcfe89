//! 核心层：错误分类、资源生命周期、关闭信号、进程编排

pub mod error;
pub mod lifecycle;
pub mod orchestrator;
pub mod shutdown;

pub use error::AgentError;
pub use lifecycle::{DefaultResourceFactory, LifecycleManager, ResourceFactory, ResourceHandle};
pub use orchestrator::{Orchestrator, RunReport};
pub use shutdown::{ShutdownManager, ShutdownReason};
