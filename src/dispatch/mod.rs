//! 分发层：请求归一化 + 调用共享引擎

pub mod dispatcher;
pub mod request;

pub use dispatcher::{CanonicalResult, Dispatcher};
pub use request::{
    normalize, with_repository_prefix, AnalyzeRequest, CanonicalRequest, ChannelPayload,
    TaskInput, TaskVariable,
};
