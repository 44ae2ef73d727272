//! Edge-dispatch: function routing, executor pooling and supervised execution
//! Edge-dispatch：函数路由、执行器池与受监督的执行
//!
//! The crate is embedded by an orchestrating layer that owns transport, caching and
//! metrics. It composes three pieces:
//! 该 crate 由上层编排层嵌入使用，由三部分组成：
//!
//! - [`dispatch::Router`] matches a request descriptor to a deployed function
//! - [`dispatch::ExecutorPool`] bounds and reuses function executors
//! - [`dispatch::Executor`] runs one invocation in a language runtime

// Shared modules / 共享模块
pub mod config;

// Dispatch engine / 分发引擎
pub mod dispatch;

// Re-exports / 重新导出
pub use config::{init_tracing, AppConfig, DispatchConfig, LoggingConfig};
pub use dispatch::*;
