//! Dispatch Module - Router, Pool, Executor
//! 分发模块 - 路由器、池、执行器
//!
//! This module implements the edge-function dispatch engine:
//! 该模块实现了边缘函数分发引擎：
//!
//! - **Router**: Matches a request descriptor to a deployed function
//! - **Router**: 将请求描述匹配到已部署的函数
//! - **Pool**: Bounds, queues and recycles function executors
//! - **Pool**: 限制、排队并复用函数执行器
//! - **Executor**: Runs one invocation in a language runtime under a deadline
//! - **Executor**: 在截止时间内于某个语言运行时中执行一次调用
//!
//! ## Control Flow / 控制流
//!
//! ```text
//! Router::match_route ──► RouteMatch ──► ExecutionRequest
//!                                              │
//!                     ExecutorPool::execute ◄──┘
//!                              │
//!                      Executor::execute ──► RuntimeStrategy::run
//! ```
//!
//! The Router and the Pool never call each other; an orchestrating layer composes them.
//! 路由器与池之间互不调用，由上层编排层组合使用。

pub mod events;
pub mod executor;
pub mod invocation;
pub mod pattern;
pub mod pool;
pub mod registry;
pub mod router;
pub mod runtime;

// Re-export commonly used types / 重新导出常用类型
pub use events::{PoolEvent, RouteEvent};
pub use executor::Executor;
pub use invocation::{
    ContextOverrides, ExecutionContext, ExecutionFailure, ExecutionMetrics, ExecutionRequest,
    ExecutionResult, FailureKind, LogBuffer, LogLevel, LogLine,
};
pub use pool::{ExecutorPool, PoolStats};
pub use registry::{FunctionMetadata, FunctionRegistry, FunctionStore, InMemoryFunctionRegistry};
pub use router::{MatchRequest, RouteDefinition, RouteMatch, RouteStats, RouteUpdate, Router};
pub use runtime::{
    capability_fn, handler_fn, Capability, Console, Invocation, NativeHandler, NativeRuntime,
    ProcessRuntime, RuntimeKind, RuntimeStrategy, RuntimeTable, SandboxScope,
};

// Dispatch result type / 分发结果类型
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Caller-visible dispatch errors / 调用方可见的分发错误
///
/// Execution-level failures never surface here; they are carried inside
/// [`ExecutionResult::error`].
/// 执行层面的失败不会出现在这里，而是放在 [`ExecutionResult::error`] 中。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Invalid route: {message}")]
    InvalidRoute { message: String },

    #[error("Executor queue is full (limit {limit})")]
    QueueFull { limit: usize },

    #[error("Executor pool is shutting down")]
    PoolShuttingDown,

    #[error("Invalid configuration: {message}")]
    InvalidConfiguration { message: String },
}

impl DispatchError {
    /// Whether the caller should retry later (backpressure)
    /// 调用方是否应稍后重试（背压）
    pub fn is_overloaded(&self) -> bool {
        matches!(
            self,
            DispatchError::QueueFull { .. } | DispatchError::PoolShuttingDown
        )
    }
}
