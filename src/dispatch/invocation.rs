//! Invocation data model
//! 调用数据模型
//!
//! Requests flow in, results flow out. A result is always structured: failures are
//! carried in [`ExecutionResult::error`] rather than returned as Rust errors.
//! 请求流入，结果流出。结果总是结构化的：失败被放在 [`ExecutionResult::error`] 中。

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Per-invocation overrides merged into the execution context
/// 合并到执行上下文中的单次调用覆盖项
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextOverrides {
    /// Request ID; generated when absent / 请求 ID，缺省时自动生成
    pub request_id: Option<String>,
    /// Region the request was served from / 请求所在区域
    pub region: Option<String>,
    /// Extra environment variables, taking precedence over function env
    /// 额外环境变量，优先于函数自带的环境变量
    pub env: HashMap<String, String>,
}

/// Execution request / 执行请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Function ID / 函数 ID
    pub function_id: String,
    /// Pinned version; the registry's current version when absent
    /// 固定版本；缺省时使用注册表中的当前版本
    pub version: Option<String>,
    /// Opaque event payload / 不透明的事件负载
    pub event: Value,
    /// Context overrides / 上下文覆盖项
    pub overrides: ContextOverrides,
    /// Timeout in milliseconds / 超时时间（毫秒）
    pub timeout_ms: Option<u64>,
    /// Memory limit in megabytes / 内存限制（MB）
    pub memory_limit_mb: Option<u64>,
}

impl ExecutionRequest {
    pub fn new(function_id: impl Into<String>) -> Self {
        Self {
            function_id: function_id.into(),
            version: None,
            event: Value::Null,
            overrides: ContextOverrides::default(),
            timeout_ms: None,
            memory_limit_mb: None,
        }
    }

    pub fn with_event(mut self, event: Value) -> Self {
        self.event = event;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_memory_limit_mb(mut self, memory_limit_mb: u64) -> Self {
        self.memory_limit_mb = Some(memory_limit_mb);
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.overrides.request_id = Some(request_id.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.overrides.region = Some(region.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.env.insert(key.into(), value.into());
        self
    }
}

/// Execution context / 执行上下文
///
/// Built by the executor at the start of an invocation and discarded at its end.
/// 由执行器在调用开始时构建，调用结束后丢弃。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Request ID / 请求 ID
    pub request_id: String,
    /// Function ID / 函数 ID
    pub function_id: String,
    /// Function name / 函数名称
    pub function_name: String,
    /// Function version / 函数版本
    pub version: String,
    /// Runtime identifier / 运行时标识
    pub runtime: String,
    /// Region / 区域
    pub region: String,
    /// Invocation start time / 调用开始时间
    pub timestamp: DateTime<Utc>,
    /// Environment variables / 环境变量
    pub env: HashMap<String, String>,
}

/// Resource accounting for one invocation / 单次调用的资源统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    /// Wall-clock duration / 墙钟时长
    pub duration_ms: u64,
    /// Memory used / 内存使用
    pub memory_used_bytes: u64,
    /// CPU time / CPU 时间
    pub cpu_time_ms: u64,
}

/// Failure classification / 失败分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    FunctionNotFound,
    UnsupportedRuntime,
    Timeout,
    ProcessSpawnFailure,
    RuntimeExecutionFailure,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::FunctionNotFound => "function_not_found",
            FailureKind::UnsupportedRuntime => "unsupported_runtime",
            FailureKind::Timeout => "timeout",
            FailureKind::ProcessSpawnFailure => "process_spawn_failure",
            FailureKind::RuntimeExecutionFailure => "runtime_execution_failure",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution failure carried inside a result / 结果中携带的执行失败
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ExecutionFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ExecutionFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn function_not_found(function_id: &str) -> Self {
        Self::new(
            FailureKind::FunctionNotFound,
            format!("Function not found: {}", function_id),
        )
    }

    pub fn unsupported_runtime(runtime: &str) -> Self {
        Self::new(
            FailureKind::UnsupportedRuntime,
            format!("Unsupported runtime: {}", runtime),
        )
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self::new(
            FailureKind::Timeout,
            format!("Execution timed out after {}ms", timeout_ms),
        )
    }

    pub fn spawn(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ProcessSpawnFailure, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(FailureKind::RuntimeExecutionFailure, message)
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "Execution was stopped")
    }
}

/// Log level of a captured line / 捕获行的日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One captured output line / 一行捕获的输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Ordered, shareable log buffer for one invocation
/// 单次调用的有序、可共享日志缓冲区
#[derive(Debug, Clone, Default)]
pub struct LogBuffer {
    lines: Arc<Mutex<Vec<LogLine>>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, level: LogLevel, message: impl Into<String>) {
        self.lines.lock().push(LogLine {
            level,
            message: message.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }

    /// Copy of the lines captured so far / 目前已捕获行的副本
    pub fn snapshot(&self) -> Vec<LogLine> {
        self.lines.lock().clone()
    }
}

/// Execution result / 执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Whether the handler returned normally / 处理函数是否正常返回
    pub success: bool,
    /// Handler return value / 处理函数返回值
    pub result: Option<Value>,
    /// Failure details / 失败详情
    pub error: Option<ExecutionFailure>,
    /// Captured output / 捕获的输出
    pub logs: Vec<LogLine>,
    /// Resource accounting / 资源统计
    pub metrics: ExecutionMetrics,
    /// Context the invocation ran with / 调用使用的上下文
    pub context: ExecutionContext,
}

impl ExecutionResult {
    pub fn succeeded(
        result: Value,
        logs: Vec<LogLine>,
        metrics: ExecutionMetrics,
        context: ExecutionContext,
    ) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            logs,
            metrics,
            context,
        }
    }

    pub fn failed(
        error: ExecutionFailure,
        logs: Vec<LogLine>,
        metrics: ExecutionMetrics,
        context: ExecutionContext,
    ) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error),
            logs,
            metrics,
            context,
        }
    }

    /// Failure kind, if the invocation failed / 调用失败时的失败类型
    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}
