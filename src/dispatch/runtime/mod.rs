//! Runtime Module
//! 运行时模块
//!
//! Execution strategies the executor dispatches to, keyed by a closed runtime enum.
//! 执行器分派到的执行策略，以封闭的运行时枚举作为键。
//!
//! ## Supported Runtimes / 支持的运行时
//! - **Native**: In-process sandboxed Rust handlers / 进程内沙箱化的 Rust 处理函数
//! - **Python / Node / Ruby**: One interpreter subprocess per invocation
//!   每次调用启动一个解释器子进程

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::invocation::{ExecutionContext, ExecutionFailure, LogBuffer};
use super::registry::FunctionStore;
use crate::config::ExecutorConfig;

pub mod native;
pub mod process;
pub mod usage;

pub use native::{
    capability_fn, handler_fn, Capability, Console, NativeHandler, NativeRuntime, SandboxScope,
};
pub use process::ProcessRuntime;

/// Runtime kind / 运行时类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// In-process sandbox / 进程内沙箱
    Native,
    /// Python interpreter / Python 解释器
    Python,
    /// Node.js interpreter / Node.js 解释器
    Node,
    /// Ruby interpreter / Ruby 解释器
    Ruby,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::Native => "native",
            RuntimeKind::Python => "python",
            RuntimeKind::Node => "node",
            RuntimeKind::Ruby => "ruby",
        }
    }

    /// Fixed entrypoint filename inside a version directory
    /// 版本目录中固定的入口文件名
    pub fn entrypoint_file(&self) -> Option<&'static str> {
        match self {
            RuntimeKind::Native => None,
            RuntimeKind::Python => Some("handler.py"),
            RuntimeKind::Node => Some("handler.js"),
            RuntimeKind::Ruby => Some("handler.rb"),
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeKind {
    type Err = ExecutionFailure;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" | "rust" => Ok(RuntimeKind::Native),
            "python" | "python3" => Ok(RuntimeKind::Python),
            "node" | "nodejs" | "javascript" => Ok(RuntimeKind::Node),
            "ruby" => Ok(RuntimeKind::Ruby),
            _ => Err(ExecutionFailure::unsupported_runtime(s)),
        }
    }
}

/// Everything a strategy needs for one run / 单次运行所需的全部输入
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Event payload / 事件负载
    pub event: Value,
    /// Execution context / 执行上下文
    pub context: ExecutionContext,
    /// Log buffer the run writes into / 运行写入的日志缓冲区
    pub logs: LogBuffer,
    /// Hard deadline / 硬性截止时间
    pub timeout: Duration,
    /// Fired by `Executor::stop` / 由 `Executor::stop` 触发
    pub cancel: CancellationToken,
}

/// Execution strategy / 执行策略
#[async_trait]
pub trait RuntimeStrategy: Send + Sync {
    /// Strategy name / 策略名称
    fn name(&self) -> &'static str;

    /// Run one invocation to completion, timeout or cancellation
    /// 运行一次调用直到完成、超时或取消
    async fn run(&self, invocation: Invocation) -> Result<Value, ExecutionFailure>;
}

/// Closed strategy table / 封闭的策略表
#[derive(Debug)]
pub struct RuntimeTable {
    native: NativeRuntime,
    python: ProcessRuntime,
    node: ProcessRuntime,
    ruby: ProcessRuntime,
}

impl RuntimeTable {
    /// Build the table from executor configuration / 根据执行器配置构建策略表
    pub fn new(config: &ExecutorConfig) -> Self {
        let store = FunctionStore::new(&config.functions_dir);
        Self {
            native: NativeRuntime::new(config.allowed_capabilities.clone()),
            python: ProcessRuntime::new(RuntimeKind::Python, store.clone(), config),
            node: ProcessRuntime::new(RuntimeKind::Node, store.clone(), config),
            ruby: ProcessRuntime::new(RuntimeKind::Ruby, store, config),
        }
    }

    /// Native sandbox, for registering handlers and capabilities
    /// 原生沙箱，用于注册处理函数和能力
    pub fn native(&self) -> &NativeRuntime {
        &self.native
    }

    pub fn strategy(&self, kind: RuntimeKind) -> &dyn RuntimeStrategy {
        match kind {
            RuntimeKind::Native => &self.native,
            RuntimeKind::Python => &self.python,
            RuntimeKind::Node => &self.node,
            RuntimeKind::Ruby => &self.ruby,
        }
    }
}
