//! Native Sandbox Runtime
//! 原生沙箱运行时
//!
//! Runs Rust handlers in-process. A handler sees only what its [`SandboxScope`]
//! exposes: a console that writes into the invocation's log buffer, the context and
//! its environment, and the capabilities named in the allow-list.
//! 在进程内运行 Rust 处理函数。处理函数只能看到 [`SandboxScope`] 暴露的内容：
//! 写入调用日志缓冲区的控制台、上下文及其环境变量，以及允许列表中的能力。
//!
//! Cancellation aborts the handler task at its next suspension point. A handler that
//! blocks without yielding cannot be pre-empted.
//! 取消会在下一个挂起点中止处理任务；不让出执行权的阻塞处理函数无法被抢占。

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{Invocation, RuntimeStrategy};
use crate::dispatch::invocation::{ExecutionContext, ExecutionFailure, LogBuffer, LogLevel};

/// In-process function handler / 进程内函数处理器
#[async_trait]
pub trait NativeHandler: Send + Sync {
    /// Handle one event; an `Err` is reported as a thrown error
    /// 处理一个事件；返回 `Err` 视为抛出错误
    async fn handle(&self, event: Value, scope: SandboxScope) -> Result<Value, String>;
}

/// Host capability a sandboxed handler may call / 沙箱处理函数可调用的宿主能力
#[async_trait]
pub trait Capability: Send + Sync {
    async fn call(&self, args: Value) -> Result<Value, String>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> NativeHandler for FnHandler<F>
where
    F: Fn(Value, SandboxScope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, String>> + Send,
{
    async fn handle(&self, event: Value, scope: SandboxScope) -> Result<Value, String> {
        (self.0)(event, scope).await
    }
}

struct FnCapability<F>(F);

#[async_trait]
impl<F, Fut> Capability for FnCapability<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, String>> + Send,
{
    async fn call(&self, args: Value) -> Result<Value, String> {
        (self.0)(args).await
    }
}

/// Wrap an async closure as a handler / 将异步闭包包装为处理函数
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn NativeHandler>
where
    F: Fn(Value, SandboxScope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, String>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Wrap an async closure as a capability / 将异步闭包包装为能力
pub fn capability_fn<F, Fut>(f: F) -> Arc<dyn Capability>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, String>> + Send + 'static,
{
    Arc::new(FnCapability(f))
}

/// Console bound to an invocation's log buffer / 绑定到调用日志缓冲区的控制台
#[derive(Debug, Clone)]
pub struct Console {
    logs: LogBuffer,
}

impl Console {
    pub fn log(&self, message: impl Into<String>) {
        self.logs.push(LogLevel::Info, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.logs.push(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.logs.push(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.logs.push(LogLevel::Error, message);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.logs.push(LogLevel::Debug, message);
    }
}

/// Bindings visible to a sandboxed handler / 沙箱处理函数可见的绑定
#[derive(Clone)]
pub struct SandboxScope {
    context: Arc<ExecutionContext>,
    console: Console,
    capabilities: Arc<HashMap<String, Arc<dyn Capability>>>,
}

impl std::fmt::Debug for SandboxScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxScope")
            .field("request_id", &self.context.request_id)
            .field("capabilities", &self.capabilities.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SandboxScope {
    pub fn console(&self) -> &Console {
        &self.console
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Read-only environment lookup / 只读的环境变量查询
    pub fn env(&self, key: &str) -> Option<&str> {
        self.context.env.get(key).map(String::as_str)
    }

    /// Call an allowed capability / 调用允许的能力
    pub async fn call(&self, capability: &str, args: Value) -> Result<Value, String> {
        match self.capabilities.get(capability) {
            Some(cap) => cap.call(args).await,
            None => Err(format!(
                "Capability '{}' is not available in the sandbox",
                capability
            )),
        }
    }
}

/// In-process sandbox runtime / 进程内沙箱运行时
pub struct NativeRuntime {
    handlers: DashMap<String, Arc<dyn NativeHandler>>,
    capabilities: DashMap<String, Arc<dyn Capability>>,
    allowed: HashSet<String>,
}

impl std::fmt::Debug for NativeRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeRuntime")
            .field("handlers", &self.handlers.len())
            .field("capabilities", &self.capabilities.len())
            .field("allowed", &self.allowed)
            .finish()
    }
}

impl NativeRuntime {
    pub fn new(allowed_capabilities: impl IntoIterator<Item = String>) -> Self {
        Self {
            handlers: DashMap::new(),
            capabilities: DashMap::new(),
            allowed: allowed_capabilities.into_iter().collect(),
        }
    }

    /// Register the handler for a function / 为函数注册处理函数
    pub fn register_handler(&self, function_id: impl Into<String>, handler: Arc<dyn NativeHandler>) {
        let function_id = function_id.into();
        debug!(%function_id, "Registering native handler");
        self.handlers.insert(function_id, handler);
    }

    pub fn remove_handler(&self, function_id: &str) -> bool {
        self.handlers.remove(function_id).is_some()
    }

    pub fn has_handler(&self, function_id: &str) -> bool {
        self.handlers.contains_key(function_id)
    }

    /// Register a host capability; it is only reachable when allow-listed
    /// 注册宿主能力；仅在允许列表中时可被调用
    pub fn register_capability(&self, name: impl Into<String>, capability: Arc<dyn Capability>) {
        let name = name.into();
        if !self.allowed.contains(&name) {
            warn!(capability = %name, "Capability registered but not allow-listed");
        }
        self.capabilities.insert(name, capability);
    }

    fn scope(&self, invocation: &Invocation) -> SandboxScope {
        let capabilities = self
            .capabilities
            .iter()
            .filter(|c| self.allowed.contains(c.key()))
            .map(|c| (c.key().clone(), c.value().clone()))
            .collect();

        SandboxScope {
            context: Arc::new(invocation.context.clone()),
            console: Console {
                logs: invocation.logs.clone(),
            },
            capabilities: Arc::new(capabilities),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[async_trait]
impl RuntimeStrategy for NativeRuntime {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn run(&self, invocation: Invocation) -> Result<Value, ExecutionFailure> {
        let function_id = invocation.context.function_id.clone();
        let Some(handler) = self.handlers.get(&function_id).map(|h| h.value().clone()) else {
            return Err(ExecutionFailure::runtime(format!(
                "No native handler registered for function {}",
                function_id
            )));
        };

        let scope = self.scope(&invocation);
        let event = invocation.event;
        let mut task = tokio::spawn(async move { handler.handle(event, scope).await });

        tokio::select! {
            joined = &mut task => match joined {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(message)) => Err(ExecutionFailure::runtime(message)),
                Err(e) if e.is_panic() => Err(ExecutionFailure::runtime(format!(
                    "Handler panicked: {}",
                    panic_message(e.into_panic())
                ))),
                Err(e) => Err(ExecutionFailure::runtime(e.to_string())),
            },
            _ = tokio::time::sleep(invocation.timeout) => {
                task.abort();
                Err(ExecutionFailure::timeout(invocation.timeout.as_millis() as u64))
            }
            _ = invocation.cancel.cancelled() => {
                task.abort();
                Err(ExecutionFailure::cancelled())
            }
        }
    }
}
