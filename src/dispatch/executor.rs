//! Function Executor
//! 函数执行器
//!
//! An executor runs one invocation at a time on behalf of the pool, although nothing
//! stops it from being driven concurrently when used on its own. `execute` never
//! fails: every failure mode is folded into the returned [`ExecutionResult`].
//! 执行器代表池一次运行一个调用（单独使用时也可并发驱动）。`execute` 从不返回错误：
//! 所有失败都被折叠进返回的 [`ExecutionResult`]。

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::invocation::{
    ExecutionContext, ExecutionFailure, ExecutionRequest, ExecutionResult, LogBuffer,
};
use super::registry::{FunctionMetadata, FunctionRegistry};
use super::runtime::usage::ResourceSnapshot;
use super::runtime::{Invocation, RuntimeKind, RuntimeTable};
use crate::config::ExecutorConfig;

/// Region recorded when the request names none / 请求未指定区域时记录的值
const DEFAULT_REGION: &str = "default";

/// In-flight table entry / 在途表条目
struct InFlight {
    /// Distinguishes invocations that reuse a request ID / 区分复用同一请求 ID 的调用
    ticket: u64,
    cancel: CancellationToken,
}

/// Deregisters an invocation on every exit path / 在任何退出路径上注销调用
///
/// Only the entry carrying its own ticket is removed, so a later invocation under the
/// same request ID stays registered.
/// 仅移除带有自身票据的条目，同一请求 ID 的后续调用保持注册。
struct InFlightGuard<'a> {
    in_flight: &'a DashMap<String, InFlight>,
    request_id: String,
    ticket: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight
            .remove_if(&self.request_id, |_, entry| entry.ticket == self.ticket);
    }
}

/// Function executor / 函数执行器
pub struct Executor {
    /// Executor ID / 执行器 ID
    id: String,
    /// Function registry / 函数注册表
    registry: Arc<dyn FunctionRegistry>,
    /// Strategy table / 策略表
    runtimes: Arc<RuntimeTable>,
    /// Configuration / 配置
    config: ExecutorConfig,
    /// In-flight invocations by request ID / 按请求 ID 索引的在途调用
    in_flight: DashMap<String, InFlight>,
    /// Ticket source for in-flight entries / 在途条目的票据来源
    next_ticket: AtomicU64,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("id", &self.id)
            .field("active", &self.in_flight.len())
            .finish()
    }
}

impl Executor {
    /// Create a new executor / 创建新的执行器
    pub fn new(
        registry: Arc<dyn FunctionRegistry>,
        runtimes: Arc<RuntimeTable>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            registry,
            runtimes,
            config,
            in_flight: DashMap::new(),
            next_ticket: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of in-flight invocations / 在途调用数
    pub fn active_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Whether the request is running here / 该请求是否正在此执行器上运行
    pub fn is_running(&self, request_id: &str) -> bool {
        self.in_flight.contains_key(request_id)
    }

    /// Stop an in-flight invocation; `false` when nothing was running under that ID
    /// 停止在途调用；若该 ID 下没有运行中的调用则返回 `false`
    pub fn stop(&self, request_id: &str) -> bool {
        match self.in_flight.remove(request_id) {
            Some((_, entry)) => {
                info!(executor_id = %self.id, %request_id, "Stopping invocation");
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Execute one request / 执行一次请求
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let snapshot = ResourceSnapshot::take();
        let logs = LogBuffer::new();
        let request_id = request
            .overrides
            .request_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let Some(metadata) = self.registry.lookup(&request.function_id).await else {
            warn!(
                executor_id = %self.id,
                %request_id,
                function_id = %request.function_id,
                "Function not found"
            );
            let context = Self::orphan_context(&request, request_id);
            return ExecutionResult::failed(
                ExecutionFailure::function_not_found(&request.function_id),
                logs.snapshot(),
                snapshot.metrics_since(),
                context,
            );
        };

        let context = Self::build_context(&request, &metadata, request_id);

        let kind = match metadata.runtime.parse::<RuntimeKind>() {
            Ok(kind) => kind,
            Err(failure) => {
                warn!(
                    executor_id = %self.id,
                    request_id = %context.request_id,
                    runtime = %metadata.runtime,
                    "Unsupported runtime"
                );
                return ExecutionResult::failed(
                    failure,
                    logs.snapshot(),
                    snapshot.metrics_since(),
                    context,
                );
            }
        };

        let timeout_ms = request.timeout_ms.unwrap_or(self.config.default_timeout_ms);
        if let Some(limit) = request.memory_limit_mb {
            debug!(request_id = %context.request_id, memory_limit_mb = limit, "Memory limit is advisory");
        }

        let cancel = CancellationToken::new();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        self.in_flight.insert(
            context.request_id.clone(),
            InFlight {
                ticket,
                cancel: cancel.clone(),
            },
        );
        let _guard = InFlightGuard {
            in_flight: &self.in_flight,
            request_id: context.request_id.clone(),
            ticket,
        };

        debug!(
            executor_id = %self.id,
            request_id = %context.request_id,
            function_id = %context.function_id,
            runtime = %kind,
            timeout_ms,
            "Executing function"
        );

        let strategy = self.runtimes.strategy(kind);
        let outcome = strategy
            .run(Invocation {
                event: request.event,
                context: context.clone(),
                logs: logs.clone(),
                timeout: Duration::from_millis(timeout_ms),
                cancel,
            })
            .await;
        let metrics = snapshot.metrics_since();

        match outcome {
            Ok(value) => {
                debug!(
                    request_id = %context.request_id,
                    duration_ms = metrics.duration_ms,
                    "Execution succeeded"
                );
                ExecutionResult::succeeded(value, logs.snapshot(), metrics, context)
            }
            Err(failure) => {
                warn!(
                    request_id = %context.request_id,
                    kind = %failure.kind,
                    error = %failure.message,
                    duration_ms = metrics.duration_ms,
                    "Execution failed"
                );
                ExecutionResult::failed(failure, logs.snapshot(), metrics, context)
            }
        }
    }

    fn build_context(
        request: &ExecutionRequest,
        metadata: &FunctionMetadata,
        request_id: String,
    ) -> ExecutionContext {
        let mut env = metadata.env.clone();
        env.extend(request.overrides.env.clone());

        ExecutionContext {
            request_id,
            function_id: metadata.id.clone(),
            function_name: metadata.name.clone(),
            version: request
                .version
                .clone()
                .unwrap_or_else(|| metadata.version.clone()),
            runtime: metadata.runtime.clone(),
            region: Self::region(request),
            timestamp: chrono::Utc::now(),
            env,
        }
    }

    /// Context for a function the registry does not know / 注册表中不存在的函数的上下文
    fn orphan_context(request: &ExecutionRequest, request_id: String) -> ExecutionContext {
        ExecutionContext {
            request_id,
            function_id: request.function_id.clone(),
            function_name: request.function_id.clone(),
            version: request.version.clone().unwrap_or_else(|| "unknown".to_string()),
            runtime: "unknown".to_string(),
            region: Self::region(request),
            timestamp: chrono::Utc::now(),
            env: HashMap::new(),
        }
    }

    fn region(request: &ExecutionRequest) -> String {
        request
            .overrides
            .region
            .clone()
            .unwrap_or_else(|| DEFAULT_REGION.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::registry::InMemoryFunctionRegistry;
    use crate::dispatch::runtime::handler_fn;
    use crate::dispatch::FailureKind;
    use serde_json::{json, Value};

    fn executor() -> (Executor, Arc<InMemoryFunctionRegistry>, Arc<RuntimeTable>) {
        let config = ExecutorConfig::default();
        let registry = Arc::new(InMemoryFunctionRegistry::new());
        let runtimes = Arc::new(RuntimeTable::new(&config));
        (
            Executor::new(registry.clone(), runtimes.clone(), config),
            registry,
            runtimes,
        )
    }

    #[tokio::test]
    async fn test_context_merges_overrides() {
        let (executor, registry, runtimes) = executor();
        registry.register(
            FunctionMetadata::new("ctx", "context-echo", "v3", "native")
                .with_env("A", "from-metadata")
                .with_env("B", "kept"),
        );
        runtimes.native().register_handler(
            "ctx",
            handler_fn(|_, scope| async move {
                Ok::<_, String>(serde_json::to_value(scope.context()).unwrap_or(Value::Null))
            }),
        );

        let result = executor
            .execute(
                ExecutionRequest::new("ctx")
                    .with_request_id("req-42")
                    .with_region("eu-west")
                    .with_env("A", "from-request"),
            )
            .await;

        assert!(result.success);
        assert_eq!(result.context.request_id, "req-42");
        assert_eq!(result.context.function_name, "context-echo");
        assert_eq!(result.context.version, "v3");
        assert_eq!(result.context.region, "eu-west");
        assert_eq!(result.context.env["A"], "from-request");
        assert_eq!(result.context.env["B"], "kept");
        assert_eq!(result.result.unwrap()["function_name"], "context-echo");
    }

    #[tokio::test]
    async fn test_generated_request_id_and_default_region() {
        let (executor, registry, runtimes) = executor();
        registry.register(FunctionMetadata::new("id", "id", "v1", "native"));
        runtimes
            .native()
            .register_handler("id", handler_fn(|_, _| async { Ok::<_, String>(json!(1)) }));

        let result = executor.execute(ExecutionRequest::new("id")).await;
        assert!(Uuid::parse_str(&result.context.request_id).is_ok());
        assert_eq!(result.context.region, "default");
    }

    #[tokio::test]
    async fn test_function_not_found_is_structured() {
        let (executor, _, _) = executor();
        let result = executor.execute(ExecutionRequest::new("ghost")).await;

        assert!(!result.success);
        assert_eq!(result.failure_kind(), Some(FailureKind::FunctionNotFound));
        assert_eq!(result.context.function_id, "ghost");
        assert_eq!(result.context.runtime, "unknown");
        assert_eq!(executor.active_count(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_runtime_is_structured() {
        let (executor, registry, _) = executor();
        registry.register(FunctionMetadata::new("old", "old", "v1", "cobol"));

        let result = executor.execute(ExecutionRequest::new("old")).await;
        assert!(!result.success);
        assert_eq!(result.failure_kind(), Some(FailureKind::UnsupportedRuntime));
        assert_eq!(result.context.runtime, "cobol");
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight() {
        let (executor, registry, runtimes) = executor();
        registry.register(FunctionMetadata::new("slow", "slow", "v1", "native"));
        runtimes.native().register_handler(
            "slow",
            handler_fn(|_, _| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, String>(Value::Null)
            }),
        );
        let executor = Arc::new(executor);

        let running = {
            let executor = executor.clone();
            tokio::spawn(async move {
                executor
                    .execute(ExecutionRequest::new("slow").with_request_id("req-stop"))
                    .await
            })
        };

        while !executor.is_running("req-stop") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(executor.active_count(), 1);
        assert!(executor.stop("req-stop"));
        assert!(!executor.stop("req-stop"));

        let result = running.await.unwrap();
        assert_eq!(result.failure_kind(), Some(FailureKind::Cancelled));
        assert_eq!(executor.active_count(), 0);
    }

    #[tokio::test]
    async fn test_finished_invocation_keeps_reused_request_id_registered() {
        let (executor, registry, runtimes) = executor();
        registry.register(FunctionMetadata::new("hold", "hold", "v1", "native"));
        registry.register(FunctionMetadata::new("long", "long", "v1", "native"));

        let release = Arc::new(tokio::sync::Notify::new());
        let long_started = Arc::new(tokio::sync::Notify::new());
        {
            let release = release.clone();
            runtimes.native().register_handler(
                "hold",
                handler_fn(move |_, _| {
                    let release = release.clone();
                    async move {
                        release.notified().await;
                        Ok::<_, String>(Value::Null)
                    }
                }),
            );
        }
        {
            let long_started = long_started.clone();
            runtimes.native().register_handler(
                "long",
                handler_fn(move |_, _| {
                    let long_started = long_started.clone();
                    async move {
                        long_started.notify_one();
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        Ok::<_, String>(Value::Null)
                    }
                }),
            );
        }
        let executor = Arc::new(executor);

        let first = {
            let executor = executor.clone();
            tokio::spawn(async move {
                executor
                    .execute(ExecutionRequest::new("hold").with_request_id("dup"))
                    .await
            })
        };
        while !executor.is_running("dup") {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let second = {
            let executor = executor.clone();
            tokio::spawn(async move {
                executor
                    .execute(ExecutionRequest::new("long").with_request_id("dup"))
                    .await
            })
        };
        long_started.notified().await;

        // The first invocation ends while the second still owns the ID
        release.notify_one();
        assert!(first.await.unwrap().success);
        assert!(executor.is_running("dup"));

        assert!(executor.stop("dup"));
        assert_eq!(
            second.await.unwrap().failure_kind(),
            Some(FailureKind::Cancelled)
        );
        assert_eq!(executor.active_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_uses_request_override() {
        let (executor, registry, runtimes) = executor();
        registry.register(FunctionMetadata::new("slow", "slow", "v1", "native"));
        runtimes.native().register_handler(
            "slow",
            handler_fn(|_, _| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, String>(Value::Null)
            }),
        );

        let result = executor
            .execute(ExecutionRequest::new("slow").with_timeout_ms(50))
            .await;
        assert_eq!(result.failure_kind(), Some(FailureKind::Timeout));
        assert!(result.metrics.duration_ms >= 50);
        assert!(result.metrics.duration_ms < 5000);
    }
}
