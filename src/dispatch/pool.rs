//! Executor Pool
//! 执行器池
//!
//! Bounds the number of executors, queues callers once the bound is reached and hands
//! released executors to queued callers in FIFO order. After load subsides the pool
//! trims itself back to `min_size`.
//! 限制执行器数量，达到上限后对调用方排队，并按 FIFO 顺序将释放的执行器交给排队者。
//! 负载下降后池会缩减回 `min_size`。
//!
//! ## Sizing / 容量
//!
//! ```text
//! acquire:  idle? ──yes──► reuse newest idle
//!             │no
//!           total < max? ──yes──► create
//!             │no
//!           waiting >= max_queue? ──yes──► QueueFull
//!             │no
//!           enqueue and wait for a hand-off
//! ```

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::events::{PoolEvent, EVENT_CHANNEL_CAPACITY};
use super::executor::Executor;
use super::invocation::{ExecutionRequest, ExecutionResult};
use super::registry::FunctionRegistry;
use super::runtime::RuntimeTable;
use super::{DispatchError, DispatchResult};
use crate::config::{ExecutorConfig, PoolConfig};

/// Pool statistics / 池统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Executors owned by the pool / 池拥有的执行器数
    pub total: usize,
    /// Executors currently leased / 当前被租用的执行器数
    pub active: usize,
    /// Executors ready for reuse / 可复用的执行器数
    pub idle: usize,
    /// Queued acquisitions / 排队中的获取请求数
    pub waiting: usize,
    /// Completed executions / 已完成的执行数
    pub executed: u64,
    /// Executions that did not succeed / 未成功的执行数
    pub failed: u64,
    /// Mean wall-clock duration / 平均墙钟时长
    pub average_execution_time_ms: f64,
    /// Executors created over the pool's lifetime / 生命周期内创建的执行器数
    pub created: u64,
    /// Executors discarded over the pool's lifetime / 生命周期内丢弃的执行器数
    pub destroyed: u64,
}

type Grant = DispatchResult<Arc<Executor>>;

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Grant>,
    enqueued_at: Instant,
}

#[derive(Default)]
struct PoolState {
    all: HashMap<String, Arc<Executor>>,
    active: HashSet<String>,
    /// Newest at the back / 最新的在队尾
    idle: VecDeque<Arc<Executor>>,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
    executed: u64,
    failed: u64,
    total_duration_ms: u64,
    created: u64,
    destroyed: u64,
    shutting_down: bool,
}

/// Returns the executor to the pool when dropped / 被丢弃时将执行器归还给池
struct Lease<'a> {
    pool: &'a ExecutorPool,
    executor: Arc<Executor>,
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        self.pool.release(&self.executor);
    }
}

/// Queued acquisition; when the caller gives up its queue slot is freed and a grant
/// that already arrived is given back
/// 排队中的获取请求；调用方放弃时释放其排队位置，已到达的授予会被归还
struct Pending<'a> {
    pool: &'a ExecutorPool,
    waiter_id: u64,
    rx: oneshot::Receiver<Grant>,
    settled: bool,
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        // Once out of the queue no further grant can be sent / 出队后不会再收到授予
        self.pool
            .state
            .lock()
            .waiters
            .retain(|w| w.id != self.waiter_id);
        self.rx.close();
        if let Ok(Ok(executor)) = self.rx.try_recv() {
            self.pool.release(&executor);
        }
    }
}

/// Executor pool / 执行器池
pub struct ExecutorPool {
    /// Configuration / 配置
    config: PoolConfig,
    /// Configuration handed to each new executor / 传给每个新执行器的配置
    executor_config: ExecutorConfig,
    /// Function registry / 函数注册表
    registry: Arc<dyn FunctionRegistry>,
    /// Strategy table shared by all executors / 所有执行器共享的策略表
    runtimes: Arc<RuntimeTable>,
    /// Sizing state and counters / 容量状态与计数器
    state: Mutex<PoolState>,
    /// Event channel / 事件通道
    events: broadcast::Sender<PoolEvent>,
}

impl std::fmt::Debug for ExecutorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorPool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ExecutorPool {
    /// Create a pool and eagerly build `min_size` executors
    /// 创建池并预先构建 `min_size` 个执行器
    pub fn new(
        config: PoolConfig,
        registry: Arc<dyn FunctionRegistry>,
        runtimes: Arc<RuntimeTable>,
        executor_config: ExecutorConfig,
    ) -> DispatchResult<Self> {
        if config.max_size == 0 {
            return Err(DispatchError::InvalidConfiguration {
                message: "pool max_size must be at least 1".to_string(),
            });
        }
        if config.min_size > config.max_size {
            return Err(DispatchError::InvalidConfiguration {
                message: format!(
                    "pool min_size ({}) exceeds max_size ({})",
                    config.min_size, config.max_size
                ),
            });
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let pool = Self {
            config,
            executor_config,
            registry,
            runtimes,
            state: Mutex::new(PoolState::default()),
            events,
        };

        {
            let mut state = pool.state.lock();
            for _ in 0..pool.config.min_size {
                let executor = pool.create_executor(&mut state);
                state.idle.push_back(executor);
            }
        }

        info!(
            min_size = pool.config.min_size,
            max_size = pool.config.max_size,
            max_queue_size = pool.config.max_queue_size,
            "Executor pool started"
        );
        Ok(pool)
    }

    /// Subscribe to pool events / 订阅池事件
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Run one request on a pooled executor / 在池中的执行器上运行一次请求
    ///
    /// Errors only for backpressure (`QueueFull`) and shutdown; execution failures are
    /// inside the returned result.
    /// 仅在背压（`QueueFull`）和关闭时返回错误；执行失败包含在返回的结果中。
    pub async fn execute(&self, request: ExecutionRequest) -> DispatchResult<ExecutionResult> {
        let executor = self.acquire().await?;
        let lease = Lease {
            pool: self,
            executor,
        };

        let result = lease.executor.execute(request).await;
        self.record(&result);
        drop(lease);
        Ok(result)
    }

    /// Stop an in-flight invocation on whichever executor runs it
    /// 在运行该调用的执行器上停止它
    pub fn stop(&self, request_id: &str) -> bool {
        let executors: Vec<Arc<Executor>> = self.state.lock().all.values().cloned().collect();
        executors.iter().any(|e| e.stop(request_id))
    }

    /// Snapshot of the counters / 计数器快照
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let average_execution_time_ms = if state.executed == 0 {
            0.0
        } else {
            state.total_duration_ms as f64 / state.executed as f64
        };
        PoolStats {
            total: state.all.len(),
            active: state.active.len(),
            idle: state.idle.len(),
            waiting: state.waiters.len(),
            executed: state.executed,
            failed: state.failed,
            average_execution_time_ms,
            created: state.created,
            destroyed: state.destroyed,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Reject queued callers, drain active executions, then discard every executor
    /// 拒绝排队的调用方，等待活跃执行结束，然后丢弃所有执行器
    pub async fn shutdown(&self) {
        let waiters = {
            let mut state = self.state.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            std::mem::take(&mut state.waiters)
        };

        info!(rejected = waiters.len(), "Shutting down executor pool");
        for waiter in waiters {
            let _ = waiter.tx.send(Err(DispatchError::PoolShuttingDown));
        }

        let deadline = Instant::now() + Duration::from_millis(self.config.shutdown_timeout_ms);
        let poll = Duration::from_millis(self.config.shutdown_poll_interval_ms.max(1));
        loop {
            let active = self.state.lock().active.len();
            if active == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(active, "Shutdown deadline reached, discarding active executors");
                break;
            }
            tokio::time::sleep(poll).await;
        }

        let discarded: Vec<String> = {
            let mut state = self.state.lock();
            let ids: Vec<String> = state.all.keys().cloned().collect();
            state.all.clear();
            state.active.clear();
            state.idle.clear();
            state.destroyed += ids.len() as u64;
            ids
        };

        for executor_id in discarded {
            let _ = self.events.send(PoolEvent::ExecutorDestroyed { executor_id });
        }
        let _ = self.events.send(PoolEvent::Shutdown);
        info!("Executor pool shut down");
    }

    async fn acquire(&self) -> DispatchResult<Arc<Executor>> {
        let (waiter_id, rx) = {
            let mut state = self.state.lock();
            if state.shutting_down {
                return Err(DispatchError::PoolShuttingDown);
            }

            if let Some(executor) = state.idle.pop_back() {
                state.active.insert(executor.id().to_string());
                return Ok(executor);
            }

            if state.all.len() < self.config.max_size {
                let executor = self.create_executor(&mut state);
                state.active.insert(executor.id().to_string());
                return Ok(executor);
            }

            if state.waiters.len() >= self.config.max_queue_size {
                debug!(waiting = state.waiters.len(), "Executor queue is full");
                return Err(DispatchError::QueueFull {
                    limit: self.config.max_queue_size,
                });
            }

            let (tx, rx) = oneshot::channel();
            let waiter_id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.waiters.push_back(Waiter {
                id: waiter_id,
                tx,
                enqueued_at: Instant::now(),
            });
            (waiter_id, rx)
        };

        let mut pending = Pending {
            pool: self,
            waiter_id,
            rx,
            settled: false,
        };
        let grant = (&mut pending.rx).await;
        pending.settled = true;

        // A dropped sender only happens when the pool itself goes away
        grant.unwrap_or(Err(DispatchError::PoolShuttingDown))
    }

    fn release(&self, executor: &Arc<Executor>) {
        let mut destroyed = Vec::new();
        {
            let mut state = self.state.lock();
            // Already discarded by shutdown / 已被关闭流程丢弃
            if !state.active.remove(executor.id()) {
                return;
            }

            let mut handed_off = false;
            while let Some(waiter) = state.waiters.pop_front() {
                let waited = waiter.enqueued_at.elapsed();
                if waiter.tx.send(Ok(executor.clone())).is_ok() {
                    state.active.insert(executor.id().to_string());
                    debug!(
                        executor_id = %executor.id(),
                        waited_ms = waited.as_millis() as u64,
                        "Handed executor to queued caller"
                    );
                    handed_off = true;
                    break;
                }
            }
            if !handed_off {
                state.idle.push_back(executor.clone());
            }

            while state.idle.len() > self.config.min_size && state.all.len() > self.config.min_size
            {
                let Some(oldest) = state.idle.pop_front() else {
                    break;
                };
                state.all.remove(oldest.id());
                state.destroyed += 1;
                destroyed.push(oldest.id().to_string());
            }
        }

        for executor_id in destroyed {
            debug!(%executor_id, "Trimmed idle executor");
            let _ = self.events.send(PoolEvent::ExecutorDestroyed { executor_id });
        }
    }

    fn create_executor(&self, state: &mut PoolState) -> Arc<Executor> {
        let executor = Arc::new(Executor::new(
            self.registry.clone(),
            self.runtimes.clone(),
            self.executor_config.clone(),
        ));
        state
            .all
            .insert(executor.id().to_string(), executor.clone());
        state.created += 1;

        debug!(executor_id = %executor.id(), total = state.all.len(), "Created executor");
        let _ = self.events.send(PoolEvent::ExecutorCreated {
            executor_id: executor.id().to_string(),
        });
        executor
    }

    fn record(&self, result: &ExecutionResult) {
        let mut state = self.state.lock();
        state.executed += 1;
        if !result.success {
            state.failed += 1;
        }
        state.total_duration_ms += result.metrics.duration_ms;
    }
}
