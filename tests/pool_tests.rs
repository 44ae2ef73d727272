//! Executor pool integration tests / 执行器池集成测试

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::Fixture;
use edge_dispatch::config::{ExecutorConfig, PoolConfig};
use edge_dispatch::{handler_fn, DispatchError, ExecutionRequest, ExecutorPool, PoolEvent};
use serde_json::{json, Value};

fn pool_config(min_size: usize, max_size: usize, max_queue_size: usize) -> PoolConfig {
    PoolConfig {
        min_size,
        max_size,
        max_queue_size,
        shutdown_timeout_ms: 5000,
        shutdown_poll_interval_ms: 10,
    }
}

/// Fixture with a `sleep` function that waits `event.ms` milliseconds
/// 带有 `sleep` 函数的夹具，该函数等待 `event.ms` 毫秒
fn sleeping_fixture() -> Fixture {
    let fixture = Fixture::new(ExecutorConfig::default());
    fixture.register("sleep", "native");
    fixture.runtimes.native().register_handler(
        "sleep",
        handler_fn(|event, _| async move {
            let ms = event["ms"].as_u64().unwrap_or(100);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, String>(json!({ "slept": ms }))
        }),
    );
    fixture
}

fn build(fixture: &Fixture, config: PoolConfig) -> Arc<ExecutorPool> {
    Arc::new(
        ExecutorPool::new(
            config,
            fixture.registry.clone(),
            fixture.runtimes.clone(),
            fixture.config.clone(),
        )
        .unwrap(),
    )
}

fn sleep_request(ms: u64) -> ExecutionRequest {
    ExecutionRequest::new("sleep").with_event(json!({ "ms": ms }))
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_never_exceeds_max_size() {
    let fixture = Fixture::new(ExecutorConfig::default());
    fixture.register("count", "native");

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    {
        let current = current.clone();
        let peak = peak.clone();
        fixture.runtimes.native().register_handler(
            "count",
            handler_fn(move |_, _| {
                let current = current.clone();
                let peak = peak.clone();
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(Value::Null)
                }
            }),
        );
    }

    let pool = build(&fixture, pool_config(2, 4, 10));
    let started = Instant::now();
    let calls: Vec<_> = (0..10)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.execute(ExecutionRequest::new("count")).await })
        })
        .collect();

    let results = futures::future::join_all(calls).await;
    for result in results {
        assert!(result.unwrap().unwrap().success);
    }

    assert!(peak.load(Ordering::SeqCst) <= 4);
    // 10 calls through 4 slots need at least three 50ms rounds
    assert!(started.elapsed() >= Duration::from_millis(150));

    let stats = pool.stats();
    assert_eq!(stats.executed, 10);
    assert!(stats.total <= 4);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.waiting, 0);
}

#[tokio::test]
async fn test_queue_full_fails_immediately() {
    let fixture = sleeping_fixture();
    let pool = build(&fixture, pool_config(1, 1, 2));

    let mut running = Vec::new();
    for _ in 0..3 {
        let pool = pool.clone();
        running.push(tokio::spawn(async move { pool.execute(sleep_request(300)).await }));
    }
    wait_until(|| {
        let stats = pool.stats();
        stats.active == 1 && stats.waiting == 2
    })
    .await;

    let started = Instant::now();
    let err = pool.execute(sleep_request(1)).await.unwrap_err();
    assert_eq!(err, DispatchError::QueueFull { limit: 2 });
    assert!(err.is_overloaded());
    assert!(started.elapsed() < Duration::from_millis(100));

    for call in running {
        assert!(call.await.unwrap().unwrap().success);
    }
}

#[tokio::test]
async fn test_queued_callers_served_in_fifo_order() {
    let fixture = sleeping_fixture();
    let pool = build(&fixture, pool_config(1, 1, 10));

    let busy = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.execute(sleep_request(100)).await })
    };
    wait_until(|| pool.stats().active == 1).await;

    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let mut queued = Vec::new();
    for i in 0..3u64 {
        let task_pool = pool.clone();
        let order = order.clone();
        queued.push(tokio::spawn(async move {
            let result = task_pool.execute(sleep_request(5)).await;
            order.lock().push(i);
            result
        }));
        wait_until(|| pool.stats().waiting as u64 == i + 1).await;
    }

    busy.await.unwrap().unwrap();
    for call in queued {
        call.await.unwrap().unwrap();
    }
    assert_eq!(*order.lock(), vec![0, 1, 2]);
}

#[tokio::test]
async fn test_trims_back_to_min_size() {
    let fixture = sleeping_fixture();
    let pool = build(&fixture, pool_config(2, 4, 10));
    let mut events = pool.subscribe();

    let burst: Vec<_> = (0..4)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.execute(sleep_request(100)).await })
        })
        .collect();
    wait_until(|| pool.stats().active == 4).await;
    assert_eq!(pool.stats().total, 4);

    for call in burst {
        call.await.unwrap().unwrap();
    }

    let stats = pool.stats();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.idle, 2);
    assert_eq!(stats.created, 4);
    assert_eq!(stats.destroyed, 2);

    // Sequential load does not shrink below the floor
    for _ in 0..3 {
        pool.execute(sleep_request(1)).await.unwrap();
    }
    assert_eq!(pool.stats().total, 2);

    let mut destroyed = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, PoolEvent::ExecutorDestroyed { .. }) {
            destroyed += 1;
        }
    }
    assert_eq!(destroyed, 2);
}

#[tokio::test]
async fn test_shutdown_rejects_waiters_and_drains_active() {
    let fixture = sleeping_fixture();
    let pool = build(&fixture, pool_config(1, 1, 5));

    let running = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.execute(sleep_request(200)).await })
    };
    wait_until(|| pool.stats().active == 1).await;

    let queued: Vec<_> = (0..2)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.execute(sleep_request(1)).await })
        })
        .collect();
    wait_until(|| pool.stats().waiting == 2).await;

    pool.shutdown().await;

    for call in queued {
        assert_eq!(
            call.await.unwrap().unwrap_err(),
            DispatchError::PoolShuttingDown
        );
    }
    // The active execution finished naturally during the drain
    assert!(running.await.unwrap().unwrap().success);

    let stats = pool.stats();
    assert_eq!(stats.total, 0);
    assert_eq!(stats.active, 0);
    assert!(pool.is_shutting_down());
    assert_eq!(
        pool.execute(sleep_request(1)).await.unwrap_err(),
        DispatchError::PoolShuttingDown
    );
}

#[tokio::test]
async fn test_stop_reaches_running_invocation() {
    let fixture = sleeping_fixture();
    let pool = build(&fixture, pool_config(1, 2, 2));

    let running = {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.execute(sleep_request(5000).with_request_id("long-one"))
                .await
        })
    };
    wait_until(|| pool.stats().active == 1).await;
    // Registration into the in-flight table happens after the registry lookup
    let deadline = Instant::now() + Duration::from_secs(5);
    while !pool.stop("long-one") {
        assert!(Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let result = running.await.unwrap().unwrap();
    assert!(!result.success);
    assert_eq!(result.error.unwrap().kind, edge_dispatch::FailureKind::Cancelled);
    assert!(!pool.stop("long-one"));
}
