//! Dispatch events
//! 分发事件
//!
//! Router and pool publish discrete events on a tokio broadcast channel, sent right
//! after the state change they describe. Subscribers that lag simply miss events.
//! 路由器和池通过 tokio broadcast 通道发布离散事件，在对应状态变更之后立即发送。

use serde::{Deserialize, Serialize};

use super::router::RouteDefinition;

/// Broadcast channel capacity / 广播通道容量
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Route table events / 路由表事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RouteEvent {
    RouteAdded { route: RouteDefinition },
    RouteRemoved { path: String },
    RouteUpdated { route: RouteDefinition },
}

/// Executor pool events / 执行器池事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PoolEvent {
    ExecutorCreated { executor_id: String },
    ExecutorDestroyed { executor_id: String },
    Shutdown,
}
