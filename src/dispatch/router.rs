//! Route Table and Matcher
//! 路由表与匹配器
//!
//! The router keeps an ordered table of route definitions and matches request
//! descriptors (path, method, region) against it.
//! 路由器维护有序的路由定义表，并用请求描述（路径、方法、区域）进行匹配。
//!
//! ## Matching / 匹配
//!
//! Every enabled route that accepts the method, the region and the path becomes a
//! candidate with a score:
//! 每条接受该方法、区域和路径的启用路由都会成为候选，并获得一个分数：
//!
//! ```text
//! priority * 1000 + (10 - params) * 100 + 50 (exact region) + 10 (< 5 methods)
//! ```
//!
//! The highest score wins. Several routes sharing the top score are load balanced by
//! weighted random selection.
//! 分数最高者胜出；若多条路由并列最高分，则按权重随机选择以实现负载均衡。

use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::events::{RouteEvent, EVENT_CHANNEL_CAPACITY};
use super::pattern::PathPattern;
use super::registry::{FunctionMetadata, FunctionRegistry};
use super::{DispatchError, DispatchResult};
use crate::config::RouterConfig;

/// Methods a route accepts when none are declared / 未声明时路由接受的方法
pub const DEFAULT_METHODS: [&str; 5] = ["GET", "POST", "PUT", "DELETE", "PATCH"];

/// Region name used for requests and routes without a region / 无区域时使用的名称
pub const DEFAULT_REGION: &str = "default";

fn default_weight() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

/// Route definition / 路由定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDefinition {
    /// Path pattern, `:name` segments capture parameters / 路径模式，`:name` 捕获参数
    pub path: String,
    /// Target function ID / 目标函数 ID
    pub function_id: String,
    /// Accepted HTTP methods / 接受的 HTTP 方法
    #[serde(default)]
    pub methods: Vec<String>,
    /// Priority, higher wins / 优先级，越高越优先
    #[serde(default)]
    pub priority: i32,
    /// Region restriction / 区域限制
    #[serde(default)]
    pub region: Option<String>,
    /// Load-balancing weight / 负载均衡权重
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Whether the route takes part in matching / 是否参与匹配
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl RouteDefinition {
    pub fn new(path: impl Into<String>, function_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            function_id: function_id.into(),
            methods: Vec::new(),
            priority: 0,
            region: None,
            weight: default_weight(),
            enabled: default_enabled(),
        }
    }

    pub fn with_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods = methods.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn validate(&self) -> DispatchResult<()> {
        if self.path.trim().is_empty() {
            return Err(DispatchError::InvalidRoute {
                message: "path must not be empty".to_string(),
            });
        }
        if self.function_id.trim().is_empty() {
            return Err(DispatchError::InvalidRoute {
                message: format!("function_id must not be empty for path {}", self.path),
            });
        }
        Ok(())
    }

    fn normalize(&mut self) {
        if self.methods.is_empty() {
            self.methods = DEFAULT_METHODS.iter().map(|m| m.to_string()).collect();
        } else {
            self.methods = self.methods.iter().map(|m| m.to_ascii_uppercase()).collect();
        }
        if self.weight == 0 {
            self.weight = default_weight();
        }
    }

    fn accepts_method(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }
}

/// Partial route update / 路由的部分更新
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteUpdate {
    pub path: Option<String>,
    pub function_id: Option<String>,
    pub methods: Option<Vec<String>>,
    pub priority: Option<i32>,
    /// `Some(None)` clears the region / `Some(None)` 清除区域限制
    pub region: Option<Option<String>>,
    pub weight: Option<u32>,
    pub enabled: Option<bool>,
}

impl RouteUpdate {
    fn apply_to(self, route: &mut RouteDefinition) {
        if let Some(path) = self.path {
            route.path = path;
        }
        if let Some(function_id) = self.function_id {
            route.function_id = function_id;
        }
        if let Some(methods) = self.methods {
            route.methods = methods;
        }
        if let Some(priority) = self.priority {
            route.priority = priority;
        }
        if let Some(region) = self.region {
            route.region = region;
        }
        if let Some(weight) = self.weight {
            route.weight = weight;
        }
        if let Some(enabled) = self.enabled {
            route.enabled = enabled;
        }
    }
}

/// Request descriptor to match / 待匹配的请求描述
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchRequest {
    pub path: String,
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub query: HashMap<String, String>,
    pub region: Option<String>,
}

impl MatchRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method: method.into(),
            ..Default::default()
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    fn cache_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.method.to_ascii_uppercase(),
            self.path,
            self.region.as_deref().unwrap_or(DEFAULT_REGION)
        )
    }
}

/// Successful match / 匹配结果
#[derive(Debug, Clone, PartialEq)]
pub struct RouteMatch {
    /// Winning route / 胜出的路由
    pub route: RouteDefinition,
    /// Resolved function / 解析出的函数
    pub function: Arc<FunctionMetadata>,
    /// Extracted path parameters / 提取的路径参数
    pub params: HashMap<String, String>,
}

/// Route table statistics / 路由表统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteStats {
    pub total: usize,
    pub enabled: usize,
    pub disabled: usize,
    pub by_method: BTreeMap<String, usize>,
    pub by_region: BTreeMap<String, usize>,
}

#[derive(Debug, Clone)]
struct RouteEntry {
    route: RouteDefinition,
    pattern: PathPattern,
}

impl RouteEntry {
    fn new(route: RouteDefinition) -> Self {
        let pattern = PathPattern::compile(&route.path);
        Self { route, pattern }
    }
}

#[derive(Debug, Default)]
struct RouterState {
    routes: Vec<RouteEntry>,
    cache: HashMap<String, Option<RouteMatch>>,
    /// Bumped on every table mutation / 每次路由表变更时递增
    generation: u64,
}

impl RouterState {
    fn invalidate(&mut self) {
        self.cache.clear();
        self.generation += 1;
    }

    fn sort(&mut self) {
        // Stable: equal priorities keep insertion order
        self.routes
            .sort_by(|a, b| b.route.priority.cmp(&a.route.priority));
    }
}

#[derive(Debug)]
struct Candidate {
    index: usize,
    score: i64,
    params: HashMap<String, String>,
}

/// Outcome of a table scan / 路由表扫描结果
#[derive(Debug)]
struct Selection {
    route: RouteDefinition,
    params: HashMap<String, String>,
    /// Decided by a weighted tie-break / 由加权随机决定
    weighted: bool,
}

/// Score a candidate / 计算候选分数
pub fn score(route: &RouteDefinition, param_count: usize, request_region: Option<&str>) -> i64 {
    let mut score = i64::from(route.priority) * 1000 + (10 - param_count as i64) * 100;
    if route.region.is_some() && route.region.as_deref() == request_region {
        score += 50;
    }
    if route.methods.len() < DEFAULT_METHODS.len() {
        score += 10;
    }
    score
}

/// Route table and matcher / 路由表与匹配器
pub struct Router {
    /// Function registry / 函数注册表
    registry: Arc<dyn FunctionRegistry>,
    /// Configuration / 配置
    config: RouterConfig,
    /// Route table, match cache and generation / 路由表、匹配缓存与代数
    state: RwLock<RouterState>,
    /// Event channel / 事件通道
    events: broadcast::Sender<RouteEvent>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Router")
            .field("config", &self.config)
            .field("routes", &state.routes.len())
            .field("cached", &state.cache.len())
            .finish()
    }
}

impl Router {
    /// Create a new router / 创建新的路由器
    pub fn new(registry: Arc<dyn FunctionRegistry>, config: RouterConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            registry,
            config,
            state: RwLock::new(RouterState::default()),
            events,
        }
    }

    /// Subscribe to route events / 订阅路由事件
    pub fn subscribe(&self) -> broadcast::Receiver<RouteEvent> {
        self.events.subscribe()
    }

    /// Add a route / 添加路由
    pub fn add_route(&self, mut route: RouteDefinition) -> DispatchResult<()> {
        route.validate()?;
        route.normalize();

        {
            let mut state = self.state.write();
            state.routes.push(RouteEntry::new(route.clone()));
            state.sort();
            state.invalidate();
        }

        info!(
            path = %route.path,
            function_id = %route.function_id,
            priority = route.priority,
            "Route added"
        );
        let _ = self.events.send(RouteEvent::RouteAdded { route });
        Ok(())
    }

    /// Remove the first route with the given path / 移除第一条匹配路径的路由
    pub fn remove_route(&self, path: &str) -> bool {
        let removed = {
            let mut state = self.state.write();
            match state.routes.iter().position(|e| e.route.path == path) {
                Some(index) => {
                    state.routes.remove(index);
                    state.invalidate();
                    true
                }
                None => false,
            }
        };

        if removed {
            info!(%path, "Route removed");
            let _ = self.events.send(RouteEvent::RouteRemoved {
                path: path.to_string(),
            });
        }
        removed
    }

    /// Merge fields into the first route with the given path
    /// 将字段合并到第一条匹配路径的路由
    pub fn update_route(&self, path: &str, update: RouteUpdate) -> DispatchResult<bool> {
        let updated = {
            let mut state = self.state.write();
            let Some(index) = state.routes.iter().position(|e| e.route.path == path) else {
                return Ok(false);
            };

            let mut route = state.routes[index].route.clone();
            update.apply_to(&mut route);
            route.validate()?;
            route.normalize();

            state.routes[index] = RouteEntry::new(route.clone());
            state.sort();
            state.invalidate();
            route
        };

        info!(%path, new_path = %updated.path, "Route updated");
        let _ = self.events.send(RouteEvent::RouteUpdated { route: updated });
        Ok(true)
    }

    /// Copy of the route table in match order / 按匹配顺序返回路由表副本
    pub fn get_routes(&self) -> Vec<RouteDefinition> {
        self.state
            .read()
            .routes
            .iter()
            .map(|e| e.route.clone())
            .collect()
    }

    /// Drop all cached matches / 清空匹配缓存
    pub fn clear_cache(&self) {
        self.state.write().cache.clear();
    }

    /// Number of cached match results / 已缓存的匹配结果数
    pub fn cached_matches(&self) -> usize {
        self.state.read().cache.len()
    }

    /// Match a request; `None` means no route applies
    /// 匹配请求；`None` 表示没有适用的路由
    pub async fn match_route(&self, request: &MatchRequest) -> Option<RouteMatch> {
        let key = request.cache_key();

        let (generation, selection) = {
            let state = self.state.read();
            if let Some(cached) = state.cache.get(&key) {
                debug!(%key, hit = cached.is_some(), "Route cache hit");
                return cached.clone();
            }
            (state.generation, Self::select(&state.routes, request))
        };

        let Some(selection) = selection else {
            debug!(%key, "No route matched");
            self.store(generation, key, None);
            return None;
        };

        // A withdrawn function is an absence, and is not cached: the registry can change
        // without the table changing.
        let Some(function) = self.registry.lookup(&selection.route.function_id).await else {
            debug!(
                %key,
                function_id = %selection.route.function_id,
                "Route target function not found"
            );
            return None;
        };

        let route_match = RouteMatch {
            route: selection.route,
            function,
            params: selection.params,
        };

        if !selection.weighted {
            self.store(generation, key, Some(route_match.clone()));
        }
        Some(route_match)
    }

    fn store(&self, generation: u64, key: String, value: Option<RouteMatch>) {
        let mut state = self.state.write();
        // The table changed while we were resolving; the result may be stale
        if state.generation != generation {
            return;
        }
        if state.cache.len() >= self.config.match_cache_capacity {
            state.cache.clear();
        }
        state.cache.insert(key, value);
    }

    fn select(routes: &[RouteEntry], request: &MatchRequest) -> Option<Selection> {
        let request_region = request.region.as_deref();
        let mut candidates: Vec<Candidate> = routes
            .iter()
            .enumerate()
            .filter(|(_, e)| e.route.enabled)
            .filter(|(_, e)| e.route.accepts_method(&request.method))
            .filter(|(_, e)| match (e.route.region.as_deref(), request_region) {
                (Some(route_region), Some(region)) => route_region == region,
                _ => true,
            })
            .filter_map(|(index, e)| {
                let params = e.pattern.matches(&request.path)?;
                Some(Candidate {
                    index,
                    score: score(&e.route, params.len(), request_region),
                    params,
                })
            })
            .collect();

        candidates.sort_by(|a, b| b.score.cmp(&a.score));
        let top_score = candidates.first()?.score;
        let tied = candidates.iter().take_while(|c| c.score == top_score).count();

        let (winner, weighted) = if tied == 1 {
            (candidates.swap_remove(0), false)
        } else {
            candidates.truncate(tied);
            let index = Self::weighted_pick(routes, &candidates);
            (candidates.swap_remove(index), true)
        };

        Some(Selection {
            route: routes[winner.index].route.clone(),
            params: winner.params,
            weighted,
        })
    }

    /// Weighted random pick among tied candidates / 在并列候选中按权重随机选择
    fn weighted_pick(routes: &[RouteEntry], tied: &[Candidate]) -> usize {
        let total: f64 = tied
            .iter()
            .map(|c| f64::from(routes[c.index].route.weight))
            .sum();
        let mut remaining = rand::thread_rng().gen::<f64>() * total;

        for (i, candidate) in tied.iter().enumerate() {
            remaining -= f64::from(routes[candidate.index].route.weight);
            if remaining <= 0.0 {
                return i;
            }
        }
        tied.len() - 1
    }

    /// Aggregate table statistics / 汇总路由表统计
    pub fn get_stats(&self) -> RouteStats {
        let state = self.state.read();
        let mut stats = RouteStats {
            total: state.routes.len(),
            ..Default::default()
        };

        for entry in &state.routes {
            let route = &entry.route;
            if route.enabled {
                stats.enabled += 1;
            } else {
                stats.disabled += 1;
            }
            for method in &route.methods {
                *stats.by_method.entry(method.clone()).or_insert(0) += 1;
            }
            let region = route.region.as_deref().unwrap_or(DEFAULT_REGION);
            *stats.by_region.entry(region.to_string()).or_insert(0) += 1;
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::registry::InMemoryFunctionRegistry;

    fn router_with(functions: &[&str]) -> (Router, Arc<InMemoryFunctionRegistry>) {
        let registry = Arc::new(InMemoryFunctionRegistry::new());
        for id in functions {
            registry.register(FunctionMetadata::new(*id, *id, "v1", "native"));
        }
        (
            Router::new(registry.clone(), RouterConfig::default()),
            registry,
        )
    }

    #[test]
    fn test_add_route_applies_defaults() {
        let (router, _) = router_with(&[]);
        router
            .add_route(RouteDefinition::new("/hello", "hello").with_weight(0))
            .unwrap();

        let routes = router.get_routes();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].methods, DEFAULT_METHODS.to_vec());
        assert_eq!(routes[0].priority, 0);
        assert_eq!(routes[0].weight, 1);
        assert!(routes[0].enabled);
    }

    #[test]
    fn test_add_route_rejects_empty_fields() {
        let (router, _) = router_with(&[]);
        let err = router.add_route(RouteDefinition::new("", "hello")).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidRoute { .. }));
        let err = router.add_route(RouteDefinition::new("/x", " ")).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidRoute { .. }));
        assert!(router.get_routes().is_empty());
    }

    #[test]
    fn test_priority_sort_is_stable() {
        let (router, _) = router_with(&[]);
        router.add_route(RouteDefinition::new("/a", "a")).unwrap();
        router
            .add_route(RouteDefinition::new("/b", "b").with_priority(5))
            .unwrap();
        router.add_route(RouteDefinition::new("/c", "c")).unwrap();

        let paths: Vec<_> = router.get_routes().into_iter().map(|r| r.path).collect();
        assert_eq!(paths, vec!["/b", "/a", "/c"]);
    }

    #[test]
    fn test_score_tiers() {
        let mut route = RouteDefinition::new("/users/:id", "users").with_priority(1);
        route.normalize();
        assert_eq!(score(&route, 1, None), 1000 + 900);

        let mut narrow = RouteDefinition::new("/users/:id", "users")
            .with_methods(["GET"])
            .with_region("eu");
        narrow.normalize();
        assert_eq!(score(&narrow, 1, Some("eu")), 900 + 50 + 10);
        assert_eq!(score(&narrow, 1, None), 900 + 10);
    }

    #[tokio::test]
    async fn test_match_extracts_params() {
        let (router, _) = router_with(&["users", "orders"]);
        router.add_route(RouteDefinition::new("/users/:id", "users")).unwrap();
        router
            .add_route(RouteDefinition::new("/users/:id/orders/:orderId", "orders"))
            .unwrap();

        let m = router
            .match_route(&MatchRequest::new("GET", "/users/42"))
            .await
            .unwrap();
        assert_eq!(m.function.id, "users");
        assert_eq!(m.params.get("id").map(String::as_str), Some("42"));

        let m = router
            .match_route(&MatchRequest::new("GET", "/users/7/orders/99"))
            .await
            .unwrap();
        assert_eq!(m.function.id, "orders");
        assert_eq!(m.params["id"], "7");
        assert_eq!(m.params["orderId"], "99");
    }

    #[tokio::test]
    async fn test_literal_beats_parameterized_at_equal_priority() {
        let (router, _) = router_with(&["by-id", "me"]);
        router.add_route(RouteDefinition::new("/users/:id", "by-id")).unwrap();
        router.add_route(RouteDefinition::new("/users/me", "me")).unwrap();

        let m = router
            .match_route(&MatchRequest::new("GET", "/users/me"))
            .await
            .unwrap();
        assert_eq!(m.function.id, "me");
    }

    #[tokio::test]
    async fn test_method_and_region_filters() {
        let (router, _) = router_with(&["write", "eu"]);
        router
            .add_route(RouteDefinition::new("/items", "write").with_methods(["post"]))
            .unwrap();
        router
            .add_route(RouteDefinition::new("/local", "eu").with_region("eu-west"))
            .unwrap();

        assert!(router
            .match_route(&MatchRequest::new("GET", "/items"))
            .await
            .is_none());
        assert!(router
            .match_route(&MatchRequest::new("POST", "/items"))
            .await
            .is_some());

        assert!(router
            .match_route(&MatchRequest::new("GET", "/local").with_region("us-east"))
            .await
            .is_none());
        assert!(router
            .match_route(&MatchRequest::new("GET", "/local").with_region("eu-west"))
            .await
            .is_some());
        // Requests without a region are not excluded by a region-restricted route
        assert!(router
            .match_route(&MatchRequest::new("GET", "/local"))
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_disabled_route_is_skipped() {
        let (router, _) = router_with(&["a"]);
        router
            .add_route(RouteDefinition::new("/a", "a").disabled())
            .unwrap();
        assert!(router
            .match_route(&MatchRequest::new("GET", "/a"))
            .await
            .is_none());

        let updated = router
            .update_route(
                "/a",
                RouteUpdate {
                    enabled: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(updated);
        assert!(router
            .match_route(&MatchRequest::new("GET", "/a"))
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_registry_miss_is_no_match_and_not_cached() {
        let (router, registry) = router_with(&[]);
        router.add_route(RouteDefinition::new("/late", "late")).unwrap();

        let request = MatchRequest::new("GET", "/late");
        assert!(router.match_route(&request).await.is_none());
        assert_eq!(router.cached_matches(), 0);

        registry.register(FunctionMetadata::new("late", "late", "v1", "native"));
        assert!(router.match_route(&request).await.is_some());
        assert_eq!(router.cached_matches(), 1);
    }

    #[test]
    fn test_remove_and_update_missing_route() {
        let (router, _) = router_with(&[]);
        assert!(!router.remove_route("/nothing"));
        assert!(!router
            .update_route("/nothing", RouteUpdate::default())
            .unwrap());
    }

    #[test]
    fn test_update_rejects_invalid_merge() {
        let (router, _) = router_with(&[]);
        router.add_route(RouteDefinition::new("/a", "a")).unwrap();
        let err = router
            .update_route(
                "/a",
                RouteUpdate {
                    function_id: Some(String::new()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidRoute { .. }));
        assert_eq!(router.get_routes()[0].function_id, "a");
    }

    #[test]
    fn test_stats() {
        let (router, _) = router_with(&[]);
        router
            .add_route(RouteDefinition::new("/a", "a").with_methods(["GET"]))
            .unwrap();
        router
            .add_route(
                RouteDefinition::new("/b", "b")
                    .with_methods(["GET", "POST"])
                    .with_region("eu")
                    .disabled(),
            )
            .unwrap();

        let stats = router.get_stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.enabled, 1);
        assert_eq!(stats.disabled, 1);
        assert_eq!(stats.by_method.get("GET"), Some(&2));
        assert_eq!(stats.by_method.get("POST"), Some(&1));
        assert_eq!(stats.by_region.get("default"), Some(&1));
        assert_eq!(stats.by_region.get("eu"), Some(&1));
    }
}
