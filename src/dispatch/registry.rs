//! Function registry and function store
//! 函数注册表与函数存储
//!
//! Both are external collaborators: the registry answers metadata lookups, the store
//! describes where deployed code lives on disk. The dispatch engine only reads them.
//! 两者均为外部协作者：注册表负责元数据查询，存储描述已部署代码在磁盘上的位置。
//! 分发引擎只读取它们。

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::runtime::RuntimeKind;

/// Function metadata / 函数元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionMetadata {
    /// Function ID / 函数 ID
    pub id: String,
    /// Function name / 函数名称
    pub name: String,
    /// Current version / 当前版本
    pub version: String,
    /// Runtime identifier (e.g. "python", "node", "native")
    /// 运行时标识（如 "python"、"node"、"native"）
    pub runtime: String,
    /// Environment variables / 环境变量
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl FunctionMetadata {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        runtime: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            runtime: runtime.into(),
            env: HashMap::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Function metadata lookup / 函数元数据查询
#[async_trait]
pub trait FunctionRegistry: Send + Sync {
    /// Resolve a function by ID; `None` when it is not (or no longer) deployed
    /// 按 ID 解析函数；未部署（或已下线）时返回 `None`
    async fn lookup(&self, function_id: &str) -> Option<Arc<FunctionMetadata>>;
}

/// In-memory function registry / 内存函数注册表
#[derive(Debug, Default)]
pub struct InMemoryFunctionRegistry {
    functions: DashMap<String, Arc<FunctionMetadata>>,
}

impl InMemoryFunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a function / 注册或替换函数
    pub fn register(&self, metadata: FunctionMetadata) {
        debug!(function_id = %metadata.id, version = %metadata.version, "Registering function");
        self.functions
            .insert(metadata.id.clone(), Arc::new(metadata));
    }

    /// Withdraw a function / 下线函数
    pub fn remove(&self, function_id: &str) -> bool {
        self.functions.remove(function_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[async_trait]
impl FunctionRegistry for InMemoryFunctionRegistry {
    async fn lookup(&self, function_id: &str) -> Option<Arc<FunctionMetadata>> {
        self.functions.get(function_id).map(|f| f.value().clone())
    }
}

/// Persisted function layout: `<root>/<function_id>/<version>/<entrypoint>`
/// 持久化函数布局：`<root>/<function_id>/<version>/<entrypoint>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionStore {
    root: PathBuf,
}

impl FunctionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one deployed version / 某个已部署版本所在目录
    pub fn version_dir(&self, function_id: &str, version: &str) -> PathBuf {
        self.root.join(function_id).join(version)
    }

    /// Entrypoint file for a runtime, if the runtime loads code from disk
    /// 运行时对应的入口文件（仅适用于从磁盘加载代码的运行时）
    pub fn entrypoint(&self, function_id: &str, version: &str, kind: RuntimeKind) -> Option<PathBuf> {
        kind.entrypoint_file()
            .map(|file| self.version_dir(function_id, version).join(file))
    }
}
