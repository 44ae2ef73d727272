//! Shared fixtures for integration tests / 集成测试共享夹具

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use edge_dispatch::config::ExecutorConfig;
use edge_dispatch::{FunctionMetadata, InMemoryFunctionRegistry, RuntimeTable};

/// Registry plus strategy table built from one executor config
/// 由同一执行器配置构建的注册表与策略表
pub struct Fixture {
    pub config: ExecutorConfig,
    pub registry: Arc<InMemoryFunctionRegistry>,
    pub runtimes: Arc<RuntimeTable>,
}

impl Fixture {
    pub fn new(config: ExecutorConfig) -> Self {
        let runtimes = Arc::new(RuntimeTable::new(&config));
        Self {
            config,
            registry: Arc::new(InMemoryFunctionRegistry::new()),
            runtimes,
        }
    }

    pub fn register(&self, id: &str, runtime: &str) {
        self.registry
            .register(FunctionMetadata::new(id, id, "v1", runtime));
    }
}

/// Whether an interpreter can be launched on this host / 本机是否可以启动该解释器
pub fn interpreter_available(bin: &str) -> bool {
    std::process::Command::new(bin)
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Write `<root>/<function_id>/<version>/<file>` / 写入函数入口文件
pub fn write_function(root: &Path, function_id: &str, version: &str, file: &str, source: &str) {
    let dir = root.join(function_id).join(version);
    std::fs::create_dir_all(&dir).expect("create function dir");
    std::fs::write(dir.join(file), source).expect("write entrypoint");
}
