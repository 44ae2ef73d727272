//! Base configuration structures and utilities
//! 基础配置结构和工具

use serde::{Deserialize, Serialize};

/// Base logging configuration / 基础日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level / 日志级别
    pub level: String,
    /// Log format / 日志格式
    pub format: String,
    /// Log output file / 日志输出文件
    pub file: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}

impl LogConfig {
    /// Convert to the common LoggingConfig used by init_tracing
    /// 转换为init_tracing使用的通用LoggingConfig
    pub fn to_logging_config(&self) -> crate::config::LoggingConfig {
        crate::config::LoggingConfig {
            level: self.level.clone(),
            format: self.format.clone(),
            file_enabled: self.file.is_some(),
            file_path: self.file.as_ref().map(std::path::PathBuf::from),
        }
    }
}

/// Router configuration / 路由器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Maximum cached match results before the cache is reset
    /// 匹配缓存在重置前的最大条目数
    pub match_cache_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            match_cache_capacity: 1024,
        }
    }
}

/// Executor pool configuration / 执行器池配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Executors kept alive when idle / 空闲时保留的执行器数
    pub min_size: usize,
    /// Hard cap on executors / 执行器数量上限
    pub max_size: usize,
    /// Pending acquisitions allowed while saturated / 饱和时允许排队的请求数
    pub max_queue_size: usize,
    /// Drain deadline during shutdown / 关闭时的排空期限
    pub shutdown_timeout_ms: u64,
    /// Poll interval while draining / 排空时的轮询间隔
    pub shutdown_poll_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            max_queue_size: 100,
            shutdown_timeout_ms: 10000, // 10 seconds
            shutdown_poll_interval_ms: 100,
        }
    }
}

/// Executor configuration / 执行器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Timeout applied when a request carries none / 请求未指定时的默认超时
    pub default_timeout_ms: u64,
    /// Root of the persisted function layout / 函数存储根目录
    pub functions_dir: String,
    /// Python interpreter / Python 解释器
    pub python_bin: String,
    /// Node.js interpreter / Node.js 解释器
    pub node_bin: String,
    /// Ruby interpreter / Ruby 解释器
    pub ruby_bin: String,
    /// Host variables passed through to child processes / 传递给子进程的宿主环境变量
    pub env_whitelist: Vec<String>,
    /// Capabilities the native sandbox may call / 原生沙箱允许调用的能力
    pub allowed_capabilities: Vec<String>,
    /// Marker prefixing the result line of a wrapper script / 包装脚本结果行的标记前缀
    pub result_sentinel: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30000, // 30 seconds
            functions_dir: "./functions".to_string(),
            python_bin: "python3".to_string(),
            node_bin: "node".to_string(),
            ruby_bin: "ruby".to_string(),
            env_whitelist: vec!["PATH".to_string(), "HOME".to_string(), "LANG".to_string()],
            allowed_capabilities: Vec::new(),
            result_sentinel: "__EDGE_RESULT__:".to_string(),
        }
    }
}
