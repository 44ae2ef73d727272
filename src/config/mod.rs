//! Configuration management for the dispatch engine
//! 分发引擎的配置管理
//!
//! Configuration is layered with figment:
//! 配置通过 figment 分层加载：
//! - Default values / 默认值
//! - Configuration file (TOML) / 配置文件（TOML）
//! - Environment variables (`EDGE_` prefix, `__` for nesting) / 环境变量（`EDGE_` 前缀，`__` 表示嵌套）

use anyhow::{bail, Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub mod base;
pub use base::*;

/// Default configuration file name / 默认配置文件名
pub const DEFAULT_CONFIG_FILE: &str = "edge-dispatch.toml";

/// Environment variable prefix / 环境变量前缀
pub const ENV_PREFIX: &str = "EDGE_";

/// Base configuration trait / 基础配置特征
///
/// Precedence order (highest to lowest):
/// 优先级顺序（从高到低）：
/// 1. Environment variables / 环境变量
/// 2. Configuration file / 配置文件
/// 3. Default values / 默认值
pub trait AppConfig: for<'de> Deserialize<'de> + Serialize + Clone + std::fmt::Debug {
    /// Load configuration from the default file and the environment
    /// 从默认文件和环境变量加载配置
    fn load() -> Result<Self> {
        Self::load_from_file(Path::new(DEFAULT_CONFIG_FILE))
    }

    /// Load configuration from a specific file
    /// 从特定文件加载配置
    fn load_from_file(path: &Path) -> Result<Self> {
        let config: Self = Figment::new()
            .merge(Serialized::defaults(Self::default_config()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Get default configuration values
    /// 获取默认配置值
    fn default_config() -> Self;

    /// Validate the configuration
    /// 验证配置
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Top-level dispatch engine configuration / 分发引擎顶层配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DispatchConfig {
    /// Logging configuration / 日志配置
    pub logging: LogConfig,
    /// Router configuration / 路由器配置
    pub router: RouterConfig,
    /// Pool configuration / 池配置
    pub pool: PoolConfig,
    /// Executor configuration / 执行器配置
    pub executor: ExecutorConfig,
}

impl AppConfig for DispatchConfig {
    fn default_config() -> Self {
        Self::default()
    }

    fn validate(&self) -> Result<()> {
        if self.pool.max_size == 0 {
            bail!("pool.max_size must be greater than 0");
        }
        if self.pool.min_size > self.pool.max_size {
            bail!(
                "pool.min_size ({}) must not exceed pool.max_size ({})",
                self.pool.min_size,
                self.pool.max_size
            );
        }
        if self.executor.default_timeout_ms == 0 {
            bail!("executor.default_timeout_ms must be greater than 0");
        }
        if self.executor.result_sentinel.trim().is_empty() {
            bail!("executor.result_sentinel must not be empty");
        }
        Ok(())
    }
}

/// Common logging configuration / 通用日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) / 日志级别
    pub level: String,
    /// Log format (json, compact, pretty) / 日志格式
    pub format: String,
    /// Enable file logging / 启用文件日志
    pub file_enabled: bool,
    /// Log file path / 日志文件路径
    pub file_path: Option<PathBuf>,
}

static FILE_LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_enabled: false,
            file_path: None,
        }
    }
}

type BoxedLayer = Box<dyn tracing_subscriber::Layer<tracing_subscriber::Registry> + Send + Sync>;

fn fmt_layer<W>(format: &str, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> tracing_subscriber::fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    use tracing_subscriber::Layer;

    let layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .with_level(true)
        .with_ansi(ansi)
        .with_writer(writer);

    match format {
        "json" => layer.json().boxed(),
        "compact" => layer.compact().boxed(),
        _ => layer.pretty().boxed(),
    }
}

/// Initialize tracing based on logging configuration
/// 基于日志配置初始化跟踪
///
/// A second call is a no-op, so tests and embedders may call it freely.
/// 重复调用不会产生效果。
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if config.level.trim().is_empty() {
            EnvFilter::new("info")
        } else {
            EnvFilter::new(config.level.clone())
        }
    });

    let mut layers: Vec<BoxedLayer> = vec![fmt_layer(&config.format, std::io::stdout, true)];

    if config.file_enabled {
        if let Some(path) = config.file_path.as_ref() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create log dir: {}", parent.display()))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file: {}", path.display()))?;
            let (file_writer, guard) = tracing_appender::non_blocking(file);
            let _ = FILE_LOG_GUARD.set(guard);

            let file_format = if config.format == "json" { "json" } else { "compact" };
            layers.push(fmt_layer(file_format, file_writer, false));
        }
    }

    if tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already installed");
    }

    Ok(())
}
