//! 统一可观测性模块
//!
//! 提供 logging 与 metrics 的统一初始化。所有服务通过单一入口点配置，
//! 确保一致的日志格式和指标命名。

pub mod metrics;
pub mod tracing;

use ::tracing::info;
use anyhow::Result;

use crate::config::ObservabilityConfig;

/// 可观测性资源守卫
///
/// 需要在 `main` 中一直持有，drop 时记录关闭日志。
pub struct ObservabilityGuard {
    service_name: String,
    metrics_enabled: bool,
}

impl ObservabilityGuard {
    /// 创建一个空的 Guard（用于测试或禁用可观测性时）
    pub fn empty() -> Self {
        Self {
            service_name: String::new(),
            metrics_enabled: false,
        }
    }

    pub fn metrics_enabled(&self) -> bool {
        self.metrics_enabled
    }
}

impl Drop for ObservabilityGuard {
    fn drop(&mut self) {
        if !self.service_name.is_empty() {
            info!(service = %self.service_name, "Shutting down observability...");
        }
    }
}

/// 统一初始化可观测性
///
/// 初始化顺序：
/// 1. Tracing（日志）
/// 2. Metrics（Prometheus 指标，`metrics_enabled` 为 false 时跳过）
///
/// # Example
///
/// ```ignore
/// use order_shared::config::AppConfig;
/// use order_shared::observability;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = AppConfig::load("notification-worker")?;
///     let _guard = observability::init(&config.service_name, &config.observability)?;
///
///     // 应用逻辑...
///
///     Ok(())
/// }
/// ```
pub fn init(service_name: &str, config: &ObservabilityConfig) -> Result<ObservabilityGuard> {
    tracing::init(config)?;

    if config.metrics_enabled {
        metrics::init(service_name, config.metrics_port)?;
    }

    info!(
        service = %service_name,
        log_format = %config.log_format,
        metrics_enabled = config.metrics_enabled,
        metrics_port = config.metrics_port,
        "Observability initialized"
    );

    Ok(ObservabilityGuard {
        service_name: service_name.to_string(),
        metrics_enabled: config.metrics_enabled,
    })
}
