//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。
//! 代理地址、凭据、交换机/队列名与路由键全部由外部提供；
//! 代码中的 guest 凭据仅为本地部署默认值。

use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// RabbitMQ 配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RabbitMqConfig {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub username: String,
    pub password: String,
    /// 心跳间隔（秒），超过该窗口无响应的连接视为断开
    pub heartbeat_secs: u16,
    /// 代理阻塞连接时的最长等待（秒），防止饱和的代理无限挂起调用方
    pub blocked_connection_timeout_secs: u64,
    /// TCP 建连超时（毫秒）
    pub connection_timeout_ms: u64,
    pub exchange: String,
    pub queue: String,
    pub new_order_routing_key: String,
    pub status_change_routing_key: String,
    pub prefetch_count: u16,
    pub consumer_tag: String,
}

impl Default for RabbitMqConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            vhost: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            heartbeat_secs: 600,
            blocked_connection_timeout_secs: 300,
            connection_timeout_ms: 10_000,
            exchange: "order_notifications".to_string(),
            queue: "order_queue".to_string(),
            new_order_routing_key: "order.new".to_string(),
            status_change_routing_key: "order.status".to_string(),
            prefetch_count: 1,
            consumer_tag: "order-notification-worker".to_string(),
        }
    }
}

impl RabbitMqConfig {
    pub fn blocked_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.blocked_connection_timeout_secs)
    }

    /// 用于日志输出的代理地址，不包含凭据
    pub fn endpoint(&self) -> String {
        format!("{}:{}{}", self.host, self.port, self.vhost)
    }

    /// 校验配置项取值
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("rabbitmq.host", &self.host),
            ("rabbitmq.exchange", &self.exchange),
            ("rabbitmq.queue", &self.queue),
            ("rabbitmq.new_order_routing_key", &self.new_order_routing_key),
            (
                "rabbitmq.status_change_routing_key",
                &self.status_change_routing_key,
            ),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field: field.to_string(),
                    message: "不能为空".to_string(),
                });
            }
        }

        if self.prefetch_count == 0 {
            return Err(ConfigError::Invalid {
                field: "rabbitmq.prefetch_count".to_string(),
                message: "必须大于 0，否则代理不限制未确认投递数量".to_string(),
            });
        }

        if self.blocked_connection_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "rabbitmq.blocked_connection_timeout_secs".to_string(),
                message: "必须大于 0".to_string(),
            });
        }

        Ok(())
    }
}

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// 日志输出格式：json（结构化）或 pretty（人类可读）
    pub log_format: String,
    pub metrics_enabled: bool,
    pub metrics_port: u16,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_port: 9090,
        }
    }
}

impl ObservabilityConfig {
    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub rabbitmq: RabbitMqConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. `.env` 文件（若存在，仅注入进程环境变量）
    /// 2. config/default.toml（默认配置）
    /// 3. config/{environment}.toml（环境特定配置）
    /// 4. config/{service_name}.toml（服务特定配置）
    /// 5. 环境变量（RESTO_ 前缀，段与字段用双下划线分隔，
    ///    如 RESTO_RABBITMQ__HOST -> rabbitmq.host）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let env = std::env::var("RESTO_ENV").unwrap_or_else(|_| "development".to_string());
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", env))).required(false),
            )
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", service_name)))
                    .required(false),
            )
            .add_source(
                Environment::with_prefix("RESTO")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: Self = builder.build()?.try_deserialize()?;
        config.rabbitmq.validate()?;

        Ok(config)
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.rabbitmq.port, 5672);
        assert_eq!(config.rabbitmq.vhost, "/");
        assert_eq!(config.rabbitmq.exchange, "order_notifications");
        assert_eq!(config.rabbitmq.queue, "order_queue");
        assert_eq!(config.rabbitmq.new_order_routing_key, "order.new");
        assert_eq!(config.rabbitmq.status_change_routing_key, "order.status");
        assert_eq!(config.rabbitmq.prefetch_count, 1);
        assert!(config.rabbitmq.validate().is_ok());
    }

    #[test]
    fn test_endpoint_hides_credentials() {
        let config = RabbitMqConfig {
            host: "192.168.1.102".to_string(),
            password: "s3cret".to_string(),
            ..Default::default()
        };
        assert_eq!(config.endpoint(), "192.168.1.102:5672/");
        assert!(!config.endpoint().contains("s3cret"));
    }

    #[test]
    fn test_validate_rejects_empty_queue() {
        let config = RabbitMqConfig {
            queue: "  ".to_string(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("rabbitmq.queue"));
    }

    #[test]
    fn test_validate_rejects_zero_prefetch() {
        let config = RabbitMqConfig {
            prefetch_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_reads_service_file_and_env() {
        let dir = std::env::temp_dir().join(format!("resto-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("创建临时配置目录失败");
        std::fs::write(
            dir.join("notification-worker.toml"),
            "[rabbitmq]\nhost = \"broker.internal\"\nqueue = \"kitchen_queue\"\n",
        )
        .expect("写入配置文件失败");

        // SAFETY: 仅本测试读写这两个环境变量
        unsafe {
            std::env::set_var("CONFIG_DIR", &dir);
            std::env::set_var("RESTO_RABBITMQ__PORT", "5673");
        }

        let config = AppConfig::load("notification-worker").expect("加载配置失败");

        unsafe {
            std::env::remove_var("CONFIG_DIR");
            std::env::remove_var("RESTO_RABBITMQ__PORT");
        }
        let _ = std::fs::remove_dir_all(&dir);

        assert_eq!(config.service_name, "notification-worker");
        assert_eq!(config.rabbitmq.host, "broker.internal");
        assert_eq!(config.rabbitmq.queue, "kitchen_queue");
        assert_eq!(config.rabbitmq.port, 5673);
        // 未覆盖的字段保留默认值
        assert_eq!(config.rabbitmq.exchange, "order_notifications");
    }
}
