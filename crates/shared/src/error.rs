//! 统一错误处理模块
//!
//! 定义通知通道中所有共享的错误类型，使用 thiserror 提供良好的错误信息。
//! 连接类错误在本地恢复（清理状态并返回失败信号），拓扑冲突类错误必须终止启动。

use thiserror::Error;

/// 消息代理错误类型
#[derive(Debug, Error)]
pub enum BrokerError {
    // ==================== 连接错误 ====================
    #[error("连接消息代理失败: {0}")]
    Connection(String),

    #[error("消息代理操作超时: {operation} ({timeout_secs}s)")]
    Timeout {
        operation: &'static str,
        timeout_secs: u64,
    },

    #[error("通道不可用: {0}")]
    Channel(String),

    // ==================== 发布错误 ====================
    #[error("发布消息失败: {0}")]
    Publish(String),

    #[error("消息序列化失败: {0}")]
    Serialization(#[from] serde_json::Error),

    // ==================== 拓扑错误 ====================
    #[error("拓扑声明冲突: {entity} '{name}' - {reason}")]
    TopologyConflict {
        entity: &'static str,
        name: String,
        reason: String,
    },

    #[error("无效的拓扑配置: {0}")]
    InvalidTopology(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, BrokerError>;

impl BrokerError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connection(_) => "BROKER_CONNECTION_ERROR",
            Self::Timeout { .. } => "BROKER_TIMEOUT",
            Self::Channel(_) => "BROKER_CHANNEL_ERROR",
            Self::Publish(_) => "BROKER_PUBLISH_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::TopologyConflict { .. } => "TOPOLOGY_CONFLICT",
            Self::InvalidTopology(_) => "INVALID_TOPOLOGY",
        }
    }

    /// 是否为致命的配置错误
    ///
    /// 致命错误不能在本地吞掉：继续运行意味着向错误配置的拓扑静默投递。
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::TopologyConflict { .. } | Self::InvalidTopology(_)
        )
    }

    /// 是否意味着底层连接已失效，需要在下次使用时重新 connect
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout { .. } | Self::Channel(_)
        )
    }
}

impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::InvalidChannelState(state) => {
                Self::Channel(format!("通道状态无效: {state:?}"))
            }
            lapin::Error::InvalidConnectionState(state) => {
                Self::Connection(format!("连接状态无效: {state:?}"))
            }
            other => Self::Connection(other.to_string()),
        }
    }
}

/// 配置加载错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("配置加载失败: {0}")]
    Load(#[from] config::ConfigError),

    #[error("配置项无效: {field} - {message}")]
    Invalid { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        let err = BrokerError::Connection("refused".to_string());
        assert_eq!(err.code(), "BROKER_CONNECTION_ERROR");

        let err = BrokerError::TopologyConflict {
            entity: "exchange",
            name: "order_notifications".to_string(),
            reason: "durable mismatch".to_string(),
        };
        assert_eq!(err.code(), "TOPOLOGY_CONFLICT");
    }

    #[test]
    fn test_is_fatal() {
        let conflict = BrokerError::TopologyConflict {
            entity: "queue",
            name: "order_queue".to_string(),
            reason: "PRECONDITION_FAILED".to_string(),
        };
        assert!(conflict.is_fatal());
        assert!(!conflict.is_connection_lost());

        let timeout = BrokerError::Timeout {
            operation: "connect",
            timeout_secs: 300,
        };
        assert!(!timeout.is_fatal());
        assert!(timeout.is_connection_lost());

        assert!(!BrokerError::Publish("closed".to_string()).is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = BrokerError::TopologyConflict {
            entity: "exchange",
            name: "orders".to_string(),
            reason: "kind mismatch".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "拓扑声明冲突: exchange 'orders' - kind mismatch"
        );
    }
}
