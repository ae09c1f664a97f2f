//! 通知处理错误类型
//!
//! 区分可重试与不可重试的失败，消费循环据此决定重新入队还是丢弃。

use order_shared::broker::Disposition;
use order_shared::error::BrokerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("通知反序列化失败: {0}")]
    DeserializationFailed(String),

    /// 暂时性失败，稍后重试可能成功
    #[error("通知处理失败: {0}")]
    HandlingFailed(String),

    /// 永久失败，重试也不会成功
    #[error("通知被拒绝: {0}")]
    Rejected(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl NotificationError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::HandlingFailed(_) => true,
            Self::Broker(e) => !e.is_fatal(),
            Self::DeserializationFailed(_) | Self::Rejected(_) => false,
        }
    }

    /// 该错误对应的消息结算方式
    pub fn disposition(&self) -> Disposition {
        if self.is_transient() {
            Disposition::Requeue
        } else {
            Disposition::Reject
        }
    }
}
