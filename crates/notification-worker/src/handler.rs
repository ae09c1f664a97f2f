//! 订单通知处理器
//!
//! 通过 `NotificationHandler` trait 抽象对单条通知的处理，
//! 默认实现只记录日志。接入厨房打印、前台推送等真实下游时只需实现同一 trait。

use async_trait::async_trait;
use order_shared::events::NotificationMessage;
use tracing::info;

use crate::error::NotificationError;

/// 餐厅使用的货币后缀（阿尔及利亚第纳尔）
pub const CURRENCY_SUFFIX: &str = "DA";

/// 通知处理器 trait
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    /// 处理一条已解析的通知
    ///
    /// 返回 `HandlingFailed` 的消息会被重新入队，`Rejected` 的消息会被丢弃。
    async fn handle(&self, message: &NotificationMessage) -> Result<(), NotificationError>;
}

/// 默认处理器：将订单事件写入日志
#[derive(Debug, Clone, Default)]
pub struct LoggingNotificationHandler;

#[async_trait]
impl NotificationHandler for LoggingNotificationHandler {
    async fn handle(&self, message: &NotificationMessage) -> Result<(), NotificationError> {
        match message {
            NotificationMessage::NewOrder {
                order_id,
                customer_name,
                total_price,
                items_count,
                timestamp,
            } => {
                info!(
                    order_id,
                    customer = %customer_name,
                    total = %format!("{total_price} {CURRENCY_SUFFIX}"),
                    items_count,
                    timestamp = %timestamp,
                    "新订单 #{order_id}"
                );
            }
            NotificationMessage::StatusChange {
                order_id,
                old_status,
                new_status,
            } => {
                info!(
                    order_id,
                    transition = %format!("{} → {}", old_status.label(), new_status.label()),
                    "订单 #{order_id} 状态变更: {old_status} → {new_status}"
                );
            }
        }
        Ok(())
    }
}
