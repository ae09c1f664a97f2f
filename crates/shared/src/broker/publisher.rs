//! 订单通知发布者
//!
//! 通知是尽力而为的：调用方（订单创建流程）无论通知结果如何都必须完成自己的事务，
//! 因此本模块的公开方法只返回 `bool`，所有错误都在这里记录日志后吞掉。
//!
//! 没有使用 publisher confirm，返回 `true` 只代表消息已被本地通道接受，
//! 不代表已在代理端持久化。

use rust_decimal::Decimal;
use tracing::{error, info};

use crate::error::{BrokerError, Result};
use crate::events::{NotificationMessage, OrderStatus};
use crate::observability::metrics as obs_metrics;

use super::{BrokerConnection, MessageProperties};

/// 订单通知发布者
pub struct NotificationPublisher {
    connection: BrokerConnection,
}

impl NotificationPublisher {
    pub fn new(connection: BrokerConnection) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &BrokerConnection {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut BrokerConnection {
        &mut self.connection
    }

    /// 发布新订单通知（路由键 `order.new`）
    pub async fn notify_new_order(
        &mut self,
        order_id: i64,
        customer_name: &str,
        total_price: Decimal,
        items_count: u32,
    ) -> bool {
        let message =
            NotificationMessage::new_order(order_id, customer_name, total_price, items_count);
        self.publish(&message).await
    }

    /// 发布订单状态变更通知（路由键 `order.status`）
    pub async fn notify_order_status_change(
        &mut self,
        order_id: i64,
        old_status: OrderStatus,
        new_status: OrderStatus,
    ) -> bool {
        let message = NotificationMessage::status_change(order_id, old_status, new_status);
        self.publish(&message).await
    }

    /// 发布任意通知消息，失败只记录日志并返回 `false`
    pub async fn publish(&mut self, message: &NotificationMessage) -> bool {
        match self.try_publish(message).await {
            Ok(()) => {
                obs_metrics::record_published(message.event_name(), true);
                match message {
                    NotificationMessage::NewOrder { order_id, .. } => {
                        info!(order_id, "新订单通知已发送");
                    }
                    NotificationMessage::StatusChange {
                        order_id,
                        old_status,
                        new_status,
                    } => {
                        info!(
                            order_id,
                            old_status = %old_status,
                            new_status = %new_status,
                            "订单状态变更通知已发送"
                        );
                    }
                }
                true
            }
            Err(e) => {
                obs_metrics::record_published(message.event_name(), false);
                error!(
                    order_id = message.order_id(),
                    event = message.event_name(),
                    error = %e,
                    code = e.code(),
                    "发送订单通知失败"
                );
                if e.is_connection_lost() {
                    self.connection.invalidate().await;
                }
                false
            }
        }
    }

    fn routing_key_for(&self, message: &NotificationMessage) -> &str {
        let config = self.connection.config();
        match message {
            NotificationMessage::NewOrder { .. } => config.new_order_routing_key.as_str(),
            NotificationMessage::StatusChange { .. } => config.status_change_routing_key.as_str(),
        }
    }

    async fn try_publish(&mut self, message: &NotificationMessage) -> Result<()> {
        let Some(channel) = self.connection.get_channel().await else {
            return Err(BrokerError::Channel("没有可用的 RabbitMQ 通道".to_string()));
        };

        let payload = message.to_json()?;
        let exchange = self.connection.config().exchange.clone();
        let routing_key = self.routing_key_for(message).to_string();
        let timeout = self.connection.config().blocked_connection_timeout();

        tokio::time::timeout(
            timeout,
            channel.publish(
                &exchange,
                &routing_key,
                &payload,
                &MessageProperties::persistent_json(),
            ),
        )
        .await
        .map_err(|_| BrokerError::Timeout {
            operation: "publish",
            timeout_secs: timeout.as_secs(),
        })?
    }
}
