//! 通知 worker
//!
//! 组装连接管理器、通知消费者与处理器。消费循环因代理不可达或连接中断退出时，
//! 等待一段时间后重新连接；收到关闭信号或遇到致命的拓扑错误时退出。

use std::sync::Arc;
use std::time::Duration;

use order_shared::broker::{
    BrokerConnection, Connector, ConsumerState, Delivery, Disposition, NotificationConsumer,
};
use order_shared::config::RabbitMqConfig;
use order_shared::events::NotificationMessage;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::NotificationError;
use crate::handler::NotificationHandler;

/// 连接失败后重新连接前的等待时间
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// 处理单条投递：解析、分发给处理器、给出结算方式
///
/// 拆分为独立函数而非方法，便于在测试中直接调用而无需构造完整的 worker。
pub async fn process_order_notification(
    handler: &dyn NotificationHandler,
    delivery: &Delivery,
) -> Disposition {
    let message = match NotificationMessage::from_json(&delivery.payload) {
        Ok(message) => message,
        Err(e) => {
            let err = NotificationError::DeserializationFailed(e.to_string());
            error!(
                delivery_tag = delivery.delivery_tag,
                routing_key = %delivery.routing_key,
                body = %delivery.payload_lossy(),
                error = %err,
                "无法解析通知消息，丢弃"
            );
            return err.disposition();
        }
    };

    if delivery.redelivered {
        info!(
            order_id = message.order_id(),
            event = message.event_name(),
            redelivered = true,
            "收到重新投递的通知"
        );
    }

    match handler.handle(&message).await {
        Ok(()) => Disposition::Ack,
        Err(e) => {
            let disposition = e.disposition();
            if e.is_transient() {
                warn!(
                    order_id = message.order_id(),
                    event = message.event_name(),
                    error = %e,
                    "处理通知失败，重新入队"
                );
            } else {
                error!(
                    order_id = message.order_id(),
                    event = message.event_name(),
                    error = %e,
                    "通知被永久拒绝，丢弃"
                );
            }
            disposition
        }
    }
}

/// 通知 worker
pub struct NotificationWorker {
    consumer: NotificationConsumer,
    handler: Arc<dyn NotificationHandler>,
    reconnect_delay: Duration,
}

impl NotificationWorker {
    pub fn new(
        config: RabbitMqConfig,
        connector: Arc<dyn Connector>,
        handler: Arc<dyn NotificationHandler>,
    ) -> Self {
        let connection = BrokerConnection::new(config, connector);
        Self {
            consumer: NotificationConsumer::new(connection),
            handler,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// 启动消费循环，直到收到 shutdown 信号
    ///
    /// 连接类错误只触发延迟重连，仅拓扑冲突等致命错误会返回 `Err`。
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), NotificationError> {
        info!(
            queue = %self.consumer.connection().config().queue,
            endpoint = %self.consumer.connection().config().endpoint(),
            "通知 worker 已启动"
        );

        loop {
            let handler = Arc::clone(&self.handler);
            self.consumer
                .start_consuming(shutdown.clone(), move |delivery| {
                    let handler = Arc::clone(&handler);
                    async move { process_order_notification(handler.as_ref(), &delivery).await }
                })
                .await?;

            if self.consumer.state() == ConsumerState::Stopped {
                break;
            }

            warn!(
                delay = ?self.reconnect_delay,
                "与 RabbitMQ 的连接不可用，稍后重试"
            );
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.consumer.stop_consuming().await;
                        break;
                    }
                }
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }

        info!("通知 worker 已停止");
        Ok(())
    }
}
