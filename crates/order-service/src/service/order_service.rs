//! 订单服务
//!
//! 每个操作分两个阶段：先持久化，再宣告。
//!
//! 持久化失败直接返回错误，不会发出任何通知；宣告失败只记录日志，
//! 订单仍然被视为创建/更新成功，结果中的 `announced` 标明通知是否已送出。

use std::sync::Arc;

use order_shared::broker::NotificationPublisher;
use tracing::{info, warn};

use crate::error::{OrderError, Result};
use crate::models::{NewOrder, Order, OrderStatus};
use crate::repository::OrderStore;

/// 订单操作结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderOutcome {
    pub order: Order,
    /// 通知是否已被通道接受
    pub announced: bool,
}

/// 订单服务
///
/// 持有进程内唯一的通知发布者，因此变更操作需要 `&mut self`；
/// 多个请求处理任务共享时由调用方加锁。
pub struct OrderService<S>
where
    S: OrderStore,
{
    store: Arc<S>,
    publisher: NotificationPublisher,
}

impl<S> OrderService<S>
where
    S: OrderStore,
{
    pub fn new(store: Arc<S>, publisher: NotificationPublisher) -> Self {
        Self { store, publisher }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn publisher_mut(&mut self) -> &mut NotificationPublisher {
        &mut self.publisher
    }

    /// 创建订单并宣告新订单事件
    pub async fn create_order(&mut self, new_order: NewOrder) -> Result<OrderOutcome> {
        new_order.validate()?;
        let order = self.store.insert(new_order).await?;

        info!(
            order_id = order.id,
            customer = %order.customer_name,
            total_price = %order.total_price,
            items_count = order.items_count(),
            "订单已创建"
        );

        let announced = self
            .publisher
            .notify_new_order(
                order.id,
                &order.customer_name,
                order.total_price,
                order.items_count(),
            )
            .await;
        if !announced {
            warn!(order_id = order.id, "新订单通知未送出，订单已保留");
        }

        Ok(OrderOutcome { order, announced })
    }

    pub async fn get_order(&self, id: i64) -> Result<Order> {
        self.store.get(id).await?.ok_or(OrderError::NotFound(id))
    }

    /// 变更订单状态并宣告状态变更事件
    ///
    /// 新旧状态相同时不写入也不宣告。
    pub async fn update_status(&mut self, id: i64, new_status: OrderStatus) -> Result<OrderOutcome> {
        let current = self.get_order(id).await?;
        let old_status = current.status;

        if old_status == new_status {
            info!(order_id = id, status = %new_status, "订单状态未变化，跳过");
            return Ok(OrderOutcome {
                order: current,
                announced: false,
            });
        }

        let order = self.store.update_status(id, new_status).await?;
        info!(
            order_id = id,
            old_status = %old_status,
            new_status = %new_status,
            "订单状态已更新"
        );

        let announced = self
            .publisher
            .notify_order_status_change(id, old_status, new_status)
            .await;
        if !announced {
            warn!(order_id = id, "状态变更通知未送出，状态已保留");
        }

        Ok(OrderOutcome { order, announced })
    }
}
