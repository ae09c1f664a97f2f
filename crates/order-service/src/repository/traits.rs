//! 仓储 Trait 定义

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{NewOrder, Order, OrderStatus};

/// 订单仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// 保存新订单并分配编号，状态为待处理
    async fn insert(&self, order: NewOrder) -> Result<Order>;

    async fn get(&self, id: i64) -> Result<Option<Order>>;

    /// 更新订单状态，返回更新后的订单；订单不存在时返回 `NotFound`
    async fn update_status(&self, id: i64, status: OrderStatus) -> Result<Order>;
}
