//! 内存订单仓储
//!
//! 编号从 1 开始递增，与数据库自增主键的行为一致。

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use crate::error::{OrderError, Result};
use crate::models::{NewOrder, Order, OrderStatus};

use super::OrderStore;

#[derive(Debug, Default)]
pub struct MemoryOrderStore {
    orders: DashMap<i64, Order>,
    last_id: AtomicI64,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn insert(&self, order: NewOrder) -> Result<Order> {
        order.validate()?;

        let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        let order = order.into_order(id, Utc::now());
        self.orders.insert(id, order.clone());
        Ok(order)
    }

    async fn get(&self, id: i64) -> Result<Option<Order>> {
        Ok(self.orders.get(&id).map(|entry| entry.value().clone()))
    }

    async fn update_status(&self, id: i64, status: OrderStatus) -> Result<Order> {
        let mut entry = self.orders.get_mut(&id).ok_or(OrderError::NotFound(id))?;
        entry.status = status;
        entry.updated_at = Utc::now();
        Ok(entry.value().clone())
    }
}
