//! 订单与订单明细
//!
//! 明细直接保存菜品的编号、名称和单价快照，不引用菜单服务的数据。

use chrono::{DateTime, Utc};
use order_shared::events::OrderStatus;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{OrderError, Result};

/// 单笔订单允许的最大明细行数
pub const MAX_ITEMS_PER_ORDER: usize = 100;

/// 订单明细
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub menu_item_id: i64,
    pub menu_item_name: String,
    pub menu_item_price: Decimal,
    pub quantity: u32,
    /// 单价 × 数量
    pub price: Decimal,
}

impl OrderItem {
    pub fn new(
        menu_item_id: i64,
        menu_item_name: impl Into<String>,
        menu_item_price: Decimal,
        quantity: u32,
    ) -> Self {
        Self {
            menu_item_id,
            menu_item_name: menu_item_name.into(),
            menu_item_price,
            quantity,
            price: menu_item_price * Decimal::from(quantity),
        }
    }
}

/// 订单
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub customer_name: String,
    pub customer_email: Option<String>,
    pub customer_phone: String,
    pub address: String,
    pub status: OrderStatus,
    pub total_price: Decimal,
    pub items: Vec<OrderItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// 订单总价：各明细小计之和
    pub fn calculate_total(items: &[OrderItem]) -> Decimal {
        items.iter().map(|item| item.price).sum()
    }

    /// 明细行数（不是菜品总份数）
    pub fn items_count(&self) -> u32 {
        u32::try_from(self.items.len()).unwrap_or(u32::MAX)
    }
}

/// 新订单明细
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrderItem {
    pub menu_item_id: i64,
    pub menu_item_name: String,
    pub menu_item_price: Decimal,
    pub quantity: u32,
}

/// 创建订单请求
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NewOrder {
    pub customer_name: String,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer_phone: String,
    #[serde(default)]
    pub address: String,
    pub items: Vec<NewOrderItem>,
}

impl NewOrder {
    pub fn new(customer_name: impl Into<String>) -> Self {
        Self {
            customer_name: customer_name.into(),
            ..Default::default()
        }
    }

    pub fn with_item(
        mut self,
        menu_item_id: i64,
        menu_item_name: impl Into<String>,
        menu_item_price: Decimal,
        quantity: u32,
    ) -> Self {
        self.items.push(NewOrderItem {
            menu_item_id,
            menu_item_name: menu_item_name.into(),
            menu_item_price,
            quantity,
        });
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.customer_name.trim().is_empty() {
            return Err(OrderError::InvalidOrder("顾客姓名不能为空".to_string()));
        }
        if self.items.is_empty() {
            return Err(OrderError::InvalidOrder("订单没有任何菜品".to_string()));
        }
        if self.items.len() > MAX_ITEMS_PER_ORDER {
            return Err(OrderError::InvalidOrder(format!(
                "订单明细不能超过 {MAX_ITEMS_PER_ORDER} 行"
            )));
        }
        for item in &self.items {
            if item.quantity == 0 {
                return Err(OrderError::InvalidOrder(format!(
                    "菜品 {} 的数量必须大于 0",
                    item.menu_item_name
                )));
            }
            if item.menu_item_price.is_sign_negative() {
                return Err(OrderError::InvalidOrder(format!(
                    "菜品 {} 的单价不能为负",
                    item.menu_item_name
                )));
            }
        }
        Ok(())
    }

    /// 计算明细小计并生成订单，状态为待处理
    pub fn into_order(self, id: i64, now: DateTime<Utc>) -> Order {
        let items: Vec<OrderItem> = self
            .items
            .into_iter()
            .map(|item| {
                OrderItem::new(
                    item.menu_item_id,
                    item.menu_item_name,
                    item.menu_item_price,
                    item.quantity,
                )
            })
            .collect();
        let total_price = Order::calculate_total(&items);

        Order {
            id,
            customer_name: self.customer_name,
            customer_email: self.customer_email,
            customer_phone: self.customer_phone,
            address: self.address,
            status: OrderStatus::Pending,
            total_price,
            items,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_item_price_is_unit_price_times_quantity() {
        let item = OrderItem::new(1, "Couscous", dec("850.00"), 2);
        assert_eq!(item.price, dec("1700.00"));
    }

    #[test]
    fn test_into_order_computes_total() {
        let order = NewOrder::new("Alice")
            .with_item(1, "Chorba", dec("4.50"), 2)
            .with_item(2, "Thé à la menthe", dec("1.33"), 3)
            .into_order(9, Utc::now());

        assert_eq!(order.id, 9);
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.total_price, dec("12.99"));
        assert_eq!(order.items_count(), 2);
        assert_eq!(order.created_at, order.updated_at);
    }

    #[test]
    fn test_validate() {
        assert!(NewOrder::new("Alice").with_item(1, "Chorba", dec("4.50"), 1).validate().is_ok());
        assert!(NewOrder::new("  ").with_item(1, "Chorba", dec("4.50"), 1).validate().is_err());
        assert!(NewOrder::new("Alice").validate().is_err());
        assert!(NewOrder::new("Alice").with_item(1, "Chorba", dec("4.50"), 0).validate().is_err());
        assert!(NewOrder::new("Alice").with_item(1, "Chorba", dec("-1"), 1).validate().is_err());
    }

    #[test]
    fn test_validate_caps_item_lines() {
        let order = (0..MAX_ITEMS_PER_ORDER as i64)
            .fold(NewOrder::new("Alice"), |order, id| order.with_item(id, "Bourek", dec("1.00"), 1));
        assert!(order.validate().is_ok());
        assert_eq!(
            order.clone().into_order(1, Utc::now()).items_count(),
            MAX_ITEMS_PER_ORDER as u32
        );

        let order = order.with_item(999, "Makroud", dec("2.00"), 1);
        assert!(matches!(order.validate(), Err(OrderError::InvalidOrder(_))));
    }
}
