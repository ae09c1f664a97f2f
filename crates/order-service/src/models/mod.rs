//! 订单领域模型

pub mod order;

pub use order::{NewOrder, NewOrderItem, Order, OrderItem};
pub use order_shared::events::OrderStatus;
