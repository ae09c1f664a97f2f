//! 服务层
//!
//! - `order_service`: 订单创建与状态变更（持久化 + 通知）

pub mod order_service;

pub use order_service::{OrderOutcome, OrderService};
