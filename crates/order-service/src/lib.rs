//! 订单服务
//!
//! 创建订单、变更订单状态，并在持久化完成后通过通知通道对外宣告。
//! 通知是尽力而为的：通知失败不会回滚已经持久化的订单。

pub mod error;
pub mod models;
pub mod repository;
pub mod service;
