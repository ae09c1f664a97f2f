//! 订单通知 worker
//!
//! 独立进程：从 RabbitMQ 通知队列逐条消费订单事件，交给处理器处理，
//! 处理成功才确认。处理器暂时失败的消息重新入队，无法解析或永久失败的消息被丢弃。

pub mod consumer;
pub mod error;
pub mod handler;
