//! 共享库
//!
//! 订单服务与通知 worker 共用的配置、错误处理、事件模型、
//! 消息代理基础设施与可观测性初始化代码。

pub mod broker;
pub mod config;
pub mod error;
pub mod events;
pub mod observability;
