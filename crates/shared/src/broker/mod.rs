//! 消息代理基础设施
//!
//! 将 AMQP 的底层 API 封装为通知通道所需的最小抽象：
//! - `BrokerChannel`：声明拓扑、发布、消费、确认的通道句柄
//! - `Connector`：打开一条新连接并返回其通道
//!
//! 生产环境使用基于 lapin 的 `LapinConnector`，测试使用进程内的 `MemoryBroker`，
//! 两者对上层（连接管理器、发布者、消费者）完全透明。

pub mod amqp;
pub mod connection;
pub mod consumer;
pub mod memory;
pub mod publisher;
pub mod topology;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::config::RabbitMqConfig;
use crate::error::Result;

pub use amqp::LapinConnector;
pub use connection::{BrokerConnection, ConnectionState};
pub use consumer::{ConsumerState, Disposition, NotificationConsumer};
pub use memory::MemoryBroker;
pub use publisher::NotificationPublisher;
pub use topology::{ExchangeKind, ExchangeSpec, QueueSpec, Topology};

/// AMQP 持久化投递模式，消息在排队期间可以挺过代理重启
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// 发布时附带的消息属性
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageProperties {
    pub delivery_mode: Option<u8>,
    pub content_type: Option<String>,
}

impl MessageProperties {
    /// 持久化的 JSON 消息
    pub fn persistent_json() -> Self {
        Self {
            delivery_mode: Some(PERSISTENT_DELIVERY_MODE),
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.delivery_mode == Some(PERSISTENT_DELIVERY_MODE)
    }
}

/// 消费到的消息的统一表示
///
/// 拥有所有字段的所有权，可以安全地跨 await 点传递给异步处理函数。
/// 确认/拒绝通过 `delivery_tag` 在原通道上完成。
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    /// 代理是否曾经投递过该消息（被 requeue 或消费者崩溃后重投）
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub payload: Vec<u8>,
}

impl Delivery {
    /// 将负载视为 UTF-8 字符串返回，非法字节会被替换
    pub fn payload_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// 消费者收到的投递流
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// 代理通道句柄
///
/// 一个实例对应一条连接上的一个通道，由打开它的进程独占。
/// 实现不保证多个任务并发发布时的顺序，调用方须保证单任务使用。
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// 连接与通道是否都仍处于打开状态
    fn is_open(&self) -> bool;

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()>;

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<()>;

    /// 设置未确认投递的上限（basic.qos）
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// 以显式确认模式注册消费者
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    /// 依次关闭通道和连接，已关闭的部分直接跳过
    async fn close(&self) -> Result<()>;
}

/// 连接工厂
#[async_trait]
pub trait Connector: Send + Sync {
    /// 打开一条新连接及其通道
    async fn open(&self, config: &RabbitMqConfig) -> Result<Arc<dyn BrokerChannel>>;
}
