//! 基于 lapin 的 AMQP 0-9-1 实现
//!
//! `LapinConnector` 按配置建立连接（心跳、建连超时、阻塞超时），
//! `LapinChannel` 持有连接与通道，将 lapin 的错误映射为 `BrokerError`。

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::types::FieldTable;
use lapin::uri::AMQPUri;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, info, warn};

use crate::config::RabbitMqConfig;
use crate::error::{BrokerError, Result};

use super::{
    BrokerChannel, Connector, Delivery, DeliveryStream, ExchangeKind, ExchangeSpec,
    MessageProperties, QueueSpec,
};

const REPLY_SUCCESS: u16 = 200;

/// 由配置构建连接 URI
///
/// 直接填充结构体字段，避免 vhost（默认为 "/"）在字符串拼接时需要百分号编码。
fn build_uri(config: &RabbitMqConfig) -> AMQPUri {
    let mut uri = AMQPUri::default();
    uri.authority.host = config.host.clone();
    uri.authority.port = config.port;
    uri.authority.userinfo.username = config.username.clone();
    uri.authority.userinfo.password = config.password.clone();
    uri.vhost = config.vhost.clone();
    uri.query.heartbeat = Some(config.heartbeat_secs);
    uri.query.connection_timeout = Some(config.connection_timeout_ms);
    uri
}

/// 声明阶段的错误映射：406 PRECONDITION_FAILED 表示与已有拓扑参数冲突
fn declare_error(entity: &'static str, name: &str, err: lapin::Error) -> BrokerError {
    if let lapin::Error::ProtocolError(amqp_error) = &err
        && matches!(
            amqp_error.kind(),
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
        )
    {
        return BrokerError::TopologyConflict {
            entity,
            name: name.to_string(),
            reason: amqp_error.to_string(),
        };
    }
    BrokerError::from(err)
}

fn to_lapin_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
    }
}

fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(mode) = properties.delivery_mode {
        basic = basic.with_delivery_mode(mode);
    }
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(content_type.as_str().into());
    }
    basic
}

fn from_lapin_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let properties = MessageProperties {
        delivery_mode: *delivery.properties.delivery_mode(),
        content_type: delivery
            .properties
            .content_type()
            .as_ref()
            .map(|ct| ct.as_str().to_string()),
    };

    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        properties,
        payload: delivery.data,
    }
}

// ---------------------------------------------------------------------------
// LapinConnector
// ---------------------------------------------------------------------------

/// 真实 RabbitMQ 连接工厂
#[derive(Debug, Clone, Default)]
pub struct LapinConnector;

#[async_trait]
impl Connector for LapinConnector {
    async fn open(&self, config: &RabbitMqConfig) -> Result<Arc<dyn BrokerChannel>> {
        let timeout = config.blocked_connection_timeout();
        let uri = build_uri(config);

        let connection = tokio::time::timeout(
            timeout,
            Connection::connect_uri(uri, ConnectionProperties::default()),
        )
        .await
        .map_err(|_| BrokerError::Timeout {
            operation: "connect",
            timeout_secs: timeout.as_secs(),
        })?
        .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                // 通道创建失败时不保留半初始化的连接
                if let Err(close_err) = connection.close(REPLY_SUCCESS, "channel failed").await {
                    debug!(error = %close_err, "关闭半初始化连接失败");
                }
                return Err(BrokerError::Channel(e.to_string()));
            }
        };

        info!(
            endpoint = %config.endpoint(),
            heartbeat_secs = config.heartbeat_secs,
            "RabbitMQ 连接已建立"
        );

        Ok(Arc::new(LapinChannel {
            connection,
            channel,
        }))
    }
}

// ---------------------------------------------------------------------------
// LapinChannel
// ---------------------------------------------------------------------------

/// 一条 lapin 连接及其唯一通道
pub struct LapinChannel {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        self.channel
            .exchange_declare(
                &spec.name,
                to_lapin_kind(spec.kind),
                ExchangeDeclareOptions {
                    durable: spec.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| declare_error("exchange", &spec.name, e))
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        self.channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|e| declare_error("queue", &spec.name, e))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| declare_error("binding", routing_key, e))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<()> {
        // 未启用 publisher confirm：返回的 confirm 句柄直接丢弃，
        // 成功仅代表消息已被本地通道接受
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                to_basic_properties(properties),
            )
            .await?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(consumer
            .map(|result| result.map(from_lapin_delivery).map_err(BrokerError::from))
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await?;
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            if let Err(e) = self.channel.close(REPLY_SUCCESS, "OK").await {
                warn!(error = %e, "关闭 RabbitMQ 通道失败");
            }
        }
        if self.connection.status().connected() {
            self.connection.close(REPLY_SUCCESS, "OK").await?;
        }
        Ok(())
    }
}
