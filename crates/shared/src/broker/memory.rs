//! 进程内消息代理
//!
//! 在不依赖外部 RabbitMQ 的情况下模拟通知通道需要的 AMQP 语义：
//! 持久化声明与冲突检测、topic 路由、prefetch 限流、显式 ack/nack、
//! 通道关闭时未确认消息回到队列。同时提供故障注入（代理不可达、连接断开、
//! 建连缓慢、prefetch 失败）与检查接口（队列深度、已确认/已丢弃消息、投递次数），供各服务测试使用。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::config::RabbitMqConfig;
use crate::error::{BrokerError, Result};

use super::{
    BrokerChannel, Connector, Delivery, DeliveryStream, ExchangeSpec, MessageProperties, QueueSpec,
};

/// 队列中的一条消息
#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    payload: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
    delivery_count: u32,
}

/// 已结算（ack 或不带 requeue 的 nack）的消息，供测试检查
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettledMessage {
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
    /// 该消息总共被投递的次数（含最后一次）
    pub delivery_count: u32,
}

impl SettledMessage {
    fn from_stored(message: StoredMessage) -> Self {
        Self {
            routing_key: message.routing_key,
            payload: message.payload,
            properties: message.properties,
            delivery_count: message.delivery_count,
        }
    }
}

struct Unacked {
    channel_id: u64,
    queue: String,
    message: StoredMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

#[derive(Default)]
struct QueueState {
    spec: Option<QueueSpec>,
    ready: VecDeque<StoredMessage>,
}

struct ChannelState {
    open: bool,
    prefetch: u16,
    /// consumer_tag -> queue
    consumers: HashMap<String, String>,
}

#[derive(Default)]
struct BrokerState {
    unavailable: bool,
    connect_delay: Duration,
    /// 剩余需要失败的 prefetch 调用次数及原因
    prefetch_failures: usize,
    prefetch_failure_reason: String,
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    channels: HashMap<u64, ChannelState>,
    unacked: HashMap<u64, Unacked>,
    next_channel_id: u64,
    next_delivery_tag: u64,
    connections_opened: usize,
    acked: Vec<SettledMessage>,
    dead_lettered: Vec<SettledMessage>,
}

impl BrokerState {
    fn channel_open(&self, channel_id: u64) -> bool {
        !self.unavailable
            && self
                .channels
                .get(&channel_id)
                .is_some_and(|channel| channel.open)
    }

    fn ensure_open(&self, channel_id: u64) -> Result<()> {
        if self.channel_open(channel_id) {
            Ok(())
        } else {
            Err(BrokerError::Channel("通道已关闭".to_string()))
        }
    }

    /// 关闭通道：注销消费者，未确认消息全部回到队列
    fn close_channel(&mut self, channel_id: u64) {
        if let Some(channel) = self.channels.get_mut(&channel_id) {
            channel.open = false;
            channel.consumers.clear();
        }

        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, unacked)| unacked.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();

        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.requeue(unacked);
            }
        }
    }

    fn requeue(&mut self, unacked: Unacked) {
        let mut message = unacked.message;
        message.redelivered = true;
        self.queues
            .entry(unacked.queue)
            .or_default()
            .ready
            .push_back(message);
    }

    /// 尝试为某个消费者取出下一条消息
    ///
    /// 返回 `Err(())` 表示消费者已不存在（被取消或通道关闭），流应结束。
    fn next_delivery(
        &mut self,
        channel_id: u64,
        consumer_tag: &str,
    ) -> std::result::Result<Option<Delivery>, ()> {
        if self.unavailable {
            return Err(());
        }
        let Some(channel) = self.channels.get(&channel_id) else {
            return Err(());
        };
        if !channel.open {
            return Err(());
        }
        let Some(queue_name) = channel.consumers.get(consumer_tag).cloned() else {
            return Err(());
        };

        let in_flight = self
            .unacked
            .values()
            .filter(|unacked| unacked.channel_id == channel_id)
            .count();
        if channel.prefetch > 0 && in_flight >= channel.prefetch as usize {
            return Ok(None);
        }

        let Some(mut message) = self
            .queues
            .get_mut(&queue_name)
            .and_then(|queue| queue.ready.pop_front())
        else {
            return Ok(None);
        };

        self.next_delivery_tag += 1;
        let delivery_tag = self.next_delivery_tag;
        message.delivery_count += 1;

        let delivery = Delivery {
            delivery_tag,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            redelivered: message.redelivered,
            properties: message.properties.clone(),
            payload: message.payload.clone(),
        };

        self.unacked.insert(
            delivery_tag,
            Unacked {
                channel_id,
                queue: queue_name,
                message,
            },
        );

        Ok(Some(delivery))
    }

    fn route(&mut self, exchange: &str, routing_key: &str, message: StoredMessage) -> Result<()> {
        let Some(spec) = self.exchanges.get(exchange) else {
            return Err(BrokerError::Publish(format!(
                "NOT_FOUND - 交换机 '{exchange}' 不存在"
            )));
        };
        let kind = spec.kind;

        let mut targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|binding| {
                binding.exchange == exchange && kind.matches(&binding.routing_key, routing_key)
            })
            .map(|binding| binding.queue.clone())
            .collect();
        targets.dedup();

        if targets.is_empty() {
            debug!(exchange, routing_key, "消息无匹配绑定，被交换机丢弃");
        }

        for queue in targets {
            self.queues
                .entry(queue)
                .or_default()
                .ready
                .push_back(message.clone());
        }
        Ok(())
    }
}

struct Inner {
    state: Mutex<BrokerState>,
    /// 队列、通道或消费者状态变化时唤醒等待中的投递流
    changed: Notify,
}

/// 进程内消息代理
///
/// 克隆得到的实例共享同一份代理状态，可同时作为 `Connector`
/// 注入发布者与消费者，再由测试代码检查结果。
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                changed: Notify::new(),
            }),
        }
    }

    fn notify(&self) {
        self.inner.changed.notify_waiters();
    }

    /// 模拟代理不可达：新连接被拒绝，已打开的通道全部断开
    pub fn set_available(&self, available: bool) {
        {
            let mut state = self.inner.state.lock();
            state.unavailable = !available;
            if !available {
                let ids: Vec<u64> = state.channels.keys().copied().collect();
                for id in ids {
                    state.close_channel(id);
                }
            }
        }
        self.notify();
    }

    /// 模拟网络中断：断开所有已打开的通道，但代理仍可重新连接
    pub fn drop_connections(&self) {
        {
            let mut state = self.inner.state.lock();
            let ids: Vec<u64> = state.channels.keys().copied().collect();
            for id in ids {
                state.close_channel(id);
            }
        }
        self.notify();
    }

    /// 模拟建连缓慢：之后每次打开连接前先等待 `delay`
    pub fn set_connect_delay(&self, delay: Duration) {
        self.inner.state.lock().connect_delay = delay;
    }

    /// 让接下来 `times` 次 prefetch 设置以通道错误失败
    pub fn fail_prefetch(&self, times: usize, reason: &str) {
        let mut state = self.inner.state.lock();
        state.prefetch_failures = times;
        state.prefetch_failure_reason = reason.to_string();
    }

    /// 直接向交换机投递原始字节，用于模拟上游生产者发送的异常消息
    pub fn inject(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
            properties: MessageProperties::persistent_json(),
            redelivered: false,
            delivery_count: 0,
        };
        self.inner
            .state
            .lock()
            .route(exchange, routing_key, message)?;
        self.notify();
        Ok(())
    }

    /// 预先声明交换机（绕过连接），用于构造与配置冲突的已有拓扑
    pub fn predeclare_exchange(&self, spec: ExchangeSpec) {
        self.inner
            .state
            .lock()
            .exchanges
            .insert(spec.name.clone(), spec);
    }

    /// 队列中等待投递的消息数（不含未确认）
    pub fn ready_count(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |queue| queue.ready.len())
    }

    /// 已投递但尚未确认的消息数
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .unacked
            .values()
            .filter(|unacked| unacked.queue == queue)
            .count()
    }

    /// 队列中全部消息数（等待投递 + 未确认）
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.ready_count(queue) + self.unacked_count(queue)
    }

    /// 等待投递的消息负载（按队列顺序）
    pub fn ready_payloads(&self, queue: &str) -> Vec<Vec<u8>> {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|queue| queue.ready.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }

    /// 按确认顺序返回已确认的消息
    pub fn acked(&self) -> Vec<SettledMessage> {
        self.inner.state.lock().acked.clone()
    }

    /// 被拒绝且未重新入队的消息
    pub fn dead_lettered(&self) -> Vec<SettledMessage> {
        self.inner.state.lock().dead_lettered.clone()
    }

    pub fn exchange_count(&self) -> usize {
        self.inner.state.lock().exchanges.len()
    }

    pub fn queue_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .values()
            .filter(|queue| queue.spec.is_some())
            .count()
    }

    pub fn binding_count(&self) -> usize {
        self.inner.state.lock().bindings.len()
    }

    /// 成功建立过的连接数
    pub fn connections_opened(&self) -> usize {
        self.inner.state.lock().connections_opened
    }

    /// 当前仍打开的通道数
    pub fn open_channels(&self) -> usize {
        self.inner
            .state
            .lock()
            .channels
            .values()
            .filter(|channel| channel.open)
            .count()
    }

    /// 当前注册的消费者数
    pub fn consumer_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .channels
            .values()
            .map(|channel| channel.consumers.len())
            .sum()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn open(&self, config: &RabbitMqConfig) -> Result<Arc<dyn BrokerChannel>> {
        let delay = self.inner.state.lock().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.inner.state.lock();
        if state.unavailable {
            return Err(BrokerError::Connection(format!(
                "无法连接到 {}: connection refused",
                config.endpoint()
            )));
        }

        state.next_channel_id += 1;
        let channel_id = state.next_channel_id;
        state.channels.insert(
            channel_id,
            ChannelState {
                open: true,
                prefetch: 0,
                consumers: HashMap::new(),
            },
        );
        state.connections_opened += 1;

        Ok(Arc::new(MemoryChannel {
            broker: self.clone(),
            channel_id,
            closed: AtomicBool::new(false),
        }))
    }
}

/// 内存代理上的通道
pub struct MemoryChannel {
    broker: MemoryBroker,
    channel_id: u64,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn with_open_state<T>(&self, f: impl FnOnce(&mut BrokerState) -> Result<T>) -> Result<T> {
        let result = {
            let mut state = self.broker.inner.state.lock();
            state.ensure_open(self.channel_id)?;
            f(&mut state)
        };
        self.broker.notify();
        result
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self.broker.inner.state.lock().channel_open(self.channel_id)
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        self.with_open_state(|state| {
            if let Some(existing) = state.exchanges.get(&spec.name) {
                if existing != spec {
                    return Err(BrokerError::TopologyConflict {
                        entity: "exchange",
                        name: spec.name.clone(),
                        reason: format!(
                            "PRECONDITION_FAILED - 已存在 kind={} durable={}，请求 kind={} durable={}",
                            existing.kind.as_str(),
                            existing.durable,
                            spec.kind.as_str(),
                            spec.durable
                        ),
                    });
                }
                return Ok(());
            }
            state.exchanges.insert(spec.name.clone(), spec.clone());
            Ok(())
        })
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        self.with_open_state(|state| {
            let queue = state.queues.entry(spec.name.clone()).or_default();
            if let Some(existing) = &queue.spec {
                if existing != spec {
                    return Err(BrokerError::TopologyConflict {
                        entity: "queue",
                        name: spec.name.clone(),
                        reason: format!(
                            "PRECONDITION_FAILED - 已存在 durable={}，请求 durable={}",
                            existing.durable, spec.durable
                        ),
                    });
                }
                return Ok(());
            }
            queue.spec = Some(spec.clone());
            Ok(())
        })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.with_open_state(|state| {
            if !state.exchanges.contains_key(exchange) {
                return Err(BrokerError::Channel(format!(
                    "NOT_FOUND - 交换机 '{exchange}' 不存在"
                )));
            }
            if !state.queues.get(queue).is_some_and(|q| q.spec.is_some()) {
                return Err(BrokerError::Channel(format!(
                    "NOT_FOUND - 队列 '{queue}' 不存在"
                )));
            }

            let binding = Binding {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            };
            if !state.bindings.contains(&binding) {
                state.bindings.push(binding);
            }
            Ok(())
        })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<()> {
        self.with_open_state(|state| {
            let message = StoredMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                payload: payload.to_vec(),
                properties: properties.clone(),
                redelivered: false,
                delivery_count: 0,
            };
            state.route(exchange, routing_key, message)
        })
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        let channel_id = self.channel_id;
        self.with_open_state(|state| {
            if state.prefetch_failures > 0 {
                state.prefetch_failures -= 1;
                return Err(BrokerError::Channel(state.prefetch_failure_reason.clone()));
            }
            if let Some(channel) = state.channels.get_mut(&channel_id) {
                channel.prefetch = count;
            }
            Ok(())
        })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let channel_id = self.channel_id;
        self.with_open_state(|state| {
            if !state.queues.get(queue).is_some_and(|q| q.spec.is_some()) {
                return Err(BrokerError::Channel(format!(
                    "NOT_FOUND - 队列 '{queue}' 不存在"
                )));
            }
            if let Some(channel) = state.channels.get_mut(&channel_id) {
                channel
                    .consumers
                    .insert(consumer_tag.to_string(), queue.to_string());
            }
            Ok(())
        })?;

        let broker = self.broker.clone();
        let consumer_tag = consumer_tag.to_string();

        let stream = futures::stream::unfold(
            (broker, consumer_tag),
            move |(broker, consumer_tag)| async move {
                let next = loop {
                    // 先登记唤醒，再检查状态，避免错过两者之间的通知
                    let notified = broker.inner.changed.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();

                    let next = broker
                        .inner
                        .state
                        .lock()
                        .next_delivery(channel_id, &consumer_tag);

                    match next {
                        Ok(None) => notified.await,
                        other => break other,
                    }
                };

                match next {
                    Ok(Some(delivery)) => Some((Ok(delivery), (broker, consumer_tag))),
                    _ => None,
                }
            },
        );

        Ok(stream.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.with_open_state(|state| {
            let unacked = state.unacked.remove(&delivery_tag).ok_or_else(|| {
                BrokerError::Channel(format!("PRECONDITION_FAILED - 未知的 delivery tag {delivery_tag}"))
            })?;
            state.acked.push(SettledMessage::from_stored(unacked.message));
            Ok(())
        })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.with_open_state(|state| {
            let unacked = state.unacked.remove(&delivery_tag).ok_or_else(|| {
                BrokerError::Channel(format!("PRECONDITION_FAILED - 未知的 delivery tag {delivery_tag}"))
            })?;
            if requeue {
                state.requeue(unacked);
            } else {
                state
                    .dead_lettered
                    .push(SettledMessage::from_stored(unacked.message));
            }
            Ok(())
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let channel_id = self.channel_id;
        self.with_open_state(|state| {
            if let Some(channel) = state.channels.get_mut(&channel_id) {
                channel.consumers.remove(consumer_tag);
            }
            Ok(())
        })
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.broker.inner.state.lock().close_channel(self.channel_id);
        self.broker.notify();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{ExchangeKind, Topology};

    async fn open_declared(broker: &MemoryBroker) -> Arc<dyn BrokerChannel> {
        let config = RabbitMqConfig::default();
        let channel = broker.open(&config).await.unwrap();
        Topology::from_config(&config)
            .declare(channel.as_ref())
            .await
            .unwrap();
        channel
    }

    #[tokio::test]
    async fn test_publish_routes_by_binding() {
        let broker = MemoryBroker::new();
        let channel = open_declared(&broker).await;
        let props = MessageProperties::persistent_json();

        channel
            .publish("order_notifications", "order.new", b"a", &props)
            .await
            .unwrap();
        channel
            .publish("order_notifications", "order.status", b"b", &props)
            .await
            .unwrap();
        // 没有绑定匹配 order.refund，消息被丢弃
        channel
            .publish("order_notifications", "order.refund", b"c", &props)
            .await
            .unwrap();

        assert_eq!(
            broker.ready_payloads("order_queue"),
            vec![b"a".to_vec(), b"b".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_publish_to_missing_exchange_fails() {
        let broker = MemoryBroker::new();
        let channel = broker.open(&RabbitMqConfig::default()).await.unwrap();

        let result = channel
            .publish("nowhere", "order.new", b"x", &MessageProperties::persistent_json())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_exchange_redeclare_conflict() {
        let broker = MemoryBroker::new();
        let channel = broker.open(&RabbitMqConfig::default()).await.unwrap();

        let durable = ExchangeSpec {
            name: "orders".to_string(),
            kind: ExchangeKind::Topic,
            durable: true,
        };
        channel.declare_exchange(&durable).await.unwrap();
        channel.declare_exchange(&durable).await.unwrap();

        let transient = ExchangeSpec {
            durable: false,
            ..durable
        };
        let err = channel.declare_exchange(&transient).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(broker.exchange_count(), 1);
    }

    #[tokio::test]
    async fn test_prefetch_limits_in_flight() {
        let broker = MemoryBroker::new();
        let channel = open_declared(&broker).await;
        let props = MessageProperties::persistent_json();
        for body in [b"1", b"2"] {
            channel
                .publish("order_notifications", "order.new", body, &props)
                .await
                .unwrap();
        }

        channel.set_prefetch(1).await.unwrap();
        let mut stream = channel.consume("order_queue", "tag").await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.payload, b"1");
        assert_eq!(broker.unacked_count("order_queue"), 1);
        assert_eq!(broker.ready_count("order_queue"), 1);

        // 未确认前不会投递第二条
        let pending = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(pending.is_err());

        channel.ack(first.delivery_tag).await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.payload, b"2");
    }

    #[tokio::test]
    async fn test_close_requeues_unacked() {
        let broker = MemoryBroker::new();
        let channel = open_declared(&broker).await;
        channel
            .publish(
                "order_notifications",
                "order.new",
                b"crash",
                &MessageProperties::persistent_json(),
            )
            .await
            .unwrap();

        let mut stream = channel.consume("order_queue", "tag").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert!(!delivery.redelivered);

        channel.close().await.unwrap();
        assert!(stream.next().await.is_none());
        assert!(!channel.is_open());
        assert_eq!(broker.ready_count("order_queue"), 1);

        // 新连接上重新投递，redelivered 标记为 true
        let channel = open_declared(&broker).await;
        let mut stream = channel.consume("order_queue", "tag").await.unwrap();
        let redelivered = stream.next().await.unwrap().unwrap();
        assert!(redelivered.redelivered);
        assert_eq!(redelivered.payload, b"crash");
    }

    #[tokio::test]
    async fn test_unavailable_broker_refuses_connections() {
        let broker = MemoryBroker::new();
        let channel = open_declared(&broker).await;

        broker.set_available(false);
        assert!(!channel.is_open());
        assert!(broker.open(&RabbitMqConfig::default()).await.is_err());

        broker.set_available(true);
        assert!(broker.open(&RabbitMqConfig::default()).await.is_ok());
        assert_eq!(broker.connections_opened(), 2);
    }
}
