//! 通知 worker 端到端测试
//!
//! 使用进程内 MemoryBroker 串联发布者、队列与 worker，不依赖外部 RabbitMQ。

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use notification_worker::consumer::NotificationWorker;
use notification_worker::error::NotificationError;
use notification_worker::handler::NotificationHandler;
use order_shared::broker::{
    BrokerConnection, ExchangeKind, ExchangeSpec, MemoryBroker, NotificationPublisher,
};
use order_shared::config::RabbitMqConfig;
use order_shared::events::{NotificationMessage, OrderStatus};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_test::assert_ok;

const QUEUE: &str = "order_queue";

/// 记录收到的消息，前 `failures` 次调用返回可重试错误
#[derive(Default)]
struct RecordingHandler {
    failures: usize,
    calls: AtomicUsize,
    handled: Mutex<Vec<NotificationMessage>>,
}

impl RecordingHandler {
    fn failing(failures: usize) -> Self {
        Self {
            failures,
            ..Default::default()
        }
    }

    fn order_ids(&self) -> Vec<i64> {
        self.handled.lock().iter().map(|m| m.order_id()).collect()
    }
}

#[async_trait]
impl NotificationHandler for RecordingHandler {
    async fn handle(&self, message: &NotificationMessage) -> Result<(), NotificationError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(NotificationError::HandlingFailed(format!("第 {} 次调用失败", call + 1)));
        }
        self.handled.lock().push(message.clone());
        Ok(())
    }
}

struct RunningWorker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<Result<(), NotificationError>>,
}

impl RunningWorker {
    fn spawn(broker: &MemoryBroker, handler: Arc<RecordingHandler>) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let worker = NotificationWorker::new(
            RabbitMqConfig::default(),
            Arc::new(broker.clone()),
            handler,
        )
        .with_reconnect_delay(Duration::from_millis(20));
        let handle = tokio::spawn(worker.run(rx));
        Self { shutdown, handle }
    }

    async fn stop(self) -> Result<(), NotificationError> {
        let _ = self.shutdown.send(true);
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("worker 未能在超时内退出")
            .expect("worker 任务 panic")
    }
}

fn publisher(broker: &MemoryBroker) -> NotificationPublisher {
    NotificationPublisher::new(BrokerConnection::new(
        RabbitMqConfig::default(),
        Arc::new(broker.clone()),
    ))
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("条件未在超时内满足");
}

#[tokio::test]
async fn test_body_is_delivered_byte_identical() {
    let broker = MemoryBroker::new();
    let handler = Arc::new(RecordingHandler::default());
    let worker = RunningWorker::spawn(&broker, Arc::clone(&handler));

    let message = NotificationMessage::new_order(42, "Alice", Decimal::new(1999, 2), 3);
    assert!(publisher(&broker).publish(&message).await);

    wait_until(|| broker.acked().len() == 1).await;
    assert_ok!(worker.stop().await);

    let acked = broker.acked();
    assert_eq!(acked[0].payload, message.to_json().unwrap());
    assert!(acked[0].properties.is_persistent());
    assert_eq!(acked[0].routing_key, "order.new");
    assert_eq!(*handler.handled.lock(), vec![message]);
}

#[tokio::test]
async fn test_transient_failures_are_redelivered_until_acked() {
    let broker = MemoryBroker::new();
    let handler = Arc::new(RecordingHandler::failing(2));
    let worker = RunningWorker::spawn(&broker, Arc::clone(&handler));

    assert!(
        publisher(&broker)
            .notify_new_order(1, "Bob", Decimal::new(2500, 2), 2)
            .await
    );

    wait_until(|| broker.acked().len() == 1).await;
    assert_ok!(worker.stop().await);

    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    assert_eq!(broker.acked()[0].delivery_count, 3);
    assert_eq!(handler.order_ids(), vec![1]);
    assert_eq!(broker.queue_depth(QUEUE), 0);
}

#[tokio::test]
async fn test_poison_message_does_not_block_queue() {
    let broker = MemoryBroker::new();
    let mut publisher = publisher(&broker);
    // 先声明拓扑，再注入无法解析的消息
    publisher.connection_mut().connect().await.unwrap();
    broker
        .inject("order_notifications", "order.new", b"{not json")
        .unwrap();
    assert!(
        publisher
            .notify_order_status_change(5, OrderStatus::Preparing, OrderStatus::Delivering)
            .await
    );

    let handler = Arc::new(RecordingHandler::default());
    let worker = RunningWorker::spawn(&broker, Arc::clone(&handler));

    wait_until(|| broker.acked().len() == 1).await;
    assert_ok!(worker.stop().await);

    let dead = broker.dead_lettered();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].payload, b"{not json");
    assert_eq!(handler.order_ids(), vec![5]);
    assert_eq!(broker.queue_depth(QUEUE), 0);
}

#[tokio::test]
async fn test_status_change_is_acked_and_removed() {
    let broker = MemoryBroker::new();
    let handler = Arc::new(RecordingHandler::default());
    let worker = RunningWorker::spawn(&broker, Arc::clone(&handler));

    assert!(
        publisher(&broker)
            .notify_order_status_change(7, OrderStatus::Pending, OrderStatus::Preparing)
            .await
    );

    wait_until(|| broker.acked().len() == 1).await;
    assert_ok!(worker.stop().await);

    assert_eq!(
        *handler.handled.lock(),
        vec![NotificationMessage::StatusChange {
            order_id: 7,
            old_status: OrderStatus::Pending,
            new_status: OrderStatus::Preparing,
        }]
    );
    assert_eq!(broker.queue_depth(QUEUE), 0);
}

#[tokio::test]
async fn test_messages_processed_in_publish_order() {
    let broker = MemoryBroker::new();
    let mut publisher = publisher(&broker);
    for id in 1..=3 {
        assert!(
            publisher
                .notify_new_order(id, "Carol", Decimal::new(1000, 2), 1)
                .await
        );
    }

    let handler = Arc::new(RecordingHandler::default());
    let worker = RunningWorker::spawn(&broker, Arc::clone(&handler));

    wait_until(|| broker.acked().len() == 3).await;
    assert_ok!(worker.stop().await);

    assert_eq!(handler.order_ids(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_graceful_shutdown_leaves_nothing_unacked() {
    let broker = MemoryBroker::new();
    let handler = Arc::new(RecordingHandler::default());
    let worker = RunningWorker::spawn(&broker, Arc::clone(&handler));

    wait_until(|| broker.consumer_count() == 1).await;
    assert_ok!(worker.stop().await);

    assert_eq!(broker.consumer_count(), 0);
    assert_eq!(broker.open_channels(), 0);
    assert_eq!(broker.unacked_count(QUEUE), 0);

    // worker 停止后发布的消息留在队列中，等待下一个消费者
    assert!(
        publisher(&broker)
            .notify_order_status_change(9, OrderStatus::Delivering, OrderStatus::Completed)
            .await
    );
    assert_eq!(broker.ready_count(QUEUE), 1);
}

#[tokio::test]
async fn test_worker_reconnects_after_outage() {
    let broker = MemoryBroker::new();
    broker.set_available(false);

    let handler = Arc::new(RecordingHandler::default());
    let worker = RunningWorker::spawn(&broker, Arc::clone(&handler));

    tokio::time::sleep(Duration::from_millis(50)).await;
    broker.set_available(true);

    assert!(
        publisher(&broker)
            .notify_order_status_change(3, OrderStatus::Pending, OrderStatus::Cancelled)
            .await
    );

    wait_until(|| broker.acked().len() == 1).await;
    assert_ok!(worker.stop().await);
    assert_eq!(handler.order_ids(), vec![3]);
}

#[tokio::test]
async fn test_worker_survives_transient_subscribe_failure() {
    let broker = MemoryBroker::new();
    broker.fail_prefetch(2, "channel closed by heartbeat timeout");

    let handler = Arc::new(RecordingHandler::default());
    let worker = RunningWorker::spawn(&broker, Arc::clone(&handler));

    assert!(
        publisher(&broker)
            .notify_order_status_change(11, OrderStatus::Pending, OrderStatus::Preparing)
            .await
    );

    wait_until(|| broker.acked().len() == 1).await;
    assert!(!worker.handle.is_finished());
    assert_ok!(worker.stop().await);
    assert_eq!(handler.order_ids(), vec![11]);
}

#[tokio::test]
async fn test_shutdown_interrupts_hanging_connect() {
    let broker = MemoryBroker::new();
    broker.set_connect_delay(Duration::from_secs(30));

    let handler = Arc::new(RecordingHandler::default());
    let worker = RunningWorker::spawn(&broker, Arc::clone(&handler));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    assert_ok!(worker.stop().await);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(broker.connections_opened(), 0);
}

#[tokio::test]
async fn test_topology_conflict_stops_worker() {
    let broker = MemoryBroker::new();
    broker.predeclare_exchange(ExchangeSpec {
        name: "order_notifications".to_string(),
        kind: ExchangeKind::Direct,
        durable: false,
    });

    let handler = Arc::new(RecordingHandler::default());
    let (_shutdown, rx) = watch::channel(false);
    let worker = NotificationWorker::new(RabbitMqConfig::default(), Arc::new(broker), handler);

    let err = tokio::time::timeout(Duration::from_secs(5), worker.run(rx))
        .await
        .expect("worker 应立即退出")
        .unwrap_err();
    assert!(matches!(err, NotificationError::Broker(ref e) if e.is_fatal()));
}
