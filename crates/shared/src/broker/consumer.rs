//! 订单通知消费者
//!
//! 以显式确认模式从通知队列拉取消息，逐条交给处理函数，再按处理结果
//! 确认、拒绝或重新入队。prefetch 限制了同一时刻未确认的消息数，
//! 默认 1 条，保证单个消费者严格按队列顺序处理。
//!
//! 只有在处理函数返回后才会确认消息：进程在处理中途崩溃时，
//! 代理会把该消息重新投递给下一个消费者（至少一次语义）。

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{BrokerError, Result};
use crate::observability::metrics as obs_metrics;

use super::{BrokerChannel, BrokerConnection, Delivery};

/// 处理函数对一条消息的结论
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// 处理成功，从队列中移除
    Ack,
    /// 永久失败，丢弃且不再投递
    Reject,
    /// 暂时失败，放回队列稍后重试
    Requeue,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Reject => "reject",
            Self::Requeue => "requeue",
        }
    }
}

/// 消费者状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Consuming,
    Stopped,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Consuming => "consuming",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// 消费循环退出的原因
enum Exit {
    Shutdown,
    ConnectionLost,
}

/// 订单通知消费者
pub struct NotificationConsumer {
    connection: BrokerConnection,
    state: ConsumerState,
    channel: Option<Arc<dyn BrokerChannel>>,
    consumer_tag: Option<String>,
}

impl NotificationConsumer {
    pub fn new(connection: BrokerConnection) -> Self {
        Self {
            connection,
            state: ConsumerState::Idle,
            channel: None,
            consumer_tag: None,
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn connection(&self) -> &BrokerConnection {
        &self.connection
    }

    /// 开始消费，直到收到关闭信号或连接中断
    ///
    /// - 收到关闭信号：处理完当前消息后取消订阅、关闭连接，状态变为 `Stopped`
    /// - 代理不可达或连接中断：记录日志后返回 `Ok(())`，状态回到 `Idle`，
    ///   是否重试由调用方决定
    /// - 拓扑冲突等致命错误：返回 `Err`，调用方应终止进程
    ///
    /// 关闭信号的发送端被丢弃也视为关闭。
    pub async fn start_consuming<F, Fut>(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
        mut handler: F,
    ) -> Result<()>
    where
        F: FnMut(Delivery) -> Fut + Send,
        Fut: Future<Output = Disposition> + Send,
    {
        if *shutdown.borrow() {
            self.state = ConsumerState::Stopped;
            return Ok(());
        }

        // 建连可能长时间阻塞，期间同样响应关闭信号
        let connected = tokio::select! {
            biased;

            _ = shutdown_requested(&mut shutdown) => None,
            result = self.connection.connect() => Some(result),
        };

        let channel = match connected {
            None => {
                info!("建立连接期间收到关闭信号，停止消费");
                self.stop_consuming().await;
                return Ok(());
            }
            Some(Ok(channel)) => channel,
            Some(Err(e)) if e.is_fatal() => return Err(e),
            Some(Err(e)) => {
                error!(error = %e, "无法连接到 RabbitMQ，跳过本轮消费");
                self.state = ConsumerState::Idle;
                return Ok(());
            }
        };

        let config = self.connection.config();
        let queue = config.queue.clone();
        let prefetch = config.prefetch_count;
        let consumer_tag = format!("{}-{}", config.consumer_tag, Uuid::now_v7());

        if let Err(e) = channel.set_prefetch(prefetch).await {
            error!(error = %e, prefetch, fatal = e.is_fatal(), "设置 prefetch 失败");
            return self.abandon(e).await;
        }

        let mut deliveries = match channel.consume(&queue, &consumer_tag).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, queue = %queue, fatal = e.is_fatal(), "注册消费者失败");
                return self.abandon(e).await;
            }
        };

        self.channel = Some(Arc::clone(&channel));
        self.consumer_tag = Some(consumer_tag.clone());
        self.state = ConsumerState::Consuming;
        info!(queue = %queue, consumer_tag = %consumer_tag, prefetch, "等待订单通知中...");

        let exit = loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("收到关闭信号，停止消费");
                        break Exit::Shutdown;
                    }
                }

                next = deliveries.next() => {
                    let delivery = match next {
                        Some(Ok(delivery)) => delivery,
                        Some(Err(e)) => {
                            warn!(error = %e, "投递流出错");
                            break Exit::ConnectionLost;
                        }
                        None => {
                            warn!("投递流已结束，连接可能已断开");
                            break Exit::ConnectionLost;
                        }
                    };

                    let delivery_tag = delivery.delivery_tag;
                    let redelivered = delivery.redelivered;
                    let disposition = handler(delivery).await;

                    if let Err(e) = settle(channel.as_ref(), delivery_tag, disposition).await {
                        error!(
                            delivery_tag,
                            disposition = disposition.as_str(),
                            error = %e,
                            "确认消息失败，消息将由代理重新投递"
                        );
                        if e.is_connection_lost() {
                            break Exit::ConnectionLost;
                        }
                    } else {
                        obs_metrics::record_consumed(disposition.as_str());
                        debug!(
                            delivery_tag,
                            redelivered,
                            disposition = disposition.as_str(),
                            "消息已结算"
                        );
                    }
                }
            }
        };

        drop(deliveries);

        match exit {
            Exit::Shutdown => {
                self.stop_consuming().await;
            }
            Exit::ConnectionLost => self.reset().await,
        }
        Ok(())
    }

    /// 订阅阶段失败：致命错误原样返回，其余错误丢弃连接后回到 `Idle`
    async fn abandon(&mut self, e: BrokerError) -> Result<()> {
        if e.is_fatal() {
            self.stop_consuming().await;
            return Err(e);
        }
        self.reset().await;
        Ok(())
    }

    async fn reset(&mut self) {
        self.channel = None;
        self.consumer_tag = None;
        self.connection.invalidate().await;
        self.state = ConsumerState::Idle;
    }

    /// 取消订阅并关闭连接
    ///
    /// 任何状态下调用都是安全的，错误只记录日志。
    pub async fn stop_consuming(&mut self) {
        if let (Some(channel), Some(tag)) = (self.channel.take(), self.consumer_tag.take())
            && channel.is_open()
            && let Err(e) = channel.cancel(&tag).await
        {
            warn!(consumer_tag = %tag, error = %e, "取消订阅失败");
        }
        self.connection.close().await;
        self.state = ConsumerState::Stopped;
        info!("消费者已停止");
    }
}

/// 等待关闭信号；发送端被丢弃也视为关闭
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn settle(
    channel: &dyn BrokerChannel,
    delivery_tag: u64,
    disposition: Disposition,
) -> Result<()> {
    match disposition {
        Disposition::Ack => channel.ack(delivery_tag).await,
        Disposition::Reject => channel.nack(delivery_tag, false).await,
        Disposition::Requeue => channel.nack(delivery_tag, true).await,
    }
}
