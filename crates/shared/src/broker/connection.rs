//! 代理连接管理器
//!
//! 持有进程内唯一的一条连接及其通道：首次使用时建立，失效后在下次使用时
//! 重新建立。由进程的组装入口显式构造并注入发布者或消费者，不存在全局单例。
//!
//! # 并发约束
//!
//! 管理器不支持多个任务并发发布。所有会改变状态的方法都要求 `&mut self`，
//! 每个进程只有一个发布任务（触发事件的请求处理任务）或一个消费任务
//! （独立的消费者进程）持有它。需要跨任务共享时须由调用方自行加锁。

use std::fmt;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::RabbitMqConfig;
use crate::error::{BrokerError, Result};

use super::{BrokerChannel, Connector, Topology};

/// 连接生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Connecting,
    Open,
    Closed,
    Broken,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Broken => "broken",
        };
        f.write_str(s)
    }
}

/// 代理连接管理器
pub struct BrokerConnection {
    config: RabbitMqConfig,
    topology: Topology,
    connector: Arc<dyn Connector>,
    channel: Option<Arc<dyn BrokerChannel>>,
    state: ConnectionState,
}

impl BrokerConnection {
    pub fn new(config: RabbitMqConfig, connector: Arc<dyn Connector>) -> Self {
        let topology = Topology::from_config(&config);
        Self {
            config,
            topology,
            connector,
            channel: None,
            state: ConnectionState::Uninitialized,
        }
    }

    pub fn config(&self) -> &RabbitMqConfig {
        &self.config
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// 是否持有一条仍然存活的连接
    pub fn is_connected(&self) -> bool {
        self.channel.as_ref().is_some_and(|channel| channel.is_open())
    }

    /// 建立连接并声明拓扑
    ///
    /// 已有存活连接时原样返回（幂等）。失败时记录原因、清空内部状态并返回错误，
    /// 不保留半初始化的连接；是否继续运行由调用方根据 `is_fatal` 决定。
    pub async fn connect(&mut self) -> Result<Arc<dyn BrokerChannel>> {
        if let Some(channel) = &self.channel {
            if channel.is_open() {
                return Ok(Arc::clone(channel));
            }
            warn!(endpoint = %self.config.endpoint(), "缓存的 RabbitMQ 连接已失效，重新连接");
            self.discard().await;
        }

        self.state = ConnectionState::Connecting;

        match self.open_and_declare().await {
            Ok(channel) => {
                self.channel = Some(Arc::clone(&channel));
                self.state = ConnectionState::Open;
                info!(
                    endpoint = %self.config.endpoint(),
                    exchange = %self.topology.exchange.name,
                    queue = %self.topology.queue.name,
                    "已连接到 RabbitMQ"
                );
                Ok(channel)
            }
            Err(e) => {
                self.channel = None;
                self.state = ConnectionState::Broken;
                error!(
                    endpoint = %self.config.endpoint(),
                    error = %e,
                    code = e.code(),
                    fatal = e.is_fatal(),
                    "连接 RabbitMQ 失败"
                );
                Err(e)
            }
        }
    }

    async fn open_and_declare(&self) -> Result<Arc<dyn BrokerChannel>> {
        self.topology.validate()?;

        let channel = self.connector.open(&self.config).await?;

        let timeout = self.config.blocked_connection_timeout();
        let declared = tokio::time::timeout(timeout, self.topology.declare(channel.as_ref()))
            .await
            .unwrap_or(Err(BrokerError::Timeout {
                operation: "declare_topology",
                timeout_secs: timeout.as_secs(),
            }));

        if let Err(e) = declared {
            if let Err(close_err) = channel.close().await {
                warn!(error = %close_err, "释放半初始化连接失败");
            }
            return Err(e);
        }

        Ok(channel)
    }

    /// 获取可用通道，必要时透明地重新连接
    ///
    /// 重连失败返回 `None`，调用方应视为"代理不可用"而不是崩溃。
    pub async fn get_channel(&mut self) -> Option<Arc<dyn BrokerChannel>> {
        self.connect().await.ok()
    }

    /// 将当前连接标记为失效，下次使用时重新建立
    pub async fn invalidate(&mut self) {
        if self.channel.is_some() {
            self.discard().await;
        }
    }

    async fn discard(&mut self) {
        if let Some(channel) = self.channel.take()
            && let Err(e) = channel.close().await
        {
            warn!(error = %e, "释放失效连接时出错");
        }
        self.state = ConnectionState::Broken;
    }

    /// 尽力关闭通道与连接
    ///
    /// 关闭过程中的任何错误只记录日志，不向外抛出。
    pub async fn close(&mut self) {
        if let Some(channel) = self.channel.take() {
            match channel.close().await {
                Ok(()) => info!("RabbitMQ 连接已关闭"),
                Err(e) => error!(error = %e, "关闭 RabbitMQ 连接时出错"),
            }
        }
        self.state = ConnectionState::Closed;
    }
}
