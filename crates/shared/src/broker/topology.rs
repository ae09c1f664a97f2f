//! 交换机/队列拓扑
//!
//! 一个持久化 topic 交换机、一个持久化队列，以及该队列上的多个路由键绑定。
//! 声明是幂等的：相同参数重复声明不会产生错误或重复拓扑；
//! 参数冲突是致命配置错误，必须立即暴露。

use tracing::{debug, info};

use crate::config::RabbitMqConfig;
use crate::error::{BrokerError, Result};

use super::BrokerChannel;

/// 交换机类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
        }
    }

    /// 判断绑定键是否匹配消息的路由键
    pub fn matches(&self, binding_key: &str, routing_key: &str) -> bool {
        match self {
            Self::Direct => binding_key == routing_key,
            Self::Fanout => true,
            Self::Topic => topic_matches(binding_key, routing_key),
        }
    }
}

/// topic 匹配规则：`*` 匹配恰好一个单词，`#` 匹配零个或多个单词
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn go(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| go(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && go(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && go(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    go(&pattern, &key)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
}

/// 通知通道的完整拓扑
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: ExchangeSpec,
    pub queue: QueueSpec,
    /// 队列绑定到交换机所用的路由键
    pub routing_keys: Vec<String>,
}

impl Topology {
    /// 由配置构建：持久化 topic 交换机 + 持久化队列，新订单与状态变更两个绑定
    pub fn from_config(config: &RabbitMqConfig) -> Self {
        let mut routing_keys = vec![config.new_order_routing_key.clone()];
        if config.status_change_routing_key != config.new_order_routing_key {
            routing_keys.push(config.status_change_routing_key.clone());
        }

        Self {
            exchange: ExchangeSpec {
                name: config.exchange.clone(),
                kind: ExchangeKind::Topic,
                durable: true,
            },
            queue: QueueSpec {
                name: config.queue.clone(),
                durable: true,
            },
            routing_keys,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.exchange.name.trim().is_empty() {
            return Err(BrokerError::InvalidTopology("交换机名称为空".to_string()));
        }
        if self.queue.name.trim().is_empty() {
            return Err(BrokerError::InvalidTopology("队列名称为空".to_string()));
        }
        if self.routing_keys.is_empty() {
            return Err(BrokerError::InvalidTopology("至少需要一个路由键".to_string()));
        }
        if self.routing_keys.iter().any(|key| key.trim().is_empty()) {
            return Err(BrokerError::InvalidTopology("路由键不能为空".to_string()));
        }
        Ok(())
    }

    /// 在给定通道上声明交换机、队列和全部绑定
    pub async fn declare(&self, channel: &dyn BrokerChannel) -> Result<()> {
        self.validate()?;

        channel.declare_exchange(&self.exchange).await?;
        debug!(
            exchange = %self.exchange.name,
            kind = self.exchange.kind.as_str(),
            "交换机已声明"
        );

        channel.declare_queue(&self.queue).await?;
        debug!(queue = %self.queue.name, "队列已声明");

        for routing_key in &self.routing_keys {
            channel
                .bind_queue(&self.queue.name, &self.exchange.name, routing_key)
                .await?;
        }

        info!(
            exchange = %self.exchange.name,
            queue = %self.queue.name,
            routing_keys = ?self.routing_keys,
            "通知拓扑声明完成"
        );
        Ok(())
    }
}
