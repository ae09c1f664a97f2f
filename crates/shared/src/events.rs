//! 订单通知事件模型
//!
//! 定义通知通道上传输的消息契约。通道本身不拥有订单数据，只报告订单的
//! 生命周期变化：新订单创建、订单状态变更。消息一经发布即不可变，
//! 任何状态变化都表现为一条新消息。

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

// ---------------------------------------------------------------------------
// OrderStatus：订单状态
// ---------------------------------------------------------------------------

/// 订单状态枚举
///
/// 序列化为小写名称，与订单服务持久化的取值一致。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    #[default]
    Pending,
    Preparing,
    Delivering,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 5] = [
        Self::Pending,
        Self::Preparing,
        Self::Delivering,
        Self::Completed,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Preparing => "preparing",
            Self::Delivering => "delivering",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// 面向餐厅前台的展示文案
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "En attente",
            Self::Preparing => "En préparation",
            Self::Delivering => "En cours de livraison",
            Self::Completed => "Terminée",
            Self::Cancelled => "Annulée",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("未知的订单状态: {s}"))
    }
}

// ---------------------------------------------------------------------------
// NotificationMessage：线上传输的通知消息
// ---------------------------------------------------------------------------

/// 路由键常量
///
/// 与配置中的默认值保持一致，集中定义防止字符串散落各处。
pub mod routing_keys {
    pub const NEW_ORDER: &str = "order.new";
    pub const STATUS_CHANGE: &str = "order.status";
}

/// 订单通知消息
///
/// 以 `event` 字段区分两种形态：
///
/// ```json
/// {"event":"new_order","order_id":1,"customer_name":"Alice","total_price":"19.99","items_count":3,"timestamp":"..."}
/// {"event":"status_change","order_id":7,"old_status":"pending","new_status":"preparing"}
/// ```
///
/// `total_price` 以十进制字符串传输，避免跨进程、跨语言时的浮点漂移。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationMessage {
    NewOrder {
        order_id: i64,
        customer_name: String,
        total_price: String,
        items_count: u32,
        timestamp: String,
    },
    StatusChange {
        order_id: i64,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
}

impl NotificationMessage {
    /// 构造新订单通知，时间戳取当前 UTC 时间（RFC 3339）
    pub fn new_order(
        order_id: i64,
        customer_name: impl Into<String>,
        total_price: Decimal,
        items_count: u32,
    ) -> Self {
        Self::NewOrder {
            order_id,
            customer_name: customer_name.into(),
            total_price: total_price.to_string(),
            items_count,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn status_change(order_id: i64, old_status: OrderStatus, new_status: OrderStatus) -> Self {
        Self::StatusChange {
            order_id,
            old_status,
            new_status,
        }
    }

    pub fn order_id(&self) -> i64 {
        match self {
            Self::NewOrder { order_id, .. } | Self::StatusChange { order_id, .. } => *order_id,
        }
    }

    /// 与 `event` 字段取值一致的事件名
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::NewOrder { .. } => "new_order",
            Self::StatusChange { .. } => "status_change",
        }
    }

    /// 默认拓扑下该消息使用的路由键
    pub fn routing_key(&self) -> &'static str {
        match self {
            Self::NewOrder { .. } => routing_keys::NEW_ORDER,
            Self::StatusChange { .. } => routing_keys::STATUS_CHANGE,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, BrokerError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}
