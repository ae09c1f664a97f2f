//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。
//! 未安装 recorder 时，记录函数均为空操作。

use std::net::SocketAddr;

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

pub const NOTIFICATIONS_PUBLISHED_TOTAL: &str = "notifications_published_total";
pub const NOTIFICATIONS_CONSUMED_TOTAL: &str = "notifications_consumed_total";

/// 安装 Prometheus recorder 并在指定端口暴露 `/metrics`
///
/// 必须在 tokio 运行时内调用。
pub fn init(service_name: &str, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    info!("Metrics server listening on {}", addr);

    register_common_metrics(service_name);
    Ok(())
}

/// 注册通用指标描述，出现在 `/metrics` 的 HELP 注释中
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!(
        NOTIFICATIONS_PUBLISHED_TOTAL,
        "Total number of order notifications published"
    );
    metrics::describe_counter!(
        NOTIFICATIONS_CONSUMED_TOTAL,
        "Total number of order notifications consumed, by disposition"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 记录一次通知发布
#[inline]
pub fn record_published(event: &'static str, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    metrics::counter!(
        NOTIFICATIONS_PUBLISHED_TOTAL,
        "event" => event,
        "outcome" => outcome
    )
    .increment(1);
}

/// 记录一次消息结算
#[inline]
pub fn record_consumed(outcome: &'static str) {
    metrics::counter!(NOTIFICATIONS_CONSUMED_TOTAL, "outcome" => outcome).increment(1);
}
