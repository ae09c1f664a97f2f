//! 订单通知 worker
//!
//! 从 RabbitMQ 通知队列消费订单事件，Ctrl+C / SIGTERM 时处理完当前消息后优雅退出。

use std::sync::Arc;

use anyhow::Result;
use notification_worker::consumer::NotificationWorker;
use notification_worker::handler::LoggingNotificationHandler;
use order_shared::broker::LapinConnector;
use order_shared::config::AppConfig;
use order_shared::observability;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load("notification-worker")?;
    let _guard = observability::init(&config.service_name, &config.observability)?;

    info!(
        service = %config.service_name,
        environment = %config.environment,
        "Starting notification-worker..."
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let worker = NotificationWorker::new(
        config.rabbitmq.clone(),
        Arc::new(LapinConnector),
        Arc::new(LoggingNotificationHandler),
    );

    if let Err(e) = worker.run(shutdown_rx).await {
        error!(error = %e, "通知 worker 异常退出");
        return Err(e.into());
    }

    info!("Service shutdown complete");
    Ok(())
}

/// 等待 Ctrl+C 或 SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}
