//! 优雅关闭
//!
//! 监听 Ctrl+C / SIGTERM，触发后取消运行中的任务、关闭准入并逐个释放工具。

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::core::Orchestrator;

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            shutdown_token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 触发关闭；重复触发只广播原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        let _ = self.reason_tx.send(reason);
        self.shutdown_token.cancel();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, shutting down");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, shutting down");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 运行 work 直到完成或收到关闭信号；两种情况下都会关停编排器
///
/// work 完成时返回 Ok(输出)，被信号打断时返回 Err(关闭原因)。
pub async fn run_until_shutdown<F, T>(
    manager: Arc<ShutdownManager>,
    orchestrator: Arc<Orchestrator>,
    work: F,
) -> Result<T, ShutdownReason>
where
    F: Future<Output = T>,
{
    let mut reasons = manager.subscribe();
    manager.install_signal_handlers();

    let output = tokio::select! {
        out = work => Ok(out),
        _ = manager.wait_for_shutdown() => {
            // shutdown() 先广播原因再取消令牌
            let reason = reasons.try_recv().unwrap_or(ShutdownReason::UserInitiated);
            tracing::info!("Shutdown signal received: {:?}", reason);
            Err(reason)
        }
    };

    let failed = orchestrator.shutdown().await;
    if failed.is_empty() {
        tracing::info!("All tools released");
    } else {
        tracing::warn!("Tools failed to release: {:?}", failed);
    }
    output
}
