//! 准入控制：所有任务共享的步骤并发上限
//!
//! 每次尝试（包括重试）进入前获取一个许可，许可随作用域释放，失败、取消或 panic 时同样归还。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::OrchestratorError;

/// 全局步骤并发限制
#[derive(Debug, Clone)]
pub struct AdmissionControl {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl AdmissionControl {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// 获取一个执行许可；丢弃返回值即释放
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, OrchestratorError> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| OrchestratorError::AdmissionClosed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 当前空闲许可数
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// 关闭后新的 acquire 立即失败（关停时使用）
    pub fn close(&self) {
        self.semaphore.close();
    }
}

impl Default for AdmissionControl {
    fn default() -> Self {
        Self::new(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_permit_released_on_drop() {
        let admission = AdmissionControl::new(2);
        {
            let _a = admission.acquire().await.unwrap();
            let _b = admission.acquire().await.unwrap();
            assert_eq!(admission.available(), 0);
        }
        assert_eq!(admission.available(), 2);
    }

    #[tokio::test]
    async fn test_zero_capacity_is_clamped() {
        let admission = AdmissionControl::new(0);
        assert_eq!(admission.capacity(), 1);
        assert!(admission.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_admission_rejects() {
        let admission = AdmissionControl::new(1);
        admission.close();
        assert_eq!(
            admission.acquire().await.unwrap_err(),
            OrchestratorError::AdmissionClosed
        );
    }
}
