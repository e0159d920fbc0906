//! 编排器错误类型
//!
//! OrchestratorError 描述计划构建与引擎自身的错误；StepError 由步骤返回，决定是否继续重试。

use thiserror::Error;

/// 编排器错误：计划构建失败、准入关闭、任务不存在等
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("Step sequence is empty")]
    EmptySequence,

    #[error("Step {0} not registered")]
    StepNotRegistered(String),

    #[error("Step {0} appears more than once in sequence")]
    DuplicateStep(String),

    #[error("Admission control closed")]
    AdmissionClosed,

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task {0} has not finished")]
    TaskNotFinished(String),
}

/// 步骤执行错误
///
/// Failed / Tool 视为可重试；Fatal 表示步骤明确要求不再重试。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    #[error("{0}")]
    Failed(String),

    #[error("{0}")]
    Fatal(String),

    #[error("Tool {tool} failed: {error}")]
    Tool { tool: String, error: String },
}

impl StepError {
    pub fn failed(msg: impl std::fmt::Display) -> Self {
        Self::Failed(msg.to_string())
    }

    pub fn fatal(msg: impl std::fmt::Display) -> Self {
        Self::Fatal(msg.to_string())
    }

    /// 是否允许按任务配置重试
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }
}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(err.to_string())
    }
}

/// 从 panic 负载中取出可读信息
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construction_error_names_step() {
        let err = OrchestratorError::StepNotRegistered("missing".to_string());
        assert_eq!(err.to_string(), "Step missing not registered");
    }

    #[test]
    fn test_fatal_is_not_retryable() {
        assert!(StepError::failed("boom").is_retryable());
        assert!(StepError::Tool {
            tool: "echo".into(),
            error: "x".into()
        }
        .is_retryable());
        assert!(!StepError::fatal("bad input").is_retryable());
    }

    #[test]
    fn test_anyhow_converts_to_failed() {
        let err: StepError = anyhow::anyhow!("disk full").into();
        assert_eq!(err, StepError::Failed("disk full".to_string()));
    }
}
