//! 步骤单元：计划中的一个命名阶段
//!
//! Step 读取 / 写入 SharedState，可通过 StepContext 调用工具；返回值由编排器写入
//! `shared_data["<name>_result"]`。同一步骤可能被重试，实现需保证重复执行是安全的。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::{SharedState, StepError};
use crate::tools::{ToolParams, ToolRegistry, ToolResult};

/// 步骤 trait
#[async_trait]
pub trait Step: Send + Sync {
    /// 步骤名称（计划中的引用名）
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// 执行一次尝试；Err 按任务配置重试（StepError::Fatal 除外）
    async fn run(&self, state: &mut SharedState, ctx: &StepContext) -> Result<Value, StepError>;

    /// 最后一次尝试结束后调用一次（成功、失败、超时放弃、取消都会调用）
    async fn release(&self, _ctx: &StepContext) {}
}

/// 步骤执行上下文：任务标识、当前尝试序号、工具注册表与取消信号
#[derive(Clone)]
pub struct StepContext {
    task_id: String,
    step_id: String,
    attempt: u32,
    tools: Arc<ToolRegistry>,
    cancel: CancellationToken,
}

impl StepContext {
    pub fn new(
        task_id: impl Into<String>,
        step_id: impl Into<String>,
        tools: Arc<ToolRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            step_id: step_id.into(),
            attempt: 0,
            tools,
            cancel,
        }
    }

    pub(crate) fn with_attempt(&self, attempt: u32) -> Self {
        let mut ctx = self.clone();
        ctx.attempt = attempt;
        ctx
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    /// 当前尝试序号（0 为首次执行）
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// 通过注册表调用工具；工具缺失或失败都以 ToolResult 返回
    pub async fn invoke_tool(&self, name: &str, params: ToolParams) -> ToolResult {
        self.tools.invoke(name, params).await
    }

    /// 调用工具，失败时转为 StepError::Tool
    pub async fn require_tool(&self, name: &str, params: ToolParams) -> Result<ToolResult, StepError> {
        let result = self.invoke_tool(name, params).await;
        if result.is_success() {
            Ok(result)
        } else {
            Err(StepError::Tool {
                tool: name.to_string(),
                error: result.error.unwrap_or_else(|| "unknown error".to_string()),
            })
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 协作式检查点
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}
