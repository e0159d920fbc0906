//! 任务级类型：配置、提交请求、最终报告与状态快照

use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::OrchestratorSection;
use crate::core::{SharedState, StepOutcome, TaskStatus};

pub type TaskId = String;

/// 单个任务的执行策略；未指定时取进程级默认值
#[derive(Debug, Clone, PartialEq)]
pub struct TaskConfig {
    /// 整个计划（含所有重试）的截止时间
    pub timeout: Duration,
    pub max_retries: u32,
    /// 第一次重试前的等待
    pub retry_delay: Duration,
    /// 每次重试等待的乘数
    pub retry_backoff: f64,
    /// 全局并发上限（只在构建引擎时生效）
    pub concurrent_agents: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self::from(&OrchestratorSection::default())
    }
}

impl From<&OrchestratorSection> for TaskConfig {
    fn from(section: &OrchestratorSection) -> Self {
        Self {
            timeout: duration_from_secs(section.timeout_secs),
            max_retries: section.max_retries,
            retry_delay: duration_from_secs(section.retry_delay_secs),
            retry_backoff: section.retry_backoff,
            concurrent_agents: section.concurrent_agents.max(1),
        }
    }
}

impl TaskConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration, retry_backoff: f64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self.retry_backoff = retry_backoff;
        self
    }

    pub fn with_concurrent_agents(mut self, concurrent_agents: usize) -> Self {
        self.concurrent_agents = concurrent_agents.max(1);
        self
    }

    /// 第 attempt 次重试（从 1 开始）前的等待：retry_delay * retry_backoff^(attempt-1)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        duration_from_secs(self.retry_delay.as_secs_f64() * self.retry_backoff.powi(exponent))
    }
}

/// 秒数转 Duration；负数与 NaN 视为 0，溢出饱和
pub fn duration_from_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// 任务提交请求
#[derive(Debug, Clone, Default)]
pub struct TaskRequest {
    pub step_sequence: Vec<String>,
    pub initial_data: Map<String, Value>,
    pub config: Option<TaskConfig>,
}

impl TaskRequest {
    pub fn new<I, S>(steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            step_sequence: steps.into_iter().map(Into::into).collect(),
            initial_data: Map::new(),
            config: None,
        }
    }

    pub fn with_data(mut self, initial_data: Map<String, Value>) -> Self {
        self.initial_data = initial_data;
        self
    }

    pub fn with_config(mut self, config: TaskConfig) -> Self {
        self.config = Some(config);
        self
    }
}

/// 任务最终结果：累积的共享状态 + 每步执行记录
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub total_execution_time: f64,
    pub state: SharedState,
}

impl TaskReport {
    pub fn step_result(&self, step_id: &str) -> Option<&StepOutcome> {
        self.state.step_result(step_id)
    }

    pub fn is_timeout(&self) -> bool {
        self.error.as_deref() == Some(TASK_TIMEOUT)
    }
}

/// 截止时间耗尽时写入 execution_metadata["error"] 的标记
pub const TASK_TIMEOUT: &str = "Task timeout";

/// 任务状态快照（供轮询）
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub current_step: Option<String>,
    pub step_results: Vec<StepOutcome>,
    pub error: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

/// 取消请求的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NotRunning,
}
