//! 共享状态：一次任务内在步骤之间传递的可变记录
//!
//! SharedState 由编排器独占，每次只以 `&mut` 借给一个步骤；step_results 按执行顺序追加。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 任务状态：PENDING → RUNNING → {COMPLETED | FAILED | CANCELLED}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// 步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
    Timeout,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }
}

/// 单个步骤的执行记录（一组尝试共用一条）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step_id: String,
    pub task_id: String,
    pub status: StepStatus,
    /// 仅 Completed 时存在
    pub result: Option<Value>,
    /// 仅 Failed / Timeout 时存在
    pub error: Option<String>,
    /// 从首次尝试开始到终态的累计耗时（秒），包含退避等待
    pub execution_time: f64,
    /// 实际执行的重试次数（0 表示首次即成功或失败）
    pub retry_count: u32,
}

impl StepOutcome {
    pub fn pending(step_id: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            task_id: task_id.into(),
            status: StepStatus::Pending,
            result: None,
            error: None,
            execution_time: 0.0,
            retry_count: 0,
        }
    }

    pub(crate) fn mark_running(&mut self) {
        if !self.status.is_terminal() {
            self.status = StepStatus::Running;
        }
    }

    pub(crate) fn mark_retrying(&mut self, retry_count: u32) {
        if !self.status.is_terminal() {
            self.status = StepStatus::Retrying;
            self.retry_count = retry_count;
        }
    }

    pub(crate) fn complete(&mut self, result: Value, execution_time: f64) {
        if self.status.is_terminal() {
            return;
        }
        self.status = StepStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.execution_time = execution_time;
    }

    pub(crate) fn fail(&mut self, error: String, execution_time: f64) {
        if self.status.is_terminal() {
            return;
        }
        self.status = StepStatus::Failed;
        self.result = None;
        self.error = Some(error);
        self.execution_time = execution_time;
    }
}

/// 任务共享状态
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SharedState {
    task_id: String,
    /// 执行顺序即插入顺序
    pub step_results: Vec<StepOutcome>,
    /// 步骤之间唯一的通信通道
    pub shared_data: Map<String, Value>,
    /// 横切簿记：错误、耗时、状态
    pub execution_metadata: Map<String, Value>,
}

impl SharedState {
    pub fn new(task_id: impl Into<String>, initial_data: Map<String, Value>) -> Self {
        Self {
            task_id: task_id.into(),
            step_results: Vec::new(),
            shared_data: initial_data,
            execution_metadata: Map::new(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// 按步骤名查找执行记录
    pub fn step_result(&self, step_id: &str) -> Option<&StepOutcome> {
        self.step_results.iter().find(|o| o.step_id == step_id)
    }

    /// 读取共享数据；缺失表示「尚未产生」
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.shared_data.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.shared_data.insert(key.into(), value);
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.execution_metadata.insert(key.into(), value);
    }

    /// 步骤结果在 shared_data 中的键
    pub fn result_key(step_id: &str) -> String {
        format!("{step_id}_result")
    }

    /// 读取某步骤写入的结果
    pub fn step_output(&self, step_id: &str) -> Option<&Value> {
        self.shared_data.get(&Self::result_key(step_id))
    }
}
