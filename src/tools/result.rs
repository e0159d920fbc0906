//! 工具调用结果：无论底层操作是什么，统一返回 ToolResult

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 工具参数：命名参数表
pub type ToolParams = Map<String, Value>;

/// 工具状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Timeout,
}

/// 一次工具调用的结果；缓存命中时原样返回
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_name: String,
    pub status: ToolStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub execution_time: f64,
    pub metadata: Map<String, Value>,
}

impl ToolResult {
    pub fn completed(tool_name: impl Into<String>, result: Value, execution_time: f64) -> Self {
        Self {
            tool_name: tool_name.into(),
            status: ToolStatus::Completed,
            result: Some(result),
            error: None,
            execution_time,
            metadata: Map::new(),
        }
    }

    pub fn failed(tool_name: impl Into<String>, error: impl Into<String>, execution_time: f64) -> Self {
        Self {
            tool_name: tool_name.into(),
            status: ToolStatus::Failed,
            result: None,
            error: Some(error.into()),
            execution_time,
            metadata: Map::new(),
        }
    }

    /// 注册表中找不到工具时的合成结果
    pub fn not_found(tool_name: &str) -> Self {
        Self::failed(tool_name, format!("Tool {tool_name} not found"), 0.0)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ToolStatus::Completed
    }
}
