//! Echo 工具（测试与演示用）

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::{Tool, ToolOutput, ToolParams};

/// Echo 工具：回显 text 参数，缺省时回显全部参数
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text (for testing). Params: {\"text\": \"message\"}"
    }

    async fn execute(&self, params: &ToolParams) -> Result<ToolOutput, String> {
        let value = match params.get("text") {
            Some(text) => text.clone(),
            None => Value::Object(params.clone()),
        };
        Ok(value.into())
    }
}
