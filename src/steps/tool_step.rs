//! 工具步骤：由配置 [[steps]] 声明，调用一个已注册的工具
//!
//! 参数模板中的 "{{key}}" 从 shared_data 取值：整个字符串恰为一个占位符时替换为原始 JSON 值，
//! 否则按文本拼接；找不到的 key 保持原样。

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::config::StepEntry;
use crate::core::{SharedState, Step, StepContext, StepError};

/// 从配置项构建的步骤
pub struct ToolStep {
    name: String,
    description: String,
    tool: String,
    params_template: Map<String, Value>,
}

impl ToolStep {
    pub fn new(
        name: impl Into<String>,
        tool: impl Into<String>,
        params_template: Map<String, Value>,
    ) -> Self {
        let tool = tool.into();
        Self {
            name: name.into(),
            description: format!("Invoke tool {}", tool),
            tool,
            params_template,
        }
    }

    pub fn from_entry(entry: &StepEntry) -> Self {
        let mut step = Self::new(&entry.name, &entry.tool, entry.params.clone());
        if !entry.description.is_empty() {
            step.description = entry.description.clone();
        }
        step
    }

    fn substitute(&self, data: &Map<String, Value>) -> Map<String, Value> {
        self.params_template
            .iter()
            .map(|(k, v)| (k.clone(), substitute_value(v, data)))
            .collect()
    }
}

fn substitute_value(value: &Value, data: &Map<String, Value>) -> Value {
    match value {
        Value::String(s) => substitute_str(s, data),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute_value(v, data)).collect()),
        Value::Object(obj) => Value::Object(
            obj.iter()
                .map(|(k, v)| (k.clone(), substitute_value(v, data)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute_str(s: &str, data: &Map<String, Value>) -> Value {
    // 整串占位符保留原始类型
    if let Some(key) = s.strip_prefix("{{").and_then(|rest| rest.strip_suffix("}}")) {
        if !key.contains("{{") && !key.contains("}}") {
            if let Some(v) = data.get(key.trim()) {
                return v.clone();
            }
        }
    }

    // 单次从左到右扫描，替换进来的值不再展开
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            out.push_str(&rest[open..]);
            rest = "";
            break;
        };
        match data.get(after[..close].trim()) {
            Some(Value::String(x)) => out.push_str(x),
            Some(v) => out.push_str(&v.to_string()),
            None => out.push_str(&rest[open..open + close + 4]),
        }
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    Value::String(out)
}

#[async_trait]
impl Step for ToolStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, state: &mut SharedState, ctx: &StepContext) -> Result<Value, StepError> {
        let params = self.substitute(&state.shared_data);
        tracing::debug!(
            task_id = %ctx.task_id(),
            step = %self.name,
            tool = %self.tool,
            attempt = ctx.attempt(),
            "tool step invoke"
        );
        let result = ctx.require_tool(&self.tool, params).await?;
        Ok(result.result.unwrap_or(Value::Null))
    }
}
