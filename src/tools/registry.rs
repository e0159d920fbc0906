//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / execute / shutdown），注册时包一层 ManagedTool
//! （缓存 + 重试 + 超时），由 ToolRegistry 按名查找；注册表在进程启动时构建，之后以 Arc 只读共享。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::tools::{ManagedTool, ToolConfig, ToolParams, ToolResult};

/// 工具一次成功执行的输出：结果值 + 附加元数据
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub value: Value,
    pub metadata: Map<String, Value>,
}

impl ToolOutput {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

impl From<Value> for ToolOutput {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

/// 工具 trait：名称、描述、异步执行（命名参数），以及可选的资源释放钩子
///
/// execute 返回 Err 视为一次失败的尝试，由 ManagedTool 决定是否重试。
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（注册表中的键）
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    async fn execute(&self, params: &ToolParams) -> Result<ToolOutput, String>;

    /// 关停时释放资源（关闭客户端等）
    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// 单个释放钩子的最长等待
const SHUTDOWN_HOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// 工具注册表：按名称存储 Arc<ManagedTool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<ManagedTool>>,
    defaults: ToolConfig,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 使用给定的默认工具配置
    pub fn with_defaults(defaults: ToolConfig) -> Self {
        Self {
            tools: HashMap::new(),
            defaults,
        }
    }

    pub fn defaults(&self) -> &ToolConfig {
        &self.defaults
    }

    /// 以默认配置注册；同名覆盖
    pub fn register(&mut self, tool: impl Tool + 'static) {
        let config = self.defaults.clone();
        self.register_with_config(tool, config);
    }

    pub fn register_with_config(&mut self, tool: impl Tool + 'static, config: ToolConfig) {
        self.register_arc(Arc::new(tool), config);
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>, config: ToolConfig) {
        let name = tool.name().to_string();
        if self
            .tools
            .insert(name.clone(), Arc::new(ManagedTool::new(tool, config)))
            .is_some()
        {
            tracing::info!(tool = %name, "Replaced tool");
        } else {
            tracing::info!(tool = %name, "Registered tool");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ManagedTool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// 按名调用；工具不存在时返回 failed 结果而不是错误
    pub async fn invoke(&self, name: &str, params: ToolParams) -> ToolResult {
        match self.tools.get(name) {
            Some(tool) => tool.invoke(&params).await,
            None => {
                tracing::warn!(tool = %name, "Tool not found");
                ToolResult::not_found(name)
            }
        }
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 返回 (name, description) 列表
    pub fn tool_descriptions(&self) -> Vec<(String, String)> {
        let mut items: Vec<(String, String)> = self
            .tools
            .iter()
            .map(|(name, tool)| (name.clone(), tool.description().to_string()))
            .collect();
        items.sort();
        items
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 依次调用所有工具的释放钩子；单个失败或超时只记录日志，返回失败的工具名
    pub async fn shutdown_all(&self) -> Vec<String> {
        tracing::info!("Shutting down {} tools...", self.tools.len());
        let mut failed = Vec::new();
        for name in self.tool_names() {
            let Some(tool) = self.tools.get(&name) else {
                continue;
            };
            match tokio::time::timeout(SHUTDOWN_HOOK_TIMEOUT, tool.shutdown()).await {
                Ok(Ok(())) => tracing::debug!(tool = %name, "Tool released"),
                Ok(Err(e)) => {
                    tracing::warn!(tool = %name, "Tool shutdown failed: {}", e);
                    failed.push(name);
                }
                Err(_) => {
                    tracing::warn!(
                        tool = %name,
                        "Tool shutdown timed out after {}s",
                        SHUTDOWN_HOOK_TIMEOUT.as_secs()
                    );
                    failed.push(name);
                }
            }
        }
        failed
    }
}
