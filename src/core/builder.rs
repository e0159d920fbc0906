//! 编排器构建器：统一的初始化逻辑
//!
//! CLI 与集成测试共用同一套工具注册与步骤注册。

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::{Orchestrator, TaskConfig};
use crate::steps::ToolStep;
use crate::tools::{EchoTool, FileReadTool, HttpFetchTool, ToolConfig, ToolRegistry};

/// 编排器构建器
pub struct OrchestratorBuilder {
    config: AppConfig,
    workspace: PathBuf,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig, workspace: PathBuf) -> Self {
        Self {
            config,
            workspace,
        }
    }

    /// 内置工具：echo、http_fetch、file_read，均使用 [tools] 段的默认策略
    pub fn build_tool_registry(&self) -> ToolRegistry {
        let tools_cfg = &self.config.tools;
        let mut tools = ToolRegistry::with_defaults(ToolConfig::from(tools_cfg));
        tools.register(EchoTool);
        tools.register(HttpFetchTool::new(
            tools_cfg.http.allowed_domains.clone(),
            tools_cfg.http.max_response_chars,
        ));
        tools.register(FileReadTool::new(&self.workspace, tools_cfg.files.max_chars));
        tools
    }

    pub fn task_defaults(&self) -> TaskConfig {
        TaskConfig::from(&self.config.orchestrator)
    }

    pub fn build(self) -> Orchestrator {
        let tools = Arc::new(self.build_tool_registry());
        let mut orchestrator = Orchestrator::new(self.task_defaults(), tools);

        for entry in &self.config.steps {
            if !orchestrator.tools().contains(&entry.tool) {
                tracing::warn!(
                    step = %entry.name,
                    "Step {} references unknown tool {}",
                    entry.name,
                    entry.tool
                );
            }
            orchestrator.register_step(ToolStep::from_entry(entry));
        }
        orchestrator
    }
}

/// 便捷函数：加载配置并准备工作目录；配置加载失败时退回默认值
pub fn create_orchestrator_builder(config_path: Option<PathBuf>) -> OrchestratorBuilder {
    let config = crate::config::load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let workspace = config
        .tools
        .files
        .root
        .clone()
        .unwrap_or_else(|| PathBuf::from("workspace"));
    if let Err(e) = std::fs::create_dir_all(&workspace) {
        tracing::warn!("Failed to create workspace {}: {}", workspace.display(), e);
    }
    let workspace = workspace.canonicalize().unwrap_or(workspace);

    OrchestratorBuilder::new(config, workspace)
}
