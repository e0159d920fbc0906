//! Baton - 线性多步骤任务编排引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 编排器、共享状态、步骤抽象、准入控制、任务配置与优雅关闭
//! - **observability**: 日志初始化
//! - **steps**: 配置声明的工具步骤
//! - **tools**: 工具 trait、注册表、带超时 / 重试 / 缓存的调用器，以及内置工具（echo、http_fetch、file_read）

pub mod config;
pub mod core;
pub mod observability;
pub mod steps;
pub mod tools;

pub use crate::core::{Orchestrator, SharedState, Step, StepContext, TaskConfig, TaskReport, TaskRequest};
pub use crate::tools::{Tool, ToolRegistry, ToolResult};
