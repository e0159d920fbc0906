//! 内置步骤

pub mod tool_step;

pub use tool_step::ToolStep;
