//! 核心编排层：错误、状态、任务配置、准入控制、步骤抽象、编排器、构建器与优雅关闭

pub mod admission;
pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod shutdown;
pub mod state;
pub mod step;
pub mod task;

pub use admission::AdmissionControl;
pub use builder::{create_orchestrator_builder, OrchestratorBuilder};
pub use error::{OrchestratorError, StepError};
pub use orchestrator::Orchestrator;
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::{SharedState, StepOutcome, StepStatus, TaskStatus};
pub use step::{Step, StepContext};
pub use task::{
    CancelOutcome, TaskConfig, TaskId, TaskReport, TaskRequest, TaskSnapshot, TASK_TIMEOUT,
};
