//! 工具层：Tool trait、调用层（缓存 + 重试 + 超时）、注册表与内置工具

pub mod echo;
pub mod file_read;
pub mod http_fetch;
pub mod invoker;
pub mod registry;
pub mod result;

pub use echo::EchoTool;
pub use file_read::FileReadTool;
pub use http_fetch::HttpFetchTool;
pub use invoker::{cache_key, ManagedTool, ToolConfig};
pub use registry::{Tool, ToolOutput, ToolRegistry};
pub use result::{ToolParams, ToolResult, ToolStatus};
