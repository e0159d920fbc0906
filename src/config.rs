//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BATON__*` 覆盖（双下划线表示嵌套，如 `BATON__ORCHESTRATOR__MAX_RETRIES=5`）。

use std::path::PathBuf;

use serde::Deserialize;
use serde_json::{Map, Value};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    /// 任务默认策略
    pub orchestrator: OrchestratorSection,
    /// 工具默认策略与内置工具参数
    pub tools: ToolsSection,
    /// [[steps]]：由配置声明的工具步骤
    pub steps: Vec<StepEntry>,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "baton".to_string(),
        }
    }
}

/// [orchestrator] 段：进程级任务默认值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// 整个任务的截止时间（秒）
    pub timeout_secs: f64,
    pub max_retries: u32,
    pub retry_delay_secs: f64,
    pub retry_backoff: f64,
    /// 所有任务共享的同时运行步骤上限
    pub concurrent_agents: usize,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            timeout_secs: 300.0,
            max_retries: 3,
            retry_delay_secs: 1.0,
            retry_backoff: 2.0,
            concurrent_agents: 5,
        }
    }
}

/// [tools] 段：默认工具策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次尝试超时（秒）
    pub timeout_secs: f64,
    pub max_retries: u32,
    pub retry_delay_secs: f64,
    pub cache_enabled: bool,
    pub cache_ttl_secs: u64,
    pub http: HttpSection,
    pub files: FilesSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            timeout_secs: 30.0,
            max_retries: 2,
            retry_delay_secs: 1.0,
            cache_enabled: true,
            cache_ttl_secs: 300,
            http: HttpSection::default(),
            files: FilesSection::default(),
        }
    }
}

/// [tools.http] 段：http_fetch 的域名白名单（空表示不限制）与响应字符上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    pub allowed_domains: Vec<String>,
    pub max_response_chars: usize,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            allowed_domains: Vec::new(),
            max_response_chars: 20_000,
        }
    }
}

/// [tools.files] 段：file_read 的沙箱根目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilesSection {
    /// 未设置时用 ./workspace
    pub root: Option<PathBuf>,
    pub max_chars: usize,
}

impl Default for FilesSection {
    fn default() -> Self {
        Self {
            root: None,
            max_chars: 20_000,
        }
    }
}

/// [[steps]] 条目：调用一个工具，params 中的 "{{key}}" 从 shared_data 取值
#[derive(Debug, Clone, Deserialize)]
pub struct StepEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub tool: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// 从 config 目录加载配置，环境变量 BATON__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 BATON__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BATON")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
