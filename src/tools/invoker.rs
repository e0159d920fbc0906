//! 工具调用层：缓存 + 重试 + 单次超时
//!
//! 同一参数集在 cache_ttl 内最多执行一次；失败按 retry_delay * 2^(attempt-1) 退避重试，
//! 耗尽后返回 failed 结果（不缓存）。缓存只按 TTL 惰性失效，不按容量淘汰。

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use serde_json::{json, Map, Value};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::config::ToolsSection;
use crate::core::error::panic_message;
use crate::core::task::duration_from_secs;
use crate::tools::{Tool, ToolParams, ToolResult};

/// 单个工具实例的调用策略
#[derive(Debug, Clone, PartialEq)]
pub struct ToolConfig {
    /// 单次尝试超时
    pub timeout: Duration,
    pub max_retries: u32,
    /// 指数退避的基数
    pub retry_delay: Duration,
    pub cache_enabled: bool,
    pub cache_ttl: Duration,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self::from(&ToolsSection::default())
    }
}

impl From<&ToolsSection> for ToolConfig {
    fn from(section: &ToolsSection) -> Self {
        Self {
            timeout: duration_from_secs(section.timeout_secs),
            max_retries: section.max_retries,
            retry_delay: duration_from_secs(section.retry_delay_secs),
            cache_enabled: section.cache_enabled,
            cache_ttl: Duration::from_secs(section.cache_ttl_secs),
        }
    }
}

impl ToolConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_cache(mut self, enabled: bool, ttl: Duration) -> Self {
        self.cache_enabled = enabled;
        self.cache_ttl = ttl;
        self
    }

    /// 第 attempt 次重试（从 1 开始）前的等待：retry_delay * 2^(attempt-1)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        duration_from_secs(self.retry_delay.as_secs_f64() * 2f64.powi(exponent))
    }
}

/// 缓存键：工具名 + 递归按键排序后的 JSON
pub fn cache_key(tool_name: &str, params: &ToolParams) -> String {
    let canonical = canonicalize(&Value::Object(params.clone()));
    format!("{tool_name}:{canonical}")
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k.clone(), canonicalize(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

struct CacheEntry {
    result: ToolResult,
    stored_at: Instant,
}

/// 被调用层包装后的工具；内部缓存可被多个任务并发访问
pub struct ManagedTool {
    tool: Arc<dyn Tool>,
    config: ToolConfig,
    cache: RwLock<HashMap<String, CacheEntry>>,
    /// 同键并发未命中时只执行一次
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ManagedTool {
    pub fn new(tool: Arc<dyn Tool>, config: ToolConfig) -> Self {
        Self {
            tool,
            config,
            cache: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        self.tool.name()
    }

    pub fn description(&self) -> &str {
        self.tool.description()
    }

    /// 调用工具：先查缓存，未命中则带重试执行，成功结果写入缓存
    pub async fn invoke(&self, params: &ToolParams) -> ToolResult {
        if !self.config.cache_enabled {
            return self.execute_with_retry(params).await;
        }

        let key = cache_key(self.name(), params);
        if let Some(hit) = self.cached(&key).await {
            return hit;
        }

        let gate = self.gate(&key).await;
        let result = {
            let _guard = gate.lock().await;
            // 等待期间可能已有其他调用写入
            match self.cached(&key).await {
                Some(hit) => hit,
                None => {
                    let result = self.execute_with_retry(params).await;
                    if result.is_success() {
                        self.store(key.clone(), result.clone()).await;
                    }
                    result
                }
            }
        };
        drop(gate);
        self.release_gate(&key).await;
        result
    }

    #[cfg(test)]
    pub(crate) async fn cache_len(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.tool.shutdown().await
    }

    async fn cached(&self, key: &str) -> Option<ToolResult> {
        {
            let cache = self.cache.read().await;
            match cache.get(key) {
                None => return None,
                Some(entry) if entry.stored_at.elapsed() < self.config.cache_ttl => {
                    tracing::debug!(tool = %self.name(), "Using cached result");
                    return Some(entry.result.clone());
                }
                Some(_) => {}
            }
        }
        let mut cache = self.cache.write().await;
        if cache
            .get(key)
            .is_some_and(|entry| entry.stored_at.elapsed() >= self.config.cache_ttl)
        {
            cache.remove(key);
        }
        None
    }

    async fn store(&self, key: String, result: ToolResult) {
        self.cache.write().await.insert(
            key,
            CacheEntry {
                result,
                stored_at: Instant::now(),
            },
        );
    }

    async fn gate(&self, key: &str) -> Arc<Mutex<()>> {
        self.inflight
            .lock()
            .await
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn release_gate(&self, key: &str) {
        let mut inflight = self.inflight.lock().await;
        if inflight.get(key).is_some_and(|g| Arc::strong_count(g) == 1) {
            inflight.remove(key);
        }
    }

    async fn execute_with_retry(&self, params: &ToolParams) -> ToolResult {
        let name = self.name();
        let started = Instant::now();
        let mut last_error = String::new();

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = self.config.backoff_delay(attempt);
                tracing::info!(
                    tool = %name,
                    attempt,
                    "Retrying {} in {:.3}s",
                    name,
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
            }

            let attempt_fut = AssertUnwindSafe(self.tool.execute(params)).catch_unwind();
            match tokio::time::timeout(self.config.timeout, attempt_fut).await {
                Ok(Ok(Ok(output))) => {
                    let mut result =
                        ToolResult::completed(name, output.value, started.elapsed().as_secs_f64());
                    result.metadata = output.metadata;
                    return result.with_metadata("attempts", json!(attempt + 1));
                }
                Ok(Ok(Err(e))) => {
                    tracing::warn!(tool = %name, "Tool {} attempt {} failed: {}", name, attempt + 1, e);
                    last_error = e;
                }
                Ok(Err(panic)) => {
                    last_error = format!("{} panicked: {}", name, panic_message(panic.as_ref()));
                    tracing::warn!(tool = %name, "Tool {} attempt {} panicked", name, attempt + 1);
                }
                Err(_) => {
                    last_error = format!(
                        "{} timed out after {}s",
                        name,
                        self.config.timeout.as_secs_f64()
                    );
                    tracing::warn!(tool = %name, "Tool {} timed out on attempt {}", name, attempt + 1);
                }
            }
        }

        ToolResult::failed(name, last_error, started.elapsed().as_secs_f64())
            .with_metadata("attempts", json!(self.config.max_retries + 1))
    }
}
