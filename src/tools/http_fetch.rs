//! HTTP 抓取工具：域名白名单、结果大小限制、JSON 自动解析
//!
//! 白名单为空时允许所有域名；`application/json` 响应解析为 JSON，其余按文本返回。
//! 响应体最多读取 max_response_chars * 4 字节，超过 max_response_chars 字符时不再解析 JSON，
//! 截断为文本并追加 ...[truncated]。单次超时由调用层 ToolConfig 控制。

use std::collections::HashSet;

use async_trait::async_trait;
use reqwest::{Client, Method, Response};
use serde_json::{json, Value};

use crate::tools::{Tool, ToolOutput, ToolParams};

const TRUNCATED_MARKER: &str = "\n...[truncated]";

/// HTTP 抓取工具
pub struct HttpFetchTool {
    client: Client,
    allowed_domains: HashSet<String>,
    max_response_chars: usize,
}

/// 从 URL 中提取 host（不含端口与路径）
fn extract_domain(url: &str) -> Option<String> {
    let url = url.trim();
    let url = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let host = url.split('/').next()?;
    let host = host.split(':').next()?;
    if host.is_empty() {
        return None;
    }
    Some(host.to_lowercase())
}

impl HttpFetchTool {
    pub fn new(allowed_domains: Vec<String>, max_response_chars: usize) -> Self {
        let allowed_domains = allowed_domains
            .into_iter()
            .map(|s| s.to_lowercase())
            .collect();
        let client = Client::builder()
            .user_agent(concat!("baton/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            client,
            allowed_domains,
            max_response_chars,
        }
    }

    fn is_allowed(&self, url: &str) -> Result<(), String> {
        let domain = extract_domain(url).ok_or_else(|| "Invalid or missing URL".to_string())?;
        if self.allowed_domains.is_empty() || self.allowed_domains.contains(&domain) {
            return Ok(());
        }
        Err(format!("Domain not in allowlist: {}", domain))
    }

    /// UTF-8 每字符至多 4 字节
    fn byte_limit(&self) -> usize {
        self.max_response_chars.saturating_mul(4)
    }

    /// 把已读取的响应体整理为结果值；返回 (值, 是否截断)
    fn shape_body(
        &self,
        body: &[u8],
        overflowed: bool,
        content_type: &str,
    ) -> Result<(Value, bool), String> {
        let text = String::from_utf8_lossy(body);
        if overflowed || text.chars().count() > self.max_response_chars {
            let cut: String = text.chars().take(self.max_response_chars).collect();
            return Ok((Value::String(cut + TRUNCATED_MARKER), true));
        }
        if content_type.contains("application/json") {
            let value =
                serde_json::from_str(&text).map_err(|e| format!("Invalid JSON body: {}", e))?;
            return Ok((value, false));
        }
        Ok((Value::String(text.into_owned()), false))
    }
}

/// 分块读取响应体，最多 limit 字节；返回 (字节, 是否超限)
async fn read_limited(mut resp: Response, limit: usize) -> Result<(Vec<u8>, bool), String> {
    let mut buf = Vec::new();
    while let Some(chunk) = resp
        .chunk()
        .await
        .map_err(|e| format!("Read body: {}", e))?
    {
        let room = limit - buf.len();
        if chunk.len() > room {
            buf.extend_from_slice(&chunk[..room]);
            return Ok((buf, true));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok((buf, false))
}

#[async_trait]
impl Tool for HttpFetchTool {
    fn name(&self) -> &str {
        "http_fetch"
    }

    fn description(&self) -> &str {
        "Fetch an HTTP endpoint. Params: {\"url\": \"https://...\", \"method\": \"GET\", \"query\": {..}, \"json\": {..}}"
    }

    async fn execute(&self, params: &ToolParams) -> Result<ToolOutput, String> {
        let url = params
            .get("url")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim();
        if url.is_empty() {
            return Err("URL is required".to_string());
        }
        self.is_allowed(url)?;

        let method_name = params
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET")
            .to_uppercase();
        let method = Method::from_bytes(method_name.as_bytes())
            .map_err(|_| format!("Invalid HTTP method: {}", method_name))?;

        tracing::info!(url = %url, method = %method, "http_fetch request");
        let mut request = self.client.request(method.clone(), url);
        if let Some(query) = params.get("query").and_then(|v| v.as_object()) {
            let pairs: Vec<(String, String)> = query
                .iter()
                .map(|(k, v)| match v {
                    Value::String(s) => (k.clone(), s.clone()),
                    other => (k.clone(), other.to_string()),
                })
                .collect();
            request = request.query(&pairs);
        }
        if let Some(body) = params.get("json") {
            request = request.json(body);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| format!("HTTP error: {}", e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(format!("HTTP {}", status));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let (body, overflowed) = read_limited(resp, self.byte_limit()).await?;
        let size = body.len();
        let (value, truncated) = self.shape_body(&body, overflowed, &content_type)?;
        if truncated {
            tracing::debug!(url = %url, size, "http_fetch response truncated");
        }

        Ok(ToolOutput::new(value)
            .with_metadata("url", json!(url))
            .with_metadata("method", json!(method.as_str()))
            .with_metadata("status_code", json!(status.as_u16()))
            .with_metadata("content_type", json!(content_type))
            .with_metadata("response_size", json!(size))
            .with_metadata("truncated", json!(truncated)))
    }
}
