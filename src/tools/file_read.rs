//! 沙箱文件读取工具
//!
//! 绑定 root_dir，所有路径经 resolve 校验必须在 root 下（禁止 ../ 逃逸）；
//! `.json` 文件解析为 JSON，其余按文本返回。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tools::{Tool, ToolOutput, ToolParams};

/// 文件读取工具
pub struct FileReadTool {
    root_dir: PathBuf,
    max_chars: usize,
}

impl FileReadTool {
    pub fn new(root_dir: impl AsRef<Path>, max_chars: usize) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir, max_chars }
    }

    /// 检查路径是否在沙箱内
    fn resolve(&self, path: &str) -> Result<PathBuf, String> {
        let path = path.trim_start_matches("./");
        let full = self.root_dir.join(path);
        let canonical = full
            .canonicalize()
            .map_err(|_| format!("Path not found: {}", path))?;
        if canonical.starts_with(&self.root_dir) {
            Ok(canonical)
        } else {
            Err(format!("Path escapes root: {}", path))
        }
    }
}

#[async_trait]
impl Tool for FileReadTool {
    fn name(&self) -> &str {
        "file_read"
    }

    fn description(&self) -> &str {
        "Read a file under the configured root. Params: {\"path\": \"relative/path\"}"
    }

    async fn execute(&self, params: &ToolParams) -> Result<ToolOutput, String> {
        let path = params
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim();
        if path.is_empty() {
            return Err("Missing path".to_string());
        }
        let resolved = self.resolve(path)?;
        let body = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| format!("Read failed: {}", e))?;
        let size = body.len();

        let is_json = resolved.extension().is_some_and(|ext| ext == "json");
        let value = if is_json {
            serde_json::from_str(&body).map_err(|e| format!("Invalid JSON in {}: {}", path, e))?
        } else if body.chars().count() > self.max_chars {
            Value::String(body.chars().take(self.max_chars).collect::<String>() + "\n...[truncated]")
        } else {
            Value::String(body)
        };

        Ok(ToolOutput::new(value)
            .with_metadata("path", json!(path))
            .with_metadata("size", json!(size)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(path: &str) -> ToolParams {
        let mut p = ToolParams::new();
        p.insert("path".into(), json!(path));
        p
    }

    #[tokio::test]
    async fn test_reads_json_and_text() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.json"), r#"{"rows": [1, 2]}"#).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "abcdef").unwrap();
        let tool = FileReadTool::new(dir.path(), 4);

        let out = tool.execute(&params("data.json")).await.unwrap();
        assert_eq!(out.value, json!({"rows": [1, 2]}));
        assert_eq!(out.metadata["size"], json!(16));

        let out = tool.execute(&params("./notes.txt")).await.unwrap();
        assert_eq!(out.value, json!("abcd\n...[truncated]"));
    }

    #[tokio::test]
    async fn test_rejects_escape_and_missing() {
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().join("root");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(outer.path().join("secret.txt"), "x").unwrap();
        let tool = FileReadTool::new(&root, 100);

        let err = tool.execute(&params("../secret.txt")).await.unwrap_err();
        assert!(err.contains("escapes"));
        let err = tool.execute(&params("nope.txt")).await.unwrap_err();
        assert!(err.contains("not found"));
        assert_eq!(tool.execute(&ToolParams::new()).await.unwrap_err(), "Missing path");
    }
}
