//! Durable destinations for exported values.
//!
//! A sink is only ever handed a value after the export it belongs to has
//! resolved. Writing a credential while it is still pending would persist
//! incomplete state, so sinks run after the stack run has finished.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::ser::{PrettyFormatter, Serializer};
use serde_json::Value;
use tracing::debug;

use crate::error::CoreResult;

/// Trait for export sink implementations.
#[async_trait]
pub trait ExportSink: Send + Sync {
    /// Persist one resolved export.
    async fn write(&self, name: &str, value: &Value) -> CoreResult<()>;
}

/// Writes an export to a file.
///
/// By default the file holds pretty-printed JSON indented by two spaces. In
/// raw mode a string value is written verbatim, which suits kubeconfig
/// documents.
#[derive(Debug, Clone)]
pub struct FileSink {
    path: PathBuf,
    raw: bool,
    indent: usize,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            raw: false,
            indent: 2,
        }
    }

    pub fn raw(mut self) -> Self {
        self.raw = true;
        self
    }

    /// Spaces per nesting level of the JSON output.
    pub fn indent(mut self, spaces: usize) -> Self {
        self.indent = spaces;
        self
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl ExportSink for FileSink {
    async fn write(&self, name: &str, value: &Value) -> CoreResult<()> {
        let content = match value {
            Value::String(text) if self.raw => text.clone().into_bytes(),
            other => {
                let indent = " ".repeat(self.indent);
                let formatter = PrettyFormatter::with_indent(indent.as_bytes());
                let mut buffer = Vec::new();
                let mut serializer = Serializer::with_formatter(&mut buffer, formatter);
                other.serialize(&mut serializer)?;
                buffer
            }
        };
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, content).await?;
        debug!("Wrote export {} to {:?}", name, self.path);
        Ok(())
    }
}

/// Collects exports in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    written: Arc<RwLock<BTreeMap<String, Value>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.written.read().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.written.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.written.read().is_empty()
    }
}

#[async_trait]
impl ExportSink for MemorySink {
    async fn write(&self, name: &str, value: &Value) -> CoreResult<()> {
        self.written.write().insert(name.to_string(), value.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_file_sink_writes_pretty_json() {
        let dir = tempdir().unwrap();
        let sink = FileSink::new(dir.path().join("out").join("cluster.json"));

        sink.write("cluster", &json!({"name": "aks-lab"}))
            .await
            .unwrap();

        let content = std::fs::read_to_string(sink.path()).unwrap();
        assert!(content.contains("\"name\": \"aks-lab\""));
    }

    #[tokio::test]
    async fn test_file_sink_custom_indent() {
        let dir = tempdir().unwrap();
        let sink = FileSink::new(dir.path().join("kubeconfig.json")).indent(4);

        sink.write("kubeconfig", &json!({"clusters": [{"name": "eks-lab"}]}))
            .await
            .unwrap();

        let content = std::fs::read_to_string(sink.path()).unwrap();
        assert!(content.starts_with("{\n    \"clusters\": [\n        {"));
        assert_eq!(
            serde_json::from_str::<Value>(&content).unwrap(),
            json!({"clusters": [{"name": "eks-lab"}]})
        );
    }

    #[tokio::test]
    async fn test_raw_file_sink_writes_string_verbatim() {
        let dir = tempdir().unwrap();
        let sink = FileSink::new(dir.path().join("kubeconfig")).raw();

        sink.write("kubeConfig", &json!("apiVersion: v1\nkind: Config\n"))
            .await
            .unwrap();

        let content = std::fs::read_to_string(sink.path()).unwrap();
        assert_eq!(content, "apiVersion: v1\nkind: Config\n");
    }

    #[tokio::test]
    async fn test_memory_sink() {
        let sink = MemorySink::new();
        sink.write("url", &json!("http://lab/")).await.unwrap();

        assert_eq!(sink.len(), 1);
        assert_eq!(sink.get("url"), Some(json!("http://lab/")));
    }
}
