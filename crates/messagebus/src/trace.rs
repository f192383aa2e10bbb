use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::io::AsyncWriteExt;

/// Append-only record of every message crossing every connection, for
/// after-the-fact debugging. Writes are best-effort: a failure is logged and
/// swallowed, never propagated to the connection it's tracing.
pub struct TraceSink {
    path: PathBuf,
}

impl TraceSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record one message. `raw` is the message text as it crossed the wire;
    /// it's re-printed with 2-space indentation so the log reads the same
    /// regardless of how the peer formatted it.
    pub async fn record(&self, local: &str, peer: &str, raw: &str, incoming: bool) {
        let pretty = serde_json::from_str::<Value>(raw)
            .ok()
            .and_then(|v| serde_json::to_string_pretty(&v).ok())
            .unwrap_or_else(|| raw.to_string());
        let arrow = if incoming {
            format!("{local} <- {peer} (incoming)")
        } else {
            format!("{local} -> {peer} (outgoing)")
        };
        let entry = format!("{arrow}\n{pretty}\n\n");
        if let Err(err) = self.append(&entry).await {
            tracing::debug!(%err, path = %self.path.display(), "failed to write trace entry");
        }
    }

    async fn append(&self, entry: &str) -> std::io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(entry.as_bytes()).await?;
        file.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_indented_messages_in_both_directions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.log");
        let sink = TraceSink::new(&path);

        sink.record("server", "client-1", r#"{"jsonrpc":"2.0","method":"ping"}"#, true)
            .await;
        sink.record(
            "server",
            "client-1",
            r#"{"jsonrpc":"2.0","id":1,"result":"pong"}"#,
            false,
        )
        .await;

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(contents.contains("server <- client-1 (incoming)"));
        assert!(contents.contains("server -> client-1 (outgoing)"));
        assert!(contents.contains("\"method\": \"ping\""));
    }

    #[tokio::test]
    async fn unwritable_path_does_not_panic() {
        let sink = TraceSink::new("/nonexistent/directory/trace.log");
        sink.record("a", "b", "{}", true).await;
    }
}
