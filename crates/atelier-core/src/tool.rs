use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result envelope returned by every tool operation.
///
/// The core never assumes a tool call succeeded; callers always branch on
/// `success` rather than relying on `Err` propagation from the
/// collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Payload on success.
    pub data: Option<serde_json::Value>,
    /// Message on failure.
    pub error: Option<String>,
}

impl ToolOutcome {
    /// A successful outcome carrying the given payload.
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// A failed outcome carrying the given message.
    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }

    /// The payload interpreted as text, if present.
    pub fn text(&self) -> Option<&str> {
        self.data.as_ref().and_then(serde_json::Value::as_str)
    }
}

/// The external file-system / code-search / git collaborator.
///
/// Implementations wrap whatever tool layer the deployment uses; the core
/// only depends on this contract.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Read a file. `data` is the file content as a JSON string on
    /// success; a missing file is a failed outcome, not an `Err`.
    async fn read_file(&self, path: &str) -> ToolOutcome;

    /// Write a file, optionally creating parent directories.
    async fn write_file(&self, path: &str, content: &str, create_dirs: bool) -> ToolOutcome;

    /// Search the project for code matching `query`.
    async fn search_code(&self, query: &str, max_results: usize) -> ToolOutcome;

    /// Run the project typecheck. `data` carries diagnostics.
    async fn typecheck(&self) -> ToolOutcome;

    /// Create one local commit covering `files`.
    async fn git_local_commit(&self, message: &str, files: &[String]) -> ToolOutcome;
}
