use async_trait::async_trait;
use atelier_core::{ToolExecutor, ToolOutcome};
use serde_json::json;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

/// Bytes of file content scanned per file during code search.
const SEARCH_FILE_CAP: u64 = 256 * 1024;

/// Local tool collaborator: real file system and git access scoped to
/// one project root. Every operation returns a [`ToolOutcome`] and
/// never panics on missing files or failed processes.
pub struct LocalTools {
    root: PathBuf,
    typecheck_command: Vec<String>,
}

impl LocalTools {
    /// Scope the tools to a project root.
    pub fn new(root: impl Into<PathBuf>, typecheck_command: &str) -> Self {
        Self {
            root: root.into(),
            typecheck_command: typecheck_command
                .split_whitespace()
                .map(str::to_string)
                .collect(),
        }
    }

    /// Resolve a relative path inside the root, refusing escapes.
    fn resolve(&self, path: &str) -> Result<PathBuf, String> {
        let candidate = Path::new(path);
        if candidate.is_absolute() || path.split('/').any(|part| part == "..") {
            return Err(format!("path escapes project root: {path}"));
        }
        Ok(self.root.join(candidate))
    }
}

#[async_trait]
impl ToolExecutor for LocalTools {
    async fn read_file(&self, path: &str) -> ToolOutcome {
        let resolved = match self.resolve(path) {
            Ok(p) => p,
            Err(e) => return ToolOutcome::err(e),
        };
        match tokio::fs::read_to_string(&resolved).await {
            Ok(content) => ToolOutcome::ok(json!(content)),
            Err(e) => ToolOutcome::err(format!("cannot read {path}: {e}")),
        }
    }

    async fn write_file(&self, path: &str, content: &str, create_dirs: bool) -> ToolOutcome {
        let resolved = match self.resolve(path) {
            Ok(p) => p,
            Err(e) => return ToolOutcome::err(e),
        };
        if create_dirs {
            if let Some(parent) = resolved.parent() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    return ToolOutcome::err(format!("cannot create {}: {e}", parent.display()));
                }
            }
        }
        match tokio::fs::write(&resolved, content).await {
            Ok(()) => ToolOutcome::ok(json!({"path": path, "bytes": content.len()})),
            Err(e) => ToolOutcome::err(format!("cannot write {path}: {e}")),
        }
    }

    async fn search_code(&self, query: &str, max_results: usize) -> ToolOutcome {
        let root = self.root.clone();
        let query = query.to_lowercase();
        let results = tokio::task::spawn_blocking(move || {
            let mut hits = Vec::new();
            let mut stack = vec![root.clone()];
            while let Some(dir) = stack.pop() {
                let Ok(entries) = std::fs::read_dir(&dir) else { continue };
                for entry in entries.flatten() {
                    if hits.len() >= max_results {
                        return hits;
                    }
                    let path = entry.path();
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    if path.is_dir() {
                        if !name.starts_with('.') && name != "target" && name != "node_modules" {
                            stack.push(path);
                        }
                        continue;
                    }
                    let Ok(meta) = entry.metadata() else { continue };
                    if meta.len() > SEARCH_FILE_CAP {
                        continue;
                    }
                    let Ok(content) = std::fs::read_to_string(&path) else { continue };
                    if let Some(line) = content
                        .lines()
                        .find(|l| l.to_lowercase().contains(&query))
                    {
                        let rel = path
                            .strip_prefix(&root)
                            .unwrap_or(&path)
                            .to_string_lossy()
                            .to_string();
                        hits.push(json!({"path": rel, "snippet": line.trim()}));
                    }
                }
            }
            hits
        })
        .await;
        match results {
            Ok(hits) => ToolOutcome::ok(json!(hits)),
            Err(e) => ToolOutcome::err(format!("search failed: {e}")),
        }
    }

    async fn typecheck(&self) -> ToolOutcome {
        let Some((program, args)) = self.typecheck_command.split_first() else {
            return ToolOutcome::err("no typecheck command configured");
        };
        debug!(command = ?self.typecheck_command, "Running typecheck");
        match Command::new(program)
            .args(args)
            .current_dir(&self.root)
            .output()
            .await
        {
            Ok(output) if output.status.success() => {
                ToolOutcome::ok(json!({"diagnostics": []}))
            }
            Ok(output) => ToolOutcome::err(String::from_utf8_lossy(&output.stderr).to_string()),
            Err(e) => ToolOutcome::err(format!("cannot run typecheck: {e}")),
        }
    }

    async fn git_local_commit(&self, message: &str, files: &[String]) -> ToolOutcome {
        let add = Command::new("git")
            .arg("add")
            .arg("--")
            .args(files)
            .current_dir(&self.root)
            .output()
            .await;
        match add {
            Ok(output) if !output.status.success() => {
                return ToolOutcome::err(String::from_utf8_lossy(&output.stderr).to_string());
            }
            Err(e) => return ToolOutcome::err(format!("cannot run git add: {e}")),
            _ => {}
        }
        match Command::new("git")
            .args(["commit", "-m", message])
            .current_dir(&self.root)
            .output()
            .await
        {
            Ok(output) if output.status.success() => {
                ToolOutcome::ok(json!({"message": message, "files": files}))
            }
            Ok(output) => ToolOutcome::err(String::from_utf8_lossy(&output.stderr).to_string()),
            Err(e) => ToolOutcome::err(format!("cannot run git commit: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tools(root: &Path) -> LocalTools {
        LocalTools::new(root, "true")
    }

    #[tokio::test]
    async fn test_read_write_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let tools = tools(dir.path());

        let write = tools.write_file("src/a.rs", "fn a() {}", true).await;
        assert!(write.success);
        let read = tools.read_file("src/a.rs").await;
        assert!(read.success);
        assert_eq!(read.text(), Some("fn a() {}"));
    }

    #[tokio::test]
    async fn test_missing_file_is_failed_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let read = tools(dir.path()).read_file("src/missing.rs").await;
        assert!(!read.success);
        assert!(read.error.is_some());
    }

    #[tokio::test]
    async fn test_escape_refused() {
        let dir = tempfile::tempdir().unwrap();
        let tools = tools(dir.path());
        assert!(!tools.read_file("../outside").await.success);
        assert!(!tools.write_file("/etc/passwd", "x", false).await.success);
    }

    #[tokio::test]
    async fn test_search_finds_content() {
        let dir = tempfile::tempdir().unwrap();
        let tools = tools(dir.path());
        tools
            .write_file("src/export.rs", "pub fn export_csv() {}", true)
            .await;
        let found = tools.search_code("export_csv", 5).await;
        assert!(found.success);
        let hits = found.data.unwrap();
        assert_eq!(hits.as_array().unwrap().len(), 1);
        assert_eq!(hits[0]["path"], json!("src/export.rs"));
    }
}
