//! File operations inside workload containers.
//!
//! A stateless wrapper over one-shot shell execs; nothing here holds
//! state between calls. File content transfer stays on the runtime's
//! archive API and is not part of this surface.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::runtime::{collect_output, Runtime};

/// Metadata for one file or directory inside a container.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub name: String,
    pub path: String,
    pub size: i64,
    pub is_dir: bool,
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
}

pub struct FileManager {
    runtime: Arc<dyn Runtime>,
}

impl FileManager {
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        Self { runtime }
    }

    pub async fn list(&self, container_id: &str, path: &str) -> Result<Vec<FileInfo>> {
        let path = if path.is_empty() { "/" } else { path };
        let output = self
            .run(container_id, format!("ls -la {}", shell_quote(path)))
            .await?;
        Ok(parse_ls_output(&output, path))
    }

    pub async fn remove(&self, container_id: &str, path: &str) -> Result<()> {
        self.run(container_id, format!("rm -rf {}", shell_quote(path)))
            .await?;
        Ok(())
    }

    pub async fn create_dir(&self, container_id: &str, path: &str) -> Result<()> {
        self.run(container_id, format!("mkdir -p {}", shell_quote(path)))
            .await?;
        Ok(())
    }

    pub async fn file_size(&self, container_id: &str, path: &str) -> Result<i64> {
        let output = self
            .run(container_id, format!("stat -c %s {}", shell_quote(path)))
            .await?;
        output
            .trim()
            .parse()
            .with_context(|| format!("unexpected stat output: {output:?}"))
    }

    async fn run(&self, container_id: &str, command: String) -> Result<String> {
        let output = self
            .runtime
            .exec(
                container_id,
                vec!["/bin/sh".to_string(), "-c".to_string(), command],
            )
            .await?;
        collect_output(output).await
    }
}

/// Single-quote a path for `/bin/sh -c`.
fn shell_quote(path: &str) -> String {
    format!("'{}'", path.replace('\'', r"'\''"))
}

/// Parse `ls -la` output into file metadata. Unparseable lines, the
/// `total` header, and the `.`/`..` entries are skipped.
fn parse_ls_output(output: &str, base_path: &str) -> Vec<FileInfo> {
    let mut files = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("total") {
            continue;
        }

        // -rw-r--r-- 1 user group size date time name
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 9 {
            continue;
        }

        let mode = parts[0];
        let name = parts[8..].join(" ");
        if name == "." || name == ".." {
            continue;
        }

        let is_dir = mode.starts_with('d');
        let size = parts[4].parse().unwrap_or(0);
        let extension = if is_dir {
            None
        } else {
            name.rsplit_once('.').map(|(_, ext)| format!(".{ext}"))
        };

        let path = if base_path.ends_with('/') {
            format!("{base_path}{name}")
        } else {
            format!("{base_path}/{name}")
        };

        files.push(FileInfo {
            name,
            path,
            size,
            is_dir,
            mode: mode.to_string(),
            extension,
        });
    }

    files
}
