//! Resource checks through external scripts.
//!
//! Each resource type has a `check` executable at `<scripts>/<type>/check`.
//! It receives `{"source": {...}, "version": {...} | null}` on stdin and
//! prints a JSON array of versions, oldest first, on stdout.

use async_trait::async_trait;
use conveyor_core::checker::ResourceChecker;
use conveyor_core::pipeline::{ResourceTypes, Source, Version};
use conveyor_core::{Error, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

#[derive(Serialize)]
struct CheckRequest<'a> {
    source: &'a Source,
    version: Option<&'a Version>,
}

pub struct ScriptChecker {
    scripts: PathBuf,
}

impl ScriptChecker {
    pub fn new(scripts: PathBuf) -> Self {
        Self { scripts }
    }

    /// Custom resource types run the script of the type they are built on.
    fn script(&self, type_name: &str, resource_types: &ResourceTypes) -> PathBuf {
        let mut name = type_name;
        for _ in 0..resource_types.0.len() {
            match resource_types.lookup(name) {
                Some(custom) if custom.type_name != name => name = &custom.type_name,
                _ => break,
            }
        }
        self.scripts.join(name).join("check")
    }
}

#[async_trait]
impl ResourceChecker for ScriptChecker {
    async fn check(
        &self,
        type_name: &str,
        source: &Source,
        from: Option<&Version>,
        resource_types: &ResourceTypes,
    ) -> Result<Vec<Version>> {
        let script = self.script(type_name, resource_types);
        let failed = |message: String| Error::CheckFailed(format!("{}: {}", script.display(), message));

        let request = serde_json::to_vec(&CheckRequest {
            source,
            version: from,
        })
        .map_err(|e| Error::Internal(e.to_string()))?;

        debug!(script = %script.display(), "Running check");
        let mut child = Command::new(&script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| failed(e.to_string()))?;

        // A script may exit without reading its input; its exit status tells.
        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(&request).await {
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => {
                    return Err(failed(e.to_string()));
                }
                _ => {}
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| failed(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failed(format!("{}: {}", output.status, stderr.trim())));
        }

        serde_json::from_slice(&output.stdout).map_err(|e| failed(format!("invalid output: {}", e)))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use conveyor_core::pipeline::ResourceType;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn write_script(dir: &Path, type_name: &str, body: &str) {
        let dir = dir.join(type_name);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("check");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    // One test so no other test forks while a script is open for writing.
    #[tokio::test]
    async fn test_check_script_protocol() {
        let dir = std::env::temp_dir().join(format!("conveyor-check-{}", uuid::Uuid::new_v4()));
        write_script(
            &dir,
            "git",
            r#"read request
case "$request" in
  *'"version":null'*) echo '[{"ref":"a"}]' ;;
  *) echo '[{"ref":"a"},{"ref":"b"}]' ;;
esac"#,
        );
        write_script(&dir, "broken", "echo 'no credentials' >&2\nexit 3");
        let checker = ScriptChecker::new(dir.clone());
        let source = Source::new();
        let a = Version::from([("ref".to_string(), "a".to_string())]);

        let first = checker
            .check("git", &source, None, &ResourceTypes::default())
            .await
            .unwrap();
        assert_eq!(first, vec![a.clone()]);

        let custom = ResourceTypes(vec![ResourceType {
            name: "git-ext".to_string(),
            type_name: "git".to_string(),
            source: Source::new(),
        }]);
        let next = checker
            .check("git-ext", &source, Some(&a), &custom)
            .await
            .unwrap();
        assert_eq!(next.len(), 2);

        let err = checker
            .check("broken", &source, None, &ResourceTypes::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no credentials"));

        let err = checker
            .check("missing", &source, None, &ResourceTypes::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CheckFailed(_)));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
