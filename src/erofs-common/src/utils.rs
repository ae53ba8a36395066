use anyhow::{anyhow, Context, Result};
use log::debug;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

use crate::constants::{MAX_TOOL_OUTPUT, MKFS_EROFS, MKFS_EROFS_BASE_ARGS};

/// Validates the input paths for an mkfs.erofs invocation.
///
/// Checks that all source paths exist and that the target does not, so a
/// failed earlier run cannot be silently overwritten.
fn validate_paths(target: &Path, sources: &[&Path]) -> Result<()> {
    if target.as_os_str().is_empty() {
        return Err(anyhow!("erofs target path is empty"));
    }

    for source in sources {
        if source.as_os_str().is_empty() {
            return Err(anyhow!("erofs source path is empty"));
        }
        if !source.exists() {
            return Err(anyhow!("erofs source does not exist: {:?}", source));
        }
    }

    Ok(())
}

/// Truncates tool output to `max_len` bytes for inclusion in error messages.
/// This prevents verbose tool output from overwhelming error logs.
pub fn truncate_output(out: &[u8], max_len: usize) -> String {
    if out.len() <= max_len {
        return String::from_utf8_lossy(out).into_owned();
    }
    format!("{}... (truncated)", String::from_utf8_lossy(&out[..max_len]))
}

/// Returns true if `mkfs.erofs` can be spawned. Used by callers that want to
/// degrade gracefully when erofs-utils is not installed.
pub fn mkfs_erofs_available() -> bool {
    std::process::Command::new(MKFS_EROFS)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

async fn run_mkfs(target: &Path, sources: &[&Path]) -> Result<()> {
    validate_paths(target, sources)?;

    let mut cmd = Command::new(MKFS_EROFS);
    cmd.args(MKFS_EROFS_BASE_ARGS)
        .arg(target)
        .args(sources)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = cmd
        .output()
        .await
        .with_context(|| format!("failed to execute {MKFS_EROFS}"))?;

    if !output.status.success() {
        // Do not leave a partial image behind.
        let _ = std::fs::remove_file(target);
        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        return Err(anyhow!(
            "{MKFS_EROFS} failed with {}: {}",
            output.status,
            truncate_output(&combined, MAX_TOOL_OUTPUT)
        ));
    }

    if !target.exists() {
        return Err(anyhow!(
            "{MKFS_EROFS} completed but output was not created: {:?}",
            target
        ));
    }

    Ok(())
}

/// Converts a directory tree (typically an overlayfs upper directory) into an
/// EROFS image at `target`.
///
/// The partial image is removed if the tool fails, and dropping the returned
/// future kills the child process.
pub async fn convert_dir_to_erofs(target: &Path, source_dir: &Path) -> Result<()> {
    debug!("creating erofs image {:?} from {:?}", target, source_dir);

    if !source_dir.is_dir() {
        return Err(anyhow!("erofs source is not a directory: {:?}", source_dir));
    }

    run_mkfs(target, &[source_dir]).await
}

/// Merges the metadata of several EROFS layer blobs into a single
/// metadata-only image at `target`, referencing the blobs as external
/// devices. `blobs` is ordered newest layer first.
pub async fn merge_blobs_to_erofs(target: &Path, blobs: &[&Path]) -> Result<()> {
    debug!("merging {} erofs blobs into {:?}", blobs.len(), target);

    if blobs.is_empty() {
        return Err(anyhow!("no erofs blobs to merge"));
    }

    run_mkfs(target, blobs).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_output_short_input_is_unchanged() {
        assert_eq!(truncate_output(b"short", 256), "short");
        assert_eq!(truncate_output(b"", 256), "");
    }

    #[test]
    fn truncate_output_long_input_is_cut() {
        let long = vec![b'x'; 300];
        let out = truncate_output(&long, 256);
        assert!(out.starts_with(&"x".repeat(256)));
        assert!(out.ends_with("... (truncated)"));
    }

    #[test]
    fn truncate_output_exact_boundary() {
        let exact = vec![b'y'; 256];
        assert_eq!(truncate_output(&exact, 256), "y".repeat(256));
    }

    #[tokio::test]
    async fn convert_rejects_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let err = convert_dir_to_erofs(&dir.path().join("out.erofs"), &dir.path().join("missing"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }

    #[tokio::test]
    async fn merge_rejects_empty_blob_list() {
        let dir = tempfile::tempdir().unwrap();
        let err = merge_blobs_to_erofs(&dir.path().join("fsmeta.erofs"), &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no erofs blobs"));
    }
}
