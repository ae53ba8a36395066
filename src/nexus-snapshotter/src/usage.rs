//! Disk usage accounting.

use std::path::Path;

use walkdir::WalkDir;

use crate::error::Result;
use crate::snapshot::Usage;

/// Computes the size and inode count of a file or directory tree.
///
/// Sizes are apparent file sizes; hardlinked files within the tree are
/// counted once per inode.
pub(crate) fn disk_usage(path: &Path) -> Result<Usage> {
    use std::collections::HashSet;
    use std::os::unix::fs::MetadataExt;

    let meta = std::fs::symlink_metadata(path)?;
    if !meta.is_dir() {
        return Ok(Usage {
            size: meta.len(),
            inodes: 1,
        });
    }

    let mut seen = HashSet::new();
    let mut usage = Usage::default();
    for entry in WalkDir::new(path) {
        let entry = entry.map_err(std::io::Error::from)?;
        let meta = entry.metadata().map_err(std::io::Error::from)?;
        if !seen.insert((meta.dev(), meta.ino())) {
            continue;
        }
        usage.inodes += 1;
        if meta.is_file() {
            usage.size += meta.len();
        }
    }
    Ok(usage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_usage_is_its_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, vec![0u8; 1234]).unwrap();
        let usage = disk_usage(&path).unwrap();
        assert_eq!(usage.size, 1234);
        assert_eq!(usage.inodes, 1);
    }

    #[test]
    fn directory_usage_counts_inodes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a"), b"12345").unwrap();
        std::fs::write(dir.path().join("sub/b"), b"1234567890").unwrap();

        let usage = disk_usage(dir.path()).unwrap();
        // Root dir, sub dir, and two files.
        assert_eq!(usage.inodes, 4);
        assert_eq!(usage.size, 15);
    }

    #[test]
    fn hardlinks_are_counted_once() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        std::fs::write(&a, b"12345").unwrap();
        std::fs::hard_link(&a, dir.path().join("b")).unwrap();

        let usage = disk_usage(dir.path()).unwrap();
        assert_eq!(usage.inodes, 2); // dir + one inode for both names
        assert_eq!(usage.size, 5);
    }
}
