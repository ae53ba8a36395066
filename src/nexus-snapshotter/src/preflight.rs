//! Startup capability probes.
//!
//! Failures here are structured so the host can react: a missing EROFS
//! filesystem is a `SkipPlugin` signal (disable the plugin, don't fail
//! every operation later), while an unusable backing filesystem is a
//! `FailedPrecondition` with a hint the operator can act on.

use std::cmp::Ordering;
use std::path::Path;

use crate::error::{Error, Result};

/// Minimum kernel for a usable EROFS + overlayfs stack.
pub const MIN_KERNEL_VERSION: &str = "5.4.0";

/// Checks whether the filesystem backing `root` reports entry types in
/// directory listings (d_type). Overlayfs misbehaves without it.
pub fn supports_d_type(root: &Path) -> Result<bool> {
    use nix::dir::Dir;
    use nix::fcntl::OFlag;
    use nix::sys::stat::Mode;

    let probe = tempfile::Builder::new()
        .prefix(".dtype-probe-")
        .tempdir_in(root)?;
    std::fs::write(probe.path().join("file"), b"")?;
    std::fs::create_dir(probe.path().join("dir"))?;

    let mut dir = Dir::open(
        probe.path(),
        OFlag::O_RDONLY | OFlag::O_DIRECTORY,
        Mode::empty(),
    )?;
    for entry in dir.iter() {
        let entry = entry?;
        if entry.file_type().is_none() {
            // DT_UNKNOWN
            return Ok(false);
        }
    }
    Ok(true)
}

/// Returns true if the kernel has the `erofs` filesystem registered.
pub fn erofs_registered() -> bool {
    std::fs::read_to_string("/proc/filesystems")
        .map(|fs| fs.lines().any(|line| line.trim() == "erofs"))
        .unwrap_or(false)
}

/// Validates that `root` can host snapshots.
pub fn check_compatibility(root: &Path) -> Result<()> {
    if !supports_d_type(root)? {
        return Err(Error::FailedPrecondition(format!(
            "{} does not support d_type. If the backing filesystem is xfs, \
             please reformat with ftype=1 to enable d_type support",
            root.display()
        )));
    }

    if !erofs_registered() {
        return Err(Error::SkipPlugin(
            "EROFS unsupported, please `modprobe erofs`".into(),
        ));
    }

    Ok(())
}

/// Returns the running kernel's release string.
pub fn kernel_version() -> Result<String> {
    let uts = nix::sys::utsname::uname()?;
    Ok(uts.release().to_string_lossy().into_owned())
}

fn parse_version(version: &str) -> Result<(u64, u64, u64)> {
    // Strip distro suffixes like "-rc1" or "-1-amd64".
    let numeric = version.split('-').next().unwrap_or("");
    let mut parts = numeric.split('.');

    let major = parts.next().and_then(|p| p.parse().ok());
    let minor = parts.next().and_then(|p| p.parse().ok());
    let patch = match parts.next() {
        Some(p) => p.parse().ok(),
        None => Some(0),
    };

    match (major, minor, patch) {
        (Some(major), Some(minor), Some(patch)) => Ok((major, minor, patch)),
        _ => Err(Error::InvalidArgument(format!(
            "cannot parse kernel version {version:?}"
        ))),
    }
}

/// Compares two kernel version strings numerically, ignoring suffixes.
pub fn compare_versions(a: &str, b: &str) -> Result<Ordering> {
    Ok(parse_version(a)?.cmp(&parse_version(b)?))
}

/// Fails unless the running kernel is at least `minimum`.
pub fn check_kernel_version(minimum: &str) -> Result<()> {
    let current = kernel_version()?;
    if compare_versions(&current, minimum)? == Ordering::Less {
        return Err(Error::FailedPrecondition(format!(
            "kernel {current} is older than required {minimum}"
        )));
    }
    Ok(())
}

/// Runs every probe that does not depend on a specific root directory.
pub fn check() -> Result<()> {
    check_kernel_version(MIN_KERNEL_VERSION)?;
    if !erofs_registered() {
        return Err(Error::SkipPlugin(
            "EROFS unsupported, please `modprobe erofs`".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_version_is_dotted() {
        let version = kernel_version().unwrap();
        assert!(!version.is_empty());
        assert!(version.contains('.'));
    }

    #[test]
    fn version_comparison() {
        let cases = [
            ("6.16.0", "6.16.0", Ordering::Equal),
            ("6.16", "6.16.0", Ordering::Equal),
            ("5.17.0", "6.16.0", Ordering::Less),
            ("6.15.0", "6.16.0", Ordering::Less),
            ("6.16.0", "6.16.1", Ordering::Less),
            ("6.16.0", "5.17.0", Ordering::Greater),
            ("7.0.0", "6.99.99", Ordering::Greater),
            ("6.16.0-rc1", "6.16.0", Ordering::Equal),
            ("5.17.0-1-amd64", "5.17.0", Ordering::Equal),
            ("6.16.0-rc1", "6.15.0", Ordering::Greater),
        ];
        for (a, b, expected) in cases {
            assert_eq!(compare_versions(a, b).unwrap(), expected, "{a} vs {b}");
        }
    }

    #[test]
    fn invalid_versions_are_rejected() {
        for (a, b) in [("", "6.16.0"), ("6.16.0", ""), ("abc", "6.16.0"), ("6", "6.16.0")] {
            assert!(compare_versions(a, b).is_err(), "{a} vs {b}");
        }
    }

    #[test]
    fn current_kernel_passes_an_ancient_minimum() {
        check_kernel_version("1.0.0").unwrap();
        assert!(check_kernel_version("99.0.0").is_err());
    }

    #[test]
    fn tempdirs_support_d_type() {
        let dir = tempfile::tempdir().unwrap();
        // Every filesystem tempdirs land on in practice reports d_type.
        assert!(supports_d_type(dir.path()).unwrap());
    }
}
