//! Applying mount descriptions with `mount(2)`.
//!
//! This is the only module that performs mounts; everything above it treats
//! the mount stack as data.

use nix::mount::{mount, MsFlags};
use std::io;
use std::path::{Path, PathBuf};

use crate::loopdev;
use crate::snapshot::Mount;

/// Splits mount options into mount flags and filesystem data options.
/// `loop` is consumed by the caller and dropped here.
fn parse_options(options: &[String]) -> (MsFlags, Vec<String>) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();
    for option in options {
        match option.as_str() {
            "ro" => flags |= MsFlags::MS_RDONLY,
            "rw" => {}
            "bind" => flags |= MsFlags::MS_BIND,
            "rbind" => flags |= MsFlags::MS_BIND | MsFlags::MS_REC,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "loop" => {}
            other => data.push(other.to_string()),
        }
    }
    (flags, data)
}

fn has_loop_option(options: &[String]) -> bool {
    options.iter().any(|o| o == "loop")
}

fn errno_to_io(errno: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

/// Applies a single concrete mount description at `target`.
///
/// Filesystem mounts with the `loop` option get their source attached to a
/// loop device first; `device=` data options referencing regular files are
/// rewritten the same way so a metadata-only EROFS image can address its
/// layer blobs as block devices.
pub(crate) fn apply_mount(m: &Mount, target: &Path) -> io::Result<()> {
    let (flags, data) = parse_options(&m.options);

    match m.fs_type.as_str() {
        "bind" => {
            let flags = flags | MsFlags::MS_BIND;
            mount(
                Some(Path::new(&m.source)),
                target,
                None::<&str>,
                flags,
                None::<&str>,
            )
            .map_err(errno_to_io)
        }
        "overlay" => {
            let data = data.join(",");
            mount(
                Some("overlay"),
                target,
                Some("overlay"),
                flags,
                Some(data.as_str()),
            )
            .map_err(errno_to_io)
        }
        "erofs" | "ext4" => {
            let read_only = flags.contains(MsFlags::MS_RDONLY);
            let source = if has_loop_option(&m.options) {
                loopdev::attach(Path::new(&m.source), read_only)?
            } else {
                PathBuf::from(&m.source)
            };

            let mut resolved = Vec::with_capacity(data.len());
            for option in data {
                match option.strip_prefix("device=") {
                    Some(blob) => {
                        let device = loopdev::attach(Path::new(blob), true)?;
                        resolved.push(format!("device={}", device.display()));
                    }
                    None => resolved.push(option),
                }
            }
            let data = resolved.join(",");

            mount(
                Some(source.as_path()),
                target,
                Some(m.fs_type.as_str()),
                flags,
                if data.is_empty() {
                    None
                } else {
                    Some(data.as_str())
                },
            )
            .map_err(errno_to_io)
        }
        other => Err(io::Error::other(format!(
            "unsupported mount type {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_split_into_flags_and_data() {
        let (flags, data) = parse_options(&[
            "ro".to_string(),
            "loop".to_string(),
            "noload".to_string(),
            "device=/x/layer.erofs".to_string(),
        ]);
        assert!(flags.contains(MsFlags::MS_RDONLY));
        assert_eq!(data, vec!["noload", "device=/x/layer.erofs"]);
    }

    #[test]
    fn rbind_is_recursive() {
        let (flags, _) = parse_options(&["rw".to_string(), "rbind".to_string()]);
        assert!(flags.contains(MsFlags::MS_BIND));
        assert!(flags.contains(MsFlags::MS_REC));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let m = Mount::new("squashfs", "/x/img", vec![]);
        let dir = tempfile::tempdir().unwrap();
        assert!(apply_mount(&m, dir.path()).is_err());
    }
}
