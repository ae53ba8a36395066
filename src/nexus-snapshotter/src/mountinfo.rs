//! Mountpoint detection backed by `/proc/self/mountinfo`.
//!
//! The kernel's mount table is the authoritative source for idempotency
//! checks; in-memory tracking is only ever a hint layered on top of this.

use std::io;
use std::path::{Path, PathBuf};

/// Decodes the octal escapes mountinfo uses for whitespace and backslashes
/// in mount points (`\040` for space, `\011` tab, `\012` newline, `\134`
/// backslash).
fn unescape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let bytes = field.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let octal = &field[i + 1..i + 4];
            if let Ok(value) = u8::from_str_radix(octal, 8) {
                out.push(value as char);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

fn mount_points(mountinfo: &str) -> Vec<PathBuf> {
    mountinfo
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(|field| PathBuf::from(unescape(field)))
        .collect()
}

/// Returns true if `path` is currently a mount point in this mount
/// namespace. A nonexistent path is not a mount point.
pub(crate) fn is_mountpoint(path: &Path) -> io::Result<bool> {
    let resolved = match std::fs::canonicalize(path) {
        Ok(p) => p,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };
    let table = std::fs::read_to_string("/proc/self/mountinfo")?;
    Ok(mount_points(&table).iter().any(|mp| *mp == resolved))
}
