//! File attribute and ownership helpers.

use std::path::Path;

use crate::error::{Error, Result};

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use std::fs::File;
    use std::os::fd::AsRawFd;

    const FS_IMMUTABLE_FL: libc::c_long = 0x10;

    nix::ioctl_read!(fs_ioc_getflags, b'f', 1, libc::c_long);
    nix::ioctl_write_ptr!(fs_ioc_setflags, b'f', 2, libc::c_long);

    /// Sets or clears the IMMUTABLE attribute on `path`. A no-op when the
    /// flag already has the requested state.
    pub(super) fn set_immutable(path: &Path, enable: bool) -> Result<()> {
        let file = File::open(path)?;
        let fd = file.as_raw_fd();

        let mut attrs: libc::c_long = 0;
        unsafe { fs_ioc_getflags(fd, &mut attrs) }?;

        let new_attrs = if enable {
            attrs | FS_IMMUTABLE_FL
        } else {
            attrs & !FS_IMMUTABLE_FL
        };
        if new_attrs == attrs {
            return Ok(());
        }
        unsafe { fs_ioc_setflags(fd, &new_attrs) }?;
        Ok(())
    }
}

/// Sets or clears the IMMUTABLE file attribute.
#[cfg(target_os = "linux")]
pub(crate) fn set_immutable(path: &Path, enable: bool) -> Result<()> {
    linux::set_immutable(path, enable)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_immutable(_path: &Path, _enable: bool) -> Result<()> {
    Err(Error::NotImplemented(
        "IMMUTABLE file attribute is only supported on Linux".into(),
    ))
}

/// Clears the IMMUTABLE attribute, tolerating a missing file and
/// filesystems without attribute support (nothing to clear on either).
/// Used on removal paths where the blob may never have been created.
pub(crate) fn clear_immutable_if_present(path: &Path) -> Result<()> {
    use nix::errno::Errno;

    match set_immutable(path, false) {
        Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(Error::Sys(Errno::ENOTTY | Errno::EOPNOTSUPP | Errno::ENOSYS)) => Ok(()),
        other => other,
    }
}

/// Copies the owner of `reference` onto `path`, so a child snapshot's upper
/// directory matches its parent's and overlays do not cross ownership
/// boundaries.
pub(crate) fn chown_like(path: &Path, reference: &Path) -> Result<()> {
    use std::os::unix::fs::MetadataExt;

    let meta = std::fs::metadata(reference)?;
    nix::unistd::chown(
        path,
        Some(nix::unistd::Uid::from_raw(meta.uid())),
        Some(nix::unistd::Gid::from_raw(meta.gid())),
    )?;
    Ok(())
}
