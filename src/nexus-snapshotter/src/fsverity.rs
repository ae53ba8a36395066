//! fsverity probing and enablement for committed layer blobs.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;

use crate::error::{Error, Result};

const FS_VERITY_HASH_ALG_SHA256: u32 = 1;
const FS_VERITY_BLOCK_SIZE: u32 = 4096;

/// `FS_VERITY_FL` inode flag reported by `FS_IOC_GETFLAGS`.
const FS_VERITY_FL: libc::c_long = 0x0010_0000;

/// `struct fsverity_enable_arg` from `<linux/fsverity.h>`.
#[repr(C)]
#[derive(Default)]
struct FsverityEnableArg {
    version: u32,
    hash_algorithm: u32,
    block_size: u32,
    salt_size: u32,
    salt_ptr: u64,
    sig_size: u32,
    reserved1: u32,
    sig_ptr: u64,
    reserved2: [u64; 11],
}

nix::ioctl_write_ptr!(fs_ioc_enable_verity, b'f', 133, FsverityEnableArg);
nix::ioctl_read!(fs_ioc_getflags, b'f', 1, libc::c_long);

fn enable_fd(file: &File) -> nix::Result<()> {
    let arg = FsverityEnableArg {
        version: 1,
        hash_algorithm: FS_VERITY_HASH_ALG_SHA256,
        block_size: FS_VERITY_BLOCK_SIZE,
        ..Default::default()
    };
    unsafe { fs_ioc_enable_verity(file.as_raw_fd(), &arg) }?;
    Ok(())
}

/// Enables fsverity on `path`. Already-enabled files are not an error.
pub(crate) fn enable(path: &Path) -> Result<()> {
    let file = File::open(path)?;
    match enable_fd(&file) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EEXIST) => Ok(()),
        Err(errno) => Err(Error::Io(io::Error::new(
            io::Error::from_raw_os_error(errno as i32).kind(),
            format!("failed to enable fsverity on {}: {errno}", path.display()),
        ))),
    }
}

/// Returns whether `path` has fsverity enabled.
pub(crate) fn is_enabled(path: &Path) -> Result<bool> {
    let file = File::open(path)?;
    let mut attrs: libc::c_long = 0;
    unsafe { fs_ioc_getflags(file.as_raw_fd(), &mut attrs) }?;
    Ok(attrs & FS_VERITY_FL != 0)
}

/// Probes whether the filesystem backing `dir` supports fsverity, by
/// enabling it on a scratch file. Run once at startup.
pub(crate) fn is_supported(dir: &Path) -> Result<bool> {
    use nix::errno::Errno;

    let probe = dir.join(".fsverity-probe");
    {
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&probe)?;
        use std::io::Write;
        file.write_all(b"probe")?;
    }

    // Verity refuses files with open writers, so reopen read-only.
    let result = File::open(&probe).map(|file| enable_fd(&file));
    let _ = std::fs::remove_file(&probe);

    match result? {
        Ok(()) => Ok(true),
        Err(Errno::EOPNOTSUPP | Errno::ENOTTY | Errno::ENOSYS | Errno::EINVAL) => Ok(false),
        Err(errno) => Err(Error::Sys(errno)),
    }
}

/// Verifies that fsverity is enabled on a blob before it is surfaced in a
/// mount plan.
pub(crate) fn verify_enabled(path: &Path) -> Result<()> {
    if is_enabled(path)? {
        return Ok(());
    }
    Err(Error::FailedPrecondition(format!(
        "fsverity is not enabled on {}",
        path.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_does_not_leave_files_behind() {
        let dir = tempfile::tempdir().unwrap();
        // Supported or not depends on the backing filesystem; either way the
        // probe file must be gone.
        let _ = is_supported(dir.path());
        assert!(!dir.path().join(".fsverity-probe").exists());
    }
}
