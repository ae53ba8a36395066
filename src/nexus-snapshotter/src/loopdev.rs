//! Loop device attachment through the kernel's loop-control interface.
//!
//! Devices are attached with `LO_FLAGS_AUTOCLEAR` so they detach on the
//! final unmount: the snapshotter never has to track loop device numbers,
//! and an unmount path is all it takes to avoid leaking the process-global
//! device pool.

use log::debug;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

const LOOP_CONTROL: &str = "/dev/loop-control";

const LO_FLAGS_READ_ONLY: u32 = 1;
const LO_FLAGS_AUTOCLEAR: u32 = 4;

const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;

/// `struct loop_info64` from `<linux/loop.h>`.
#[repr(C)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; LO_NAME_SIZE],
    lo_crypt_name: [u8; LO_NAME_SIZE],
    lo_encrypt_key: [u8; LO_KEY_SIZE],
    lo_init: [u64; 2],
}

impl Default for LoopInfo64 {
    fn default() -> Self {
        // Plain zeroes; every field is an integer or byte array.
        unsafe { std::mem::zeroed() }
    }
}

nix::ioctl_write_int_bad!(loop_set_fd, 0x4C00);
nix::ioctl_none_bad!(loop_clr_fd, 0x4C01);
nix::ioctl_write_ptr_bad!(loop_set_status64, 0x4C04, LoopInfo64);
nix::ioctl_none_bad!(loop_ctl_get_free, 0x4C82);

fn errno_to_io(errno: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

/// Attaches `backing` to a free loop device and returns the device path.
///
/// Finding a free device and binding it race against other processes, so
/// EBUSY on `LOOP_SET_FD` retries with a fresh device number.
pub(crate) fn attach(backing: &Path, read_only: bool) -> io::Result<PathBuf> {
    let control = OpenOptions::new()
        .read(true)
        .write(true)
        .open(LOOP_CONTROL)?;
    let backing_file = OpenOptions::new()
        .read(true)
        .write(!read_only)
        .open(backing)?;

    const MAX_ATTEMPTS: usize = 10;
    for _ in 0..MAX_ATTEMPTS {
        let index =
            unsafe { loop_ctl_get_free(control.as_raw_fd()) }.map_err(errno_to_io)?;
        let device_path = PathBuf::from(format!("/dev/loop{index}"));
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&device_path)?;

        match unsafe { loop_set_fd(device.as_raw_fd(), backing_file.as_raw_fd()) } {
            Ok(_) => {
                let mut info = LoopInfo64::default();
                info.lo_flags = LO_FLAGS_AUTOCLEAR
                    | if read_only { LO_FLAGS_READ_ONLY } else { 0 };
                let name = backing.as_os_str().as_encoded_bytes();
                let len = name.len().min(LO_NAME_SIZE - 1);
                info.lo_file_name[..len].copy_from_slice(&name[..len]);

                if let Err(errno) =
                    unsafe { loop_set_status64(device.as_raw_fd(), &info) }
                {
                    let _ = unsafe { loop_clr_fd(device.as_raw_fd()) };
                    return Err(errno_to_io(errno));
                }

                debug!("attached {:?} to {:?}", backing, device_path);
                return Ok(device_path);
            }
            // Someone grabbed this device between GET_FREE and SET_FD.
            Err(nix::errno::Errno::EBUSY) => continue,
            Err(errno) => return Err(errno_to_io(errno)),
        }
    }

    Err(io::Error::other(format!(
        "no free loop device for {}",
        backing.display()
    )))
}
