// System V shared memory segments
//
// MIT-SHM readback goes through one of these per bound image. The
// segment is both attached by the X server and imported into Vulkan as
// a host pointer, so it has to be aligned to what the device wants.
//
// Austin Shafer - 2024
use crate::{GranizoError, Result};
use nix::errno::Errno;
use utils::log;

use std::os::raw::c_void;
use std::ptr;

/// Round `size` up to a multiple of `alignment`
///
/// An alignment of 0 is treated as 1.
pub fn align_size(size: u64, alignment: u64) -> u64 {
    let alignment = alignment.max(1);
    match size % alignment {
        0 => size,
        rem => size + (alignment - rem),
    }
}

/// A private shared memory segment mapped into our address space
///
/// The segment is detached and marked for removal when this is dropped.
#[derive(Debug)]
pub struct ShmSegment {
    ss_id: i32,
    ss_addr: *mut c_void,
}

impl ShmSegment {
    /// Create and attach a new segment of `size` bytes
    pub fn new(size: usize) -> Result<Self> {
        let id = unsafe {
            libc::shmget(
                libc::IPC_PRIVATE,
                size,
                libc::IPC_CREAT | libc::IPC_EXCL | 0o600,
            )
        };
        if id < 0 {
            log::error!(
                "Failed to allocate shared memory segment of {} bytes: {}",
                size,
                Errno::last()
            );
            return Err(GranizoError::SHARED_MEMORY_FAILED);
        }

        // From here on Drop cleans up after us
        let mut ret = Self {
            ss_id: id,
            ss_addr: ptr::null_mut(),
        };

        let addr = unsafe { libc::shmat(id, ptr::null(), 0) };
        if addr as isize == -1 {
            log::error!("Failed to attach to shared memory segment: {}", Errno::last());
            return Err(GranizoError::SHARED_MEMORY_FAILED);
        }
        ret.ss_addr = addr;

        Ok(ret)
    }

    pub fn id(&self) -> i32 {
        self.ss_id
    }

    pub fn addr(&self) -> *mut c_void {
        self.ss_addr
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        unsafe {
            if !self.ss_addr.is_null() && libc::shmdt(self.ss_addr) != 0 {
                log::error!("Failed to detach shared memory segment: {}", Errno::last());
            }
            if libc::shmctl(self.ss_id, libc::IPC_RMID, ptr::null_mut()) != 0 {
                log::error!("Failed to remove shared memory segment: {}", Errno::last());
            }
        }
    }
}
