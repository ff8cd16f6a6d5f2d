//! Shared memory segments.
//!
//! A [`SharedRegion`] is an anonymous, readable and writable mapping that two
//! cooperating processes can share. On Linux the backing object is a memfd,
//! exported to a peer as a `(pid, fd, len)` triple and re-imported through
//! `/proc/{pid}/fd/{fd}`; elsewhere a delete-after-open scratch file gives the
//! same in-process semantics without the cross-process export.

use std::fs::File;

use memmap2::{MmapMut, MmapOptions};

use crate::{Error, Result};

/// Exported identity of a shared region, importable by a peer process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShmemHandle {
    pub pid: u32,
    pub fd: i32,
    pub len: u64,
}

impl ShmemHandle {
    pub fn is_valid(&self) -> bool {
        self.pid != 0 && self.fd >= 0 && self.len > 0
    }
}

/// A mapped shared-memory segment.
///
/// The base pointer is handed out to both queue endpoints, which write
/// disjoint parts of the segment under the cursor protocol; the mapping
/// stays alive as long as any clone of the owning `Arc` does.
pub struct SharedRegion {
    _map: MmapMut,
    base: *mut u8,
    len: usize,
    file: File,
}

// SAFETY: all access to the mapping goes through `base()` offsets governed by
// the queue's single-producer/single-consumer cursor protocol; the struct
// itself only hands out the pointer and never aliases the bytes.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Allocates a fresh zero-filled segment of exactly `len` bytes.
    pub fn alloc(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::Unsupported("shared region length must be non-zero"));
        }
        let file = platform::create_backing(len)?;
        Self::map(file, len)
    }

    /// Re-imports a segment exported by [`SharedRegion::handle`] in another
    /// process.
    pub fn from_handle(handle: &ShmemHandle) -> Result<Self> {
        if !handle.is_valid() {
            return Err(Error::Fatal("invalid shared memory handle"));
        }
        let len = usize::try_from(handle.len)
            .map_err(|_| Error::Unsupported("shared region exceeds addressable range"))?;
        let file = platform::open_backing(handle)?;
        let actual = file.metadata()?.len();
        if actual < handle.len {
            return Err(Error::Fatal("shared memory shorter than declared"));
        }
        Self::map(file, len)
    }

    /// Exports this segment for transfer. The exporting process must keep
    /// its mapping alive until the peer has imported the handle.
    pub fn handle(&self) -> Result<ShmemHandle> {
        platform::export_handle(&self.file, self.len)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base address of the mapping. Callers must stay within `len` bytes and
    /// follow the cursor protocol when the segment is shared.
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    fn map(file: File, len: usize) -> Result<Self> {
        let mut map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        let base = map.as_mut_ptr();
        Ok(Self {
            _map: map,
            base,
            len,
            file,
        })
    }
}

#[cfg(target_os = "linux")]
mod platform {
    use std::ffi::CString;
    use std::fs::File;
    use std::os::fd::{AsRawFd, FromRawFd};

    use super::ShmemHandle;
    use crate::{Error, Result};

    pub fn create_backing(len: usize) -> Result<File> {
        let name = CString::new("pcqueue-segment").expect("static name");
        let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        let file = unsafe { File::from_raw_fd(fd) };
        file.set_len(len as u64)?;
        Ok(file)
    }

    pub fn open_backing(handle: &ShmemHandle) -> Result<File> {
        let path = format!("/proc/{}/fd/{}", handle.pid, handle.fd);
        let cpath = CString::new(path).map_err(|_| Error::Unsupported("proc path contains NUL"))?;
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
        if fd < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(unsafe { File::from_raw_fd(fd) })
    }

    pub fn export_handle(file: &File, len: usize) -> Result<ShmemHandle> {
        Ok(ShmemHandle {
            pid: std::process::id(),
            fd: file.as_raw_fd(),
            len: len as u64,
        })
    }
}

#[cfg(not(target_os = "linux"))]
mod platform {
    use std::fs::{File, OpenOptions};
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::ShmemHandle;
    use crate::{Error, Result};

    static NEXT_SCRATCH: AtomicU64 = AtomicU64::new(0);

    pub fn create_backing(len: usize) -> Result<File> {
        let n = NEXT_SCRATCH.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "pcqueue-{}-{}.seg",
            std::process::id(),
            n
        ));
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        file.set_len(len as u64)?;
        // Unlink immediately; the open descriptor keeps the mapping valid.
        let _ = std::fs::remove_file(&path);
        Ok(file)
    }

    pub fn open_backing(_handle: &ShmemHandle) -> Result<File> {
        Err(Error::Unsupported(
            "cross-process shared memory import requires linux",
        ))
    }

    pub fn export_handle(_file: &File, _len: usize) -> Result<ShmemHandle> {
        Err(Error::Unsupported(
            "cross-process shared memory export requires linux",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_zero_filled_and_writable() {
        let region = SharedRegion::alloc(4096).unwrap();
        assert_eq!(region.len(), 4096);
        unsafe {
            assert_eq!(*region.base(), 0);
            assert_eq!(*region.base().add(4095), 0);
            *region.base().add(100) = 0xAB;
            assert_eq!(*region.base().add(100), 0xAB);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn handle_round_trip_within_process() {
        let region = SharedRegion::alloc(4096).unwrap();
        unsafe {
            *region.base().add(7) = 0x5A;
        }
        let imported = SharedRegion::from_handle(&region.handle().unwrap()).unwrap();
        assert_eq!(imported.len(), 4096);
        unsafe {
            assert_eq!(*imported.base().add(7), 0x5A);
            // Writes through the import are visible to the original mapping.
            *imported.base().add(8) = 0x77;
            assert_eq!(*region.base().add(8), 0x77);
        }
    }
}
