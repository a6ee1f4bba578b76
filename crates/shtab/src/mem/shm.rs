//! Shared-memory segment creation and attachment.
//!
//! The master process creates an anonymous, fd-backed segment
//! (`memfd_create` on Linux, `shm_open` + unlink elsewhere) and maps it
//! shared. Workers inherit the mapping across `fork`, or receive the fd and
//! map it themselves with [`ShmSegment::attach`]. Nothing address-dependent
//! is stored in the segment, so every process may see a different base.

use std::fs::File;
use std::os::fd::FromRawFd;

use memmap2::MmapMut;
use shtab_util::status::{Result, Status};

use crate::util::{align_up, is_aligned};

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(target_os = "linux")]
fn create_fd() -> Result<File> {
    let name = b"shtab-arena\0";
    // SAFETY: name is a valid NUL-terminated string.
    let fd = unsafe { libc::memfd_create(name.as_ptr().cast(), 0) };
    if fd < 0 {
        return Err(Status::Sys {
            call: "memfd_create",
            errno: last_errno(),
        });
    }
    // SAFETY: fd is a fresh, owned descriptor.
    Ok(unsafe { File::from_raw_fd(fd) })
}

#[cfg(all(unix, not(target_os = "linux")))]
fn create_fd() -> Result<File> {
    // shm_open needs a name; unlink immediately so only the fd keeps the
    // object alive, matching the anonymous memfd behaviour.
    let name = format!("/shtab-arena-{}\0", std::process::id());
    // SAFETY: name is a valid NUL-terminated string.
    let fd = unsafe {
        libc::shm_open(
            name.as_ptr().cast(),
            libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
            0o600,
        )
    };
    if fd < 0 {
        return Err(Status::Sys {
            call: "shm_open",
            errno: last_errno(),
        });
    }
    // SAFETY: the name was just created by us.
    unsafe { libc::shm_unlink(name.as_ptr().cast()) };
    // SAFETY: fd is a fresh, owned descriptor.
    Ok(unsafe { File::from_raw_fd(fd) })
}

/// A mapped shared-memory segment.
pub struct ShmSegment {
    file: File,
    map: MmapMut,
}

impl ShmSegment {
    /// Create a new zero-filled segment of at least `len` bytes
    /// (rounded up to the system page size) and map it shared.
    pub fn create(len: usize) -> Result<Self> {
        let page = page_size::get();
        let len = align_up(len.max(page), page);

        let file = create_fd()?;
        file.set_len(len as u64).map_err(|e| Status::Sys {
            call: "ftruncate",
            errno: e.raw_os_error().unwrap_or(0),
        })?;

        Self::map(file, len)
    }

    /// Map an existing segment by file. The caller typically received the
    /// fd from the master process.
    pub fn attach(file: File) -> Result<Self> {
        let len = file
            .metadata()
            .map_err(|e| Status::Sys {
                call: "fstat",
                errno: e.raw_os_error().unwrap_or(0),
            })?
            .len() as usize;
        if len == 0 || !is_aligned(len, page_size::get()) {
            return Err(Status::ArgInvalid("segment length is not page aligned"));
        }
        Self::map(file, len)
    }

    fn map(file: File, len: usize) -> Result<Self> {
        // SAFETY: the fd refers to a shm object we own for at least as long
        // as the mapping; file-backed map_mut yields a MAP_SHARED mapping.
        let map = unsafe {
            memmap2::MmapOptions::new()
                .len(len)
                .map_mut(&file)
                .map_err(|e| Status::Sys {
                    call: "mmap",
                    errno: e.raw_os_error().unwrap_or(0),
                })?
        };
        Ok(Self { file, map })
    }

    /// Base address of the mapping in this process.
    pub fn base(&self) -> *mut u8 {
        self.map.as_ptr() as *mut u8
    }

    /// Mapped length in bytes.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// The backing file, for passing the fd to another process.
    pub fn file(&self) -> &File {
        &self.file
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_rounds_to_page_size() {
        let seg = ShmSegment::create(100).unwrap();
        assert!(seg.len() >= page_size::get());
        assert_eq!(seg.len() % page_size::get(), 0);
    }

    #[test]
    fn segment_is_zeroed_and_writable() {
        let seg = ShmSegment::create(8192).unwrap();
        // SAFETY: within the mapping.
        unsafe {
            assert_eq!(*seg.base(), 0);
            *seg.base() = 0xAB;
            assert_eq!(*seg.base(), 0xAB);
        }
    }

    #[test]
    fn attach_sees_writes_through_second_mapping() {
        let seg = ShmSegment::create(4096).unwrap();
        let dup = seg.file().try_clone().unwrap();
        let view = ShmSegment::attach(dup).unwrap();

        // SAFETY: both mappings cover offset 0.
        unsafe {
            *seg.base().add(16) = 0x5A;
            assert_eq!(*view.base().add(16), 0x5A);
        }
    }
}
