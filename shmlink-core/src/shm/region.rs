// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! SharedMemoryRegion - POSIX shared memory wrapper.
//!
//! Provides safe abstraction over mmap and shm_open.
//! All unsafe operations are encapsulated with bounds checking.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;

use crate::error::SharedMemoryError;

/// Represents a mapped shared memory region.
///
/// This struct owns the mapping and unmaps it on drop. Named regions can be
/// opened by another process until the creator unlinks the name.
pub struct SharedMemoryRegion {
    /// Name of the shared memory object (without the leading slash).
    name: String,
    ptr: NonNull<u8>,
    size: usize,
    /// Backing object; `None` for anonymous maps.
    fd: Option<OwnedFd>,
    /// Whether the name is still linked and ours to unlink.
    is_owner: bool,
}

// SAFETY: the region owns its mapping; concurrent access is coordinated by
// the atomics of the ring buffer laid over it.
unsafe impl Send for SharedMemoryRegion {}
unsafe impl Sync for SharedMemoryRegion {}

impl SharedMemoryRegion {
    /// Minimum size for a shared memory region.
    pub const MIN_SIZE: usize = 4096;

    /// Maximum size for a shared memory region (1 GB).
    pub const MAX_SIZE: usize = 1024 * 1024 * 1024;

    /// Create a new named shared memory region of `size` zeroed bytes.
    ///
    /// Fails if the name already exists; names are never reused.
    pub fn create(name: &str, size: usize) -> Result<Self, SharedMemoryError> {
        Self::check_size(name, size)?;
        let c_name = Self::c_name(name)?;
        let create_failed = |reason: String| SharedMemoryError::CreateFailed {
            name: name.to_string(),
            reason,
        };

        let fd = shm_open(&c_name, libc::O_CREAT | libc::O_RDWR | libc::O_EXCL, 0o600).map_err(
            |err| match err.raw_os_error() {
                Some(libc::EEXIST) => create_failed("Shared memory already exists".to_string()),
                _ => create_failed(format!("shm_open failed: {}", err)),
            },
        )?;

        let mapped = size_object(&fd, size)
            .map_err(|err| create_failed(format!("ftruncate failed: {}", err)))
            .and_then(|()| Self::map(Some(&fd), size, libc::MAP_SHARED));
        let ptr = match mapped {
            Ok(ptr) => ptr,
            Err(err) => {
                // SAFETY: c_name is a valid CString naming the object just created
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
                return Err(err);
            }
        };

        tracing::debug!(name = %name, size, "Created shared memory region");

        Ok(Self {
            name: name.to_string(),
            ptr,
            size,
            fd: Some(fd),
            is_owner: true,
        })
    }

    /// Open an existing named shared memory region of at least `size` bytes.
    pub fn open(name: &str, size: usize) -> Result<Self, SharedMemoryError> {
        let open_failed = |reason: String| SharedMemoryError::OpenFailed {
            name: name.to_string(),
            reason,
        };
        if !(Self::MIN_SIZE..=Self::MAX_SIZE).contains(&size) {
            return Err(open_failed(format!("Invalid size: {}", size)));
        }
        let c_name = Self::c_name(name)?;

        let fd = shm_open(&c_name, libc::O_RDWR, 0)
            .map_err(|err| open_failed(format!("shm_open failed: {}", err)))?;

        // Refuse to map past the end of the object.
        let actual = object_size(&fd).map_err(|err| open_failed(format!("fstat failed: {}", err)))?;
        if actual < size as u64 {
            return Err(open_failed(format!(
                "Object has {} bytes, expected at least {}",
                actual, size
            )));
        }

        let ptr = Self::map(Some(&fd), size, libc::MAP_SHARED)?;
        tracing::debug!(name = %name, size, "Opened shared memory region");

        Ok(Self {
            name: name.to_string(),
            ptr,
            size,
            fd: Some(fd),
            is_owner: false,
        })
    }

    /// Map an anonymous shared region. It has no name and cannot be opened by
    /// another process, but it is shared with children forked afterwards.
    pub fn anonymous(size: usize) -> Result<Self, SharedMemoryError> {
        Self::check_size("anonymous", size)?;
        let ptr = Self::map(None, size, libc::MAP_SHARED | libc::MAP_ANONYMOUS)?;

        Ok(Self {
            name: String::new(),
            ptr,
            size,
            fd: None,
            is_owner: false,
        })
    }

    /// Remove the name so no further process can open the region. Existing
    /// mappings stay valid.
    pub fn unlink(&mut self) {
        if !self.is_owner {
            return;
        }
        self.is_owner = false;

        if let Ok(c_name) = Self::c_name(&self.name) {
            // SAFETY: c_name is a valid CString
            let result = unsafe { libc::shm_unlink(c_name.as_ptr()) };
            if result < 0 {
                tracing::warn!(
                    name = %self.name,
                    error = %io::Error::last_os_error(),
                    "Failed to unlink shared memory region"
                );
            } else {
                tracing::debug!(name = %self.name, "Unlinked shared memory region");
            }
        }
    }

    /// Get the name of this shared memory region.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the size of this shared memory region.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the region's name is still linked by this instance.
    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    /// Get a raw pointer to the shared memory.
    ///
    /// Callers must ensure proper synchronization when accessing the memory.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn check_size(name: &str, size: usize) -> Result<(), SharedMemoryError> {
        if size < Self::MIN_SIZE {
            return Err(SharedMemoryError::CreateFailed {
                name: name.to_string(),
                reason: format!("Size {} is below minimum {}", size, Self::MIN_SIZE),
            });
        }
        if size > Self::MAX_SIZE {
            return Err(SharedMemoryError::CreateFailed {
                name: name.to_string(),
                reason: format!("Size {} exceeds maximum {}", size, Self::MAX_SIZE),
            });
        }
        Ok(())
    }

    fn c_name(name: &str) -> Result<CString, SharedMemoryError> {
        if name.is_empty() {
            return Err(SharedMemoryError::CreateFailed {
                name: name.to_string(),
                reason: "Name cannot be empty".to_string(),
            });
        }

        CString::new(format!("/{}", name)).map_err(|e| SharedMemoryError::CreateFailed {
            name: name.to_string(),
            reason: format!("Invalid name: {}", e),
        })
    }

    fn map(
        fd: Option<&OwnedFd>,
        size: usize,
        flags: libc::c_int,
    ) -> Result<NonNull<u8>, SharedMemoryError> {
        let raw_fd = fd.map_or(-1, |fd| fd.as_raw_fd());
        // SAFETY: size is validated, raw_fd is open or -1 with MAP_ANONYMOUS
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                raw_fd,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(SharedMemoryError::MapFailed {
                reason: format!("mmap failed: {}", io::Error::last_os_error()),
            });
        }

        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| SharedMemoryError::MapFailed {
            reason: "mmap returned a null mapping".to_string(),
        })
    }
}

fn shm_open(name: &CString, flags: libc::c_int, mode: libc::mode_t) -> io::Result<OwnedFd> {
    // SAFETY: name is a valid CString
    let raw = unsafe { libc::shm_open(name.as_ptr(), flags, mode) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: shm_open returned a fresh descriptor nobody else owns
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// New objects are zero-filled by ftruncate.
fn size_object(fd: &OwnedFd, size: usize) -> io::Result<()> {
    // SAFETY: fd is open
    if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn object_size(fd: &OwnedFd) -> io::Result<u64> {
    // SAFETY: fd is open and stat is a plain C struct
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat.st_size as u64)
}

impl Drop for SharedMemoryRegion {
    fn drop(&mut self) {
        // SAFETY: ptr and size describe the mapping made at construction
        let result = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.size) };
        if result < 0 {
            tracing::error!(
                name = %self.name,
                error = %io::Error::last_os_error(),
                "Failed to unmap shared memory"
            );
        }
        self.unlink();
    }
}

impl std::fmt::Debug for SharedMemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemoryRegion")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("fd", &self.fd.as_ref().map(|fd| fd.as_raw_fd()))
            .field("is_owner", &self.is_owner)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("shmlink-region-{}-{}", tag, std::process::id())
    }

    #[test]
    fn test_shm_size_validation() {
        // Too small
        assert!(SharedMemoryRegion::create("test-small", 100).is_err());

        // Too large
        assert!(
            SharedMemoryRegion::create("test-large", SharedMemoryRegion::MAX_SIZE + 1).is_err()
        );
    }

    #[test]
    fn test_shm_empty_name() {
        assert!(SharedMemoryRegion::create("", 4096).is_err());
    }

    #[test]
    fn test_create_open_share_memory() {
        let name = unique_name("share");
        let created = SharedMemoryRegion::create(&name, 8192).unwrap();
        let opened = SharedMemoryRegion::open(&name, 8192).unwrap();

        // SAFETY: both mappings are valid for 8192 bytes
        unsafe {
            *created.as_ptr().add(100) = 0x5A;
            assert_eq!(*opened.as_ptr().add(100), 0x5A);
        }
        assert!(created.is_owner());
        assert!(!opened.is_owner());
    }

    #[test]
    fn test_open_larger_than_object_fails() {
        let name = unique_name("short");
        let _created = SharedMemoryRegion::create(&name, 4096).unwrap();
        assert!(matches!(
            SharedMemoryRegion::open(&name, 8192),
            Err(SharedMemoryError::OpenFailed { .. })
        ));
    }

    #[test]
    fn test_unlink_hides_name() {
        let name = unique_name("unlink");
        let mut created = SharedMemoryRegion::create(&name, 4096).unwrap();
        created.unlink();
        assert!(!created.is_owner());
        assert!(SharedMemoryRegion::open(&name, 4096).is_err());
    }

    #[test]
    fn test_anonymous_region() {
        let region = SharedMemoryRegion::anonymous(4096).unwrap();
        assert_eq!(region.size(), 4096);
        assert!(region.name().is_empty());
    }
}
