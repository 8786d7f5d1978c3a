// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Memory exchange handles.

use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

/// A file descriptor attached to a message, typically referring to memory
/// the receiver maps itself (a memfd, a shared memory object, a file).
///
/// Delivery is best-effort: under resource pressure a message degrades to
/// data-only and the receiver gets no handle.
#[derive(Debug)]
pub struct MemoryHandle(OwnedFd);

impl MemoryHandle {
    pub fn new(fd: OwnedFd) -> Self {
        Self(fd)
    }

    /// Duplicate the underlying descriptor.
    pub fn try_clone(&self) -> io::Result<Self> {
        self.0.try_clone().map(Self)
    }

    pub fn into_owned_fd(self) -> OwnedFd {
        self.0
    }

    /// Treat the descriptor as a file, e.g. to read through it.
    pub fn into_file(self) -> File {
        File::from(self.0)
    }
}

impl From<OwnedFd> for MemoryHandle {
    fn from(fd: OwnedFd) -> Self {
        Self(fd)
    }
}

impl From<File> for MemoryHandle {
    fn from(file: File) -> Self {
        Self(OwnedFd::from(file))
    }
}

impl AsFd for MemoryHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl AsRawFd for MemoryHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}
