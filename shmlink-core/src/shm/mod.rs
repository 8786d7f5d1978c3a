// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Shared Memory IPC module.
//!
//! POSIX shared memory regions and the lock-free byte ring built on them.
//! Each connection direction owns one ring.

mod region;
mod ring_buffer;

pub use region::SharedMemoryRegion;
pub use ring_buffer::{RingBuffer, RING_HEADER_SIZE};
