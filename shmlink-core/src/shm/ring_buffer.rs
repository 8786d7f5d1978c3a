// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Lock-free circular byte ring for one direction of a connection.
//!
//! Uses atomic head/tail cursors for wait-free single-producer single-consumer
//! communication. Cursors advance monotonically; the byte at cursor `c` lives
//! at `c % capacity` in the data area, so writes wrap physically.
//!
//! The shared header also holds two wake-up flags. A side that is about to
//! wait raises its flag and re-checks the ring; the other side clears the flag
//! after making progress and sends a wake-up over the side-channel only if it
//! was raised.

use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};

use crate::error::SharedMemoryError;
use crate::shm::SharedMemoryRegion;

/// Bytes reserved at the start of the region for [`RingBufferHeader`].
pub const RING_HEADER_SIZE: usize = 64;

/// Ring buffer header stored at the start of shared memory.
#[repr(C)]
struct RingBufferHeader {
    /// Write position (owned by producer).
    head: AtomicU64,
    /// Read position (owned by consumer).
    tail: AtomicU64,
    /// Total capacity in bytes (excluding header).
    capacity: AtomicU64,
    /// Raised by a producer waiting for free space.
    writer_waiting: AtomicU32,
    /// Raised by a consumer waiting for data.
    reader_waiting: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<RingBufferHeader>() <= RING_HEADER_SIZE);

/// Single-producer, single-consumer byte ring in shared memory.
pub struct RingBuffer {
    /// Underlying shared memory region.
    region: SharedMemoryRegion,
    /// Capacity validated at construction; the shared copy is not trusted.
    capacity: usize,
}

impl RingBuffer {
    /// Format `region` as an empty ring buffer.
    pub fn new(region: SharedMemoryRegion) -> Result<Self, SharedMemoryError> {
        let capacity = Self::data_capacity(&region)?;
        let buffer = Self { region, capacity };

        // SAFETY: we just created the region and nobody else uses it yet
        unsafe {
            let header = &*buffer.header();
            header.head.store(0, Ordering::Relaxed);
            header.tail.store(0, Ordering::Relaxed);
            header.writer_waiting.store(0, Ordering::Relaxed);
            header.reader_waiting.store(0, Ordering::Relaxed);
            header.capacity.store(capacity as u64, Ordering::Release);
        }

        Ok(buffer)
    }

    /// Attach to a ring buffer formatted by another process.
    pub fn open(region: SharedMemoryRegion) -> Result<Self, SharedMemoryError> {
        let capacity = Self::data_capacity(&region)?;
        let buffer = Self { region, capacity };

        // SAFETY: the region is at least RING_HEADER_SIZE bytes
        let advertised = unsafe { (*buffer.header()).capacity.load(Ordering::Acquire) };
        if advertised != capacity as u64 {
            return Err(SharedMemoryError::InvalidBufferState {
                reason: format!(
                    "Header advertises {} bytes but the region holds {}",
                    advertised, capacity
                ),
            });
        }

        Ok(buffer)
    }

    /// Create a named region holding a ring of `capacity` data bytes.
    pub fn create(name: &str, capacity: usize) -> Result<Self, SharedMemoryError> {
        let region = SharedMemoryRegion::create(name, RING_HEADER_SIZE + capacity)?;
        Self::new(region)
    }

    /// Open the named ring created by a peer, expecting `capacity` data bytes.
    pub fn open_named(name: &str, capacity: usize) -> Result<Self, SharedMemoryError> {
        let region = SharedMemoryRegion::open(name, RING_HEADER_SIZE + capacity)?;
        Self::open(region)
    }

    /// Ring in an anonymous mapping, for use within one process.
    pub fn with_capacity(capacity: usize) -> Result<Self, SharedMemoryError> {
        let region = SharedMemoryRegion::anonymous(RING_HEADER_SIZE + capacity)?;
        Self::new(region)
    }

    fn data_capacity(region: &SharedMemoryRegion) -> Result<usize, SharedMemoryError> {
        let size = region.size();
        if size < RING_HEADER_SIZE + 64 {
            return Err(SharedMemoryError::InvalidBufferState {
                reason: format!("Region too small: {} bytes", size),
            });
        }
        Ok(size - RING_HEADER_SIZE)
    }

    /// Name of the backing region (empty for anonymous rings).
    pub fn region_name(&self) -> &str {
        self.region.name()
    }

    /// Unlink the backing region's name; the mapping stays usable.
    pub fn unlink(&mut self) {
        self.region.unlink();
    }

    fn header(&self) -> *const RingBufferHeader {
        self.region.as_ptr() as *const RingBufferHeader
    }

    fn data_ptr(&self) -> *mut u8 {
        // SAFETY: RING_HEADER_SIZE is within the region bounds
        unsafe { self.region.as_ptr().add(RING_HEADER_SIZE) }
    }

    fn header_ref(&self) -> &RingBufferHeader {
        // SAFETY: the header lies at the start of a live mapping and only
        // contains atomics
        unsafe { &*self.header() }
    }

    /// Get the capacity of the data area.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn head(&self) -> u64 {
        self.header_ref().head.load(Ordering::Acquire)
    }

    fn tail(&self) -> u64 {
        self.header_ref().tail.load(Ordering::Acquire)
    }

    /// Amount of data ready to read.
    pub fn readable_bytes(&self) -> usize {
        let used = self.head().wrapping_sub(self.tail());
        used.min(self.capacity as u64) as usize
    }

    /// Space available for writing.
    pub fn free_space(&self) -> usize {
        self.capacity - self.readable_bytes()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.readable_bytes() == 0
    }

    /// Free space above which a blocked writer is worth waking.
    pub fn significant_free_space(&self) -> usize {
        self.capacity / 4
    }

    /// Whether free space is strictly above [`Self::significant_free_space`].
    pub fn watermark_crossed(&self) -> bool {
        self.free_space() > self.significant_free_space()
    }

    /// Write `payload` in one step.
    pub fn write(&self, payload: &[u8]) -> Result<usize, SharedMemoryError> {
        self.write_vectored(&[payload])
    }

    /// Write all `parts` back to back, or nothing at all.
    ///
    /// Returns SharedMemoryError::RingBufferFull if they don't fit.
    pub fn write_vectored(&self, parts: &[&[u8]]) -> Result<usize, SharedMemoryError> {
        let total: usize = parts.iter().map(|part| part.len()).sum();
        if total > self.free_space() {
            return Err(SharedMemoryError::RingBufferFull { size: total });
        }

        let head = self.head();
        let mut position = head;
        for part in parts {
            // SAFETY: free space was checked and only this side writes here
            unsafe { self.copy_in(position, part) };
            position += part.len() as u64;
        }

        self.header_ref().head.store(position, Ordering::Release);
        Ok(total)
    }

    /// Copy readable bytes into `buffer` and consume them.
    ///
    /// Returns SharedMemoryError::RingBufferEmpty if no data is available.
    pub fn read(&self, buffer: &mut [u8]) -> Result<usize, SharedMemoryError> {
        let readable = self.readable_bytes();
        if readable == 0 {
            return Err(SharedMemoryError::RingBufferEmpty);
        }

        let count = readable.min(buffer.len());
        // SAFETY: count bytes past tail are readable
        unsafe { self.copy_out(self.tail(), &mut buffer[..count]) };
        self.advance_tail(count);
        Ok(count)
    }

    /// Copy bytes starting `offset` bytes past the tail without consuming.
    pub fn peek(&self, offset: usize, buffer: &mut [u8]) -> Result<(), SharedMemoryError> {
        let readable = self.readable_bytes();
        if offset + buffer.len() > readable {
            return Err(SharedMemoryError::InvalidBufferState {
                reason: format!(
                    "Peek of {} bytes at offset {} exceeds {} readable bytes",
                    buffer.len(),
                    offset,
                    readable
                ),
            });
        }

        // SAFETY: the requested span lies within the readable bytes
        unsafe { self.copy_out(self.tail() + offset as u64, buffer) };
        Ok(())
    }

    /// Release `count` bytes at the tail.
    pub fn consume(&self, count: usize) -> Result<(), SharedMemoryError> {
        let readable = self.readable_bytes();
        if count > readable {
            return Err(SharedMemoryError::InvalidBufferState {
                reason: format!("Cannot consume {} of {} readable bytes", count, readable),
            });
        }
        self.advance_tail(count);
        Ok(())
    }

    fn advance_tail(&self, count: usize) {
        let tail = self.tail();
        self.header_ref()
            .tail
            .store(tail + count as u64, Ordering::Release);
    }

    /// Announce that the consumer is about to wait for data.
    pub fn set_reader_waiting(&self) {
        self.header_ref().reader_waiting.store(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);
    }

    /// Clear the consumer's flag, returning whether it was raised.
    pub fn take_reader_waiting(&self) -> bool {
        fence(Ordering::SeqCst);
        self.header_ref().reader_waiting.swap(0, Ordering::SeqCst) != 0
    }

    /// Announce that the producer is about to wait for free space.
    pub fn set_writer_waiting(&self) {
        self.header_ref().writer_waiting.store(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);
    }

    /// Whether the producer currently waits for free space.
    pub fn writer_waiting(&self) -> bool {
        fence(Ordering::SeqCst);
        self.header_ref().writer_waiting.load(Ordering::SeqCst) != 0
    }

    /// Clear the producer's flag, returning whether it was raised.
    pub fn take_writer_waiting(&self) -> bool {
        fence(Ordering::SeqCst);
        self.header_ref().writer_waiting.swap(0, Ordering::SeqCst) != 0
    }

    /// # Safety
    /// `src.len()` bytes starting at `position` must be free and owned by the
    /// caller as the single producer.
    unsafe fn copy_in(&self, position: u64, src: &[u8]) {
        let offset = (position % self.capacity as u64) as usize;
        let first_chunk = src.len().min(self.capacity - offset);
        let data = self.data_ptr();

        std::ptr::copy_nonoverlapping(src.as_ptr(), data.add(offset), first_chunk);
        if first_chunk < src.len() {
            // Wrap around to beginning
            std::ptr::copy_nonoverlapping(
                src.as_ptr().add(first_chunk),
                data,
                src.len() - first_chunk,
            );
        }
    }

    /// # Safety
    /// `dst.len()` bytes starting at `position` must be readable.
    unsafe fn copy_out(&self, position: u64, dst: &mut [u8]) {
        let offset = (position % self.capacity as u64) as usize;
        let first_chunk = dst.len().min(self.capacity - offset);
        let data = self.data_ptr();

        std::ptr::copy_nonoverlapping(data.add(offset), dst.as_mut_ptr(), first_chunk);
        if first_chunk < dst.len() {
            std::ptr::copy_nonoverlapping(
                data,
                dst.as_mut_ptr().add(first_chunk),
                dst.len() - first_chunk,
            );
        }
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("region", &self.region)
            .field("capacity", &self.capacity)
            .field("readable", &self.readable_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read() {
        let ring = RingBuffer::with_capacity(4096).unwrap();
        assert!(ring.is_empty());
        assert_eq!(ring.free_space(), 4096);

        assert_eq!(ring.write(b"hello").unwrap(), 5);
        assert_eq!(ring.readable_bytes(), 5);

        let mut buf = [0u8; 16];
        assert_eq!(ring.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        assert!(matches!(
            ring.read(&mut buf),
            Err(SharedMemoryError::RingBufferEmpty)
        ));
    }

    #[test]
    fn test_all_or_nothing() {
        let ring = RingBuffer::with_capacity(4096).unwrap();
        ring.write(&[1u8; 4000]).unwrap();

        let result = ring.write_vectored(&[&[2u8; 50], &[3u8; 50]]);
        assert!(matches!(
            result,
            Err(SharedMemoryError::RingBufferFull { size: 100 })
        ));
        assert_eq!(ring.readable_bytes(), 4000);

        ring.write_vectored(&[&[2u8; 48], &[3u8; 48]]).unwrap();
        assert_eq!(ring.free_space(), 0);
    }

    #[test]
    fn test_wraparound() {
        let ring = RingBuffer::with_capacity(4096).unwrap();
        let mut sink = vec![0u8; 4096];

        ring.write(&[0u8; 4000]).unwrap();
        ring.consume(4000).unwrap();

        // Straddles the physical end of the data area
        let payload: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        ring.write(&payload).unwrap();

        let mut peeked = [0u8; 10];
        ring.peek(95, &mut peeked).unwrap();
        assert_eq!(&peeked, &payload[95..105]);

        let n = ring.read(&mut sink).unwrap();
        assert_eq!(&sink[..n], &payload[..]);
    }

    #[test]
    fn test_peek_and_consume_bounds() {
        let ring = RingBuffer::with_capacity(4096).unwrap();
        ring.write(b"abc").unwrap();

        let mut buf = [0u8; 4];
        assert!(ring.peek(0, &mut buf).is_err());
        assert!(ring.consume(4).is_err());
        ring.consume(3).unwrap();
        assert!(ring.is_empty());
    }

    #[test]
    fn test_watermark_boundary() {
        let ring = RingBuffer::with_capacity(4096).unwrap();
        assert_eq!(ring.significant_free_space(), 1024);

        ring.write(&[0u8; 4096]).unwrap();
        assert!(!ring.watermark_crossed());

        // Free space exactly capacity/4: not eligible
        ring.consume(1024).unwrap();
        assert_eq!(ring.free_space(), 1024);
        assert!(!ring.watermark_crossed());

        // One more byte makes it capacity/4 + 1
        ring.consume(1).unwrap();
        assert_eq!(ring.free_space(), 1025);
        assert!(ring.watermark_crossed());
    }

    #[test]
    fn test_waiting_flags() {
        let ring = RingBuffer::with_capacity(4096).unwrap();
        assert!(!ring.take_reader_waiting());

        ring.set_reader_waiting();
        assert!(ring.take_reader_waiting());
        assert!(!ring.take_reader_waiting());

        ring.set_writer_waiting();
        assert!(ring.writer_waiting());
        assert!(ring.take_writer_waiting());
        assert!(!ring.writer_waiting());
    }

    #[test]
    fn test_named_ring_shared_between_mappings() {
        let name = format!("shmlink-ring-{}", std::process::id());
        let producer = RingBuffer::create(&name, 8192).unwrap();
        let consumer = RingBuffer::open_named(&name, 8192).unwrap();

        producer.write(b"across mappings").unwrap();
        let mut buf = [0u8; 32];
        let n = consumer.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"across mappings");
        assert_eq!(producer.free_space(), 8192);
    }

    #[test]
    fn test_open_rejects_capacity_mismatch() {
        let name = format!("shmlink-ring-mismatch-{}", std::process::id());
        let _producer = RingBuffer::create(&name, 8192).unwrap();
        assert!(RingBuffer::open_named(&name, 4096).is_err());
    }
}
