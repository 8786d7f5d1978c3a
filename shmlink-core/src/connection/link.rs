// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Data path of an established connection.
//!
//! A [`Link`] owns both ring buffers and the side-channel. All operations are
//! non-blocking: they either complete or report `WouldBlock`. Waiting is the
//! business of [`super::Connection`].

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::Mutex;

use crate::error::{ProtocolError, SharedMemoryError, TransportError, TransportResult};
use crate::frame::{
    CommonHeader, ExtendedHeader, MessageFormat, SequenceCounter, COMMON_HEADER_SIZE,
    EXTENDED_HEADER_SIZE,
};
use crate::handle::MemoryHandle;
use crate::shm::RingBuffer;
use crate::side_channel::{ControlCode, SideChannel};
use crate::stats::StatsCounters;
use crate::sync::lock;
use crate::types::BufferSizes;

use super::{ChunkProgress, ChunkSink, MessageInfo, ReceivedMessage};

/// Which end of the handshake created this link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

impl Role {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
        }
    }
}

#[derive(Debug, Default)]
struct TxState {
    seq: SequenceCounter,
    next_handle: u32,
}

#[derive(Debug, Default)]
struct RxState {
    seq: SequenceCounter,
    /// Handles delivered by the side-channel, tagged with their arrival index.
    handles: VecDeque<(u32, Option<MemoryHandle>)>,
    next_handle: u32,
}

/// Validated header of the next inbound message.
#[derive(Debug, Clone, Copy)]
struct Frame {
    format: MessageFormat,
    size: usize,
    handle_seq: Option<u32>,
}

impl Frame {
    fn overhead(&self) -> usize {
        self.format.overhead()
    }
}

enum HandleClaim {
    Ready(Option<MemoryHandle>),
    Pending,
}

pub(crate) struct Link {
    role: Role,
    outbound: RingBuffer,
    inbound: RingBuffer,
    side: SideChannel,
    sizes: BufferSizes,
    tx: Mutex<TxState>,
    rx: Mutex<RxState>,
    stats: StatsCounters,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("role", &self.role)
            .field("sizes", &self.sizes)
            .finish()
    }
}

impl Link {
    pub fn new(
        role: Role,
        outbound: RingBuffer,
        inbound: RingBuffer,
        side: SideChannel,
        sizes: BufferSizes,
    ) -> Self {
        Self {
            role,
            outbound,
            inbound,
            side,
            sizes,
            tx: Mutex::new(TxState::default()),
            rx: Mutex::new(RxState::default()),
            stats: StatsCounters::default(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn sizes(&self) -> BufferSizes {
        self.sizes
    }

    pub fn side(&self) -> &SideChannel {
        &self.side
    }

    pub fn stats(&self) -> &StatsCounters {
        &self.stats
    }

    /// Largest payload a single message of `format` can carry.
    pub fn max_payload(&self, format: MessageFormat) -> usize {
        self.outbound.capacity().saturating_sub(format.overhead())
    }

    /// Write one message, or nothing.
    ///
    /// The handle goes over the side-channel before the message is published
    /// so the receiver never sees a handle message whose descriptor is still
    /// in flight behind it.
    pub fn send(&self, payload: &[u8], handle: Option<&MemoryHandle>) -> TransportResult<()> {
        let requested = if handle.is_some() {
            MessageFormat::HandleExchange
        } else {
            MessageFormat::Data
        };
        let max = self.max_payload(requested);
        if payload.len() > max {
            return Err(TransportError::MessageTooLarge {
                size: payload.len(),
                max,
            });
        }

        let mut tx = lock(&self.tx);
        if requested.overhead() + payload.len() > self.outbound.free_space() {
            self.stats.record_would_block();
            return Err(TransportError::WouldBlock);
        }

        let handle_seq = match handle {
            Some(handle) => match self.side.send_handle(handle) {
                Ok(()) => {
                    let seq = tx.next_handle;
                    tx.next_handle = seq.wrapping_add(1);
                    Some(seq)
                }
                Err(err) if is_handle_pressure(&err) => {
                    tracing::warn!(
                        role = self.role.name(),
                        error = %err,
                        "Could not pass memory handle, sending data only"
                    );
                    self.stats.record_degraded_handle();
                    None
                }
                Err(err) => return Err(TransportError::from_io("sending memory handle", err)),
            },
            None => None,
        };

        let format = if handle_seq.is_some() {
            MessageFormat::HandleExchange
        } else {
            MessageFormat::Data
        };
        let header = CommonHeader::new(format, payload.len() as u32, tx.seq.current()).serialize();
        let written = match handle_seq {
            Some(seq) => {
                let extended = ExtendedHeader::new(seq).serialize();
                self.outbound
                    .write_vectored(&[&header, &extended, payload])
            }
            None => self.outbound.write_vectored(&[&header, payload]),
        };
        written.map_err(|err| match err {
            SharedMemoryError::RingBufferFull { .. } => TransportError::WouldBlock,
            other => other.into(),
        })?;
        tx.seq.advance();
        drop(tx);

        self.stats.record_send(payload.len(), handle_seq.is_some());
        if self.outbound.take_reader_waiting() {
            self.side.signal(ControlCode::DataAvailable);
        }
        Ok(())
    }

    /// Read one message into `buffer`.
    ///
    /// On truncation the prefix that fits is copied, the message is consumed
    /// and `Truncated` is returned.
    pub fn receive(&self, buffer: &mut [u8]) -> TransportResult<ReceivedMessage> {
        let mut rx = lock(&self.rx);
        let frame = self.next_frame(&rx)?.ok_or(TransportError::WouldBlock)?;
        let handle = self.claim_frame_handle(&mut rx, &frame)?;

        let copied = frame.size.min(buffer.len());
        self.inbound.peek(frame.overhead(), &mut buffer[..copied])?;
        self.finish_frame(&mut rx, &frame)?;
        drop(rx);

        self.after_consume();
        self.stats.record_receive(frame.size, handle.is_some());

        if copied < frame.size {
            if handle.is_some() {
                tracing::debug!(role = self.role.name(), "Dropping handle of truncated message");
            }
            return Err(TransportError::Truncated {
                message_size: frame.size,
                buffer_size: buffer.len(),
            });
        }

        Ok(ReceivedMessage {
            len: frame.size,
            handle,
        })
    }

    /// Read one message piecewise into destinations supplied by `sink`.
    pub fn receive_chunked<S: ChunkSink + ?Sized>(&self, sink: &mut S) -> TransportResult<usize> {
        let mut rx = lock(&self.rx);
        let frame = self.next_frame(&rx)?.ok_or(TransportError::WouldBlock)?;
        let handle = self.claim_frame_handle(&mut rx, &frame)?;

        let mut delivered = 0;
        while delivered < frame.size {
            let chunk = sink.next_chunk(ChunkProgress {
                message_size: frame.size,
                received: delivered,
            });
            if chunk.is_empty() {
                break;
            }
            let count = chunk.len().min(frame.size - delivered);
            self.inbound
                .peek(frame.overhead() + delivered, &mut chunk[..count])?;
            delivered += count;
        }

        self.finish_frame(&mut rx, &frame)?;
        drop(rx);

        self.after_consume();
        self.stats.record_receive(frame.size, handle.is_some());

        if delivered < frame.size {
            return Err(TransportError::Truncated {
                message_size: frame.size,
                buffer_size: delivered,
            });
        }
        Ok(frame.size)
    }

    /// Size and handle flag of the next message, without consuming it.
    pub fn pending_message(&self) -> TransportResult<Option<MessageInfo>> {
        let rx = lock(&self.rx);
        Ok(self.next_frame(&rx)?.map(|frame| MessageInfo {
            size: frame.size,
            has_handle: frame.handle_seq.is_some(),
        }))
    }

    /// Queue a handle received on the side-channel.
    pub fn push_handle(&self, handle: Option<MemoryHandle>) {
        let mut rx = lock(&self.rx);
        let seq = rx.next_handle;
        rx.next_handle = seq.wrapping_add(1);
        if handle.is_none() {
            tracing::warn!(role = self.role.name(), handle_seq = seq, "Memory handle lost in transit");
        }
        rx.handles.push_back((seq, handle));
    }

    /// Raise the reader flag. Returns true if a retry can make progress right
    /// away, in which case the caller must not wait.
    pub fn arm_reader(&self) -> bool {
        self.inbound.set_reader_waiting();
        !self.inbound.is_empty() && !self.awaiting_handle()
    }

    /// The next message carries a handle the driver has not queued yet.
    fn awaiting_handle(&self) -> bool {
        let rx = lock(&self.rx);
        matches!(
            self.next_frame(&rx),
            Ok(Some(frame)) if frame.handle_seq.is_some() && rx.handles.is_empty()
        )
    }

    /// Publish raw bytes on the outbound ring, bypassing framing.
    #[cfg(test)]
    pub(crate) fn inject_raw(&self, parts: &[&[u8]]) {
        self.outbound.write_vectored(parts).unwrap();
    }

    /// Raise the writer flag. Returns true if `needed` bytes are already
    /// free, in which case the caller must not wait.
    pub fn arm_writer(&self, needed: usize) -> bool {
        self.outbound.set_writer_waiting();
        self.outbound.free_space() >= needed
    }

    /// Announce an orderly close and shut the side-channel down.
    pub fn say_goodbye(&self) {
        self.side.signal(ControlCode::Goodbye);
        self.side.shutdown();
    }

    fn next_frame(&self, rx: &RxState) -> TransportResult<Option<Frame>> {
        let readable = self.inbound.readable_bytes();
        if readable == 0 {
            return Ok(None);
        }

        // Writers publish whole messages, so anything shorter than a header
        // means the ring is corrupt.
        if readable < COMMON_HEADER_SIZE {
            return Err(corrupt_incomplete(COMMON_HEADER_SIZE, readable));
        }

        let mut raw = [0u8; COMMON_HEADER_SIZE];
        self.inbound.peek(0, &mut raw)?;
        let header = CommonHeader::deserialize(&raw);
        let format = header
            .validate(rx.seq.current())
            .map_err(ProtocolError::from)?;

        let size = header.payload_size();
        if format.overhead() + size > readable {
            return Err(corrupt_incomplete(format.overhead() + size, readable));
        }

        let handle_seq = match format {
            MessageFormat::Data => None,
            MessageFormat::HandleExchange => {
                let mut raw = [0u8; EXTENDED_HEADER_SIZE];
                self.inbound.peek(COMMON_HEADER_SIZE, &mut raw)?;
                let seq = ExtendedHeader::deserialize(&raw)
                    .validate()
                    .map_err(ProtocolError::from)?;
                Some(seq)
            }
        };

        Ok(Some(Frame {
            format,
            size,
            handle_seq,
        }))
    }

    fn claim_frame_handle(
        &self,
        rx: &mut RxState,
        frame: &Frame,
    ) -> TransportResult<Option<MemoryHandle>> {
        let Some(expected) = frame.handle_seq else {
            return Ok(None);
        };

        match claim_handle(rx, expected)? {
            HandleClaim::Ready(handle) => Ok(handle),
            // The descriptor precedes the message on the wire; it only needs
            // the driver to pick it up.
            HandleClaim::Pending => Err(TransportError::WouldBlock),
        }
    }

    fn finish_frame(&self, rx: &mut RxState, frame: &Frame) -> TransportResult<()> {
        self.inbound.consume(frame.overhead() + frame.size)?;
        rx.seq.advance();
        Ok(())
    }

    fn after_consume(&self) {
        if self.inbound.writer_waiting()
            && self.inbound.watermark_crossed()
            && self.inbound.take_writer_waiting()
        {
            self.side.signal(ControlCode::Writable);
        }
    }
}

fn claim_handle(rx: &mut RxState, expected: u32) -> TransportResult<HandleClaim> {
    match rx.handles.front() {
        None => Ok(HandleClaim::Pending),
        Some((seq, _)) if *seq == expected => {
            let handle = rx.handles.pop_front().and_then(|(_, handle)| handle);
            Ok(HandleClaim::Ready(handle))
        }
        Some((seq, _)) => Err(ProtocolError::HandleOutOfOrder {
            expected,
            actual: *seq,
        }
        .into()),
    }
}

fn corrupt_incomplete(size: usize, readable: usize) -> TransportError {
    ProtocolError::from(crate::error::CorruptionError::IncompleteMessage { size, readable }).into()
}

/// Failures that mean "not now" rather than "broken".
fn is_handle_pressure(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::WouldBlock {
        return true;
    }
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM | libc::ETOOMANYREFS)
    )
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    static NEXT_PAIR: AtomicU32 = AtomicU32::new(0);

    /// Two links wired to each other through real named regions.
    pub(crate) fn link_pair(client_to_server: usize, server_to_client: usize) -> (Link, Link) {
        let id = NEXT_PAIR.fetch_add(1, Ordering::Relaxed);
        let c2s_name = format!("shmlink-lt-{:x}-{:x}-c", std::process::id(), id);
        let s2c_name = format!("shmlink-lt-{:x}-{:x}-s", std::process::id(), id);

        let c2s_server = RingBuffer::create(&c2s_name, client_to_server).unwrap();
        let c2s_client = RingBuffer::open_named(&c2s_name, client_to_server).unwrap();
        let s2c_server = RingBuffer::create(&s2c_name, server_to_client).unwrap();
        let s2c_client = RingBuffer::open_named(&s2c_name, server_to_client).unwrap();

        let (client_side, server_side) = SideChannel::pair().unwrap();
        let sizes = BufferSizes {
            client_to_server,
            server_to_client,
        };

        (
            Link::new(Role::Client, c2s_client, s2c_client, client_side, sizes),
            Link::new(Role::Server, s2c_server, c2s_server, server_side, sizes),
        )
    }
}
