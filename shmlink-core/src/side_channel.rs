// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Out-of-band signalling between the two ends of a connection.
//!
//! The side-channel is the Unix stream socket left over from the handshake.
//! Every byte on it is one event:
//!
//! | value   | meaning                                          |
//! |---------|--------------------------------------------------|
//! | 0..=249 | application notification                         |
//! | 250     | handshake acknowledgement                        |
//! | 251     | data became available in the receiver's ring     |
//! | 252     | free space crossed the watermark                 |
//! | 253     | orderly close                                    |
//! | 254     | memory handle, fd attached via `SCM_RIGHTS`      |
//! | 255     | reserved                                         |
//!
//! Writes never block: wake-ups are dropped when the socket buffer is full
//! (the peer has unread wake-ups pending anyway), notifications fail with a
//! resource error.

use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use crate::error::{TransportError, TransportResult};
use crate::handle::MemoryHandle;
use crate::types::{PeerIdentity, ProcessId};

/// Largest notification value available to applications.
pub const MAX_USER_NOTIFICATION: u8 = 249;

/// Transport-internal side-channel bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ControlCode {
    Attached = 250,
    DataAvailable = 251,
    Writable = 252,
    Goodbye = 253,
    Handle = 254,
}

impl ControlCode {
    const fn name(self) -> &'static str {
        match self {
            Self::Attached => "attached",
            Self::DataAvailable => "data-available",
            Self::Writable => "writable",
            Self::Goodbye => "goodbye",
            Self::Handle => "handle",
        }
    }
}

/// One decoded side-channel byte.
#[derive(Debug)]
pub(crate) enum SideEvent {
    Notification(u8),
    Attached,
    DataAvailable,
    Writable,
    Goodbye,
    /// `None` when the kernel dropped the descriptor on the way.
    Handle(Option<MemoryHandle>),
    Reserved(u8),
}

/// Events read by one `recvmsg` call.
#[derive(Debug, Default)]
pub(crate) struct SideBatch {
    pub events: Vec<SideEvent>,
    /// The peer closed its end.
    pub eof: bool,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = libc::MSG_DONTWAIT;

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: libc::c_int = libc::MSG_DONTWAIT | libc::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: libc::c_int = libc::MSG_DONTWAIT;

/// Descriptors accepted per `recvmsg` call.
const MAX_FDS_PER_READ: usize = 8;

/// Control message buffer with the alignment `cmsghdr` requires.
#[repr(C, align(8))]
struct ControlBuffer([u8; 256]);

pub(crate) struct SideChannel {
    fd: AsyncFd<OwnedFd>,
}

impl SideChannel {
    /// Take over a connected stream socket.
    pub fn new(stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        let fd = OwnedFd::from(stream);
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        disable_sigpipe(fd.as_raw_fd())?;

        Ok(Self {
            fd: AsyncFd::try_with_interest(fd, Interest::READABLE)?,
        })
    }

    #[cfg(test)]
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::new(a)?, Self::new(b)?))
    }

    fn raw_fd(&self) -> RawFd {
        self.fd.get_ref().as_raw_fd()
    }

    /// Send an application notification.
    pub fn send_notification(&self, value: u8) -> TransportResult<()> {
        if value > MAX_USER_NOTIFICATION {
            return Err(TransportError::Api {
                reason: format!(
                    "Notification value {} is reserved (allowed: 0..={})",
                    value, MAX_USER_NOTIFICATION
                ),
            });
        }

        match self.send_byte(value) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Err(TransportError::Resource {
                reason: "Too many notifications in flight".to_string(),
            }),
            Err(err) => Err(TransportError::from_io("sending notification", err)),
        }
    }

    /// Best-effort transport signal. Returns whether it was sent.
    pub fn signal(&self, code: ControlCode) -> bool {
        match self.send_byte(code as u8) {
            Ok(()) => true,
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                tracing::trace!(signal = code.name(), "Side-channel full, signal dropped");
                false
            }
            Err(err) => {
                tracing::debug!(signal = code.name(), error = %err, "Failed to send signal");
                false
            }
        }
    }

    fn send_byte(&self, byte: u8) -> io::Result<()> {
        loop {
            // SAFETY: fd is a valid socket, the buffer is one live byte
            let ret = unsafe {
                libc::send(
                    self.raw_fd(),
                    &byte as *const u8 as *const libc::c_void,
                    1,
                    SEND_FLAGS,
                )
            };

            match ret {
                1 => return Ok(()),
                0 => return Err(io::Error::new(ErrorKind::WriteZero, "send wrote 0 bytes")),
                _ => {
                    let err = io::Error::last_os_error();
                    if err.kind() != ErrorKind::Interrupted {
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Send the handle byte with `handle` attached. The kernel duplicates the
    /// descriptor; the caller keeps its own.
    pub fn send_handle(&self, handle: &MemoryHandle) -> io::Result<()> {
        let byte = [ControlCode::Handle as u8];
        let mut iov = libc::iovec {
            iov_base: byte.as_ptr() as *mut libc::c_void,
            iov_len: byte.len(),
        };

        let fds = [handle.as_raw_fd()];
        let data_len = std::mem::size_of_val(&fds);
        let mut control = ControlBuffer([0u8; 256]);
        // SAFETY: CMSG_SPACE is a pure size computation
        let cmsg_space = unsafe { libc::CMSG_SPACE(data_len as u32) as usize };

        // SAFETY: an all-zero msghdr is a valid empty header
        let mut msghdr: libc::msghdr = unsafe { std::mem::zeroed() };
        msghdr.msg_iov = &mut iov;
        msghdr.msg_iovlen = 1;
        msghdr.msg_control = control.0.as_mut_ptr().cast();
        msghdr.msg_controllen = cmsg_space as _;

        // SAFETY: msghdr points at a control buffer of cmsg_space bytes
        let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msghdr) };
        if cmsg.is_null() {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                "failed to build cmsg header",
            ));
        }

        // SAFETY: cmsg points into the control buffer with room for one fd
        unsafe {
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(data_len as u32) as _;
            let data_ptr = libc::CMSG_DATA(cmsg).cast::<RawFd>();
            std::ptr::copy_nonoverlapping(fds.as_ptr(), data_ptr, 1);
        }

        loop {
            // SAFETY: msghdr and everything it points to outlive the call
            let n = unsafe { libc::sendmsg(self.raw_fd(), &msghdr, SEND_FLAGS) };
            if n > 0 {
                return Ok(());
            }
            if n == 0 {
                return Err(io::Error::new(ErrorKind::WriteZero, "sendmsg wrote 0 bytes"));
            }
            let err = io::Error::last_os_error();
            if err.kind() != ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// Wait for and decode the next burst of side-channel bytes.
    pub async fn recv(&self) -> io::Result<SideBatch> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| recv_batch(inner.get_ref().as_raw_fd())) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Shut down both directions; the peer observes end-of-stream.
    pub fn shutdown(&self) {
        // SAFETY: fd is a valid socket
        unsafe { libc::shutdown(self.raw_fd(), libc::SHUT_RDWR) };
    }

    /// Credentials of the peer process.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub fn peer_identity(&self) -> TransportResult<PeerIdentity> {
        use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};

        let creds = getsockopt(self.fd.get_ref(), PeerCredentials).map_err(|errno| {
            TransportError::from_io("reading peer credentials", io::Error::from(errno))
        })?;

        Ok(PeerIdentity {
            pid: ProcessId::new(creds.pid() as u32).ok(),
            uid: creds.uid(),
            gid: creds.gid(),
        })
    }

    /// Credentials of the peer process.
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub fn peer_identity(&self) -> TransportResult<PeerIdentity> {
        let mut uid: libc::uid_t = 0;
        let mut gid: libc::gid_t = 0;
        // SAFETY: fd is a connected Unix socket, uid/gid are valid out-params
        if unsafe { libc::getpeereid(self.raw_fd(), &mut uid, &mut gid) } < 0 {
            return Err(TransportError::from_io(
                "reading peer credentials",
                io::Error::last_os_error(),
            ));
        }

        Ok(PeerIdentity {
            pid: None,
            uid,
            gid,
        })
    }
}

/// One non-blocking `recvmsg`, decoded into events.
fn recv_batch(fd: RawFd) -> io::Result<SideBatch> {
    let mut data = [0u8; 256];
    let mut iov = libc::iovec {
        iov_base: data.as_mut_ptr().cast(),
        iov_len: data.len(),
    };

    let mut control = ControlBuffer([0u8; 256]);
    // SAFETY: CMSG_SPACE is a pure size computation
    let cmsg_space = unsafe {
        libc::CMSG_SPACE((MAX_FDS_PER_READ * std::mem::size_of::<RawFd>()) as u32) as usize
    };

    // SAFETY: an all-zero msghdr is a valid empty header
    let mut msghdr: libc::msghdr = unsafe { std::mem::zeroed() };
    msghdr.msg_iov = &mut iov;
    msghdr.msg_iovlen = 1;
    msghdr.msg_control = control.0.as_mut_ptr().cast();
    msghdr.msg_controllen = cmsg_space.min(control.0.len()) as _;

    let n = loop {
        // SAFETY: msghdr and its buffers are valid for the call
        let n = unsafe { libc::recvmsg(fd, &mut msghdr, RECV_FLAGS) };
        if n >= 0 {
            break n as usize;
        }
        let err = io::Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    };

    // Take ownership of every received descriptor before anything else so
    // none of them leak.
    let mut fds = VecDeque::new();
    // SAFETY: the kernel filled msghdr; we only walk headers it reports
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msghdr);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let cmsg_len = (*cmsg).cmsg_len as usize;
                let base_len = libc::CMSG_LEN(0) as usize;
                let count = cmsg_len.saturating_sub(base_len) / std::mem::size_of::<RawFd>();
                let data_ptr = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                for i in 0..count {
                    let raw = std::ptr::read_unaligned(data_ptr.add(i));
                    fds.push_back(OwnedFd::from_raw_fd(raw));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msghdr, cmsg);
        }
    }

    if (msghdr.msg_flags & libc::MSG_CTRUNC) != 0 {
        tracing::warn!("Side-channel control data truncated, memory handles were dropped");
    }

    if n == 0 {
        return Ok(SideBatch {
            events: Vec::new(),
            eof: true,
        });
    }

    let events = data[..n]
        .iter()
        .map(|&byte| match byte {
            0..=MAX_USER_NOTIFICATION => SideEvent::Notification(byte),
            250 => SideEvent::Attached,
            251 => SideEvent::DataAvailable,
            252 => SideEvent::Writable,
            253 => SideEvent::Goodbye,
            254 => SideEvent::Handle(fds.pop_front().map(MemoryHandle::new)),
            _ => SideEvent::Reserved(byte),
        })
        .collect();

    if !fds.is_empty() {
        tracing::warn!(count = fds.len(), "Dropping unexpected descriptors");
    }

    Ok(SideBatch { events, eof: false })
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn disable_sigpipe(fd: RawFd) -> io::Result<()> {
    let one: libc::c_int = 1;
    // SAFETY: fd is a valid socket, option value is a c_int
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            &one as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::FileExt;
    use std::time::Duration;

    use crate::error::ErrorKind as TransportErrorKind;

    async fn next_batch(channel: &SideChannel) -> SideBatch {
        tokio::time::timeout(Duration::from_secs(5), channel.recv())
            .await
            .expect("timed out waiting for side-channel")
            .expect("recv failed")
    }

    #[tokio::test]
    async fn test_notifications_in_order() {
        let (a, b) = SideChannel::pair().unwrap();
        for value in [7u8, 0, 249] {
            a.send_notification(value).unwrap();
        }

        let mut received = Vec::new();
        while received.len() < 3 {
            for event in next_batch(&b).await.events {
                if let SideEvent::Notification(v) = event {
                    received.push(v);
                }
            }
        }
        assert_eq!(received, vec![7, 0, 249]);
    }

    #[tokio::test]
    async fn test_reserved_values_rejected() {
        let (a, _b) = SideChannel::pair().unwrap();
        for value in 250..=255u8 {
            let err = a.send_notification(value).unwrap_err();
            assert_eq!(err.kind(), TransportErrorKind::Api);
        }
    }

    #[tokio::test]
    async fn test_control_codes_decode() {
        let (a, b) = SideChannel::pair().unwrap();
        assert!(a.signal(ControlCode::DataAvailable));
        assert!(a.signal(ControlCode::Goodbye));

        let mut events = Vec::new();
        while events.len() < 2 {
            events.extend(next_batch(&b).await.events);
        }
        assert!(matches!(events[0], SideEvent::DataAvailable));
        assert!(matches!(events[1], SideEvent::Goodbye));
    }

    #[tokio::test]
    async fn test_handle_transfer() {
        let (a, b) = SideChannel::pair().unwrap();

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"shared bytes").unwrap();
        let handle = MemoryHandle::from(file);
        a.send_handle(&handle).unwrap();

        let batch = next_batch(&b).await;
        assert_eq!(batch.events.len(), 1);
        let received = match batch.events.into_iter().next() {
            Some(SideEvent::Handle(Some(received))) => received,
            other => panic!("unexpected event {:?}", other),
        };

        let mut buf = [0u8; 12];
        received.into_file().read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"shared bytes");
    }

    #[tokio::test]
    async fn test_shutdown_reports_eof() {
        let (a, b) = SideChannel::pair().unwrap();
        a.shutdown();
        let batch = next_batch(&b).await;
        assert!(batch.eof);
        assert!(batch.events.is_empty());
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[tokio::test]
    async fn test_peer_identity() {
        let (a, _b) = SideChannel::pair().unwrap();
        let identity = a.peer_identity().unwrap();
        assert_eq!(identity.pid.map(|p| p.value()), Some(std::process::id()));
        // SAFETY: getuid has no preconditions
        assert_eq!(identity.uid, unsafe { libc::getuid() });
    }
}
