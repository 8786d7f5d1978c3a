// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Connection lifecycle and data transfer.
//!
//! A [`Connection`] moves messages through two shared memory rings, one per
//! direction, and exchanges single-byte notifications and memory handles over
//! a Unix socket side-channel. A driver task spawned on the tokio runtime
//! watches the side-channel and wakes pending operations.
//!
//! Every operation has a non-blocking `_sync` form that completes or reports
//! `WouldBlock`, and an async form that waits. At most one async send, one
//! async receive and one connect may be outstanding per connection; a second
//! one fails with `Busy`.

mod driver;
mod link;

#[cfg(test)]
pub(crate) use link::testing;
pub(crate) use link::{Link, Role};

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::TransportConfig;
use crate::error::{DisconnectKind, ProtocolError, TransportError, TransportResult};
use crate::frame::MessageFormat;
use crate::handle::MemoryHandle;
use crate::handshake;
use crate::state::{ConnectionState, ConnectionStateMachine};
use crate::stats::TransportStats;
use crate::sync::{lock, OpSlot};
use crate::types::{BufferSizes, PeerIdentity, UnicastAddress};

/// How an async send completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The message went out on the first attempt.
    Immediate,
    /// The ring was full; the message went out after the peer made room.
    Deferred,
}

/// A message read into a caller buffer.
#[derive(Debug)]
pub struct ReceivedMessage {
    /// Payload size. Equals the number of bytes written to the buffer.
    pub len: usize,
    /// The attached handle, if the message had one and it survived transit.
    pub handle: Option<MemoryHandle>,
}

/// Metadata of the next unread message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageInfo {
    pub size: usize,
    pub has_handle: bool,
}

/// Position within a message being received in chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    /// Total payload size of the message.
    pub message_size: usize,
    /// Bytes delivered so far.
    pub received: usize,
}

/// Destination provider for [`Connection::receive_chunked`].
///
/// Called until the message is complete. Returning an empty slice truncates
/// the rest of the message. The sink runs while the inbound direction is
/// locked and must not call back into the same connection.
pub trait ChunkSink {
    fn next_chunk(&mut self, progress: ChunkProgress) -> &mut [u8];
}

/// Appends the whole remaining message in one chunk.
impl ChunkSink for Vec<u8> {
    fn next_chunk(&mut self, progress: ChunkProgress) -> &mut [u8] {
        let start = self.len();
        self.resize(start + (progress.message_size - progress.received), 0);
        &mut self[start..]
    }
}

type NotificationHandler = Arc<dyn Fn(u8) + Send + Sync>;

struct Session {
    machine: ConnectionStateMachine,
    link: Option<Arc<Link>>,
    driver: Option<JoinHandle<()>>,
    /// Bumped on every connect and close, so stale tasks recognise themselves.
    generation: u64,
    peer: Option<DisconnectKind>,
    broken: Option<ProtocolError>,
}

pub(crate) struct ConnectionInner {
    config: TransportConfig,
    session: Mutex<Session>,
    handler: Mutex<Option<NotificationHandler>>,
    connect_slot: OpSlot,
    send_slot: OpSlot,
    receive_slot: OpSlot,
    readable: Notify,
    writable: Notify,
    closed: Notify,
}

/// Live session state captured at the start of an attempt.
struct Active {
    link: Arc<Link>,
    peer: Option<DisconnectKind>,
    generation: u64,
}

impl ConnectionInner {
    fn active(&self) -> TransportResult<Active> {
        let session = lock(&self.session);
        if session.machine.state() != ConnectionState::Connected {
            return Err(TransportError::Uninitialized);
        }
        if let Some(err) = &session.broken {
            return Err(TransportError::Protocol(err.clone()));
        }
        let link = session.link.clone().ok_or(TransportError::Uninitialized)?;
        Ok(Active {
            link,
            peer: session.peer,
            generation: session.generation,
        })
    }

    /// Re-enter a session a pending operation started in. A session that has
    /// ended since then means the operation was canceled.
    fn resume(&self, generation: u64, operation: &'static str) -> TransportResult<Active> {
        match self.active() {
            Ok(active) if active.generation == generation => Ok(active),
            Ok(_) | Err(TransportError::Uninitialized) => {
                Err(TransportError::Canceled { operation })
            }
            Err(err) => Err(err),
        }
    }

    /// Protocol errors break the connection for good.
    fn check<T>(&self, result: TransportResult<T>) -> TransportResult<T> {
        if let Err(TransportError::Protocol(err)) = &result {
            let mut session = lock(&self.session);
            if session.broken.is_none() {
                tracing::error!(error = %err, "Protocol violation, connection is broken");
                session.broken = Some(err.clone());
            }
            drop(session);
            self.readable.notify_one();
            self.writable.notify_one();
        }
        result
    }

    fn begin_connecting(&self) -> TransportResult<u64> {
        let mut session = lock(&self.session);
        match session.machine.state() {
            ConnectionState::Connected => return Err(TransportError::AlreadyConnected),
            ConnectionState::Connecting => {
                return Err(TransportError::Busy {
                    operation: self.connect_slot.operation(),
                })
            }
            ConnectionState::Closed => {}
        }

        session.machine.transition_to(ConnectionState::Connecting)?;
        session.generation = session.generation.wrapping_add(1);
        session.peer = None;
        session.broken = None;
        Ok(session.generation)
    }

    fn establish(self: &Arc<Self>, generation: u64, link: Link) -> TransportResult<()> {
        let link = Arc::new(link);
        let mut session = lock(&self.session);
        if session.generation != generation
            || session.machine.state() != ConnectionState::Connecting
        {
            drop(session);
            link.say_goodbye();
            return Err(TransportError::Canceled {
                operation: self.connect_slot.operation(),
            });
        }

        session.machine.transition_to(ConnectionState::Connected)?;
        let driver = tokio::spawn(driver::run(
            Arc::clone(self),
            Arc::clone(&link),
            generation,
        ));
        session.driver = Some(driver);
        session.link = Some(link);
        Ok(())
    }

    fn mark_disconnected(&self, generation: u64, kind: DisconnectKind) {
        {
            let mut session = lock(&self.session);
            if session.generation != generation
                || session.machine.state() != ConnectionState::Connected
                || session.peer.is_some()
            {
                return;
            }
            session.peer = Some(kind);
        }

        tracing::info!(kind = kind.name(), "Peer disconnected");
        self.readable.notify_one();
        self.writable.notify_one();
    }

    fn dispatch_notification(&self, value: u8) {
        // Cloned out so the handler may unregister itself.
        let handler = lock(&self.handler).clone();
        match handler {
            Some(handler) => handler(value),
            None => tracing::trace!(value, "No notification handler, dropping"),
        }
    }

    fn close(&self) {
        let (link, driver, uptime) = {
            let mut session = lock(&self.session);
            if session.machine.state() == ConnectionState::Closed {
                return;
            }
            let uptime = session.machine.time_in_current_state();
            if let Err(err) = session.machine.transition_to(ConnectionState::Closed) {
                tracing::warn!(error = %err, "Unexpected state while closing");
            }
            session.generation = session.generation.wrapping_add(1);
            (session.link.take(), session.driver.take(), uptime)
        };

        if let Some(driver) = driver {
            driver.abort();
        }
        if let Some(link) = link {
            link.say_goodbye();
            tracing::info!(
                role = link.role().name(),
                sizes = %link.sizes(),
                ?uptime,
                "Connection closed"
            );
        }
        self.closed.notify_waiters();
    }
}

/// Reverts a connect that did not finish to `Closed`, including when the
/// connect future is dropped.
struct ConnectAttempt<'a> {
    inner: &'a ConnectionInner,
    generation: u64,
    finished: bool,
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut session = lock(&self.inner.session);
        if session.generation == self.generation
            && session.machine.state() == ConnectionState::Connecting
        {
            if let Err(err) = session.machine.transition_to(ConnectionState::Closed) {
                tracing::warn!(error = %err, "Failed to roll back connect");
            }
        }
    }
}

/// One end of a point-to-point shared memory connection.
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                config,
                session: Mutex::new(Session {
                    machine: ConnectionStateMachine::default(),
                    link: None,
                    driver: None,
                    generation: 0,
                    peer: None,
                    broken: None,
                }),
                handler: Mutex::new(None),
                connect_slot: OpSlot::new("connect"),
                send_slot: OpSlot::new("send"),
                receive_slot: OpSlot::new("receive"),
                readable: Notify::new(),
                writable: Notify::new(),
                closed: Notify::new(),
            }),
        }
    }

    /// Wrap a link whose handshake the acceptor completed.
    pub(crate) fn from_established(config: TransportConfig, link: Link) -> TransportResult<Self> {
        let connection = Self::new(config);
        let generation = connection.inner.begin_connecting()?;
        connection.inner.establish(generation, link)?;
        Ok(connection)
    }

    /// Connect to the acceptor listening on `address`.
    ///
    /// `client_to_server` of 0 requests the configured default size;
    /// `server_to_client` of [`USE_SERVER_BUFFER_SIZE`] requests the size the
    /// acceptor was initialized with. The acceptor clamps both.
    ///
    /// If the acceptor never answers this never completes; bound it with
    /// `tokio::time::timeout` or [`Connection::close`].
    ///
    /// [`USE_SERVER_BUFFER_SIZE`]: crate::types::USE_SERVER_BUFFER_SIZE
    pub async fn connect(
        &self,
        address: UnicastAddress,
        client_to_server: usize,
        server_to_client: usize,
    ) -> TransportResult<()> {
        let _slot = self.inner.connect_slot.try_acquire()?;
        let generation = self.inner.begin_connecting()?;
        let mut attempt = ConnectAttempt {
            inner: &self.inner,
            generation,
            finished: false,
        };

        let closed = self.inner.closed.notified();
        let link = tokio::select! {
            result = handshake::connect(&self.inner.config, address, client_to_server, server_to_client) => result?,
            _ = closed => {
                return Err(TransportError::Canceled {
                    operation: self.inner.connect_slot.operation(),
                })
            }
        };

        let sizes = link.sizes();
        self.inner.establish(generation, link)?;
        attempt.finished = true;

        tracing::info!(address = %address, sizes = %sizes, "Connected");
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.session).machine.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Ok if the connection can carry traffic: connected, not broken and the
    /// peer still there.
    pub fn check_is_open(&self) -> TransportResult<()> {
        let active = self.inner.active()?;
        match active.peer {
            Some(kind) => Err(TransportError::Disconnected(kind)),
            None => Ok(()),
        }
    }

    /// True while the driver task still holds the connection, e.g. because
    /// a notification handler is executing.
    pub fn is_in_use(&self) -> bool {
        Arc::strong_count(&self.inner) > 1
    }

    /// How the peer went away, once the driver has noticed.
    pub fn peer_disconnected(&self) -> Option<DisconnectKind> {
        lock(&self.inner.session).peer
    }

    pub fn buffer_sizes(&self) -> TransportResult<BufferSizes> {
        Ok(self.inner.active()?.link.sizes())
    }

    /// Largest payload a single message can carry in the sending direction.
    pub fn max_message_size(&self, with_handle: bool) -> TransportResult<usize> {
        let format = if with_handle {
            MessageFormat::HandleExchange
        } else {
            MessageFormat::Data
        };
        Ok(self.inner.active()?.link.max_payload(format))
    }

    /// Send one message without waiting. Never sends partially.
    pub fn send_sync(&self, payload: &[u8], handle: Option<&MemoryHandle>) -> TransportResult<()> {
        let active = self.inner.active()?;
        if let Some(kind) = active.peer {
            return Err(TransportError::Disconnected(kind));
        }
        self.inner.check(active.link.send(payload, handle))
    }

    /// Send one message, waiting for room if the ring is full.
    pub async fn send(
        &self,
        payload: &[u8],
        handle: Option<&MemoryHandle>,
    ) -> TransportResult<SendOutcome> {
        let operation = self.inner.send_slot.operation();
        let _slot = self.inner.send_slot.try_acquire()?;
        let generation = self.inner.active()?.generation;
        let mut outcome = SendOutcome::Immediate;

        loop {
            let closed = self.inner.closed.notified();
            let active = self.inner.resume(generation, operation)?;
            if let Some(kind) = active.peer {
                return Err(TransportError::Disconnected(kind));
            }

            match self.inner.check(active.link.send(payload, handle)) {
                Ok(()) => return Ok(outcome),
                Err(TransportError::WouldBlock) => {}
                Err(err) => return Err(err),
            }

            outcome = SendOutcome::Deferred;
            let format = if handle.is_some() {
                MessageFormat::HandleExchange
            } else {
                MessageFormat::Data
            };
            if active.link.arm_writer(format.overhead() + payload.len()) {
                continue;
            }

            tokio::select! {
                _ = self.inner.writable.notified() => {}
                _ = closed => {}
            }
        }
    }

    /// Receive one message without waiting. Any attached handle is dropped.
    ///
    /// If `buffer` is too small the prefix that fits is copied, the message
    /// is consumed and `Truncated` is returned.
    pub fn receive_sync(&self, buffer: &mut [u8]) -> TransportResult<usize> {
        self.receive_sync_with_handle(buffer).map(|message| message.len)
    }

    /// Receive one message and its handle without waiting.
    pub fn receive_sync_with_handle(&self, buffer: &mut [u8]) -> TransportResult<ReceivedMessage> {
        let active = self.inner.active()?;
        match self.inner.check(active.link.receive(buffer)) {
            Err(TransportError::WouldBlock) => match active.peer {
                Some(kind) => Err(TransportError::Disconnected(kind)),
                None => Err(TransportError::WouldBlock),
            },
            result => result,
        }
    }

    /// Wait for and receive one message. Any attached handle is dropped.
    pub async fn receive(&self, buffer: &mut [u8]) -> TransportResult<usize> {
        self.receive_with_handle(buffer)
            .await
            .map(|message| message.len)
    }

    /// Wait for and receive one message together with its handle.
    pub async fn receive_with_handle(&self, buffer: &mut [u8]) -> TransportResult<ReceivedMessage> {
        let _slot = self.inner.receive_slot.try_acquire()?;
        self.wait_inbound(|link| link.receive(&mut *buffer)).await
    }

    /// Wait for one message and deliver it piecewise into `sink`.
    ///
    /// Returns the full message size. Handles are dropped.
    pub async fn receive_chunked<S: ChunkSink + ?Sized>(&self, sink: &mut S) -> TransportResult<usize> {
        let _slot = self.inner.receive_slot.try_acquire()?;
        self.wait_inbound(|link| link.receive_chunked(&mut *sink))
            .await
    }

    async fn wait_inbound<T>(
        &self,
        mut attempt: impl FnMut(&Link) -> TransportResult<T>,
    ) -> TransportResult<T> {
        let operation = self.inner.receive_slot.operation();
        let generation = self.inner.active()?.generation;

        loop {
            let closed = self.inner.closed.notified();
            let active = self.inner.resume(generation, operation)?;

            match self.inner.check(attempt(&active.link)) {
                Err(TransportError::WouldBlock) => {}
                result => return result,
            }

            // Everything the peer sent before leaving has been read.
            if let Some(kind) = active.peer {
                return Err(TransportError::Disconnected(kind));
            }
            if active.link.arm_reader() {
                continue;
            }

            tokio::select! {
                _ = self.inner.readable.notified() => {}
                _ = closed => {}
            }
        }
    }

    /// Size and handle flag of the next message, if any.
    pub fn pending_message(&self) -> TransportResult<Option<MessageInfo>> {
        let active = self.inner.active()?;
        match self.inner.check(active.link.pending_message())? {
            Some(info) => Ok(Some(info)),
            None => match active.peer {
                Some(kind) => Err(TransportError::Disconnected(kind)),
                None => Ok(None),
            },
        }
    }

    /// Send a notification byte (0..=249) to the peer.
    pub fn send_notification(&self, value: u8) -> TransportResult<()> {
        let active = self.inner.active()?;
        if let Some(kind) = active.peer {
            return Err(TransportError::Disconnected(kind));
        }
        active.link.side().send_notification(value)?;
        active.link.stats().record_notification_sent();
        Ok(())
    }

    /// Install the handler notifications from the peer are delivered to.
    ///
    /// Handlers run on the driver task, one call at a time, in send order.
    /// Notifications arriving while no handler is installed are dropped.
    pub fn register_notification_handler<F>(&self, handler: F) -> TransportResult<()>
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        let mut slot = lock(&self.inner.handler);
        if slot.is_some() {
            return Err(TransportError::Api {
                reason: "A notification handler is already registered".to_string(),
            });
        }
        *slot = Some(Arc::new(handler));
        Ok(())
    }

    pub fn unregister_notification_handler(&self) -> TransportResult<()> {
        match lock(&self.inner.handler).take() {
            Some(_) => Ok(()),
            None => Err(TransportError::Api {
                reason: "No notification handler is registered".to_string(),
            }),
        }
    }

    /// Credentials of the process on the other end.
    pub fn peer_identity(&self) -> TransportResult<PeerIdentity> {
        self.inner.active()?.link.side().peer_identity()
    }

    pub fn stats(&self) -> TransportResult<TransportStats> {
        Ok(self.inner.active()?.link.stats().snapshot())
    }

    /// Close the connection. Idempotent.
    ///
    /// Pending operations complete with `Canceled`. The peer observes an
    /// orderly disconnect.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let session = lock(&self.inner.session);
        f.debug_struct("Connection")
            .field("state", &session.machine.state())
            .field("sizes", &session.link.as_ref().map(|link| link.sizes()))
            .field("peer", &session.peer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::fs::FileExt;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::testing::link_pair;
    use super::*;
    use crate::error::{CorruptionError, ErrorKind};
    use crate::frame::CommonHeader;

    const WAIT: Duration = Duration::from_secs(5);

    fn established(link: Link) -> Connection {
        Connection::from_established(TransportConfig::default(), link).unwrap()
    }

    fn connected_pair(c2s: usize, s2c: usize) -> (Connection, Connection) {
        let (client, server) = link_pair(c2s, s2c);
        (established(client), established(server))
    }

    async fn wait_for_disconnect(connection: &Connection) -> DisconnectKind {
        tokio::time::timeout(WAIT, async {
            loop {
                if let Some(kind) = connection.peer_disconnected() {
                    return kind;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("peer disconnect not observed")
    }

    #[tokio::test]
    async fn test_unconnected_operations() {
        let connection = Connection::default();
        assert_eq!(connection.state(), ConnectionState::Closed);

        let mut buf = [0u8; 8];
        assert_eq!(
            connection.send_sync(b"x", None).unwrap_err().kind(),
            ErrorKind::Uninitialized
        );
        assert_eq!(
            connection.receive_sync(&mut buf).unwrap_err().kind(),
            ErrorKind::Uninitialized
        );
        assert_eq!(
            connection.receive(&mut buf).await.unwrap_err().kind(),
            ErrorKind::Uninitialized
        );
        assert!(connection.check_is_open().is_err());

        // Closing something that never opened is fine.
        connection.close();
        connection.close();
    }

    #[tokio::test]
    async fn test_sync_round_trip() {
        let (client, server) = connected_pair(4096, 4096);
        assert!(client.is_open());

        client.send_sync(b"one", None).unwrap();
        client.send_sync(b"two", None).unwrap();

        let mut buf = [0u8; 8];
        let n = server.receive_sync(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"one");
        let n = server.receive_sync(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"two");
        assert_eq!(
            server.receive_sync(&mut buf).unwrap_err().kind(),
            ErrorKind::WouldBlock
        );

        let stats = client.stats().unwrap();
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.bytes_sent, 6);
    }

    #[tokio::test]
    async fn test_async_receive_waits_for_data() {
        let (client, server) = connected_pair(4096, 4096);
        let mut buf = [0u8; 16];

        let (received, sent) = tokio::join!(
            tokio::time::timeout(WAIT, server.receive(&mut buf)),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                client.send_sync(b"late", None)
            }
        );
        sent.unwrap();
        assert_eq!(received.unwrap().unwrap(), 4);
        assert_eq!(&buf[..4], b"late");
    }

    #[tokio::test]
    async fn test_async_send_deferred_until_room() {
        let (client, server) = connected_pair(4096, 4096);
        let max = client.max_message_size(false).unwrap();
        client.send_sync(&vec![1u8; max], None).unwrap();
        assert_eq!(
            client.send_sync(b"more", None).unwrap_err().kind(),
            ErrorKind::WouldBlock
        );

        let mut buf = vec![0u8; max];
        let (outcome, drained) = tokio::join!(
            tokio::time::timeout(WAIT, client.send(b"more", None)),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                server.receive_sync(&mut buf)
            }
        );
        assert_eq!(drained.unwrap(), max);
        assert_eq!(outcome.unwrap().unwrap(), SendOutcome::Deferred);

        let n = server.receive_sync(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"more");
    }

    #[tokio::test]
    async fn test_immediate_send() {
        let (client, _server) = connected_pair(4096, 4096);
        assert_eq!(
            client.send(b"fits", None).await.unwrap(),
            SendOutcome::Immediate
        );
    }

    #[tokio::test]
    async fn test_second_receive_is_busy() {
        let (_client, server) = connected_pair(4096, 4096);
        let mut first_buf = [0u8; 8];
        let mut second_buf = [0u8; 8];

        let first = server.receive(&mut first_buf);
        tokio::pin!(first);
        assert!(tokio::time::timeout(Duration::from_millis(20), &mut first)
            .await
            .is_err());

        let err = server.receive(&mut second_buf).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);

        let mut sink = Vec::new();
        let err = server.receive_chunked(&mut sink).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
    }

    #[tokio::test]
    async fn test_close_cancels_pending_receive() {
        let (_client, server) = connected_pair(4096, 4096);
        let mut buf = [0u8; 8];

        let (result, ()) = tokio::join!(
            tokio::time::timeout(WAIT, server.receive(&mut buf)),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                server.close();
            }
        );
        assert_eq!(result.unwrap().unwrap_err().kind(), ErrorKind::Canceled);
        assert_eq!(server.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_orderly_disconnect_after_buffered_data() {
        let (client, server) = connected_pair(4096, 4096);
        client.send_sync(b"last words", None).unwrap();
        client.close();

        assert_eq!(wait_for_disconnect(&server).await, DisconnectKind::Orderly);

        let mut buf = [0u8; 16];
        let n = server.receive_sync(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"last words");
        assert_eq!(
            server.receive_sync(&mut buf).unwrap_err().kind(),
            ErrorKind::Disconnected(DisconnectKind::Orderly)
        );
        assert_eq!(
            server.send_sync(b"reply", None).unwrap_err().kind(),
            ErrorKind::Disconnected(DisconnectKind::Orderly)
        );
        assert!(matches!(
            server.pending_message(),
            Err(TransportError::Disconnected(DisconnectKind::Orderly))
        ));
    }

    #[tokio::test]
    async fn test_abnormal_disconnect() {
        let (client_link, server_link) = link_pair(4096, 4096);
        let client = established(client_link);

        // The peer vanishes without a goodbye.
        drop(server_link);

        assert_eq!(wait_for_disconnect(&client).await, DisconnectKind::Abnormal);
        let mut buf = [0u8; 8];
        let err = tokio::time::timeout(WAIT, client.receive(&mut buf))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Disconnected(DisconnectKind::Abnormal));
    }

    #[tokio::test]
    async fn test_corruption_breaks_connection() {
        let (client_link, server_link) = link_pair(4096, 4096);
        let client = established(client_link);

        let mut header = CommonHeader::new(MessageFormat::Data, 3, 1).serialize();
        header[1] ^= 0x10;
        server_link.inject_raw(&[&header, b"bad"]);

        let mut buf = [0u8; 8];
        let err = client.receive_sync(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            TransportError::Protocol(ProtocolError::Corruption(
                CorruptionError::FormatCheckMismatch { .. }
            ))
        ));

        // Sticky until close.
        assert_eq!(
            client.send_sync(b"x", None).unwrap_err().kind(),
            ErrorKind::Protocol
        );
        assert_eq!(client.check_is_open().unwrap_err().kind(), ErrorKind::Protocol);
        client.close();
        assert_eq!(
            client.send_sync(b"x", None).unwrap_err().kind(),
            ErrorKind::Uninitialized
        );
    }

    #[tokio::test]
    async fn test_notifications_reach_handler_in_order() {
        let (client, server) = connected_pair(4096, 4096);
        let (tx, mut rx) = mpsc::unbounded_channel();
        server
            .register_notification_handler(move |value| {
                let _ = tx.send(value);
            })
            .unwrap();

        for value in [3u8, 1, 249, 0] {
            client.send_notification(value).unwrap();
        }

        let mut received = Vec::new();
        while received.len() < 4 {
            let value = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            received.push(value);
        }
        assert_eq!(received, vec![3, 1, 249, 0]);
        assert_eq!(client.stats().unwrap().notifications_sent, 4);
    }

    #[tokio::test]
    async fn test_notification_without_handler_is_dropped() {
        let (client, server) = connected_pair(4096, 4096);
        client.send_notification(7).unwrap();

        // The driver counts each notification before handing it on.
        tokio::time::timeout(WAIT, async {
            while server.stats().unwrap().notifications_received < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        server
            .register_notification_handler(move |value| {
                let _ = tx.send(value);
            })
            .unwrap();
        client.send_notification(9).unwrap();

        let value = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(value, 9);
        assert!(rx.try_recv().is_err());
        assert_eq!(server.stats().unwrap().notifications_received, 2);
    }

    #[tokio::test]
    async fn test_notification_handler_registration() {
        let (client, server) = connected_pair(4096, 4096);
        server.register_notification_handler(|_| {}).unwrap();
        let err = server.register_notification_handler(|_| {}).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Api);

        server.unregister_notification_handler().unwrap();
        assert_eq!(
            server.unregister_notification_handler().unwrap_err().kind(),
            ErrorKind::Api
        );

        for value in 250..=255u8 {
            assert_eq!(
                client.send_notification(value).unwrap_err().kind(),
                ErrorKind::Api
            );
        }
    }

    #[tokio::test]
    async fn test_async_receive_with_handle() {
        let (client, server) = connected_pair(4096, 4096);

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"payload behind the fd").unwrap();
        let handle = MemoryHandle::from(file);
        client.send_sync(b"see attached", Some(&handle)).unwrap();

        let mut buf = [0u8; 32];
        let message = tokio::time::timeout(WAIT, server.receive_with_handle(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..message.len], b"see attached");

        let mut contents = [0u8; 7];
        message
            .handle
            .expect("handle lost")
            .into_file()
            .read_exact_at(&mut contents, 0)
            .unwrap();
        assert_eq!(&contents, b"payload");
        assert_eq!(server.stats().unwrap().handles_received, 1);
    }

    #[tokio::test]
    async fn test_receive_chunked_into_vec() {
        let (client, server) = connected_pair(4096, 4096);
        client.send_sync(&[7u8; 300], None).unwrap();

        let mut sink = Vec::new();
        let size = tokio::time::timeout(WAIT, server.receive_chunked(&mut sink))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(size, 300);
        assert_eq!(sink, vec![7u8; 300]);
    }

    #[tokio::test]
    async fn test_pending_message_and_sizes() {
        let (client, server) = connected_pair(8192, 4096);
        assert_eq!(
            client.buffer_sizes().unwrap(),
            BufferSizes {
                client_to_server: 8192,
                server_to_client: 4096
            }
        );
        assert_eq!(client.max_message_size(false).unwrap(), 8192 - 12);
        assert_eq!(client.max_message_size(true).unwrap(), 8192 - 20);
        assert_eq!(server.max_message_size(false).unwrap(), 4096 - 12);

        assert_eq!(server.pending_message().unwrap(), None);
        client.send_sync(&[0u8; 10], None).unwrap();
        assert_eq!(
            server.pending_message().unwrap(),
            Some(MessageInfo {
                size: 10,
                has_handle: false
            })
        );
    }

    #[tokio::test]
    async fn test_not_in_use_after_close() {
        let (client, _server) = connected_pair(4096, 4096);
        assert!(client.is_in_use());

        client.close();
        tokio::time::timeout(WAIT, async {
            while client.is_in_use() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("driver still holds the connection");
    }
}
