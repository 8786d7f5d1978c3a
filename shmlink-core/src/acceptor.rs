// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Listening endpoint that turns connect requests into [`Connection`]s.
//!
//! An accept loop task owns the listening socket and runs one handshake task
//! per client. Clients in the middle of a handshake and established
//! connections nobody has accepted yet both count against the backlog; when
//! it is full new clients are refused with a resource error.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::{TransportConfig, MAX_BUFFER_SIZE, MIN_BUFFER_SIZE};
use crate::connection::{Connection, Link};
use crate::error::{TransportError, TransportResult};
use crate::frame::ReplyStatus;
use crate::handshake;
use crate::state::{AcceptorState, AcceptorStateMachine};
use crate::sync::{lock, OpSlot};
use crate::types::{UnicastAddress, USE_SERVER_BUFFER_SIZE};

/// Pause after a failed `accept` so descriptor exhaustion does not spin.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// What happens to a client that stops in the middle of its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacklogEviction {
    /// The client keeps its backlog slot until the acceptor is closed.
    Never,
    /// The handshake is abandoned and the slot reclaimed after this long.
    After(Duration),
}

impl BacklogEviction {
    /// Strategy implied by `handshake_timeout`.
    pub fn from_config(config: &TransportConfig) -> Self {
        match config.handshake_timeout {
            Some(limit) => Self::After(limit),
            None => Self::Never,
        }
    }

    /// Run a handshake under this strategy. `None` means it was evicted.
    async fn bound<F>(self, handshake: F) -> Option<TransportResult<Link>>
    where
        F: Future<Output = TransportResult<Link>>,
    {
        match self {
            Self::Never => Some(handshake.await),
            Self::After(limit) => tokio::time::timeout(limit, handshake).await.ok(),
        }
    }
}

/// Backlog bookkeeping of one listening period.
#[derive(Debug, Default)]
struct Backlog {
    /// Handshakes in flight, keyed by client number.
    in_flight: DashMap<u64, Instant>,
    /// Established connections waiting for `accept`.
    ready: AtomicUsize,
}

impl Backlog {
    fn len(&self) -> usize {
        self.in_flight.len() + self.ready.load(Ordering::Acquire)
    }
}

type ReadyQueue = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Connection>>>;

struct Listening {
    machine: AcceptorStateMachine,
    eviction: BacklogEviction,
    address: Option<UnicastAddress>,
    socket_path: Option<PathBuf>,
    server_to_client: usize,
    backlog: Option<Arc<Backlog>>,
    ready: Option<ReadyQueue>,
    accept_loop: Option<JoinHandle<()>>,
}

struct AcceptorInner {
    config: TransportConfig,
    listening: Mutex<Listening>,
    accept_slot: OpSlot,
    closed: Notify,
}

/// Server end of the rendezvous.
pub struct Acceptor {
    inner: Arc<AcceptorInner>,
}

impl Acceptor {
    /// Acceptor whose eviction strategy follows `config.handshake_timeout`.
    pub fn new(config: TransportConfig) -> Self {
        let eviction = BacklogEviction::from_config(&config);
        Self {
            inner: Arc::new(AcceptorInner {
                config,
                listening: Mutex::new(Listening {
                    machine: AcceptorStateMachine::default(),
                    eviction,
                    address: None,
                    socket_path: None,
                    server_to_client: 0,
                    backlog: None,
                    ready: None,
                    accept_loop: None,
                }),
                accept_slot: OpSlot::new("accept"),
                closed: Notify::new(),
            }),
        }
    }

    /// Override the eviction strategy. Takes effect at the next `init`.
    pub fn with_eviction(self, eviction: BacklogEviction) -> Self {
        lock(&self.inner.listening).eviction = eviction;
        self
    }

    /// Start listening on `address`.
    ///
    /// `server_to_client` is the capacity granted to (and the cap for) the
    /// server-to-client ring of every connection; [`USE_SERVER_BUFFER_SIZE`]
    /// selects the configured default. Must be called inside a tokio runtime.
    pub fn init(&self, address: UnicastAddress, server_to_client: usize) -> TransportResult<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| TransportError::Api {
            reason: "Acceptor::init requires a tokio runtime".to_string(),
        })?;
        let config = &self.inner.config;
        config.validate()?;

        let mut listening = lock(&self.inner.listening);
        if listening.machine.state() == AcceptorState::Listening {
            return Err(TransportError::AlreadyConnected);
        }

        let server_to_client = match server_to_client {
            USE_SERVER_BUFFER_SIZE => config.default_buffer_size,
            size => size.clamp(MIN_BUFFER_SIZE, MAX_BUFFER_SIZE),
        };

        std::fs::create_dir_all(&config.socket_dir)
            .map_err(|err| TransportError::from_io("creating socket directory", err))?;
        let socket_path = address.socket_path(&config.socket_dir);
        let listener = bind(address, &socket_path)?;

        listening.machine.transition_to(AcceptorState::Listening)?;

        let backlog = Arc::new(Backlog::default());
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let accept_loop = runtime.spawn(accept_loop(AcceptLoop {
            listener,
            config: config.clone(),
            eviction: listening.eviction,
            server_to_client,
            backlog: Arc::clone(&backlog),
            ready: ready_tx,
        }));

        tracing::info!(
            address = %address,
            socket = %socket_path.display(),
            server_to_client,
            eviction = ?listening.eviction,
            "Acceptor listening"
        );

        listening.address = Some(address);
        listening.socket_path = Some(socket_path);
        listening.server_to_client = server_to_client;
        listening.backlog = Some(backlog);
        listening.ready = Some(Arc::new(tokio::sync::Mutex::new(ready_rx)));
        listening.accept_loop = Some(accept_loop);
        Ok(())
    }

    /// Wait for the next fully established connection.
    pub async fn accept(&self) -> TransportResult<Connection> {
        let operation = self.inner.accept_slot.operation();
        let _slot = self.inner.accept_slot.try_acquire()?;

        let closed = self.inner.closed.notified();
        let (ready, backlog) = {
            let listening = lock(&self.inner.listening);
            match (&listening.ready, &listening.backlog) {
                (Some(ready), Some(backlog)) => (Arc::clone(ready), Arc::clone(backlog)),
                _ => return Err(TransportError::Uninitialized),
            }
        };

        let mut receiver = ready.lock().await;
        tokio::select! {
            biased;
            _ = closed => Err(TransportError::Canceled { operation }),
            connection = receiver.recv() => match connection {
                Some(connection) => {
                    backlog.ready.fetch_sub(1, Ordering::AcqRel);
                    Ok(connection)
                }
                None => Err(TransportError::Canceled { operation }),
            },
        }
    }

    /// Stop listening. Idempotent.
    ///
    /// In-flight handshakes are aborted, connections not yet accepted are
    /// closed and a pending `accept` completes with `Canceled`.
    pub fn close(&self) {
        let (socket_path, ready, address) = {
            let mut listening = lock(&self.inner.listening);
            if listening.machine.state() != AcceptorState::Listening {
                return;
            }
            if let Err(err) = listening.machine.transition_to(AcceptorState::Uninitialized) {
                tracing::warn!(error = %err, "Unexpected state while closing acceptor");
            }
            // The handle stays behind so is_in_use can watch the loop wind down.
            if let Some(accept_loop) = &listening.accept_loop {
                accept_loop.abort();
            }
            listening.backlog = None;
            (
                listening.socket_path.take(),
                listening.ready.take(),
                listening.address.take(),
            )
        };
        drop(ready);

        if let Some(path) = socket_path {
            if let Err(err) = std::fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(socket = %path.display(), error = %err, "Failed to remove socket");
                }
            }
        }

        self.inner.closed.notify_waiters();
        if let Some(address) = address {
            tracing::info!(address = %address, "Acceptor closed");
        }
    }

    /// True while the accept loop is still winding down or an `accept` is
    /// outstanding.
    pub fn is_in_use(&self) -> bool {
        let loop_alive = lock(&self.inner.listening)
            .accept_loop
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());
        loop_alive || self.inner.accept_slot.is_taken()
    }

    pub fn state(&self) -> AcceptorState {
        lock(&self.inner.listening).machine.state()
    }

    pub fn address(&self) -> Option<UnicastAddress> {
        lock(&self.inner.listening).address
    }

    /// Handshakes in flight plus established connections not yet accepted.
    pub fn backlog_len(&self) -> usize {
        lock(&self.inner.listening)
            .backlog
            .as_ref()
            .map_or(0, |backlog| backlog.len())
    }

    /// Server-to-client capacity granted to new connections, once listening.
    pub fn server_buffer_size(&self) -> Option<usize> {
        let listening = lock(&self.inner.listening);
        (listening.machine.state() == AcceptorState::Listening)
            .then_some(listening.server_to_client)
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.close();
    }
}

/// Bind the rendezvous socket, replacing a stale socket file left behind by
/// a dead process but never a live acceptor.
fn bind(address: UnicastAddress, path: &std::path::Path) -> TransportResult<UnixListener> {
    match UnixListener::bind(path) {
        Ok(listener) => return Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {}
        Err(err) => return Err(TransportError::from_address_io(address, "binding socket", err)),
    }

    match std::os::unix::net::UnixStream::connect(path) {
        Ok(_) => {
            return Err(TransportError::AddressNotAvailable {
                address,
                reason: "Another acceptor is listening on this address".to_string(),
            })
        }
        Err(err) if err.kind() == std::io::ErrorKind::ConnectionRefused => {
            tracing::debug!(socket = %path.display(), "Removing stale socket");
            std::fs::remove_file(path)
                .map_err(|err| TransportError::from_io("removing stale socket", err))?;
        }
        Err(err) => return Err(TransportError::from_address_io(address, "probing socket", err)),
    }

    UnixListener::bind(path).map_err(|err| TransportError::from_address_io(address, "binding socket", err))
}

struct AcceptLoop {
    listener: UnixListener,
    config: TransportConfig,
    eviction: BacklogEviction,
    server_to_client: usize,
    backlog: Arc<Backlog>,
    ready: mpsc::UnboundedSender<Connection>,
}

enum Handshake {
    Refused,
    Evicted { client: u64 },
    Done { client: u64, result: TransportResult<Link> },
}

async fn accept_loop(state: AcceptLoop) {
    let AcceptLoop {
        listener,
        config,
        eviction,
        server_to_client,
        backlog,
        ready,
    } = state;

    let mut handshakes = JoinSet::new();
    let mut next_client: u64 = 0;

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    if backlog.len() >= config.backlog {
                        tracing::warn!(backlog = config.backlog, "Backlog full, refusing client");
                        handshakes.spawn(refuse(stream));
                        continue;
                    }

                    let client = next_client;
                    next_client += 1;
                    backlog.in_flight.insert(client, Instant::now());

                    let config = config.clone();
                    handshakes.spawn(async move {
                        match eviction.bound(handshake::serve(stream, &config, server_to_client)).await {
                            Some(result) => Handshake::Done { client, result },
                            None => Handshake::Evicted { client },
                        }
                    });
                }
                Err(err) => {
                    tracing::warn!(error = %err, "Failed to accept client");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            },
            Some(joined) = handshakes.join_next() => {
                let outcome = match joined {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        tracing::error!(error = %err, "Handshake task failed");
                        continue;
                    }
                };
                finish_handshake(outcome, &config, &backlog, &ready);
            }
        }
    }
}

async fn refuse(stream: UnixStream) -> Handshake {
    handshake::reject(stream, ReplyStatus::BacklogFull).await;
    Handshake::Refused
}

fn finish_handshake(
    outcome: Handshake,
    config: &TransportConfig,
    backlog: &Backlog,
    ready: &mpsc::UnboundedSender<Connection>,
) {
    match outcome {
        Handshake::Refused => {}
        Handshake::Evicted { client } => {
            let waited = backlog
                .in_flight
                .remove(&client)
                .map(|(_, started)| started.elapsed());
            tracing::warn!(client, ?waited, "Evicted stalled handshake");
        }
        Handshake::Done { client, result } => {
            backlog.in_flight.remove(&client);
            let link = match result {
                Ok(link) => link,
                Err(err) => {
                    tracing::warn!(client, error = %err, "Handshake failed");
                    return;
                }
            };

            let sizes = link.sizes();
            match Connection::from_established(config.clone(), link) {
                Ok(connection) => {
                    backlog.ready.fetch_add(1, Ordering::AcqRel);
                    if ready.send(connection).is_err() {
                        backlog.ready.fetch_sub(1, Ordering::AcqRel);
                        return;
                    }
                    tracing::info!(client, sizes = %sizes, "Client connected");
                }
                Err(err) => {
                    tracing::warn!(client, error = %err, "Failed to set up connection");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> TransportConfig {
        TransportConfig::default().with_socket_dir(dir.path())
    }

    #[test]
    fn test_eviction_from_config() {
        let config = TransportConfig::default();
        assert_eq!(BacklogEviction::from_config(&config), BacklogEviction::Never);

        let config = config.with_handshake_timeout(Duration::from_millis(250));
        assert_eq!(
            BacklogEviction::from_config(&config),
            BacklogEviction::After(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_init_outside_runtime() {
        let dir = TempDir::new().unwrap();
        let acceptor = Acceptor::new(config(&dir));
        let err = acceptor.init(UnicastAddress::new(1, 1), 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Api);
    }

    #[tokio::test]
    async fn test_init_and_close() {
        let dir = TempDir::new().unwrap();
        let acceptor = Acceptor::new(config(&dir));
        let address = UnicastAddress::new(4, 2);
        assert_eq!(acceptor.state(), AcceptorState::Uninitialized);

        acceptor.init(address, 64 * 1024).unwrap();
        assert_eq!(acceptor.state(), AcceptorState::Listening);
        assert_eq!(acceptor.address(), Some(address));
        assert_eq!(acceptor.server_buffer_size(), Some(64 * 1024));
        assert!(address.socket_path(dir.path()).exists());

        assert_eq!(
            acceptor.init(address, 0).unwrap_err().kind(),
            ErrorKind::AlreadyConnected
        );

        acceptor.close();
        acceptor.close();
        assert_eq!(acceptor.state(), AcceptorState::Uninitialized);
        assert!(!address.socket_path(dir.path()).exists());
        assert_eq!(acceptor.server_buffer_size(), None);

        // Listening again after close works.
        acceptor.init(address, 0).unwrap();
    }

    #[tokio::test]
    async fn test_live_address_is_not_available() {
        let dir = TempDir::new().unwrap();
        let address = UnicastAddress::new(4, 3);
        let first = Acceptor::new(config(&dir));
        first.init(address, 0).unwrap();

        let second = Acceptor::new(config(&dir));
        let err = second.init(address, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AddressNotAvailable);
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced() {
        let dir = TempDir::new().unwrap();
        let address = UnicastAddress::new(4, 4);
        let path = address.socket_path(dir.path());
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let acceptor = Acceptor::new(config(&dir));
        acceptor.init(address, 0).unwrap();
        assert_eq!(acceptor.state(), AcceptorState::Listening);
    }

    #[tokio::test]
    async fn test_accept_requires_listening() {
        let dir = TempDir::new().unwrap();
        let acceptor = Acceptor::new(config(&dir));
        let err = acceptor.accept().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Uninitialized);
    }

    #[tokio::test]
    async fn test_server_buffer_size_clamped() {
        let dir = TempDir::new().unwrap();
        let acceptor = Acceptor::new(config(&dir));
        acceptor.init(UnicastAddress::new(4, 5), 100).unwrap();
        assert_eq!(acceptor.server_buffer_size(), Some(MIN_BUFFER_SIZE));
    }
}
