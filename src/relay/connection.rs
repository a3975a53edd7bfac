//! One accepted client socket.
//!
//! A connection moves through `Open -> Closing -> Closed` exactly once. The first caller
//! of [`Connection::close`] (remote EOF, read failure, kick, quit or shutdown) performs the
//! teardown and fires the close hook; everyone else returns immediately.
//!
//! Outbound lines go through a bounded queue drained by a [`WriteLoop`], so a peer that
//! stops reading never blocks the task that sends to it.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use encoding_rs::Encoding;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::codec;
use super::identity::ConnectionId;

/// Consecutive read failures tolerated before the connection is closed.
pub const MAX_READ_ERRORS: u32 = 10;

/// Longest inbound line accepted, line break excluded.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Outbound messages queued for a peer before it is dropped as too slow.
pub const OUTBOUND_CAPACITY: usize = 256;

/// Time a single outbound message may take to reach the peer's socket.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Called once, with the connection's identity, when the connection closes.
pub type CloseHook = Box<dyn FnOnce(ConnectionId) + Send>;

/// Read half handed to [`Connection::receive_loop`].
pub type LineReader = BufReader<OwnedReadHalf>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

/// Receives every inbound line of a connection.
#[async_trait]
pub trait LineHandler: Send + Sync {
    async fn handle_line(&self, connection: &Arc<Connection>, line: String);
}

pub struct Connection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    encoding: &'static Encoding,
    state: Mutex<ConnectionState>,
    outbound: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    on_close: Mutex<Option<CloseHook>>,
    /// Stops the receive loop.
    cancel: CancellationToken,
}

impl Connection {
    /// Wrap an accepted stream.
    ///
    /// The returned reader must be passed to [`Connection::receive_loop`] and the
    /// [`WriteLoop`] run on its own task. Cancelling `halt` aborts both without
    /// draining queued messages.
    pub fn new(
        id: ConnectionId,
        remote_addr: SocketAddr,
        stream: TcpStream,
        encoding: &'static Encoding,
        halt: CancellationToken,
        on_close: CloseHook,
    ) -> (Arc<Self>, LineReader, WriteLoop) {
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let cancel = halt.child_token();

        let connection = Arc::new(Self {
            id,
            remote_addr,
            encoding,
            state: Mutex::new(ConnectionState::Open),
            outbound: Mutex::new(Some(tx)),
            on_close: Mutex::new(Some(on_close)),
            cancel: cancel.clone(),
        });

        let write_loop = WriteLoop {
            id,
            peer: remote_addr,
            rx,
            writer,
            halt,
            read_cancel: cancel,
        };

        (connection, BufReader::new(reader), write_loop)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_outbound(&self) -> MutexGuard<'_, Option<mpsc::Sender<Vec<u8>>>> {
        self.outbound.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> ConnectionState {
        *self.lock_state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Queue `message` followed by a line break. Never waits on the peer.
    ///
    /// Dropped silently once the connection is closing. A multi-line message is queued
    /// as one unit, so it is never interleaved with other writes. A peer whose queue is
    /// full is closed.
    pub fn send(&self, message: &str) {
        if !self.is_open() {
            return;
        }

        let line = codec::encode_line(self.encoding, message);
        let queued = match self.lock_outbound().as_ref() {
            Some(tx) => tx.try_send(line),
            None => return,
        };

        match queued {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(
                    conn = %self.id,
                    peer = %self.remote_addr,
                    "Outbound queue full, dropping slow reader"
                );
                self.close();
            }
            Err(TrySendError::Closed(_)) => {
                debug!(conn = %self.id, "Writer already stopped");
            }
        }
    }

    /// Close the connection. Returns `true` only for the call that performed the teardown.
    ///
    /// Messages queued before the close are still written; the socket is shut down once
    /// they are.
    pub fn close(&self) -> bool {
        {
            let mut state = self.lock_state();
            if *state != ConnectionState::Open {
                return false;
            }
            *state = ConnectionState::Closing;
        }

        info!(conn = %self.id, peer = %self.remote_addr, "Connection closing");

        self.cancel.cancel();
        drop(self.lock_outbound().take());

        let hook = self
            .on_close
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(hook) = hook {
            hook(self.id);
        }

        *self.lock_state() = ConnectionState::Closed;
        info!(conn = %self.id, peer = %self.remote_addr, "Connection closed");
        true
    }

    /// Read lines and hand them to `handler` until EOF, a disconnect, an oversized line,
    /// too many consecutive read errors, or a local close. Always ends with the
    /// connection closed.
    pub async fn receive_loop(
        self: Arc<Self>,
        mut reader: LineReader,
        handler: Arc<dyn LineHandler>,
    ) {
        let mut buf = Vec::new();
        let mut errors = 0u32;

        loop {
            buf.clear();

            let mut limited = (&mut reader).take(MAX_LINE_BYTES as u64 + 1);
            let read = tokio::select! {
                _ = self.cancel.cancelled() => break,
                read = limited.read_until(b'\n', &mut buf) => read,
            };

            match read {
                Ok(0) => {
                    debug!(conn = %self.id, peer = %self.remote_addr, "Peer closed the connection");
                    break;
                }
                Ok(_) if buf.len() > MAX_LINE_BYTES && !buf.ends_with(b"\n") => {
                    warn!(
                        conn = %self.id,
                        peer = %self.remote_addr,
                        limit = MAX_LINE_BYTES,
                        "Line too long"
                    );
                    break;
                }
                Ok(_) => {
                    errors = 0;
                    let line = codec::decode_line(self.encoding, &buf);
                    handler.handle_line(&self, line).await;
                }
                Err(e) if is_disconnect(&e) => {
                    info!(
                        conn = %self.id,
                        peer = %self.remote_addr,
                        error = %e,
                        "Client socket closed"
                    );
                    break;
                }
                Err(e) => {
                    errors += 1;
                    error!(
                        conn = %self.id,
                        peer = %self.remote_addr,
                        error = %e,
                        errors,
                        "Read failed"
                    );
                    if errors >= MAX_READ_ERRORS {
                        break;
                    }
                }
            }
        }

        self.close();
    }
}

fn is_disconnect(e: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        e.kind(),
        ConnectionReset | ConnectionAborted | BrokenPipe | NotConnected | UnexpectedEof
    )
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Drains a connection's outbound queue into its socket.
pub struct WriteLoop {
    id: ConnectionId,
    peer: SocketAddr,
    rx: mpsc::Receiver<Vec<u8>>,
    writer: OwnedWriteHalf,
    halt: CancellationToken,
    read_cancel: CancellationToken,
}

impl WriteLoop {
    /// Write queued messages until the connection closes and the queue is drained, a
    /// write fails or times out, or `halt` is cancelled. A failed write stops the
    /// receive loop too.
    pub async fn run(self) {
        let WriteLoop {
            id,
            peer,
            mut rx,
            mut writer,
            halt,
            read_cancel,
        } = self;

        loop {
            let line = tokio::select! {
                biased;
                _ = halt.cancelled() => break,
                next = rx.recv() => match next {
                    Some(line) => line,
                    None => break,
                },
            };

            let outcome = tokio::select! {
                biased;
                _ = halt.cancelled() => break,
                outcome = tokio::time::timeout(WRITE_TIMEOUT, writer.write_all(&line)) => outcome,
            };

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(conn = %id, peer = %peer, error = %e, "Write failed");
                    read_cancel.cancel();
                    break;
                }
                Err(_) => {
                    warn!(conn = %id, peer = %peer, timeout = ?WRITE_TIMEOUT, "Write timed out");
                    read_cancel.cancel();
                    break;
                }
            }
        }

        if let Err(e) = writer.shutdown().await {
            debug!(conn = %id, error = %e, "Socket shutdown failed");
        }
    }
}
