//! Per-socket connection state machine
//!
//! A [`Connection`] moves through `Connecting -> Validating -> Ready ->
//! Closed`. Once a socket is attached, one driver task runs the handshake and
//! then the read pump; a second task runs the write pump. Both live on the
//! owner's execution context and both stop as soon as the connection is
//! closed.
//!
//! ## Pumps
//! - **Read pump**: header, then body if `size > 0`, then hand the message to
//!   the shared inbound queue and re-arm. Any error closes the connection.
//! - **Write pump**: drains the outbound queue one frame at a time, header
//!   then body. A frame that fails to write goes back to the front of the
//!   queue. Any error closes the connection.
//!
//! There are no timeouts and no retries: a stalled peer holds its connection
//! until the socket errors or the owner disconnects it.

use crate::error::{Result, TransportError};
use crate::handshake::{Handshake, HANDSHAKE_LEN};
use crate::message::{Message, MessageHeader, MessageTag, OwnedMessage};
use crate::queue::TsQueue;
use crate::server::ServerHandler;
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch, Notify};
use tracing::{debug, info, warn};

/// Which side of the handshake a connection plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Server,
    Client,
}

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket accepted or connect in flight
    Connecting,
    /// Handshake in progress
    Validating,
    /// Pumps running
    Ready,
    /// Terminal; no further I/O
    Closed,
}

/// One live TCP socket and its pumps
pub struct Connection<T: MessageTag> {
    owner: Owner,
    id: AtomicU32,
    handle: Handle,
    nodelay: bool,
    peer_addr: OnceLock<SocketAddr>,
    state: Mutex<ConnectionState>,
    handshake: Mutex<Handshake>,
    /// Accepted socket waiting for `connect_to_client`
    parked: Mutex<Option<TcpStream>>,
    outgoing: TsQueue<Message<T>>,
    incoming: Arc<TsQueue<OwnedMessage<T>>>,
    write_ready: Notify,
    closed_tx: watch::Sender<bool>,
}

impl<T: MessageTag> Connection<T> {
    fn new(
        owner: Owner,
        handle: Handle,
        incoming: Arc<TsQueue<OwnedMessage<T>>>,
        nodelay: bool,
    ) -> Self {
        let handshake = match owner {
            Owner::Server => Handshake::challenge(),
            Owner::Client => Handshake::default(),
        };
        let (closed_tx, _) = watch::channel(false);

        Self {
            owner,
            id: AtomicU32::new(0),
            handle,
            nodelay,
            peer_addr: OnceLock::new(),
            state: Mutex::new(ConnectionState::Connecting),
            handshake: Mutex::new(handshake),
            parked: Mutex::new(None),
            outgoing: TsQueue::new(),
            incoming,
            write_ready: Notify::new(),
            closed_tx,
        }
    }

    /// Server-owned connection around an accepted socket
    pub(crate) fn accepted(
        handle: Handle,
        stream: TcpStream,
        incoming: Arc<TsQueue<OwnedMessage<T>>>,
        nodelay: bool,
    ) -> Self {
        let conn = Self::new(Owner::Server, handle, incoming, nodelay);
        if let Ok(addr) = stream.peer_addr() {
            let _ = conn.peer_addr.set(addr);
        }
        *conn.parked.lock() = Some(stream);
        conn
    }

    /// Client-owned connection; the socket arrives with `connect_to_server`
    pub(crate) fn outbound(
        handle: Handle,
        incoming: Arc<TsQueue<OwnedMessage<T>>>,
        nodelay: bool,
    ) -> Self {
        Self::new(Owner::Client, handle, incoming, nodelay)
    }

    /// Server-assigned identity, `0` until assigned
    pub fn id(&self) -> u32 {
        self.id.load(Ordering::Acquire)
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr.get().copied()
    }

    /// Handshake values exchanged so far
    pub fn handshake(&self) -> Handshake {
        *self.handshake.lock()
    }

    /// True until the connection reaches `Closed`
    pub fn is_connected(&self) -> bool {
        self.state() != ConnectionState::Closed
    }

    /// Queue a message for the write pump.
    ///
    /// The push happens on the execution context, never on the caller's
    /// thread. Messages sent before the handshake completes are written once
    /// it has.
    pub fn send(self: &Arc<Self>, msg: Message<T>) {
        if !self.is_connected() {
            debug!(id = self.id(), "Dropping message for closed connection");
            return;
        }

        let conn = Arc::clone(self);
        self.handle.spawn(async move {
            let idle = conn.outgoing.is_empty();
            conn.outgoing.push_back(msg);
            if idle {
                conn.write_ready.notify_one();
            }
        });
    }

    /// Close the connection; both pumps stop and the socket is dropped
    pub fn disconnect(&self) {
        self.close("disconnect requested");
    }

    /// Start the server side of the handshake on the parked socket
    pub(crate) fn connect_to_client(self: &Arc<Self>, id: u32, hooks: Arc<dyn ServerHandler<T>>) {
        if self.owner != Owner::Server {
            return;
        }

        let Some(stream) = self.parked.lock().take() else {
            warn!(id, "No socket to start handshake on");
            return;
        };

        self.id.store(id, Ordering::Release);
        let conn = Arc::clone(self);
        self.handle.spawn(async move {
            conn.run(stream, Some(hooks)).await;
        });
    }

    /// Connect to the first reachable address, then run the client side of
    /// the handshake. The connect outcome is reported on the returned channel.
    pub(crate) fn connect_to_server(
        self: &Arc<Self>,
        addrs: Vec<SocketAddr>,
    ) -> oneshot::Receiver<Result<()>> {
        let (result_tx, result_rx) = oneshot::channel();
        let conn = Arc::clone(self);

        self.handle.spawn(async move {
            match TcpStream::connect(&addrs[..]).await {
                Ok(stream) => {
                    if let Ok(addr) = stream.peer_addr() {
                        let _ = conn.peer_addr.set(addr);
                    }
                    info!(peer = ?conn.peer_addr(), "Connected to server");
                    let _ = result_tx.send(Ok(()));
                    conn.run(stream, None).await;
                }
                Err(e) => {
                    conn.close("connect failed");
                    let _ = result_tx.send(Err(TransportError::connection_with_source(
                        "Failed to connect to server",
                        addrs.first().copied(),
                        e,
                    )));
                }
            }
        });

        result_rx
    }

    /// Driver task: handshake, then pumps
    async fn run(self: Arc<Self>, stream: TcpStream, hooks: Option<Arc<dyn ServerHandler<T>>>) {
        if self.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY: {}", e);
            }
        }

        let mut closed = self.closed_tx.subscribe();
        let (mut reader, mut writer) = stream.into_split();

        if !self.transition(ConnectionState::Validating) {
            return;
        }

        let validated = tokio::select! {
            res = self.exchange_handshake(&mut reader, &mut writer) => res,
            _ = closed.wait_for(|c| *c) => return,
        };

        match validated {
            Ok(true) => {}
            Ok(false) => {
                warn!(id = self.id(), peer = ?self.peer_addr(), "Client failed validation");
                self.close("handshake mismatch");
                return;
            }
            Err(e) => {
                warn!(id = self.id(), error = %e, "Handshake failed");
                self.close("handshake I/O error");
                return;
            }
        }

        if !self.transition(ConnectionState::Ready) {
            return;
        }

        if let Some(hooks) = hooks {
            info!(id = self.id(), peer = ?self.peer_addr(), "Client validated");
            hooks.on_client_validated(&self);
        }

        let write_conn = Arc::clone(&self);
        let write_closed = self.closed_tx.subscribe();
        self.handle.spawn(async move {
            write_conn.write_pump(writer, write_closed).await;
        });

        self.read_pump(reader, closed).await;
    }

    async fn exchange_handshake(
        &self,
        reader: &mut OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
    ) -> Result<bool> {
        match self.owner {
            Owner::Server => {
                let out = self.handshake.lock().out;
                writer
                    .write_all(&out.to_ne_bytes())
                    .await
                    .map_err(|e| TransportError::io("Failed to write handshake challenge", e))?;
                let reply = read_handshake_value(reader).await?;
                Ok(self.handshake.lock().verify(reply))
            }
            Owner::Client => {
                let challenge = read_handshake_value(reader).await?;
                let answer = self.handshake.lock().answer(challenge);
                writer
                    .write_all(&answer.to_ne_bytes())
                    .await
                    .map_err(|e| TransportError::io("Failed to write handshake reply", e))?;
                Ok(true)
            }
        }
    }

    async fn read_pump(self: &Arc<Self>, mut reader: OwnedReadHalf, mut closed: watch::Receiver<bool>) {
        let mut header_buf = vec![0u8; MessageHeader::<T>::LEN];

        loop {
            let frame = tokio::select! {
                res = read_frame::<T>(&mut reader, &mut header_buf) => res,
                _ = closed.wait_for(|c| *c) => break,
            };

            match frame {
                Ok(msg) => {
                    debug!(id = self.id(), msg = %msg, "Received frame");
                    let remote = match self.owner {
                        Owner::Server => Some(Arc::clone(self)),
                        Owner::Client => None,
                    };
                    self.incoming.push_back(OwnedMessage { remote, msg });
                }
                Err(e) => {
                    warn!(id = self.id(), error = %e, "Read failed");
                    self.close("read error");
                    break;
                }
            }
        }
    }

    async fn write_pump(self: Arc<Self>, mut writer: OwnedWriteHalf, mut closed: watch::Receiver<bool>) {
        loop {
            // Sole consumer: take the frame, put it back if it could not be written.
            let msg = match self.outgoing.pop_front() {
                Some(msg) => msg,
                None => {
                    tokio::select! {
                        _ = self.write_ready.notified() => {}
                        _ = closed.wait_for(|c| *c) => break,
                    }
                    continue;
                }
            };

            let written = tokio::select! {
                res = write_frame(&mut writer, &msg) => res,
                _ = closed.wait_for(|c| *c) => Err(TransportError::connection("Closed during write", self.peer_addr())),
            };

            match written {
                Ok(()) => {
                    debug!(id = self.id(), msg = %msg, "Sent frame");
                }
                Err(e) => {
                    self.outgoing.push_front(msg);
                    if self.is_connected() {
                        warn!(id = self.id(), error = %e, "Write failed");
                        self.close("write error");
                    }
                    break;
                }
            }
        }

        let _ = writer.shutdown().await;
    }

    /// Move forward unless already closed
    fn transition(&self, next: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if *state == ConnectionState::Closed {
            return false;
        }
        debug!(id = self.id(), from = ?*state, to = ?next, "Connection state change");
        *state = next;
        true
    }

    fn close(&self, reason: &str) {
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }

        self.parked.lock().take();
        self.closed_tx.send_replace(true);
        info!(id = self.id(), peer = ?self.peer_addr(), reason, "Connection closed");
    }
}

async fn read_handshake_value(reader: &mut OwnedReadHalf) -> Result<u64> {
    let mut buf = [0u8; HANDSHAKE_LEN];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| TransportError::io("Failed to read handshake value", e))?;
    Ok(u64::from_ne_bytes(buf))
}

async fn read_frame<T: MessageTag>(
    reader: &mut OwnedReadHalf,
    header_buf: &mut [u8],
) -> Result<Message<T>> {
    reader
        .read_exact(header_buf)
        .await
        .map_err(|e| TransportError::io("Failed to read header", e))?;
    let header = MessageHeader::<T>::decode(header_buf)?;

    let mut body = vec![0u8; header.size as usize];
    if !body.is_empty() {
        reader
            .read_exact(&mut body)
            .await
            .map_err(|e| TransportError::io("Failed to read body", e))?;
    }

    Ok(Message::from_parts(header.id, body))
}

async fn write_frame<T: MessageTag>(writer: &mut OwnedWriteHalf, msg: &Message<T>) -> Result<()> {
    writer
        .write_all(&msg.header().encode())
        .await
        .map_err(|e| TransportError::io("Failed to write header", e))?;

    if !msg.is_empty() {
        writer
            .write_all(msg.body())
            .await
            .map_err(|e| TransportError::io("Failed to write body", e))?;
    }

    writer
        .flush()
        .await
        .map_err(|e| TransportError::io("Failed to flush", e))
}

impl<T: MessageTag> fmt::Display for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer_addr() {
            Some(addr) => write!(f, "[{}] {}", self.id(), addr),
            None => write!(f, "[{}] <unconnected>", self.id()),
        }
    }
}

impl<T: MessageTag> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("owner", &self.owner)
            .field("id", &self.id())
            .field("state", &self.state())
            .field("peer_addr", &self.peer_addr())
            .field("outgoing", &self.outgoing.count())
            .finish()
    }
}
