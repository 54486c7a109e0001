//! Client façade
//!
//! Owns one execution context and at most one [`Connection`] to a server.
//! Messages from the server land in [`Client::incoming`]; the application
//! drains them itself or through [`Client::update`].

use crate::connection::Connection;
use crate::context::IoContext;
use crate::error::{Result, TransportError};
use crate::message::{Message, MessageTag, OwnedMessage};
use crate::queue::TsQueue;
use crate::settings::ClientSettings;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use tracing::{debug, info};

pub struct Client<T: MessageTag> {
    context: Option<IoContext>,
    connection: Option<Arc<Connection<T>>>,
    incoming: Arc<TsQueue<OwnedMessage<T>>>,
    nodelay: bool,
}

impl<T: MessageTag> Client<T> {
    pub fn new() -> Self {
        Self {
            context: None,
            connection: None,
            incoming: Arc::new(TsQueue::new()),
            nodelay: true,
        }
    }

    /// Resolve `host`, start the execution context and connect.
    ///
    /// Returns once the TCP connect has succeeded or failed; the handshake
    /// continues in the background. An existing connection is torn down
    /// first and messages still queued from it are discarded.
    ///
    /// # Panics
    ///
    /// Blocks the calling thread until the connect resolves, so it panics
    /// when called from an async task. Inside a tokio runtime, call it from
    /// `tokio::task::spawn_blocking`.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        self.disconnect();
        self.incoming.clear();

        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| TransportError::resolve_with_source(host, port, e))?
            .collect();
        if addrs.is_empty() {
            return Err(TransportError::resolve(host, port, "no addresses"));
        }
        debug!(host, port, candidates = addrs.len(), "Resolved server address");

        let context = IoContext::start("transport-client")?;
        let connection = Arc::new(Connection::outbound(
            context.handle().clone(),
            Arc::clone(&self.incoming),
            self.nodelay,
        ));

        connection
            .connect_to_server(addrs)
            .blocking_recv()
            .map_err(|_| TransportError::runtime("Execution context stopped during connect"))??;

        info!(host, port, "[CLIENT] Connected");
        self.context = Some(context);
        self.connection = Some(connection);
        Ok(())
    }

    /// Connect using host, port and socket options from settings
    pub fn connect_with(&mut self, settings: &ClientSettings) -> Result<()> {
        self.nodelay = settings.nodelay;
        self.connect(&settings.host, settings.port)
    }

    /// Close the connection and stop the execution context. Idempotent.
    pub fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.disconnect();
        }
        if let Some(mut context) = self.context.take() {
            context.stop();
            info!("[CLIENT] Disconnected");
        }
    }

    /// True while a connection exists and has not closed
    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().is_some_and(|c| c.is_connected())
    }

    /// Queue a message for the server; dropped when not connected
    pub fn send(&self, msg: Message<T>) {
        if let Some(connection) = self.connection.as_ref() {
            connection.send(msg);
        }
    }

    /// Messages received from the server, in arrival order
    pub fn incoming(&self) -> &TsQueue<OwnedMessage<T>> {
        &self.incoming
    }

    pub fn connection(&self) -> Option<&Arc<Connection<T>>> {
        self.connection.as_ref()
    }

    /// Hand up to `max_messages` queued messages to `handler`.
    ///
    /// With `wait` set, blocks until at least one message is queued. Returns
    /// the number handled.
    pub fn update<F>(&self, max_messages: usize, wait: bool, mut handler: F) -> usize
    where
        F: FnMut(Message<T>),
    {
        if wait {
            self.incoming.wait();
        }

        let mut handled = 0;
        while handled < max_messages {
            let Some(owned) = self.incoming.pop_front() else {
                break;
            };
            handler(owned.msg);
            handled += 1;
        }
        handled
    }
}

impl<T: MessageTag> Default for Client<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: MessageTag> Drop for Client<T> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl<T: MessageTag> fmt::Debug for Client<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("connection", &self.connection)
            .field("queued", &self.incoming.count())
            .finish()
    }
}
