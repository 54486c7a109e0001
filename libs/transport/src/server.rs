//! Server façade
//!
//! Listens on one port, admits connections through [`ServerHandler`] hooks,
//! keeps a registry of live connections and dispatches inbound messages to
//! the application when it calls [`Server::update`].
//!
//! All connections share a single execution context thread and a single
//! inbound queue. Dead connections are noticed lazily: the next attempt to
//! message them fires `on_client_disconnect` and drops them from the
//! registry.

use crate::connection::Connection;
use crate::context::IoContext;
use crate::error::{Result, TransportError};
use crate::message::{Message, MessageTag, OwnedMessage};
use crate::queue::TsQueue;
use crate::settings::ServerSettings;
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Application hooks invoked by a [`Server`].
///
/// `on_client_connect` and `on_client_validated` run on the server's
/// execution context; keep them short. `on_message` and
/// `on_client_disconnect` run on whichever thread drives `update` or sends.
pub trait ServerHandler<T: MessageTag>: Send + Sync + 'static {
    /// Veto a freshly accepted socket. Denied by default.
    fn on_client_connect(&self, _client: &Arc<Connection<T>>) -> bool {
        false
    }

    /// A registry entry was found disconnected and is being removed
    fn on_client_disconnect(&self, _client: &Arc<Connection<T>>) {}

    /// The client answered the handshake correctly
    fn on_client_validated(&self, _client: &Arc<Connection<T>>) {}

    /// A message arrived from `client`
    fn on_message(&self, _server: &Server<T>, _client: &Arc<Connection<T>>, _msg: Message<T>) {}
}

/// State shared with the accept loop
struct Shared<T: MessageTag> {
    incoming: Arc<TsQueue<OwnedMessage<T>>>,
    registry: Mutex<Vec<Arc<Connection<T>>>>,
    next_id: AtomicU32,
    hooks: Arc<dyn ServerHandler<T>>,
    nodelay: bool,
}

impl<T: MessageTag> Shared<T> {
    /// Add unless the same connection is already present
    fn register(&self, conn: Arc<Connection<T>>) -> bool {
        let mut registry = self.registry.lock();
        if registry.iter().any(|c| Arc::ptr_eq(c, &conn)) {
            return false;
        }
        registry.push(conn);
        true
    }

    fn remove(&self, conn: &Arc<Connection<T>>) {
        self.registry.lock().retain(|c| !Arc::ptr_eq(c, conn));
    }
}

/// Multi-client TCP server
pub struct Server<T: MessageTag> {
    settings: ServerSettings,
    shared: Arc<Shared<T>>,
    context: Option<IoContext>,
    local_addr: Option<SocketAddr>,
}

impl<T: MessageTag> Server<T> {
    /// Server listening on all IPv4 interfaces at `port`
    pub fn new(port: u16, hooks: Arc<dyn ServerHandler<T>>) -> Self {
        let settings = ServerSettings {
            port,
            ..ServerSettings::default()
        };
        Self::with_settings(&settings, hooks)
    }

    pub fn with_settings(settings: &ServerSettings, hooks: Arc<dyn ServerHandler<T>>) -> Self {
        Self {
            settings: settings.clone(),
            shared: Arc::new(Shared {
                incoming: Arc::new(TsQueue::new()),
                registry: Mutex::new(Vec::new()),
                next_id: AtomicU32::new(settings.first_client_id),
                hooks,
                nodelay: settings.nodelay,
            }),
            context: None,
            local_addr: None,
        }
    }

    /// Bind, start the execution context and arm the accept loop
    pub fn start(&mut self) -> Result<()> {
        if self.context.is_some() {
            return Ok(());
        }

        let bind_addr = self.settings.socket_addr();
        let std_listener = std::net::TcpListener::bind(bind_addr)
            .map_err(|e| TransportError::bind(bind_addr, e))?;
        std_listener
            .set_nonblocking(true)
            .map_err(|e| TransportError::bind(bind_addr, e))?;
        let local_addr = std_listener
            .local_addr()
            .map_err(|e| TransportError::bind(bind_addr, e))?;

        let context = IoContext::start("transport-server")?;
        let listener = {
            let _guard = context.handle().enter();
            TcpListener::from_std(std_listener).map_err(|e| TransportError::bind(bind_addr, e))?
        };

        let shared = Arc::clone(&self.shared);
        context.handle().spawn(accept_loop(listener, shared));

        info!(addr = %local_addr, "[SERVER] Started");
        self.context = Some(context);
        self.local_addr = Some(local_addr);
        Ok(())
    }

    /// Close every registered connection, stop the context and join its thread.
    ///
    /// Undispatched inbound messages are discarded: each one holds its
    /// connection, and each connection holds the queue.
    pub fn stop(&mut self) {
        let Some(mut context) = self.context.take() else {
            return;
        };

        let connections: Vec<_> = self.shared.registry.lock().drain(..).collect();
        for conn in &connections {
            conn.disconnect();
        }

        context.stop();
        self.shared.incoming.clear();
        self.local_addr = None;
        info!("[SERVER] Stopped");
    }

    pub fn is_running(&self) -> bool {
        self.context.is_some()
    }

    /// Address actually bound, available after `start`
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of registry entries, live or not yet pruned
    pub fn connection_count(&self) -> usize {
        self.shared.registry.lock().len()
    }

    /// Inbound queue shared by every connection
    pub fn incoming(&self) -> &TsQueue<OwnedMessage<T>> {
        &self.shared.incoming
    }

    /// Send to one client, pruning it if it has gone away
    pub fn message_client(&self, client: &Arc<Connection<T>>, msg: Message<T>) {
        if client.is_connected() {
            client.send(msg);
        } else {
            self.shared.hooks.on_client_disconnect(client);
            self.shared.remove(client);
        }
    }

    /// Send to every registered client except `exclude`, pruning dead ones
    pub fn message_all_clients(&self, msg: &Message<T>, exclude: Option<&Arc<Connection<T>>>) {
        let stale = {
            let mut registry = self.shared.registry.lock();
            let mut dead = vec![false; registry.len()];

            for (slot, client) in registry.iter().enumerate() {
                if !client.is_connected() {
                    dead[slot] = true;
                    continue;
                }
                if exclude.is_some_and(|skip| Arc::ptr_eq(skip, client)) {
                    continue;
                }
                client.send(msg.clone());
            }

            let stale: Vec<_> = registry
                .iter()
                .zip(&dead)
                .filter(|(_, dead)| **dead)
                .map(|(client, _)| Arc::clone(client))
                .collect();

            let mut marks = dead.iter();
            registry.retain(|_| !marks.next().copied().unwrap_or(false));
            stale
        };

        for client in &stale {
            self.shared.hooks.on_client_disconnect(client);
        }
    }

    /// Dispatch up to `max_messages` queued messages to `on_message`.
    ///
    /// With `wait` set, blocks until at least one message is queued. Returns
    /// the number dispatched.
    pub fn update(&self, max_messages: usize, wait: bool) -> usize {
        if wait {
            self.shared.incoming.wait();
        }

        let mut dispatched = 0;
        while dispatched < max_messages {
            let Some(owned) = self.shared.incoming.pop_front() else {
                break;
            };
            if let Some(remote) = owned.remote {
                self.shared.hooks.on_message(self, &remote, owned.msg);
            }
            dispatched += 1;
        }
        dispatched
    }
}

async fn accept_loop<T: MessageTag>(listener: TcpListener, shared: Arc<Shared<T>>) {
    let handle = tokio::runtime::Handle::current();

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!(peer = %peer, "[SERVER] New connection");
                let conn = Arc::new(Connection::accepted(
                    handle.clone(),
                    stream,
                    Arc::clone(&shared.incoming),
                    shared.nodelay,
                ));

                if shared.hooks.on_client_connect(&conn) {
                    let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
                    if shared.register(Arc::clone(&conn)) {
                        conn.connect_to_client(id, Arc::clone(&shared.hooks));
                        info!(id, "Connection approved");
                    }
                } else {
                    info!(peer = %peer, "Connection denied");
                }
            }
            Err(e) => {
                error!(error = %e, "[SERVER] New connection error");
            }
        }
    }
}

impl<T: MessageTag> Drop for Server<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<T: MessageTag> fmt::Debug for Server<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("settings", &self.settings)
            .field("local_addr", &self.local_addr)
            .field("connections", &self.connection_count())
            .field("queued", &self.shared.incoming.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::handshake::scramble;
    use num_enum::{IntoPrimitive, TryFromPrimitive};
    use std::io::{Read, Write};
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    #[repr(u32)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
    enum Kind {
        Hello = 7,
    }

    #[derive(Default)]
    struct Counting {
        accept: bool,
        connects: AtomicUsize,
        validated: AtomicUsize,
        disconnected: AtomicUsize,
        messages: AtomicUsize,
    }

    impl ServerHandler<Kind> for Counting {
        fn on_client_connect(&self, _client: &Arc<Connection<Kind>>) -> bool {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.accept
        }

        fn on_client_disconnect(&self, _client: &Arc<Connection<Kind>>) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }

        fn on_client_validated(&self, _client: &Arc<Connection<Kind>>) {
            self.validated.fetch_add(1, Ordering::SeqCst);
        }

        fn on_message(&self, _server: &Server<Kind>, _client: &Arc<Connection<Kind>>, _msg: Message<Kind>) {
            self.messages.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn local_server(hooks: Arc<Counting>) -> Server<Kind> {
        let settings = ServerSettings {
            bind_address: [127, 0, 0, 1].into(),
            port: 0,
            ..ServerSettings::default()
        };
        let mut server = Server::with_settings(&settings, hooks);
        server.start().unwrap();
        server
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn handshake(stream: &mut std::net::TcpStream) {
        let mut challenge = [0u8; 8];
        stream.read_exact(&mut challenge).unwrap();
        let reply = scramble(u64::from_ne_bytes(challenge));
        stream.write_all(&reply.to_ne_bytes()).unwrap();
    }

    #[test]
    fn test_denied_connection_is_dropped() {
        let hooks = Arc::new(Counting::default());
        let server = local_server(Arc::clone(&hooks));

        let mut stream = std::net::TcpStream::connect(server.local_addr().unwrap()).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
        assert_eq!(hooks.connects.load(Ordering::SeqCst), 1);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_ids_start_at_threshold_and_increase() {
        let hooks = Arc::new(Counting {
            accept: true,
            ..Counting::default()
        });
        let server = local_server(Arc::clone(&hooks));
        let addr = server.local_addr().unwrap();

        let mut first = std::net::TcpStream::connect(addr).unwrap();
        handshake(&mut first);
        let mut second = std::net::TcpStream::connect(addr).unwrap();
        handshake(&mut second);

        assert!(wait_until(|| hooks.validated.load(Ordering::SeqCst) == 2));
        let ids: Vec<u32> = server.shared.registry.lock().iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec![10000, 10001]);
        assert!(server
            .shared
            .registry
            .lock()
            .iter()
            .all(|c| c.state() == ConnectionState::Ready));
    }

    #[test]
    fn test_update_respects_max_messages() {
        let hooks = Arc::new(Counting {
            accept: true,
            ..Counting::default()
        });
        let server = local_server(Arc::clone(&hooks));
        let mut stream = std::net::TcpStream::connect(server.local_addr().unwrap()).unwrap();
        handshake(&mut stream);

        let frame = Message::new(Kind::Hello).header().encode();
        for _ in 0..3 {
            stream.write_all(&frame).unwrap();
        }

        assert!(wait_until(|| server.incoming().count() == 3));
        assert_eq!(server.update(2, false), 2);
        assert_eq!(hooks.messages.load(Ordering::SeqCst), 2);
        assert_eq!(server.update(usize::MAX, true), 1);
        assert_eq!(server.update(usize::MAX, false), 0);
    }

    #[test]
    fn test_dead_clients_pruned_on_broadcast() {
        let hooks = Arc::new(Counting {
            accept: true,
            ..Counting::default()
        });
        let server = local_server(Arc::clone(&hooks));
        let addr = server.local_addr().unwrap();

        let mut keep = std::net::TcpStream::connect(addr).unwrap();
        handshake(&mut keep);
        let mut gone = std::net::TcpStream::connect(addr).unwrap();
        handshake(&mut gone);
        assert!(wait_until(|| hooks.validated.load(Ordering::SeqCst) == 2));

        drop(gone);
        assert!(wait_until(|| {
            server
                .shared
                .registry
                .lock()
                .iter()
                .filter(|c| !c.is_connected())
                .count()
                == 1
        }));

        server.message_all_clients(&Message::new(Kind::Hello), None);
        assert_eq!(server.connection_count(), 1);
        assert_eq!(hooks.disconnected.load(Ordering::SeqCst), 1);

        let mut header = [0u8; 8];
        keep.read_exact(&mut header).unwrap();
        assert_eq!(&header[..4], &7u32.to_ne_bytes());
    }

    #[test]
    fn test_bind_conflict_reported() {
        let hooks = Arc::new(Counting::default());
        let server = local_server(Arc::clone(&hooks));
        let port = server.local_addr().unwrap().port();

        let settings = ServerSettings {
            bind_address: [127, 0, 0, 1].into(),
            port,
            ..ServerSettings::default()
        };
        let mut clash: Server<Kind> = Server::with_settings(&settings, hooks);
        assert!(matches!(clash.start(), Err(TransportError::Bind { .. })));
        assert!(!clash.is_running());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut server = local_server(Arc::new(Counting::default()));
        assert!(server.is_running());
        server.stop();
        server.stop();
        assert!(!server.is_running());
        assert!(server.local_addr().is_none());
    }

    #[test]
    fn test_drop_with_queued_messages_releases_connections() {
        let hooks = Arc::new(Counting {
            accept: true,
            ..Counting::default()
        });
        let server = local_server(Arc::clone(&hooks));
        let mut stream = std::net::TcpStream::connect(server.local_addr().unwrap()).unwrap();
        handshake(&mut stream);
        stream
            .write_all(&Message::new(Kind::Hello).header().encode())
            .unwrap();

        assert!(wait_until(|| server.incoming().count() == 1));
        let conn = Arc::downgrade(&server.shared.registry.lock()[0]);
        let queue = Arc::downgrade(&server.shared.incoming);

        drop(server);
        assert!(conn.upgrade().is_none());
        assert!(queue.upgrade().is_none());
    }
}
