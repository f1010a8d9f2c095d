//! The WebSocket server: listening socket, path registry, accept loop.
//!
//! The server owns the listening socket and a registry mapping URL paths to
//! connection listeners. The accept loop runs on its own task; every accepted
//! client gets a fresh task that performs the handshake and then runs that
//! connection's receive loop, so a slow or hostile handshake never blocks other
//! clients from being accepted.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, info};
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::config::Config;
use crate::connection::WebSocket;
use crate::{handshake, Result, WebSocketError, WebSocketListener};

/// Server implementing the draft 75 and 76 WebSocket protocols.
///
/// Clones share the same server. The expected lifecycle is: construct, register
/// listeners, [`start`](Self::start), eventually [`stop`](Self::stop).
///
/// ```no_run
/// use std::sync::Arc;
/// use legacy_ws::{Config, WebSocket, WebSocketListener, WebSocketServer};
///
/// struct Chat;
///
/// impl WebSocketListener for Chat {
///     fn client_connected(&self, socket: &WebSocket) {
///         println!("joined {:?}", socket.context_path());
///     }
///     fn client_closed(&self, _socket: &WebSocket) {}
/// }
///
/// # async fn run() -> legacy_ws::Result<()> {
/// let server = WebSocketServer::new(Config::from_env());
/// server.register_listener("/chat", Arc::new(Chat))?;
/// server.start().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct WebSocketServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: Config,
    /// Path registry. Mutation is expected during setup, before `start`;
    /// concurrent registration while serving needs external synchronization.
    listeners: Mutex<HashMap<String, Vec<Arc<dyn WebSocketListener>>>>,
    /// Whether a listening socket is currently bound.
    started: AtomicBool,
    /// Tells the accept loop to drop the listening socket.
    shutdown: watch::Sender<bool>,
}

impl WebSocketServer {
    /// Creates a server that will listen according to `config` once started.
    pub fn new(config: Config) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(ServerInner {
                config,
                listeners: Mutex::new(HashMap::new()),
                started: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    /// Whether the server is currently bound and listening for connections.
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Registers a connection listener for a path.
    ///
    /// A client requesting a path with no registered listener has its handshake
    /// rejected. Registration is append-only and duplicates are allowed; the
    /// notification order is the registration order.
    ///
    /// # Errors
    /// Returns [`WebSocketError::EmptyPath`] when `path` is empty.
    pub fn register_listener(&self, path: &str, listener: Arc<dyn WebSocketListener>) -> Result<()> {
        if path.is_empty() {
            return Err(WebSocketError::EmptyPath);
        }
        self.inner
            .listeners
            .lock()
            .unwrap()
            .entry(path.to_owned())
            .or_default()
            .push(listener);
        Ok(())
    }

    /// Binds the listening socket and launches the accept loop.
    ///
    /// The socket listens on all interfaces, on the configured port and with the
    /// configured backlog. After this returns, [`is_started`](Self::is_started)
    /// reports true until [`stop`](Self::stop) is called or the accept loop hits a
    /// fatal I/O fault.
    pub async fn start(&self) -> Result<()> {
        let listener = bind(self.inner.config.port, self.inner.config.backlog)?;
        info!("listening on port {}", self.inner.config.port);

        self.inner.shutdown.send_replace(false);
        self.inner.started.store(true, Ordering::SeqCst);

        let server = self.clone();
        tokio::spawn(async move {
            server.accept_loop(listener).await;
        });
        Ok(())
    }

    /// Stops listening for new connections.
    ///
    /// In-flight client connections are not closed by this call; they terminate
    /// independently on their own streams' fate.
    pub fn stop(&self) {
        self.inner.started.store(false, Ordering::SeqCst);
        self.inner.shutdown.send_replace(true);
    }

    async fn accept_loop(self, listener: TcpListener) {
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => {
                    info!("server closed normally");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("accepted connection from {peer}");
                        let server = self.clone();
                        tokio::spawn(async move {
                            server.serve_client(stream).await;
                        });
                    }
                    Err(err) => {
                        error!("accept failed, shutting the server down: {err}");
                        break;
                    }
                }
            }
        }
        self.inner.started.store(false, Ordering::SeqCst);
        // the listening socket is released here
    }

    /// Serves one client from handshake to closure; the whole lifetime of the
    /// connection runs on the current task.
    async fn serve_client(self, stream: TcpStream) {
        let (read_half, mut write_half) = stream.into_split();
        // handshake reads byte-at-a-time; buffering keeps that cheap, and any
        // bytes beyond the handshake stay available for the receive loop
        let mut reader = BufReader::new(read_half);

        let handshake =
            match handshake::perform(&mut reader, &mut write_half, |path| self.has_listeners(path))
                .await
            {
                Ok(handshake) => handshake,
                Err(err) => {
                    info!("handshake aborted: {err}");
                    return;
                }
            };

        let ws = WebSocket::new(handshake, write_half);
        self.notify_connected(&ws);
        ws.run(reader, &self).await;
    }

    fn has_listeners(&self, path: &str) -> bool {
        self.inner.listeners.lock().unwrap().contains_key(path)
    }

    /// Notifies the path's listeners of a fresh connection, in registration order.
    fn notify_connected(&self, socket: &WebSocket) {
        for listener in self.listeners_for(socket) {
            listener.client_connected(socket);
        }
    }

    /// Notifies the path's listeners that a connection closed, in registration
    /// order. A path with no listeners is a silent no-op.
    pub(crate) fn notify_closure(&self, socket: &WebSocket) {
        for listener in self.listeners_for(socket) {
            listener.client_closed(socket);
        }
    }

    fn listeners_for(&self, socket: &WebSocket) -> Vec<Arc<dyn WebSocketListener>> {
        let Some(path) = socket.context_path() else {
            return Vec::new();
        };
        self.inner
            .listeners
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .unwrap_or_default()
    }
}

/// Binds a listening socket with an explicit accept backlog.
///
/// Tokio's `TcpListener::bind` does not expose the backlog, so the socket is
/// prepared through socket2 and then handed over.
fn bind(port: u16, backlog: u32) -> Result<TcpListener> {
    let address = SocketAddr::from(([0, 0, 0, 0], port));
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.bind(&address.into())?;
    socket.listen(backlog as i32)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into())?)
}
