//! Per-client connection state and receive loop.
//!
//! A [`WebSocket`] is a cheaply clonable handle to one client's connection. The
//! write half of the stream is owned by a dedicated writer task fed through an
//! unbounded channel, which makes [`WebSocket::send_message`] a synchronous
//! fire-and-forget call usable from any task or thread. The read half is consumed
//! by the receive loop, which runs on the same task that performed the handshake
//! and fans every decoded message out to the registered message listeners in
//! order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::codec::Codec;
use crate::handshake::Handshake;
use crate::server::WebSocketServer;
use crate::{WebSocketError, WebSocketMessageListener};

/// Handle to one client connection established by a successful handshake.
///
/// Clones share the same underlying connection. All methods are callable from any
/// task or thread; none of them blocks on the network.
#[derive(Clone)]
pub struct WebSocket {
    inner: Arc<Inner>,
}

struct Inner {
    /// Header table from the handshake, keys uppercased and values trimmed.
    headers: HashMap<String, String>,
    /// Path from the request line; absent when the request line was malformed.
    path: Option<String>,
    /// Feeds the writer task. Sending never blocks; the channel is unbounded.
    outbound: mpsc::UnboundedSender<String>,
    /// Set once the underlying stream has actually been torn down.
    closed: AtomicBool,
    /// Signals the receive loop and the writer task to shut the stream down.
    shutdown: watch::Sender<bool>,
    /// Active message listeners, in registration order.
    listeners: Mutex<Vec<Arc<dyn WebSocketMessageListener>>>,
    /// Listeners queued for removal, applied before the next dispatch.
    removed: Mutex<Vec<Arc<dyn WebSocketMessageListener>>>,
}

impl WebSocket {
    /// Builds the connection handle and spawns its writer task over `writer`.
    ///
    /// The receive loop is not started here; the caller runs [`WebSocket::run`]
    /// after firing the connect notifications, so listeners always observe the
    /// connection before its first message.
    pub(crate) fn new<W>(handshake: Handshake, writer: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, outbox) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let ws = Self {
            inner: Arc::new(Inner {
                headers: handshake.headers,
                path: handshake.path,
                outbound,
                closed: AtomicBool::new(false),
                shutdown,
                listeners: Mutex::new(Vec::new()),
                removed: Mutex::new(Vec::new()),
            }),
        };

        let shutdown = ws.inner.shutdown.subscribe();
        tokio::spawn(write_loop(writer, outbox, shutdown));
        ws
    }

    /// Returns the value of a handshake header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.inner
            .headers
            .get(&name.to_uppercase())
            .map(String::as_str)
    }

    /// Returns the path the client requested during the handshake, if the request
    /// line carried one.
    pub fn context_path(&self) -> Option<&str> {
        self.inner.path.as_deref()
    }

    /// Sends a text message to the client, best effort.
    ///
    /// The message is framed and handed to the writer task; a write failure is
    /// logged there and never surfaced to the caller, consistent with the
    /// fire-and-forget nature of the draft protocol. Messages sent after the
    /// connection closed are silently dropped.
    pub fn send_message(&self, message: &str) {
        if self.inner.outbound.send(message.to_owned()).is_err() {
            debug!("connection closed, message dropped");
        }
    }

    /// Closes the connection.
    ///
    /// Idempotent and callable from any thread. The receive loop observes the
    /// signal, tears the stream down and triggers the closure notification.
    pub fn close(&self) {
        self.inner.shutdown.send_replace(true);
    }

    /// Whether the underlying stream has been torn down.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Appends a message listener. Duplicates are allowed; notification order is
    /// registration order.
    pub fn add_message_listener(&self, listener: Arc<dyn WebSocketMessageListener>) {
        self.inner.listeners.lock().unwrap().push(listener);
    }

    /// Queues a message listener for removal.
    ///
    /// Removal is deferred: the listener still receives the message currently
    /// being dispatched, if any, and is excluded starting with the next one.
    /// Identity is pointer identity of the `Arc`.
    pub fn remove_message_listener(&self, listener: &Arc<dyn WebSocketMessageListener>) {
        self.inner.removed.lock().unwrap().push(Arc::clone(listener));
    }

    /// Runs the receive loop until the stream ends, the client signals an error,
    /// the stream faults, or [`WebSocket::close`] is called.
    ///
    /// On exit the stream is shut down and the owning server is told exactly once
    /// that this connection closed, even when a listener panicked mid-dispatch.
    /// Transport faults are translated into that closure event, never surfaced to
    /// listener code.
    pub(crate) async fn run<R>(&self, reader: R, server: &WebSocketServer)
    where
        R: AsyncRead + Unpin,
    {
        // Cleanup must happen however the loop exits, including a listener
        // panicking mid-dispatch, so it lives in a drop guard.
        struct Cleanup<'a> {
            ws: &'a WebSocket,
            server: &'a WebSocketServer,
        }

        impl Drop for Cleanup<'_> {
            fn drop(&mut self) {
                // stop the writer task so it shuts the write half down
                self.ws.inner.shutdown.send_replace(true);
                self.ws.inner.closed.store(true, Ordering::SeqCst);
                self.server.notify_closure(self.ws);
            }
        }

        let _cleanup = Cleanup { ws: self, server };
        let mut frames = FramedRead::new(reader, Codec::new());
        let mut shutdown = self.inner.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => {
                    info!("connection closed locally");
                    break;
                }
                frame = frames.next() => match frame {
                    Some(Ok(message)) => self.dispatch(&message),
                    Some(Err(WebSocketError::ClientError)) => {
                        warn!("client sent error");
                        break;
                    }
                    Some(Err(err)) => {
                        warn!("error while trying to read: {err}");
                        break;
                    }
                    None => {
                        info!("socket closed by client");
                        break;
                    }
                }
            }
        }
    }

    /// Applies pending removals, then notifies a snapshot of the active listeners.
    ///
    /// Dispatching from a snapshot means a listener removed while this message is
    /// being delivered still sees it, and additions take effect with the next one.
    fn dispatch(&self, message: &str) {
        let snapshot = {
            let mut listeners = self.inner.listeners.lock().unwrap();
            let mut removed = self.inner.removed.lock().unwrap();
            if !removed.is_empty() {
                listeners.retain(|active| !removed.iter().any(|gone| Arc::ptr_eq(active, gone)));
                removed.clear();
            }
            listeners.clone()
        };

        for listener in &snapshot {
            listener.on_message(message);
        }
    }
}

/// Owns the write half: frames queued messages out and shuts the stream down on
/// closure. Write failures are logged, matching the protocol's best-effort sends.
async fn write_loop<W>(
    writer: W,
    mut outbox: mpsc::UnboundedReceiver<String>,
    mut shutdown: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, Codec::new());
    loop {
        // the watch guard returned by wait_for must not live across the send
        let message = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            message = outbox.recv() => match message {
                Some(message) => message,
                None => break,
            }
        };
        if let Err(err) = sink.send(message).await {
            warn!("failed to send message: {err}");
        }
    }
    let _ = sink.into_inner().shutdown().await;
}
