//! # legacy-ws
//! Server-side implementation of the legacy WebSocket protocol as specified by the
//! pre-standardization hixie drafts 75 and 76, predating RFC 6455.
//!
//! The server performs the HTTP-Upgrade handshake (including the draft-76 numeric
//! challenge, when the client sends `Sec-WebSocket-Key*` headers) and then speaks the
//! old delimiter-based framing (`0x00 <payload> 0xFF`), not the masked length-prefixed
//! format of RFC 6455. Connections and messages are dispatched to application-supplied
//! listeners keyed by the URL path of the handshake request.
//!
//! Each accepted client is served by its own task: the handshake and the subsequent
//! receive loop run sequentially on that task, so message listeners for a single
//! connection are always invoked in frame order with no concurrent delivery.
//!
//! # Usage Example
//! ```no_run
//! use std::sync::Arc;
//! use legacy_ws::{Config, WebSocket, WebSocketListener, WebSocketServer};
//!
//! struct Greeter;
//!
//! impl WebSocketListener for Greeter {
//!     fn client_connected(&self, socket: &WebSocket) {
//!         socket.send_message("hello");
//!     }
//!
//!     fn client_closed(&self, _socket: &WebSocket) {}
//! }
//!
//! # async fn run() -> legacy_ws::Result<()> {
//! let server = WebSocketServer::new(Config::default());
//! server.register_listener("/greet", Arc::new(Greeter))?;
//! server.start().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Protocol Caveats
//! The legacy drafts carry a couple of hazards that this crate preserves rather than
//! silently fixes, to stay byte-for-byte compatible with draft-era clients:
//!
//! - The framing has no escaping, so a payload byte equal to `0xFF` terminates the
//!   frame early.
//! - Frame payloads are decoded one byte per character rather than as UTF-8, matching
//!   the draft-era read model.
//! - There is no handshake or idle timeout; a client that never completes a handshake
//!   or never terminates a frame occupies its task indefinitely.

pub mod challenge;
pub mod codec;
mod config;
mod connection;
mod handshake;
mod server;

use thiserror::Error;

pub use config::Config;
pub use connection::WebSocket;
pub use server::WebSocketServer;

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Listener for connection-level events on a registered path.
///
/// Implementations are registered with [`WebSocketServer::register_listener`] and are
/// notified once per successful handshake and once per connection closure, in
/// registration order. The implementation should keep whatever reference it needs to
/// the [`WebSocket`] on `client_connected` and forget it on `client_closed`.
///
/// Closure is not guaranteed to be observed immediately: the event fires when the
/// connection's receive loop notices that the stream has ended.
pub trait WebSocketListener: Send + Sync {
    /// Invoked after a successful handshake with a client on the listener's path.
    fn client_connected(&self, socket: &WebSocket);

    /// Invoked exactly once when the connection has been closed by either end.
    fn client_closed(&self, socket: &WebSocket);
}

/// Listener for text messages decoded from a single connection's frame stream.
///
/// Added and removed through [`WebSocket::add_message_listener`] and
/// [`WebSocket::remove_message_listener`]. Listeners are invoked in registration
/// order, on the connection's receive task.
pub trait WebSocketMessageListener: Send + Sync {
    /// Invoked for every complete frame decoded from the connection.
    fn on_message(&self, message: &str);
}

/// Represents errors that can occur during WebSocket operations.
///
/// Protocol violations during the handshake abort the connection before any listener
/// is notified; transport faults on an established connection are translated into a
/// closure event rather than surfaced to listener code.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// The stream ended, or a line violated the CR-LF termination rule, before the
    /// handshake completed. No connection is created.
    #[error("Connection closed before the handshake completed")]
    HandshakeInterrupted,

    /// The requested path has no registered connection listener, so the handshake
    /// was rejected and the socket closed.
    #[error("No listener registered for path {0}")]
    NoListeners(String),

    /// A secure-mode handshake was missing one of the `Sec-WebSocket-Key*` headers
    /// required to compute the challenge.
    #[error("Missing challenge header {0}")]
    MissingChallengeKey(&'static str),

    /// A challenge key could not be reduced to a number: it contained no digits, no
    /// spaces (a division-by-zero fault in the original draft algorithm), or more
    /// digits than fit in the key number.
    #[error("Malformed challenge key: {0}")]
    MalformedChallengeKey(&'static str),

    /// The client signalled an error through the frame stream. The connection is
    /// closed.
    #[error("Client sent an error marker")]
    ClientError,

    /// A listener was registered with an empty path.
    #[error("Listener path must not be empty")]
    EmptyPath,

    /// Wraps standard I/O errors that may occur while accepting, reading or writing.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}
