//! Process configuration for the server.
//!
//! The server itself only consumes the values; how they are sourced is up to the
//! embedding application. [`Config::from_env`] mirrors the original deployment
//! convention of overriding the defaults through the process environment.

use log::warn;

/// TCP port the server listens on when nothing else is configured.
pub const DEFAULT_PORT: u16 = 10123;

/// Accept backlog used when nothing else is configured.
pub const DEFAULT_BACKLOG: u32 = 40;

/// Environment variable overriding the listening port.
pub const PORT_VAR: &str = "LEGACY_WS_PORT";

/// Environment variable overriding the accept backlog.
pub const BACKLOG_VAR: &str = "LEGACY_WS_BACKLOG";

/// Listening parameters for a [`WebSocketServer`](crate::WebSocketServer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// TCP port to listen on, on all interfaces.
    pub port: u16,
    /// Accept backlog handed to `listen(2)`.
    pub backlog: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            backlog: DEFAULT_BACKLOG,
        }
    }
}

impl Config {
    /// Builds a configuration from `LEGACY_WS_PORT` and `LEGACY_WS_BACKLOG`.
    ///
    /// An unset variable keeps its default; an unparsable one is logged and also
    /// falls back to the default rather than failing startup.
    pub fn from_env() -> Self {
        Self {
            port: parse_var(PORT_VAR, DEFAULT_PORT),
            backlog: parse_var(BACKLOG_VAR, DEFAULT_BACKLOG),
        }
    }
}

fn parse_var<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(value) => value.parse().unwrap_or_else(|_| {
            warn!("ignoring unparsable {name}={value}");
            default
        }),
        Err(_) => default,
    }
}
