//! HTTP-Upgrade handshake for drafts 75 and 76.
//!
//! The handshake reads raw header lines from a freshly accepted stream, decides
//! whether the client speaks draft 75 (plain) or draft 76 (secure, with the numeric
//! challenge), and writes the `101` upgrade response. Parsing is deliberately
//! line-oriented rather than going through an HTTP library: the draft response
//! carries 16 raw digest bytes after the blank line, which no HTTP/1.1 framing
//! model accommodates.

use std::collections::HashMap;
use std::io;

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{challenge, Result, WebSocketError};

/// The outcome of a successful handshake: everything a connection needs to start.
#[derive(Debug)]
pub(crate) struct Handshake {
    /// Header table, keys uppercased and values trimmed.
    pub headers: HashMap<String, String>,
    /// Path from the request line, absent when the request line was malformed.
    pub path: Option<String>,
    /// Whether the client completed the draft-76 challenge exchange.
    pub secure: bool,
}

impl Handshake {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_uppercase()).map(String::as_str)
    }
}

/// Runs the handshake state machine over a freshly accepted stream.
///
/// `has_listener` consults the server's registry; a parsed path without any
/// registered listener rejects the handshake before headers are read.
///
/// On success the upgrade response has been written and flushed, and any bytes the
/// client sent beyond the handshake are still buffered in `reader` for the receive
/// loop. On error the caller drops the stream; no connection exists and no listener
/// has been notified.
pub(crate) async fn perform<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    has_listener: F,
) -> Result<Handshake>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(&str) -> bool,
{
    let Some(request_line) = read_line(reader).await? else {
        return Err(WebSocketError::HandshakeInterrupted);
    };
    debug!("request: {request_line}");

    // Fewer than three tokens means a malformed request line; the draft-era
    // behavior is to carry on without a path rather than abort.
    let tokens: Vec<&str> = request_line.split(' ').collect();
    let path = (tokens.len() >= 3).then(|| tokens[1].to_owned());

    if let Some(path) = &path {
        if !has_listener(path) {
            warn!("path {path} has no listeners, aborting connection");
            return Err(WebSocketError::NoListeners(path.clone()));
        }
    }

    let mut headers = HashMap::new();
    let mut secure = false;
    loop {
        let Some(line) = read_line(reader).await? else {
            return Err(WebSocketError::HandshakeInterrupted);
        };
        if line.is_empty() {
            break;
        }
        debug!("header: {line}");

        let Some((name, value)) = line.split_once(':') else {
            debug!("invalid header: {line}");
            continue;
        };
        let name = name.to_uppercase();
        if name.starts_with("SEC-WEBSOCKET-KEY") {
            secure = true;
        }
        headers.insert(name, value.trim().to_owned());
    }

    let handshake = Handshake {
        headers,
        path,
        secure,
    };

    let digest = if secure {
        let mut key3 = [0u8; 8];
        reader.read_exact(&mut key3).await.map_err(|err| {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                WebSocketError::HandshakeInterrupted
            } else {
                err.into()
            }
        })?;
        debug!("key 3: {key3:02X?}");

        let key1 = handshake
            .header("Sec-WebSocket-Key1")
            .ok_or(WebSocketError::MissingChallengeKey("Sec-WebSocket-Key1"))?;
        let key2 = handshake
            .header("Sec-WebSocket-Key2")
            .ok_or(WebSocketError::MissingChallengeKey("Sec-WebSocket-Key2"))?;
        Some(challenge::compute(key1, key2, &key3)?)
    } else {
        None
    };

    let response = build_response(&handshake);
    debug!("response:\n{response}");

    writer.write_all(response.as_bytes()).await?;
    if let Some(digest) = &digest {
        // raw digest bytes, no terminator
        writer.write_all(digest).await?;
    }
    writer.flush().await?;

    Ok(handshake)
}

/// Builds the upgrade response headers, up to and including the blank line.
///
/// The Origin and Location echoes (and the Protocol echo, when the request carried
/// one) gain a `Sec-` prefix exactly when the handshake is secure.
fn build_response(handshake: &Handshake) -> String {
    let sec = if handshake.secure { "Sec-" } else { "" };
    let origin = handshake.header("Origin").unwrap_or("");
    let host = handshake.header("Host").unwrap_or("");
    let path = handshake.path.as_deref().unwrap_or("");

    let mut response = String::new();
    response.push_str("HTTP/1.1 101 Web Socket Protocol Handshake\r\n");
    response.push_str("Upgrade: WebSocket\r\n");
    response.push_str("Connection: Upgrade\r\n");
    response.push_str(&format!("{sec}WebSocket-Origin: {origin}\r\n"));
    response.push_str(&format!("{sec}WebSocket-Location: ws://{host}{path}\r\n"));
    if let Some(protocol) = handshake.header("Protocol") {
        response.push_str(&format!("{sec}Protocol: {protocol}\r\n"));
    }
    response.push_str("\r\n");
    response
}

/// Reads one CR-LF terminated line, without the terminator.
///
/// The draft requires every LF to be preceded by a CR; a bare LF is a protocol
/// violation and reads as "no line", the same as end of stream. Carriage returns
/// never become part of the line.
async fn read_line<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<String>> {
    let mut line = String::new();
    let mut got_cr = false;
    loop {
        let mut byte = [0u8; 1];
        if reader.read(&mut byte).await? == 0 {
            return Ok(None);
        }
        match byte[0] {
            b'\r' => got_cr = true,
            b'\n' if got_cr => return Ok(Some(line)),
            b'\n' => return Ok(None),
            other => line.push(other as char),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split, AsyncReadExt, AsyncWriteExt};

    async fn run_handshake(
        request: &[u8],
        registered: &'static [&'static str],
    ) -> (Result<Handshake>, Vec<u8>) {
        let (mut client, server) = duplex(4096);
        client.write_all(request).await.unwrap();
        client.shutdown().await.unwrap();

        let (mut reader, mut writer) = split(server);
        let result = perform(&mut reader, &mut writer, |path| {
            registered.contains(&path)
        })
        .await;
        // drop both halves so the client side observes EOF
        drop(reader);
        drop(writer);

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        (result, response)
    }

    #[tokio::test]
    async fn test_plain_handshake() {
        let request = b"GET /chat HTTP/1.1\r\n\
            Host: example.com:10123\r\n\
            Origin: http://example.com\r\n\
            \r\n";
        let (result, response) = run_handshake(request, &["/chat"]).await;
        let handshake = result.unwrap();

        assert!(!handshake.secure);
        assert_eq!(handshake.path.as_deref(), Some("/chat"));
        assert_eq!(handshake.header("host"), Some("example.com:10123"));

        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 101 Web Socket Protocol Handshake\r\n"));
        assert!(response.contains("Upgrade: WebSocket\r\n"));
        assert!(response.contains("Connection: Upgrade\r\n"));
        assert!(response.contains("WebSocket-Origin: http://example.com\r\n"));
        assert!(response.contains("WebSocket-Location: ws://example.com:10123/chat\r\n"));
        assert!(!response.contains("Sec-"));
        assert!(response.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_secure_handshake_appends_digest() {
        let mut request = Vec::new();
        request.extend_from_slice(
            b"GET /chat HTTP/1.1\r\n\
            Host: example.com\r\n\
            Origin: http://example.com\r\n\
            Sec-WebSocket-Key1: 3e6b263  4 17 80\r\n\
            Sec-WebSocket-Key2: 17  9 G`ZD9   2 2b 7X 3 /r90\r\n\
            \r\n",
        );
        request.extend_from_slice(&[0x57, 0x6A, 0x4E, 0x7D, 0x7C, 0x4D, 0x28, 0x36]);

        let (result, response) = run_handshake(&request, &["/chat"]).await;
        let handshake = result.unwrap();
        assert!(handshake.secure);

        let header_end = response
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .unwrap()
            + 4;
        let headers = std::str::from_utf8(&response[..header_end]).unwrap();
        assert!(headers.contains("Sec-WebSocket-Origin: http://example.com\r\n"));
        assert!(headers.contains("Sec-WebSocket-Location: ws://example.com/chat\r\n"));

        let digest = &response[header_end..];
        assert_eq!(digest, b"n`9eBk9z$R8pOtVb");
    }

    #[tokio::test]
    async fn test_unregistered_path_is_rejected() {
        let request = b"GET /nowhere HTTP/1.1\r\nHost: h\r\n\r\n";
        let (result, response) = run_handshake(request, &["/chat"]).await;
        match result {
            Err(WebSocketError::NoListeners(path)) => assert_eq!(path, "/nowhere"),
            other => panic!("expected NoListeners, got {other:?}"),
        }
        assert!(response.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_request_line_proceeds_without_path() {
        // two tokens only, so no path is parsed and the registry is not consulted
        let request = b"GET /nowhere\r\nHost: h\r\n\r\n";
        let (result, _) = run_handshake(request, &[]).await;
        let handshake = result.unwrap();
        assert!(handshake.path.is_none());
    }

    #[tokio::test]
    async fn test_truncated_request_aborts() {
        let request = b"GET /chat HTTP/1.1\r\nHost: h\r\n";
        let (result, _) = run_handshake(request, &["/chat"]).await;
        match result {
            Err(WebSocketError::HandshakeInterrupted) => {}
            other => panic!("expected HandshakeInterrupted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bare_lf_aborts() {
        let request = b"GET /chat HTTP/1.1\nHost: h\r\n\r\n";
        let (result, _) = run_handshake(request, &["/chat"]).await;
        assert!(matches!(result, Err(WebSocketError::HandshakeInterrupted)));
    }

    #[tokio::test]
    async fn test_line_without_colon_is_skipped() {
        let request = b"GET /chat HTTP/1.1\r\n\
            Host: h\r\n\
            this line has no separator\r\n\
            Origin: o\r\n\
            \r\n";
        let (result, _) = run_handshake(request, &["/chat"]).await;
        let handshake = result.unwrap();
        assert_eq!(handshake.header("Origin"), Some("o"));
        assert_eq!(handshake.headers.len(), 2);
    }

    #[tokio::test]
    async fn test_protocol_header_is_echoed() {
        let request = b"GET /chat HTTP/1.1\r\n\
            Host: h\r\n\
            Protocol: sample\r\n\
            \r\n";
        let (_, response) = run_handshake(request, &["/chat"]).await;
        let response = String::from_utf8(response).unwrap();
        assert!(response.contains("Protocol: sample\r\n"));
    }

    #[tokio::test]
    async fn test_secure_handshake_with_spaceless_key_is_rejected() {
        let mut request = Vec::new();
        request.extend_from_slice(
            b"GET /chat HTTP/1.1\r\n\
            Host: h\r\n\
            Sec-WebSocket-Key1: 12345\r\n\
            Sec-WebSocket-Key2: 17  9 G`ZD9   2 2b 7X 3 /r90\r\n\
            \r\n",
        );
        request.extend_from_slice(&[0u8; 8]);
        let (result, response) = run_handshake(&request, &["/chat"]).await;
        assert!(matches!(
            result,
            Err(WebSocketError::MalformedChallengeKey(_))
        ));
        assert!(response.is_empty());
    }

    #[tokio::test]
    async fn test_read_line_strips_cr() {
        let mut input = &b"GET / HTTP/1.1\r\nrest"[..];
        let line = read_line(&mut input).await.unwrap();
        assert_eq!(line.as_deref(), Some("GET / HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_read_line_eof_is_no_line() {
        let mut input = &b"partial"[..];
        assert!(read_line(&mut input).await.unwrap().is_none());
    }
}
