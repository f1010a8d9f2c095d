//! Echo server: every message a client sends on /echo comes straight back.
//!
//! Run with `cargo run --example echo_server`, then point a draft-75/76 capable
//! client at `ws://localhost:10123/echo`.

use std::sync::Arc;

use legacy_ws::{Config, WebSocket, WebSocketListener, WebSocketMessageListener, WebSocketServer};

struct Echo;

impl WebSocketListener for Echo {
    fn client_connected(&self, socket: &WebSocket) {
        println!("client connected on {:?}", socket.context_path());
        let ws = socket.clone();
        socket.add_message_listener(Arc::new(EchoBack { ws }));
    }

    fn client_closed(&self, _socket: &WebSocket) {
        println!("client closed");
    }
}

struct EchoBack {
    ws: WebSocket,
}

impl WebSocketMessageListener for EchoBack {
    fn on_message(&self, message: &str) {
        self.ws.send_message(message);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Debug)
        .init()?;

    let server = WebSocketServer::new(Config::from_env());
    server.register_listener("/echo", Arc::new(Echo))?;
    server.start().await?;

    tokio::signal::ctrl_c().await?;
    server.stop();
    Ok(())
}
