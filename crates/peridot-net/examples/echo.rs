//! Echo server: `cargo run --example echo -- [port]`, then `nc 127.0.0.1 7000`.

use std::time::Duration;

use peridot_net::{NetResult, Server, ServerConfig};

fn main() -> NetResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let port = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(7000);

    let config = ServerConfig::new("0.0.0.0", port)?
        .with_name("echo")
        .with_idle_timeout(Duration::from_secs(60));
    let server = Server::bind(config)?;

    server.set_connection_callback(|conn| {
        if conn.is_connected() {
            tracing::info!(peer = %conn.peer_addr(), "peer up");
        } else {
            tracing::info!(peer = %conn.peer_addr(), "peer down");
        }
    });
    server.set_message_callback(|conn, buffer, ts| {
        tracing::debug!(
            peer = %conn.peer_addr(),
            bytes = buffer.readable_bytes(),
            at = %ts,
            "echoing"
        );
        conn.send(buffer.as_slice());
    });

    server.serve_forever();
    Ok(())
}
