//! Echo Server - answers every frame with the same payload.
//!
//! This demo shows:
//! - Building a server endpoint with the fluent builder
//! - Handling NONE, SYNC and ASYNC frames
//! - Replying through the connection's `Sender`
//!
//! # Running
//!
//! ```text
//! RUST_LOG=debug cargo run --example echo_server -- 127.0.0.1:7000
//! cargo run --example ping_client -- 127.0.0.1:7000
//! ```

use qtp::{Endpoint, Frame, Sender};
use tracing_subscriber::EnvFilter;

async fn echo(sender: Sender, frame: Frame) -> qtp::Result<()> {
    tracing::info!(
        seq = frame.sequence(),
        mode = ?frame.ack_mode(),
        "Echoing {} bytes",
        frame.payload_len()
    );
    sender
        .send_no_ack(frame.payload_bytes(), frame.encoding(), |seq, result| {
            if let Err(e) = result {
                tracing::warn!(seq, "Echo not delivered: {}", e);
            }
        })
        .await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7000".to_string());

    let server = Endpoint::builder()
        .on_no_ack(echo)
        .on_sync_ack(echo)
        .on_async_ack(echo)
        .on_conn_init(|_| async { tracing::info!("Client connected") })
        .on_conn_closed(|e| tracing::info!("Client disconnected: {}", e))
        .bind(&addr)
        .await?;

    tracing::info!("Echo server on {}", server.local_addr()?);
    server.run().await;

    Ok(())
}
