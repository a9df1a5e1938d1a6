//! Ping Client - sends a few frames of each delivery mode and prints echoes.
//!
//! This demo shows:
//! - Connecting with a reconnect policy
//! - Completion callbacks for NONE, SYNC and ASYNC sends
//! - JSON payloads
//! - Ordered shutdown with `Session::close`
//!
//! Start `echo_server` first, then:
//!
//! ```text
//! RUST_LOG=qtp=debug,info cargo run --example ping_client -- 127.0.0.1:7000
//! ```

use std::time::Duration;

use qtp::retry::RetryConfig;
use qtp::transport::ReconnectConfig;
use qtp::{AckMode, Encoding, Endpoint, Frame};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Serialize)]
struct Ping {
    n: u32,
    note: &'static str,
}

fn report(seq: u64, result: qtp::Result<()>) {
    match result {
        Ok(()) => tracing::info!(seq, "Delivered"),
        Err(e) => tracing::warn!(seq, "Not delivered: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7000".to_string());

    let session = Endpoint::builder()
        .reconnect(ReconnectConfig {
            max_attempts: 10,
            retry_delay: Duration::from_millis(500),
        })
        .retry(RetryConfig {
            attempts: 3,
            timeout: Duration::from_secs(2),
            interval: Duration::from_secs(1),
        })
        .on_no_ack(|_, frame: Frame| async move {
            tracing::info!(
                seq = frame.sequence(),
                "Echo: {}",
                String::from_utf8_lossy(frame.payload())
            );
            Ok(())
        })
        .on_conn_closed(|e| tracing::info!("Connection closed: {}", e))
        .connect(&addr)
        .await?;

    let sender = session.sender();
    sender.send_no_ack(&b"ping"[..], Encoding::Binary, report).await;
    for i in 0..3 {
        sender
            .send_sync_ack(format!("sync {}", i), Encoding::Binary, report)
            .await;
    }
    for i in 0..3 {
        sender
            .send_async_ack(format!("async {}", i), Encoding::Binary, report)
            .await;
    }
    sender
        .send_json(&Ping { n: 7, note: "json" }, AckMode::Sync, report)
        .await;

    // Leave time for the echoes before shutting down.
    tokio::time::sleep(Duration::from_secs(1)).await;
    tracing::info!(queued = sender.queued(), in_flight = sender.in_flight(), "Closing");
    session.close().await;

    Ok(())
}
