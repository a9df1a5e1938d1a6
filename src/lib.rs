//! # qtp
//!
//! Reliable messaging transport over raw byte streams.
//!
//! Payloads are wrapped in a fixed 23-byte header and sent with one of three
//! delivery guarantees:
//!
//! - **NONE** - fire and forget
//! - **SYNC** - acknowledged; SYNC sends of one sender go out one at a time
//! - **ASYNC** - acknowledged; sends are not held back
//!
//! Unacknowledged frames are resent as RETRY frames on timeout, and a broken
//! client connection is re-dialed while in-flight reads and writes wait.
//!
//! ## Architecture
//!
//! ```text
//!            ┌──────────── Session ─────────────────────────────┐
//! bytes ───► │ Reader ─► data ─► Receiver ─► callbacks ─┐       │
//!            │        └► acks ─► Sender ack matcher     │ ACK   │
//!            │ send_*() ─► Sender ─► Writer ◄───────────┘       │ ───► bytes
//!            │                         └─► retry lifecycles     │
//!            └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use qtp::{Encoding, Endpoint};
//!
//! #[tokio::main]
//! async fn main() -> qtp::Result<()> {
//!     let server = Endpoint::builder()
//!         .on_sync_ack(|sender, frame| async move {
//!             sender.send_no_ack(frame.payload_bytes(), frame.encoding(), |_, _| {}).await;
//!             Ok(())
//!         })
//!         .bind("127.0.0.1:7000")
//!         .await?;
//!
//!     server.run().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod reader;
pub mod retry;
pub mod sender;
pub mod sequence;
pub mod task_group;
pub mod transport;
pub mod writer;

mod endpoint;
mod receiver;
mod server;
mod session;

pub use config::QtpConfig;
pub use endpoint::{Endpoint, EndpointBuilder};
pub use error::{QtpError, Result};
pub use handler::{BoxFuture, Callback, Callbacks};
pub use protocol::{AckMode, Encoding, Frame, MessageKind};
pub use sender::Sender;
pub use server::Server;
pub use session::Session;
