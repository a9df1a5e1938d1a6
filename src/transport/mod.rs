//! Transport module - byte-stream connections.
//!
//! Provides:
//! - [`Transport`] - the read/write/close seam the pipelines run on
//! - [`Connection`] - split-locked wrapper over any `AsyncRead + AsyncWrite`
//! - [`ReconnectPolicy`] - single-flight, bounded reconnection
//! - TCP dial/listen helpers
//!
//! Any [`Dialer`] producing an `AsyncRead + AsyncWrite` stream plugs in the
//! same way as [`TcpDialer`], e.g. a TLS client stream.

mod connection;
mod reconnect;
mod tcp;

pub use connection::Connection;
pub use reconnect::{Dialer, Reconnect, ReconnectConfig, ReconnectPolicy};
pub use tcp::{dial, listen, TcpDialer};

use crate::error::Result;
use crate::BoxFuture;

/// A shared, full-duplex byte stream.
///
/// Reads and writes may run concurrently from different tasks; concurrent
/// writes are serialized so each `write_all` lands contiguously.
pub trait Transport: Send + Sync + 'static {
    /// Read some bytes into `buf`. `Ok(0)` means end of stream.
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, Result<usize>>;

    /// Write the whole buffer.
    fn write_all<'a>(&'a self, buf: &'a [u8]) -> BoxFuture<'a, Result<()>>;

    /// Close the stream. Idempotent.
    fn close(&self) -> BoxFuture<'_, Result<()>>;

    /// Generation of the link the last successful `read` came from.
    ///
    /// Changes when a reconnect swaps the underlying stream. Bytes from
    /// different generations never belong to the same frame.
    fn read_generation(&self) -> u64 {
        0
    }
}
