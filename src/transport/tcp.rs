//! TCP dial and listen helpers.
//!
//! # Example
//!
//! ```ignore
//! use qtp::transport::{dial, listen};
//!
//! let listener = listen("127.0.0.1:0").await?;
//! let addr = listener.local_addr()?;
//! let stream = dial(&addr.to_string()).await?;
//! ```

use tokio::net::{TcpListener, TcpStream};

use super::reconnect::Dialer;
use crate::error::{QtpError, Result};
use crate::BoxFuture;

/// Open a TCP connection with Nagle's algorithm disabled.
pub async fn dial(addr: &str) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| QtpError::from(e).context(format!("Failed to dial {}", addr)))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Bind a TCP listener.
pub async fn listen(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| QtpError::from(e).context(format!("Failed to listen on {}", addr)))
}

/// Re-dials a fixed TCP address.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    addr: String,
}

impl TcpDialer {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    #[inline]
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl Dialer<TcpStream> for TcpDialer {
    fn dial(&self) -> BoxFuture<'_, Result<TcpStream>> {
        Box::pin(dial(&self.addr))
    }
}
