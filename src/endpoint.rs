//! Endpoint builder.
//!
//! The [`EndpointBuilder`] collects callbacks and configuration once, then
//! opens sessions as a client ([`connect`](EndpointBuilder::connect)) or
//! accepts them as a server ([`bind`](EndpointBuilder::bind)).
//!
//! # Example
//!
//! ```ignore
//! use qtp::{Encoding, Endpoint};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = Endpoint::builder()
//!         .on_no_ack(|_sender, frame| async move {
//!             println!("got {} bytes", frame.payload_len());
//!             Ok(())
//!         })
//!         .on_conn_closed(|err| eprintln!("lost connection: {}", err))
//!         .connect("127.0.0.1:7000")
//!         .await?;
//!
//!     session
//!         .sender()
//!         .send_sync_ack(&b"ping"[..], Encoding::Binary, |seq, result| {
//!             println!("{} -> {:?}", seq, result);
//!         })
//!         .await;
//!
//!     session.closed().await;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::QtpConfig;
use crate::error::{QtpError, Result};
use crate::handler::{Callbacks, HandlerResult};
use crate::protocol::{AckMode, Frame};
use crate::retry::RetryConfig;
use crate::sender::Sender;
use crate::sequence::{SequenceGenerator, Snowflake};
use crate::server::Server;
use crate::session::Session;
use crate::transport::{self, Connection, Dialer, ReconnectConfig, ReconnectPolicy, TcpDialer};

/// Namespace for [`Endpoint::builder`].
pub struct Endpoint;

impl Endpoint {
    /// Create a new endpoint builder.
    pub fn builder() -> EndpointBuilder {
        EndpointBuilder::new()
    }
}

/// Builder for client sessions and servers.
pub struct EndpointBuilder {
    callbacks: Callbacks,
    config: QtpConfig,
    sequences: Option<Arc<dyn SequenceGenerator>>,
}

impl EndpointBuilder {
    /// Create a new endpoint builder.
    pub fn new() -> Self {
        Self {
            callbacks: Callbacks::new(),
            config: QtpConfig::default(),
            sequences: None,
        }
    }

    /// Register a callback for frames sent without acknowledgment.
    pub fn on_no_ack<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Sender, Frame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.callbacks.on_no_ack(handler);
        self
    }

    /// Register a callback for SYNC frames.
    ///
    /// SYNC callbacks run one frame at a time; the ACK goes out after the
    /// last callback returns.
    pub fn on_sync_ack<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Sender, Frame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.callbacks.on_sync_ack(handler);
        self
    }

    /// Register a callback for ASYNC frames.
    pub fn on_async_ack<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Sender, Frame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.callbacks.on_async_ack(handler);
        self
    }

    /// Register a callback receiving JSON payloads decoded into `T`.
    pub fn on_json<F, T, Fut>(mut self, mode: AckMode, handler: F) -> Self
    where
        F: Fn(Sender, T) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.callbacks.on_json(mode, handler);
        self
    }

    /// Register a callback run when a session starts.
    pub fn on_conn_init<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Sender) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.callbacks.on_conn_init(handler);
        self
    }

    /// Register a callback run when a session's connection is lost.
    pub fn on_conn_closed<F>(mut self, handler: F) -> Self
    where
        F: Fn(&QtpError) + Send + Sync + 'static,
    {
        self.callbacks.on_conn_closed(handler);
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: QtpConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the client reconnect policy.
    ///
    /// Default: 5 attempts, 2 seconds apart
    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.config.reconnect = reconnect;
        self
    }

    /// Set redelivery timing for SYNC/ASYNC frames.
    ///
    /// Default: 3 attempts, 10 second timeout, 2 second interval
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.writer.retry = retry;
        self
    }

    /// Use a custom sequence number source instead of a [`Snowflake`].
    pub fn sequences(mut self, sequences: Arc<dyn SequenceGenerator>) -> Self {
        self.sequences = Some(sequences);
        self
    }

    /// Dial `addr` over TCP and start a session.
    ///
    /// A broken link is re-dialed to the same address by the reconnect policy.
    pub async fn connect(self, addr: &str) -> Result<Session> {
        let stream = transport::dial(addr).await?;
        tracing::info!("Connected to {}", addr);
        Ok(self.connect_with(stream, TcpDialer::new(addr)))
    }

    /// Start a session on an established stream, re-dialing with `dialer`.
    ///
    /// Any stream type works, e.g. a TLS client stream paired with a dialer
    /// that performs the handshake.
    pub fn connect_with<S, D>(self, stream: S, dialer: D) -> Session
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        D: Dialer<S>,
    {
        let policy = ReconnectPolicy::new(dialer, self.config.reconnect);
        self.start(Arc::new(Connection::with_reconnect(stream, policy)))
    }

    /// Start a session on an established stream without reconnection.
    pub fn attach<S>(self, stream: S) -> Session
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.start(Arc::new(Connection::new(stream)))
    }

    /// Listen on `addr` for incoming sessions.
    pub async fn bind(self, addr: &str) -> Result<Server> {
        let listener = transport::listen(addr).await?;
        let (callbacks, config, sequences) = self.into_parts();
        Ok(Server::new(listener, callbacks, config, sequences))
    }

    fn start(self, link: Arc<dyn transport::Transport>) -> Session {
        let (callbacks, config, sequences) = self.into_parts();
        Session::start(link, &config, callbacks, sequences)
    }

    fn into_parts(self) -> (Arc<Callbacks>, QtpConfig, Arc<dyn SequenceGenerator>) {
        let sequences = self
            .sequences
            .unwrap_or_else(|| Arc::new(Snowflake::new()));
        (Arc::new(self.callbacks), self.config, sequences)
    }
}

impl Default for EndpointBuilder {
    fn default() -> Self {
        Self::new()
    }
}
