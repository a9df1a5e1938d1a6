//! Accept loop for incoming sessions.
//!
//! Every accepted connection gets its own reader, writer, sender and
//! receiver, all sharing the endpoint's callbacks. Server-side connections
//! are never re-dialed; a lost peer ends its session.
//!
//! Accepted `TcpStream`s can be wrapped before the session starts, e.g. by a
//! TLS acceptor, through [`Server::accept_with`] and [`Server::run_with`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

use crate::config::QtpConfig;
use crate::error::{QtpError, Result};
use crate::handler::Callbacks;
use crate::sequence::SequenceGenerator;
use crate::session::Session;
use crate::transport::Connection;

/// Pause after a failed `accept` before the listener is polled again.
pub(crate) const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A bound listener producing [`Session`]s.
///
/// Created by [`EndpointBuilder::bind`](crate::EndpointBuilder::bind).
pub struct Server {
    listener: TcpListener,
    callbacks: Arc<Callbacks>,
    config: QtpConfig,
    sequences: Arc<dyn SequenceGenerator>,
}

impl Server {
    pub(crate) fn new(
        listener: TcpListener,
        callbacks: Arc<Callbacks>,
        config: QtpConfig,
        sequences: Arc<dyn SequenceGenerator>,
    ) -> Self {
        Self {
            listener,
            callbacks,
            config,
            sequences,
        }
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept one connection and start its session.
    pub async fn accept(&self) -> Result<Session> {
        let stream = self.accept_stream().await?;
        Ok(self.start(stream))
    }

    /// Accept one connection, pass it through `wrap`, then start its session.
    ///
    /// A failed `wrap` drops the connection and returns its error.
    pub async fn accept_with<W, Fut, S>(&self, wrap: W) -> Result<Session>
    where
        W: FnOnce(TcpStream) -> Fut,
        Fut: Future<Output = Result<S>>,
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let stream = self.accept_stream().await?;
        let stream = wrap(stream).await?;
        Ok(self.start(stream))
    }

    /// Accept connections until the task is dropped.
    ///
    /// Accept errors are logged and the loop continues after a 100 ms pause.
    pub async fn run(self) {
        self.run_with(|stream| async move { Ok::<_, QtpError>(stream) })
            .await
    }

    /// Like [`run`](Self::run), wrapping every accepted stream with `wrap`.
    ///
    /// Each `wrap` runs on its own task, so a slow handshake does not hold up
    /// the listener. A failed `wrap` is logged and only drops that connection.
    pub async fn run_with<W, Fut, S>(self, wrap: W)
    where
        W: Fn(TcpStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S>> + Send + 'static,
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if let Ok(addr) = self.local_addr() {
            tracing::info!("Listening on {}", addr);
        }
        let server = &self;
        let wrap = Arc::new(wrap);
        let wrap = &wrap;
        accept_loop(move || server.spawn_session(wrap)).await
    }

    async fn spawn_session<W, Fut, S>(&self, wrap: &Arc<W>) -> Result<()>
    where
        W: Fn(TcpStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S>> + Send + 'static,
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let stream = self.accept_stream().await?;
        let wrap = Arc::clone(wrap);
        let callbacks = Arc::clone(&self.callbacks);
        let config = self.config.clone();
        let sequences = Arc::clone(&self.sequences);

        tokio::spawn(async move {
            match (*wrap)(stream).await {
                Ok(stream) => {
                    Session::start(Arc::new(Connection::new(stream)), &config, callbacks, sequences);
                }
                Err(e) => tracing::warn!("Dropping connection: {}", e),
            }
        });
        Ok(())
    }

    async fn accept_stream(&self) -> Result<TcpStream> {
        let (stream, peer) = self.listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }
        tracing::info!("Accepted connection from {}", peer);
        Ok(stream)
    }

    fn start<S>(&self, stream: S) -> Session
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Session::start(
            Arc::new(Connection::new(stream)),
            &self.config,
            Arc::clone(&self.callbacks),
            Arc::clone(&self.sequences),
        )
    }
}

/// Drive `accept` forever, backing off after each failure.
async fn accept_loop<A, Fut>(mut accept: A)
where
    A: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    loop {
        if let Err(e) = accept().await {
            tracing::warn!("Accept failed: {}", e);
            tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("callbacks", &self.callbacks.len())
            .finish_non_exhaustive()
    }
}
