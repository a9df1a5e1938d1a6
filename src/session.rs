//! One running connection: reader, writer, sender and receiver wired together.

use std::sync::Arc;

use crate::config::QtpConfig;
use crate::handler::Callbacks;
use crate::protocol::{Encoder, Parser};
use crate::reader::spawn_reader;
use crate::receiver::spawn_receiver;
use crate::sender::Sender;
use crate::sequence::SequenceGenerator;
use crate::task_group::TaskGroup;
use crate::transport::Transport;
use crate::writer::spawn_writer;

/// Handle to a running connection.
///
/// Dropping the handle does not stop the connection; use
/// [`close`](Self::close) for that.
#[derive(Debug, Clone)]
pub struct Session {
    sender: Sender,
    running: TaskGroup,
}

impl Session {
    /// Start every pipeline task for `transport`.
    ///
    /// The session ends when the reader stops, after which the sender is
    /// closed in order and the connection-closed callbacks have run.
    pub fn start(
        transport: Arc<dyn Transport>,
        config: &QtpConfig,
        callbacks: Arc<Callbacks>,
        sequences: Arc<dyn SequenceGenerator>,
    ) -> Self {
        let encoder = Encoder::new(sequences);
        let (inbound, _reader_task) =
            spawn_reader(Arc::clone(&transport), Parser::new(), config.reader);
        let (writer, _writer_task) = spawn_writer(Arc::clone(&transport), config.writer);
        let sender = Sender::start(
            transport,
            writer.clone(),
            inbound.acks,
            encoder.clone(),
            config.sender,
        );
        let receiver = spawn_receiver(
            callbacks,
            sender.clone(),
            writer,
            encoder,
            inbound.data,
            inbound.failure,
        );

        let running = TaskGroup::new("session");
        let closing = sender.clone();
        running.spawn(async move {
            if let Err(e) = receiver.await {
                tracing::error!("Receiver task failed: {}", e);
            }
            closing.close().await;
            tracing::debug!("Session finished");
        });

        Self { sender, running }
    }

    /// Sender for this connection.
    #[inline]
    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    /// Whether the session has shut down.
    pub fn is_finished(&self) -> bool {
        self.running.count() == 0
    }

    /// Wait until the connection is lost and shutdown has completed.
    pub async fn closed(&self) {
        self.running.wait().await;
    }

    /// Close the connection and wait for shutdown to complete.
    pub async fn close(&self) {
        self.sender.close().await;
        self.closed().await;
    }
}
