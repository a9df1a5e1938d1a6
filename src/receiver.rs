//! Inbound dispatch: runs application callbacks and acknowledges frames.
//!
//! | Ack mode | Callbacks                          | ACK sent                 |
//! |----------|------------------------------------|--------------------------|
//! | NONE     | spawned, receive loop continues    | never                    |
//! | SYNC     | awaited in order inside the loop   | after the callbacks      |
//! | ASYNC    | spawned, receive loop continues    | after the callbacks      |
//!
//! When the reader reports its terminal error the receiver dispatches what is
//! still queued, waits for spawned callbacks, closes the writer and runs the
//! connection-closed callbacks once.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::QtpError;
use crate::handler::{Callbacks, FrameHandler};
use crate::protocol::{AckMode, Encoder, Frame, FrameConfig};
use crate::sender::Sender;
use crate::task_group::TaskGroup;
use crate::writer::{Completion, SendRequest, WriterHandle};

/// Everything the receive loop and its spawned dispatch tasks share.
#[derive(Clone)]
struct Dispatcher {
    callbacks: Arc<Callbacks>,
    sender: Sender,
    writer: WriterHandle,
    encoder: Encoder,
}

/// Spawn the receiver task.
///
/// The task resolves to the reader's terminal error once shutdown is complete.
pub(crate) fn spawn_receiver(
    callbacks: Arc<Callbacks>,
    sender: Sender,
    writer: WriterHandle,
    encoder: Encoder,
    data: mpsc::Receiver<Frame>,
    failure: oneshot::Receiver<QtpError>,
) -> JoinHandle<QtpError> {
    let dispatcher = Dispatcher {
        callbacks,
        sender,
        writer,
        encoder,
    };
    tokio::spawn(receive_loop(dispatcher, data, failure))
}

async fn receive_loop(
    dispatcher: Dispatcher,
    mut data: mpsc::Receiver<Frame>,
    mut failure: oneshot::Receiver<QtpError>,
) -> QtpError {
    let dispatch = TaskGroup::new("dispatch");

    for handler in dispatcher.callbacks.init_handlers() {
        handler.call(dispatcher.sender.clone()).await;
    }
    tracing::debug!("Receiver started");

    let reported = loop {
        tokio::select! {
            biased;
            frame = data.recv() => match frame {
                Some(frame) => dispatcher.handle(frame, &dispatch).await,
                None => break None,
            },
            error = &mut failure => break Some(error),
        }
    };
    // The data queue closes before the reader reports its error.
    let reported = match reported {
        Some(reported) => reported,
        None => failure.await,
    };
    let error = reported.unwrap_or(QtpError::ConnectionClosed);

    while let Ok(frame) = data.try_recv() {
        dispatcher.handle(frame, &dispatch).await;
    }
    dispatch.wait().await;
    dispatcher.writer.close().await;

    tracing::info!("Connection lost: {}", error);
    for handler in dispatcher.callbacks.closed_handlers() {
        handler(&error);
    }
    error
}

impl Dispatcher {
    async fn handle(&self, frame: Frame, dispatch: &TaskGroup) {
        let mode = frame.ack_mode();
        let handlers = self.callbacks.frame_handlers(mode);
        tracing::debug!(seq = frame.sequence(), ?mode, retry = frame.is_retry(), "Dispatching frame");

        match mode {
            AckMode::None => {
                let sender = self.sender.clone();
                dispatch.spawn(async move {
                    run_handlers(&handlers, &sender, frame).await;
                });
            }
            AckMode::Sync => {
                let seq = frame.sequence();
                run_handlers(&handlers, &self.sender, frame).await;
                self.acknowledge(seq).await;
            }
            AckMode::Async => {
                let this = self.clone();
                dispatch.spawn(async move {
                    let seq = frame.sequence();
                    run_handlers(&handlers, &this.sender, frame).await;
                    this.acknowledge(seq).await;
                });
            }
        }
    }

    /// Queue an ACK frame echoing `seq`.
    async fn acknowledge(&self, seq: u64) {
        let frame = match self.encoder.encode_with_sequence(seq, &[], FrameConfig::ack()) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(seq, "Failed to encode ACK: {}", e);
                return;
            }
        };
        let completion = Completion::new(|seq, result| {
            if let Err(e) = result {
                tracing::warn!(seq, "Failed to write ACK: {}", e);
            }
        });
        self.writer
            .submit(SendRequest::new(seq, frame, AckMode::None, completion))
            .await;
    }
}

async fn run_handlers(handlers: &[Arc<dyn FrameHandler>], sender: &Sender, frame: Frame) {
    let seq = frame.sequence();
    for handler in handlers {
        if let Err(e) = handler.call(sender.clone(), frame.clone()).await {
            tracing::warn!(seq, "Callback failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_frame, Encoding, Header, MessageKind, Parser, HEADER_SIZE};
    use crate::sender::SenderConfig;
    use crate::sequence::Sequential;
    use crate::transport::{Connection, Transport};
    use crate::writer::{spawn_writer, WriterConfig};
    use bytes::Bytes;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, DuplexStream};

    struct Harness {
        data: mpsc::Sender<Frame>,
        failure: oneshot::Sender<QtpError>,
        remote: DuplexStream,
        task: JoinHandle<QtpError>,
    }

    fn harness(callbacks: Callbacks) -> Harness {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let transport: Arc<dyn Transport> = Arc::new(Connection::new(local));
        let (writer, _writer_task) = spawn_writer(Arc::clone(&transport), WriterConfig::default());
        let encoder = Encoder::new(Arc::new(Sequential::starting_at(100)));
        let (_acks_tx, acks) = mpsc::channel(1);
        let sender = Sender::start(
            transport,
            writer.clone(),
            acks,
            encoder.clone(),
            SenderConfig::default(),
        );

        let (data, data_rx) = mpsc::channel(16);
        let (failure, failure_rx) = oneshot::channel();
        let task = spawn_receiver(
            Arc::new(callbacks),
            sender,
            writer,
            encoder,
            data_rx,
            failure_rx,
        );
        Harness {
            data,
            failure,
            remote,
            task,
        }
    }

    fn data_frame(seq: u64, mode: AckMode, payload: &'static [u8]) -> Frame {
        let config = FrameConfig::data(Encoding::Binary, mode);
        Frame::new(
            Header::new(seq, config, payload.len() as u32),
            Bytes::from_static(payload),
        )
    }

    async fn read_ack(remote: &mut DuplexStream) -> Frame {
        let mut buf = [0u8; HEADER_SIZE];
        remote.read_exact(&mut buf).await.unwrap();
        Parser::new().parse_buffer(&buf).remove(0).unwrap()
    }

    #[tokio::test]
    async fn test_sync_frame_acked_after_callbacks() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut callbacks = Callbacks::new();
        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            callbacks.on_sync_ack(move |_, frame: Frame| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().unwrap().push((tag, frame.sequence()));
                    Ok(())
                }
            });
        }
        let mut h = harness(callbacks);

        h.data.send(data_frame(42, AckMode::Sync, b"hi")).await.unwrap();
        let ack = read_ack(&mut h.remote).await;

        assert_eq!(ack.kind(), MessageKind::Ack);
        assert_eq!(ack.sequence(), 42);
        assert_eq!(ack.ack_mode(), AckMode::None);
        assert_eq!(ack.encoding(), Encoding::Binary);
        assert_eq!(ack.payload_len(), 0);
        assert_eq!(*seen.lock().unwrap(), vec![("first", 42), ("second", 42)]);
    }

    #[tokio::test]
    async fn test_async_frame_acked() {
        let mut callbacks = Callbacks::new();
        callbacks.on_async_ack(|_, _| async { Ok(()) });
        let mut h = harness(callbacks);

        h.data.send(data_frame(7, AckMode::Async, b"x")).await.unwrap();
        let ack = read_ack(&mut h.remote).await;
        assert_eq!(ack.sequence(), 7);
    }

    #[tokio::test]
    async fn test_failing_callback_still_acked() {
        let mut callbacks = Callbacks::new();
        callbacks.on_sync_ack(|_, _| async { Err(QtpError::Protocol("bad input".into())) });
        let mut h = harness(callbacks);

        h.data.send(data_frame(5, AckMode::Sync, b"x")).await.unwrap();
        assert_eq!(read_ack(&mut h.remote).await.sequence(), 5);
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_reports_once() {
        let handled = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(Vec::new()));
        let inits = Arc::new(Mutex::new(0));

        let mut callbacks = Callbacks::new();
        {
            let handled = Arc::clone(&handled);
            callbacks.on_no_ack(move |_, frame: Frame| {
                let handled = Arc::clone(&handled);
                async move {
                    handled.lock().unwrap().push(frame.sequence());
                    Ok(())
                }
            });
        }
        {
            let closed = Arc::clone(&closed);
            callbacks.on_conn_closed(move |e| closed.lock().unwrap().push(e.to_string()));
        }
        {
            let inits = Arc::clone(&inits);
            callbacks.on_conn_init(move |_| {
                let inits = Arc::clone(&inits);
                async move { *inits.lock().unwrap() += 1 }
            });
        }
        let h = harness(callbacks);

        for seq in 1..=3 {
            h.data.send(data_frame(seq, AckMode::None, b"n")).await.unwrap();
        }
        h.failure.send(QtpError::ConnectionClosed).unwrap();
        let error = h.task.await.unwrap();

        assert!(matches!(error, QtpError::ConnectionClosed));
        let mut handled = handled.lock().unwrap().clone();
        handled.sort_unstable();
        assert_eq!(handled, vec![1, 2, 3]);
        assert_eq!(*closed.lock().unwrap(), vec!["Connection closed".to_string()]);
        assert_eq!(*inits.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_no_ack_frame_not_acked() {
        let mut h = harness(Callbacks::new());

        h.data.send(data_frame(1, AckMode::None, b"n")).await.unwrap();
        h.data.send(data_frame(2, AckMode::Sync, b"s")).await.unwrap();

        // The only ACK on the wire is for the SYNC frame.
        assert_eq!(read_ack(&mut h.remote).await.sequence(), 2);
        drop(h.data);
        drop(h.failure);
        assert!(matches!(h.task.await.unwrap(), QtpError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_retry_frame_dispatched_by_mode() {
        let mut callbacks = Callbacks::new();
        callbacks.on_sync_ack(|_, frame: Frame| async move {
            assert!(frame.is_retry());
            Ok(())
        });
        let mut h = harness(callbacks);

        let mut header = Header::new(9, FrameConfig::data(Encoding::Binary, AckMode::Sync), 1);
        header.kind = MessageKind::Retry;
        let bytes = build_frame(&header, b"r");
        let frame = Parser::new().parse_buffer(&bytes).remove(0).unwrap();

        h.data.send(frame).await.unwrap();
        assert_eq!(read_ack(&mut h.remote).await.sequence(), 9);
    }
}
