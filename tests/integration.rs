//! Integration tests for qtp.
//!
//! These tests drive whole sessions through the public API, over in-memory
//! duplex streams and localhost TCP.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use qtp::protocol::{
    build_frame, AckMode, Encoder, Encoding, FrameBuffer, FrameConfig, Header, MessageKind,
    Parser, HEADER_SIZE, MAGIC,
};
use qtp::retry::RetryConfig;
use qtp::sequence::Sequential;
use qtp::transport::{Connection, ReconnectConfig, Transport};
use qtp::writer::{spawn_writer, Completion, SendRequest, WriterConfig};
use qtp::{Endpoint, Frame, QtpError, Result, Sender};
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::{mpsc, oneshot};

type Outcomes = Arc<Mutex<Vec<(u64, Result<()>)>>>;

fn record(outcomes: &Outcomes) -> impl FnOnce(u64, Result<()>) + Send + 'static {
    let outcomes = Arc::clone(outcomes);
    move |seq, result| outcomes.lock().unwrap().push((seq, result))
}

async fn read_frame(stream: &mut DuplexStream) -> Frame {
    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header).await.unwrap();
    let parsed = Parser::new().parse_header(&header).unwrap();
    let mut payload = vec![0u8; parsed.payload_length as usize];
    stream.read_exact(&mut payload).await.unwrap();
    Frame::new(parsed, payload.into())
}

/// "ping" as BINARY / DATA / NONE is 27 bytes with the documented layout.
#[test]
fn test_ping_frame_bytes() {
    let encoder = Encoder::new(Arc::new(Sequential::starting_at(1)));
    let (seq, bytes) = encoder
        .encode(b"ping", FrameConfig::data(Encoding::Binary, AckMode::None))
        .unwrap();

    assert_eq!(seq, 1);
    assert_eq!(bytes.len(), 27);
    assert_eq!(&bytes[0..5], &MAGIC);
    assert_eq!(bytes[5], 1);
    assert_eq!(&bytes[6..14], &1u64.to_le_bytes());
    assert_eq!(bytes[14], 1);
    assert_eq!(bytes[15], 1);
    assert_eq!(bytes[16], 0);
    assert_eq!(&bytes[17..21], &[4, 0, 0, 0]);
    assert_eq!(&bytes[21..23], &[0, 0]);
    assert_eq!(&bytes[23..], b"ping");
}

/// Every encoding / ack mode combination survives a parse.
#[test]
fn test_encode_parse_all_configs() {
    let encoder = Encoder::new(Arc::new(Sequential::starting_at(500)));
    let mut all = Vec::new();
    let mut expected = Vec::new();

    for encoding in [Encoding::Json, Encoding::Binary] {
        for mode in [AckMode::None, AckMode::Sync, AckMode::Async] {
            let payload = format!("{:?}/{:?}", encoding, mode);
            let (seq, bytes) = encoder
                .encode(payload.as_bytes(), FrameConfig::data(encoding, mode))
                .unwrap();
            all.extend(bytes);
            expected.push((seq, encoding, mode, payload));
        }
    }

    let frames = Parser::new().parse_buffer(&all);
    assert_eq!(frames.len(), expected.len());
    for (frame, (seq, encoding, mode, payload)) in frames.into_iter().zip(expected) {
        let frame = frame.unwrap();
        assert_eq!(frame.sequence(), seq);
        assert_eq!(frame.encoding(), encoding);
        assert_eq!(frame.ack_mode(), mode);
        assert_eq!(frame.kind(), MessageKind::Data);
        assert_eq!(frame.payload(), payload.as_bytes());
    }
}

/// Garbage yields nothing; a flipped magic byte or a cut frame yields an error.
#[test]
fn test_parse_buffer_rejects_bad_input() {
    let parser = Parser::new();
    assert!(parser.parse_buffer(b"no frame in here at all").is_empty());

    let header = Header::new(3, FrameConfig::data(Encoding::Binary, AckMode::Sync), 5);
    let good = build_frame(&header, b"hello");

    let mut flipped = good.clone();
    flipped[1] ^= 0xff;
    assert!(matches!(parser.parse_header(&flipped), Err(QtpError::Protocol(_))));

    // The scan skips the damaged frame and still finds the intact one.
    let mut both = flipped;
    both.extend_from_slice(&good);
    let results = parser.parse_buffer(&both);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].as_ref().unwrap().sequence(), 3);

    let cut = &good[..good.len() - 2];
    let results = parser.parse_buffer(cut);
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], Err(QtpError::Truncated { .. })));

    let mut bad_version = good.clone();
    bad_version[5] = 9;
    assert!(matches!(
        parser.parse_header(&bad_version),
        Err(QtpError::Protocol(_))
    ));
}

/// Frames split at arbitrary points are reassembled.
#[test]
fn test_fragmented_frame_parsing() {
    let payload = br#"{"text":"test data for fragmentation"}"#;
    let header = Header::new(
        789,
        FrameConfig::data(Encoding::Json, AckMode::Async),
        payload.len() as u32,
    );
    let frame_bytes = build_frame(&header, payload);

    let mut buffer = FrameBuffer::default();

    assert!(buffer.push(&frame_bytes[..5]).unwrap().is_empty());
    assert!(buffer.push(&frame_bytes[5..HEADER_SIZE]).unwrap().is_empty());

    let mid = HEADER_SIZE + payload.len() / 2;
    assert!(buffer.push(&frame_bytes[HEADER_SIZE..mid]).unwrap().is_empty());

    let frames = buffer.push(&frame_bytes[mid..]).unwrap();
    assert_eq!(frames.len(), 1);

    let decoded: serde_json::Value = frames[0].json().unwrap();
    assert_eq!(decoded["text"], "test data for fragmentation");
}

/// Two SYNC frames with sequences 10 and 11 go out as DATA and are matched by their ACKs.
#[tokio::test]
async fn test_writer_matches_acks_by_sequence() {
    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let transport: Arc<dyn Transport> = Arc::new(Connection::new(local));
    let (writer, _task) = spawn_writer(transport, WriterConfig::default());
    let encoder = Encoder::new(Arc::new(Sequential::starting_at(10)));
    let outcomes: Outcomes = Arc::default();

    for payload in [&b"first"[..], &b"second"[..]] {
        let (seq, bytes) = encoder
            .encode(payload, FrameConfig::data(Encoding::Binary, AckMode::Sync))
            .unwrap();
        writer
            .submit(SendRequest::new(
                seq,
                bytes,
                AckMode::Sync,
                Completion::new(record(&outcomes)),
            ))
            .await;
    }

    let first = read_frame(&mut remote).await;
    let second = read_frame(&mut remote).await;
    assert_eq!((first.sequence(), first.kind()), (10, MessageKind::Data));
    assert_eq!((second.sequence(), second.kind()), (11, MessageKind::Data));

    assert!(writer.finish(second.sequence()));
    assert!(writer.finish(first.sequence()));
    writer.close().await;

    let mut outcomes = outcomes.lock().unwrap().drain(..).collect::<Vec<_>>();
    outcomes.sort_by_key(|(seq, _)| *seq);
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].0, 10);
    assert_eq!(outcomes[1].0, 11);
    assert!(outcomes.iter().all(|(_, r)| r.is_ok()));
}

/// An unacknowledged SYNC frame is resent `attempts` times, `interval` apart,
/// then fails exactly once.
#[tokio::test(start_paused = true)]
async fn test_unacked_sync_is_retried_then_fails() {
    let retry = RetryConfig {
        attempts: 3,
        timeout: Duration::from_secs(10),
        interval: Duration::from_secs(2),
    };
    let (local, mut remote) = tokio::io::duplex(64 * 1024);
    let session = Endpoint::builder()
        .retry(retry)
        .sequences(Arc::new(Sequential::starting_at(1)))
        .attach(local);

    let outcomes: Outcomes = Arc::default();
    let start = tokio::time::Instant::now();
    session
        .sender()
        .send_sync_ack(&b"anyone?"[..], Encoding::Binary, record(&outcomes))
        .await;

    let original = read_frame(&mut remote).await;
    assert_eq!(original.kind(), MessageKind::Data);

    let mut resent_at = Vec::new();
    for _ in 0..retry.attempts {
        let frame = read_frame(&mut remote).await;
        assert_eq!(frame.kind(), MessageKind::Retry);
        assert_eq!(frame.sequence(), original.sequence());
        assert_eq!(frame.payload(), b"anyone?");
        resent_at.push(start.elapsed());
    }
    assert_eq!(
        resent_at,
        vec![
            Duration::from_secs(10),
            Duration::from_secs(12),
            Duration::from_secs(14)
        ]
    );

    session.close().await;
    let outcomes = outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(
        outcomes[0].1,
        Err(QtpError::DeliveryFailed { seq: 1, attempts: 3 })
    ));
}

/// Closing the sender after K SYNC sends returns only once all K callbacks fired.
#[tokio::test]
async fn test_close_after_sync_sends_settles_all() {
    const K: u64 = 5;

    let (a, b) = tokio::io::duplex(64 * 1024);
    let _server = Endpoint::builder()
        .on_sync_ack(|_: Sender, _: Frame| async { Ok(()) })
        .attach(a);
    let client = Endpoint::builder()
        .sequences(Arc::new(Sequential::starting_at(1)))
        .attach(b);

    let outcomes: Outcomes = Arc::default();
    for i in 0..K {
        client
            .sender()
            .send_sync_ack(i.to_le_bytes().to_vec(), Encoding::Binary, record(&outcomes))
            .await;
    }
    client.sender().close().await;

    let outcomes = outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), K as usize);
    let seqs: Vec<u64> = outcomes.iter().map(|(seq, _)| *seq).collect();
    assert_eq!(seqs, (1..=K).collect::<Vec<_>>());
    assert!(outcomes.iter().all(|(_, r)| r.is_ok()));
}

/// JSON request over TCP, answered by the server through its own sender.
#[tokio::test]
async fn test_tcp_json_echo() {
    #[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq)]
    struct Echo {
        id: u32,
        message: String,
    }

    let server = Endpoint::builder()
        .on_json(AckMode::Sync, |sender: Sender, echo: Echo| async move {
            sender
                .send_json(&echo, AckMode::None, |_, _| {})
                .await;
            Ok(())
        })
        .bind("127.0.0.1:0")
        .await
        .unwrap();
    let addr = server.local_addr().unwrap().to_string();
    let server_task = tokio::spawn(server.run());

    let (reply_tx, mut replies) = mpsc::unbounded_channel();
    let client = Endpoint::builder()
        .on_no_ack(move |_, frame: Frame| {
            let reply_tx = reply_tx.clone();
            async move {
                let _ = reply_tx.send(frame.json::<Echo>()?);
                Ok(())
            }
        })
        .connect(&addr)
        .await
        .unwrap();

    let request = Echo {
        id: 42,
        message: "Hello, world!".to_string(),
    };
    let (acked_tx, acked) = oneshot::channel();
    client
        .sender()
        .send_json(&request, AckMode::Sync, move |_, result| {
            let _ = acked_tx.send(result.is_ok());
        })
        .await;

    assert!(acked.await.unwrap());
    assert_eq!(replies.recv().await.unwrap(), request);

    client.close().await;
    server_task.abort();
}

/// A client whose peer drops the link re-dials and keeps working.
#[tokio::test]
async fn test_client_reconnects_after_server_drop() {
    let server = Endpoint::builder()
        .on_sync_ack(|_: Sender, _: Frame| async { Ok(()) })
        .bind("127.0.0.1:0")
        .await
        .unwrap();
    let addr = server.local_addr().unwrap().to_string();

    let lost = Arc::new(Mutex::new(0));
    let lost_count = Arc::clone(&lost);
    let client = Endpoint::builder()
        .reconnect(ReconnectConfig {
            max_attempts: 5,
            retry_delay: Duration::from_millis(20),
        })
        .on_conn_closed(move |_| *lost_count.lock().unwrap() += 1)
        .connect(&addr)
        .await
        .unwrap();

    let first = server.accept().await.unwrap();
    first.close().await;

    let second = server.accept().await.unwrap();

    let (acked_tx, acked) = oneshot::channel();
    client
        .sender()
        .send_sync_ack(&b"still there?"[..], Encoding::Binary, move |_, result| {
            let _ = acked_tx.send(result);
        })
        .await;
    assert!(acked.await.unwrap().is_ok());
    assert_eq!(*lost.lock().unwrap(), 0);

    client.close().await;
    second.closed().await;
    assert_eq!(*lost.lock().unwrap(), 1);
}

/// Reconnection that keeps failing gives up and ends the session.
#[tokio::test]
async fn test_reconnect_exhaustion_ends_session() {
    let server = Endpoint::builder().bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap().to_string();

    let (error_tx, error_rx) = oneshot::channel();
    let error_tx = Mutex::new(Some(error_tx));
    let client = Endpoint::builder()
        .reconnect(ReconnectConfig {
            max_attempts: 2,
            retry_delay: Duration::from_millis(10),
        })
        .on_conn_closed(move |e| {
            if let Some(tx) = error_tx.lock().unwrap().take() {
                let _ = tx.send(e.to_string());
            }
        })
        .connect(&addr)
        .await
        .unwrap();

    let accepted = server.accept().await.unwrap();
    drop(server);
    accepted.close().await;

    client.closed().await;
    let reason = error_rx.await.unwrap();
    assert!(reason.contains("Reconnect failed after 2 attempts"), "{}", reason);
    assert!(!client.sender().is_accepting());
}
