//! Integration tests for streamwire.
//!
//! Two connections talk over an in-memory duplex pipe, or one connection
//! talks to raw bytes written by the test.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::broadcast;
use tokio::time::timeout;

use streamwire::codec::{CompressionRegistry, SerializationRegistry, GZIP, IDENTITY};
use streamwire::protocol::{Frame, FrameBuffer, FrameType, HEADER_SIZE};
use streamwire::{
    ret, CallContext, CallOptions, CodecRegistry, Connection, ResetOrigin, Result, Role,
    Serialization, ServiceRegistry, StreamEvent, StreamReceiver, StreamSender, StreamwireError,
    Termination,
};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone, PartialEq, prost::Message, serde::Serialize, serde::Deserialize)]
struct Echo {
    #[prost(string, tag = "1")]
    text: String,
    #[prost(uint32, tag = "2")]
    seq: u32,
}

fn echo(text: &str, seq: u32) -> Echo {
    Echo {
        text: text.to_string(),
        seq,
    }
}

// Handlers

async fn unary_echo(_ctx: CallContext, req: Echo) -> Result<Echo> {
    Ok(echo(&format!("echo: {}", req.text), req.seq + 1))
}

async fn unary_codec(ctx: CallContext, _req: Echo) -> Result<Echo> {
    Ok(echo(ctx.serialization().as_str(), ctx.content_encoding() as u32))
}

async fn unary_denied(_ctx: CallContext, _req: Echo) -> Result<Echo> {
    Err(StreamwireError::Rpc {
        ret: 1001,
        msg: "denied".to_string(),
    })
}

async fn unary_slow(_ctx: CallContext, req: Echo) -> Result<Echo> {
    tokio::time::sleep(Duration::from_secs(30)).await;
    Ok(req)
}

async fn unary_empty(_ctx: CallContext, _req: Echo) -> Result<Echo> {
    Ok(Echo::default())
}

async fn unary_panic(_ctx: CallContext, _req: Echo) -> Result<Echo> {
    panic!("handler bug");
}

async fn sum(_ctx: CallContext, mut rx: StreamReceiver<Echo>) -> Result<Echo> {
    let mut count = 0;
    let mut total = 0;
    while let Some(msg) = rx.recv().await? {
        count += 1;
        total += msg.seq;
    }
    Ok(echo(&format!("{} messages", count), total))
}

async fn countdown(_ctx: CallContext, req: Echo, mut tx: StreamSender<Echo>) -> Result<()> {
    for seq in 0..req.seq {
        tx.send(&echo(&req.text, seq)).await?;
    }
    Ok(())
}

async fn stall(_ctx: CallContext, _req: Echo, _tx: StreamSender<Echo>) -> Result<()> {
    tokio::time::sleep(Duration::from_secs(30)).await;
    Ok(())
}

async fn bidi_echo(_ctx: CallContext, mut rx: StreamReceiver<Echo>, mut tx: StreamSender<Echo>) -> Result<()> {
    while let Some(msg) = rx.recv().await? {
        tx.send(&msg).await?;
    }
    Ok(())
}

async fn bidi_idle(_ctx: CallContext, rx: StreamReceiver<Echo>, _tx: StreamSender<Echo>) -> Result<()> {
    let _rx = rx;
    tokio::time::sleep(Duration::from_secs(30)).await;
    Ok(())
}

fn echo_services() -> ServiceRegistry {
    let mut services = ServiceRegistry::new();
    services
        .register_unary("/echo/Unary", unary_echo)
        .register_unary("/echo/Codec", unary_codec)
        .register_unary("/echo/Denied", unary_denied)
        .register_unary("/echo/Slow", unary_slow)
        .register_unary("/echo/Empty", unary_empty)
        .register_unary("/echo/Panic", unary_panic)
        .register_client_streaming("/echo/Sum", sum)
        .register_server_streaming("/echo/Countdown", countdown)
        .register_server_streaming("/echo/Stall", stall)
        .register_bidi("/echo/Bidi", bidi_echo)
        .register_bidi("/echo/Idle", bidi_idle);
    services
}

fn pair() -> (Connection, Connection) {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let server = Connection::builder()
        .server()
        .services(echo_services())
        .build(server_io)
        .unwrap();
    let client = Connection::builder().build(client_io).unwrap();
    (client, server)
}

async fn next_event(events: &mut broadcast::Receiver<StreamEvent>) -> StreamEvent {
    timeout(WAIT, events.recv()).await.unwrap().unwrap()
}

/// Read raw bytes until one whole frame has arrived.
async fn read_frame(raw: &mut DuplexStream, frames: &mut FrameBuffer) -> Frame {
    let mut buf = [0u8; 4096];
    loop {
        let n = timeout(WAIT, raw.read(&mut buf)).await.unwrap().unwrap();
        assert!(n > 0, "peer closed before a frame arrived");
        if let Some(frame) = frames.push(&buf[..n]).unwrap().into_iter().next() {
            return frame.unwrap();
        }
    }
}

#[tokio::test]
async fn test_unary_round_trip() {
    let (client, server) = pair();

    let reply: Echo = client
        .unary(CallOptions::new("/echo/Unary"), &echo("hello", 1))
        .await
        .unwrap();

    assert_eq!(reply, echo("echo: hello", 2));
    assert_eq!(client.live_streams(), 0);
    assert_eq!(server.live_streams(), 0);
}

#[tokio::test]
async fn test_client_streaming_sums_requests() {
    let (client, _server) = pair();

    let mut call = client
        .client_streaming::<Echo, Echo>(CallOptions::new("/echo/Sum"))
        .await
        .unwrap();
    for seq in 1..=5 {
        call.send(&echo("n", seq)).await.unwrap();
    }
    let reply = call.finish().await.unwrap();

    assert_eq!(reply, echo("5 messages", 15));
}

#[tokio::test]
async fn test_server_streaming_delivers_in_order() {
    let (client, _server) = pair();

    let mut rx = client
        .server_streaming::<Echo, Echo>(CallOptions::new("/echo/Countdown"), &echo("tick", 10))
        .await
        .unwrap();

    let mut seen = Vec::new();
    while let Some(msg) = rx.recv().await.unwrap() {
        seen.push(msg.seq);
    }
    assert_eq!(seen, (0..10).collect::<Vec<_>>());
    assert!(rx.termination().unwrap().is_success());
}

#[tokio::test]
async fn test_bidi_echo_then_close() {
    let (client, _server) = pair();

    let (mut tx, mut rx) = client
        .bidi::<Echo, Echo>(CallOptions::new("/echo/Bidi"))
        .await
        .unwrap();
    for seq in 0..3 {
        tx.send(&echo("ping", seq)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Some(echo("ping", seq)));
    }
    tx.close().await.unwrap();

    assert_eq!(rx.recv().await.unwrap(), None);
    assert_eq!(
        rx.termination(),
        Some(Termination::Closed {
            ret: ret::SUCCESS,
            msg: String::new()
        })
    );
}

#[tokio::test]
async fn test_small_window_is_replenished_by_feedback() {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let server = Connection::builder()
        .server()
        .services(echo_services())
        .build(server_io)
        .unwrap();
    let client = Connection::builder()
        .init_window_size(100)
        .build(client_io)
        .unwrap();
    let mut server_events = server.subscribe();

    let text = "x".repeat(20);
    let mut rx = client
        .server_streaming::<Echo, Echo>(CallOptions::new("/echo/Countdown"), &echo(&text, 50))
        .await
        .unwrap();
    let mut count = 0;
    while let Some(msg) = rx.recv().await.unwrap() {
        assert_eq!(msg.seq, count);
        count += 1;
    }
    assert_eq!(count, 50);

    let mut feedback = 0;
    while let Ok(event) = server_events.try_recv() {
        if matches!(event, StreamEvent::Feedback { .. }) {
            feedback += 1;
        }
    }
    assert!(feedback > 0);
}

#[tokio::test]
async fn test_reset_one_stream_leaves_other_untouched() {
    let (client, _server) = pair();

    let (x_tx, mut x_rx) = client
        .bidi::<Echo, Echo>(CallOptions::new("/echo/Bidi"))
        .await
        .unwrap();
    let (mut y_tx, mut y_rx) = client
        .bidi::<Echo, Echo>(CallOptions::new("/echo/Bidi"))
        .await
        .unwrap();
    assert_eq!(client.stream_ids(), vec![1, 3]);

    x_tx.cancel().await;
    assert!(matches!(x_rx.recv().await, Err(StreamwireError::Cancelled)));

    y_tx.send(&echo("still here", 7)).await.unwrap();
    assert_eq!(y_rx.recv().await.unwrap(), Some(echo("still here", 7)));
    assert_eq!(client.stream_ids(), vec![3]);
}

#[tokio::test]
async fn test_unknown_method_is_rejected() {
    let (client, _server) = pair();

    let err = client
        .unary::<Echo, Echo>(CallOptions::new("/echo/Missing"), &echo("?", 0))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StreamwireError::Rpc {
            ret: ret::SERVER_NO_FUNC,
            ..
        }
    ));
}

#[tokio::test]
async fn test_connection_without_services_rejects_streams() {
    let (client_io, server_io) = tokio::io::duplex(1 << 16);
    let _server = Connection::builder().server().build(server_io).unwrap();
    let client = Connection::builder().build(client_io).unwrap();

    let err = client
        .unary::<Echo, Echo>(CallOptions::new("/echo/Unary"), &echo("hi", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, StreamwireError::Rpc { ret: 12, .. }));
}

#[tokio::test]
async fn test_saturated_server_rejects_with_overload() {
    let (client_io, server_io) = tokio::io::duplex(1 << 16);
    let server = Connection::builder()
        .server()
        .services(echo_services())
        .max_concurrent_handlers(1)
        .build(server_io)
        .unwrap();
    let client = Connection::builder().build(client_io).unwrap();

    let _busy = client
        .bidi::<Echo, Echo>(CallOptions::new("/echo/Idle"))
        .await
        .unwrap();
    let err = client
        .bidi::<Echo, Echo>(CallOptions::new("/echo/Idle"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        StreamwireError::Rpc {
            ret: ret::SERVER_OVERLOAD,
            ..
        }
    ));
    let stats = server.worker_stats();
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.active, 1);
}

#[tokio::test]
async fn test_business_error_closes_with_ret() {
    let (client, server) = pair();

    let err = client
        .unary::<Echo, Echo>(CallOptions::new("/echo/Denied"), &echo("let me in", 1))
        .await
        .unwrap_err();

    match err {
        StreamwireError::Rpc { ret, msg } => {
            assert_eq!(ret, 1001);
            assert_eq!(msg, "denied");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(client.live_streams(), 0);
    assert_eq!(server.live_streams(), 0);
}

#[tokio::test]
async fn test_client_deadline_resets_stream() {
    let (client, server) = pair();
    let mut server_events = server.subscribe();

    let err = client
        .unary::<Echo, Echo>(
            CallOptions::new("/echo/Slow").timeout(Duration::from_millis(100)),
            &echo("zzz", 1),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StreamwireError::Timeout {
            ret: ret::STREAM_CLIENT_READ_TIMEOUT
        }
    ));
    assert_eq!(client.live_streams(), 0);

    // The server is told through a RESET carrying the timeout ret.
    loop {
        if let StreamEvent::Reset {
            stream_id,
            ret: code,
            origin,
        } = next_event(&mut server_events).await
        {
            assert_eq!(stream_id, 1);
            assert_eq!(code, ret::STREAM_CLIENT_READ_TIMEOUT);
            assert_eq!(origin, ResetOrigin::Peer);
            break;
        }
    }
}

#[tokio::test]
async fn test_server_deadline_resets_stream() {
    let (client_io, server_io) = tokio::io::duplex(1 << 16);
    let _server = Connection::builder()
        .server()
        .services(echo_services())
        .stream_timeout(Duration::from_millis(100))
        .build(server_io)
        .unwrap();
    let client = Connection::builder().build(client_io).unwrap();

    let mut rx = client
        .server_streaming::<Echo, Echo>(CallOptions::new("/echo/Stall"), &echo("wait", 1))
        .await
        .unwrap();
    let err = timeout(WAIT, rx.recv()).await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        StreamwireError::Reset {
            ret: ret::STREAM_SERVER_READ_TIMEOUT,
            ..
        }
    ));
}

#[tokio::test]
async fn test_json_gzip_negotiated() {
    let (client, _server) = pair();

    let options = CallOptions::new("/echo/Codec")
        .serialization(Serialization::Json)
        .compression(GZIP);
    let reply: Echo = client.unary(options, &echo("codec", 1)).await.unwrap();

    assert_eq!(reply, echo("json", GZIP as u32));
}

#[tokio::test]
async fn test_unregistered_compression_falls_back_to_identity() {
    let (client_io, server_io) = tokio::io::duplex(1 << 16);
    let codecs = CodecRegistry {
        serialization: SerializationRegistry::default(),
        compression: CompressionRegistry::identity_only(),
    };
    let _server = Connection::builder()
        .server()
        .codecs(codecs)
        .services(echo_services())
        .build(server_io)
        .unwrap();
    let client = Connection::builder().build(client_io).unwrap();

    let options = CallOptions::new("/echo/Codec").compression(GZIP);
    let reply: Echo = client.unary(options, &echo("codec", 1)).await.unwrap();

    assert_eq!(reply, echo("protobuf", IDENTITY as u32));
}

#[tokio::test]
async fn test_unregistered_serialization_resets_stream() {
    let (client_io, server_io) = tokio::io::duplex(1 << 16);
    let mut serialization = SerializationRegistry::default();
    serialization.unregister(Serialization::Json);
    let codecs = CodecRegistry {
        serialization,
        compression: CompressionRegistry::default(),
    };
    let _server = Connection::builder()
        .server()
        .codecs(codecs)
        .services(echo_services())
        .build(server_io)
        .unwrap();
    let client = Connection::builder().build(client_io).unwrap();

    let options = CallOptions::new("/echo/Unary").serialization(Serialization::Json);
    let err = client
        .unary::<Echo, Echo>(options, &echo("json?", 1))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        StreamwireError::Reset {
            ret: ret::STREAM_SERVER_DECODE,
            ..
        }
    ));
}

#[tokio::test]
async fn test_try_send_reports_exhausted_window() {
    let (client_io, server_io) = tokio::io::duplex(1 << 16);
    let _server = Connection::builder()
        .server()
        .services(echo_services())
        .init_window_size(32)
        .build(server_io)
        .unwrap();
    let client = Connection::builder().build(client_io).unwrap();

    let (mut tx, _rx) = client
        .bidi::<Echo, Echo>(CallOptions::new("/echo/Idle"))
        .await
        .unwrap();

    // 16 text bytes, 2 bytes of string framing, 2 for `seq`.
    let msg = echo(&"x".repeat(16), 1);
    tx.try_send(&msg).unwrap();
    assert_eq!(tx.available_window(), 12);
    assert!(matches!(tx.try_send(&msg), Err(StreamwireError::WindowExhausted)));

    let too_big = echo(&"x".repeat(100), 1);
    assert!(matches!(
        tx.send(&too_big).await,
        Err(StreamwireError::MessageTooLarge { .. })
    ));
    assert_eq!(client.live_streams(), 1);
}

#[tokio::test]
async fn test_many_small_messages_within_window_reach_slow_reader() {
    let (client, server) = pair();

    // ~6 bytes each, far inside the 65535 byte window but more messages
    // than the configured queue capacity.
    let count = 1100;
    let mut rx = client
        .server_streaming::<Echo, Echo>(CallOptions::new("/echo/Countdown"), &echo("t", count))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut received = 0;
    while let Some(msg) = timeout(WAIT, rx.recv()).await.unwrap().unwrap() {
        assert_eq!(msg.seq, received);
        received += 1;
    }
    assert_eq!(received, count);
    assert!(rx.termination().unwrap().is_success());
    assert_eq!(server.live_streams(), 0);
}

#[tokio::test]
async fn test_message_over_frame_limit_fails_locally() {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let server = Connection::builder()
        .server()
        .services(echo_services())
        .max_frame_size(4096)
        .build(server_io)
        .unwrap();
    let client = Connection::builder()
        .max_frame_size(4096)
        .build(client_io)
        .unwrap();

    let (mut x_tx, mut x_rx) = client
        .bidi::<Echo, Echo>(CallOptions::new("/echo/Bidi"))
        .await
        .unwrap();
    let (mut y_tx, mut y_rx) = client
        .bidi::<Echo, Echo>(CallOptions::new("/echo/Bidi"))
        .await
        .unwrap();

    // Fits the 65535 byte window, not a 4096 byte frame.
    let window = x_tx.available_window();
    let err = x_tx.send(&echo(&"x".repeat(8000), 1)).await.unwrap_err();
    assert!(matches!(
        err,
        StreamwireError::MessageTooLarge {
            limit: 4080,
            ..
        }
    ));
    assert_eq!(x_tx.available_window(), window);

    y_tx.send(&echo("sibling", 2)).await.unwrap();
    assert_eq!(y_rx.recv().await.unwrap(), Some(echo("sibling", 2)));
    x_tx.send(&echo("small", 3)).await.unwrap();
    assert_eq!(x_rx.recv().await.unwrap(), Some(echo("small", 3)));

    // An INIT too large for one frame never leaves this side either.
    let options = CallOptions::new("/echo/Unary").trans_info("blob", vec![0u8; 8000]);
    let err = client
        .unary::<Echo, Echo>(options, &echo("hi", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, StreamwireError::MessageTooLarge { .. }));

    assert!(!client.is_closed());
    assert!(!server.is_closed());
    assert_eq!(client.stream_ids(), vec![1, 3]);
}

#[tokio::test]
async fn test_panicking_handler_resets_stream() {
    let (client, server) = pair();

    let err = timeout(
        WAIT,
        client.unary::<Echo, Echo>(CallOptions::new("/echo/Panic"), &echo("boom", 1)),
    )
    .await
    .unwrap()
    .unwrap_err();

    assert!(matches!(
        err,
        StreamwireError::Reset {
            ret: ret::STREAM_UNKNOWN,
            ..
        }
    ));
    assert_eq!(client.live_streams(), 0);
    assert_eq!(server.live_streams(), 0);

    // The connection outlives the failed handler.
    let reply: Echo = client
        .unary(CallOptions::new("/echo/Unary"), &echo("after", 1))
        .await
        .unwrap();
    assert_eq!(reply, echo("echo: after", 2));
}

#[tokio::test]
async fn test_empty_response_is_server_encode_error() {
    let (client, _server) = pair();

    let err = client
        .unary::<Echo, Echo>(CallOptions::new("/echo/Empty"), &echo("nothing", 1))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        StreamwireError::Reset {
            ret: ret::STREAM_SERVER_ENCODE,
            ..
        }
    ));
}

#[tokio::test]
async fn test_events_follow_stream_lifecycle() {
    let (client, _server) = pair();
    let mut events = client.subscribe();

    let _: Echo = client
        .unary(CallOptions::new("/echo/Unary"), &echo("observe", 1))
        .await
        .unwrap();

    assert_eq!(
        next_event(&mut events).await,
        StreamEvent::Opened {
            stream_id: 1,
            func: "/echo/Unary".to_string(),
            role: Role::Client,
        }
    );
    assert!(matches!(
        next_event(&mut events).await,
        StreamEvent::Data { stream_id: 1, .. }
    ));
    assert_eq!(
        next_event(&mut events).await,
        StreamEvent::Closed {
            stream_id: 1,
            ret: ret::SUCCESS
        }
    );
}

#[tokio::test]
async fn test_server_endpoint_calls_client_services() {
    let (client_io, server_io) = tokio::io::duplex(1 << 16);
    let client = Connection::builder()
        .services(echo_services())
        .build(client_io)
        .unwrap();
    let server = Connection::builder().server().build(server_io).unwrap();
    let mut events = client.subscribe();

    let reply: Echo = server
        .unary(CallOptions::new("/echo/Unary"), &echo("reverse", 4))
        .await
        .unwrap();
    assert_eq!(reply, echo("echo: reverse", 5));

    match next_event(&mut events).await {
        StreamEvent::Opened {
            stream_id, role, ..
        } => {
            assert_eq!(stream_id, 2);
            assert_eq!(role, Role::Server);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn test_close_resets_live_streams() {
    let (client, server) = pair();

    let (_tx, mut rx) = client
        .bidi::<Echo, Echo>(CallOptions::new("/echo/Bidi"))
        .await
        .unwrap();
    client.close().await;

    assert!(client.is_closed());
    assert!(matches!(rx.recv().await, Err(StreamwireError::ConnectionClosed)));
    assert!(matches!(
        client
            .unary::<Echo, Echo>(CallOptions::new("/echo/Unary"), &echo("late", 1))
            .await,
        Err(StreamwireError::ConnectionClosed)
    ));

    timeout(WAIT, server.closed()).await.unwrap();
    assert_eq!(server.live_streams(), 0);
}

#[tokio::test]
async fn test_bad_magic_tears_connection_down() {
    let (client_io, mut raw) = tokio::io::duplex(1 << 16);
    let client = Connection::builder().build(client_io).unwrap();

    let caller = client.clone();
    let call = tokio::spawn(async move {
        caller
            .unary::<Echo, Echo>(CallOptions::new("/echo/Unary"), &echo("hi", 1))
            .await
    });

    // Wait for the INIT so the stream is live before the garbage arrives.
    let mut buf = [0u8; 256];
    let n = timeout(WAIT, raw.read(&mut buf)).await.unwrap().unwrap();
    assert!(n > 0);
    raw.write_all(&[0xFF; HEADER_SIZE]).await.unwrap();

    let result = timeout(WAIT, call).await.unwrap().unwrap();
    assert!(matches!(result, Err(StreamwireError::ConnectionClosed)));
    timeout(WAIT, client.closed()).await.unwrap();
    assert_eq!(client.live_streams(), 0);
}

#[tokio::test]
async fn test_data_for_unknown_stream_is_reset() {
    let (server_io, mut raw) = tokio::io::duplex(1 << 16);
    let _server = Connection::builder()
        .server()
        .services(echo_services())
        .build(server_io)
        .unwrap();

    let orphan = Frame::data(9, Bytes::from_static(b"orphan")).unwrap();
    raw.write_all(&orphan.encode()).await.unwrap();

    let mut frames = FrameBuffer::new();
    let reply = read_frame(&mut raw, &mut frames).await;
    assert_eq!(reply.stream_id(), 9);
    assert_eq!(reply.frame_type(), FrameType::Close);
    let meta = reply.close_meta().unwrap();
    assert!(meta.is_reset());
    assert_eq!(meta.ret, ret::STREAM_UNKNOWN);
}
