//! End-to-end SSE scenarios over an in-memory stream.

use std::time::Duration;

use http::header::{HeaderMap, HeaderName};
use http::{Method, Version};
use rill_protocol::SseEvent;
use rill_transport::{
    ConnError, HandshakeError, Hijack, Hijacked, RequestHead, SseConfig, SseConn, SseUpgrader,
    StreamHijack,
};
use tokio::io::{duplex, AsyncReadExt, DuplexStream};
use tokio::time::timeout;

fn request_head(extra: &[(&str, &str)]) -> RequestHead {
    let mut headers = HeaderMap::new();
    headers.insert("host".parse::<HeaderName>().unwrap(), "example.com".parse().unwrap());
    for (name, value) in extra {
        headers.insert(name.parse::<HeaderName>().unwrap(), value.parse().unwrap());
    }
    RequestHead::new(Method::GET, Version::HTTP_11, headers)
}

async fn read_response_head(client: &mut DuplexStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        client.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

/// No automatic keep-alives: most tests want a quiet wire.
fn quiet_config() -> SseConfig {
    SseConfig {
        keep_alive: None,
        ..SseConfig::default()
    }
}

async fn connect(config: SseConfig, extra_headers: &[(&str, &str)]) -> (SseConn, DuplexStream) {
    let (server_io, mut client) = duplex(4096);
    let conn = SseUpgrader::new(config)
        .upgrade(&request_head(extra_headers), StreamHijack(server_io))
        .await
        .expect("sse upgrade");
    let head = read_response_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    (conn, client)
}

#[tokio::test]
async fn test_response_headers() {
    let (server_io, mut client) = duplex(4096);
    let _conn = SseUpgrader::new(quiet_config())
        .upgrade(&request_head(&[]), StreamHijack(server_io))
        .await
        .unwrap();

    let head = read_response_head(&mut client).await;
    assert!(head.contains("Content-Type: text/event-stream\r\n"));
    assert!(head.contains("Cache-Control: no-cache\r\n"));
    assert!(head.contains("Connection: keep-alive\r\n"));
    assert!(head.contains("X-Accel-Buffering: no\r\n"));
}

#[tokio::test]
async fn test_tick_event_byte_exact() {
    let (conn, mut client) = connect(quiet_config(), &[]).await;

    let event = SseEvent::new("2024-01-01T00:00:00Z")
        .unwrap()
        .with_event_type("time")
        .unwrap();
    conn.send(&event).await.unwrap();

    let expected = b"event: time\ndata: 2024-01-01T00:00:00Z\n\n";
    let mut received = vec![0u8; expected.len()];
    client.read_exact(&mut received).await.unwrap();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn test_events_flush_in_submission_order() {
    let (conn, mut client) = connect(quiet_config(), &[]).await;

    for i in 0..3 {
        let event = SseEvent::new(format!("tick-{i}")).unwrap();
        conn.send(&event).await.unwrap();
    }

    let expected = b"data: tick-0\n\ndata: tick-1\n\ndata: tick-2\n\n";
    let mut received = vec![0u8; expected.len()];
    client.read_exact(&mut received).await.unwrap();
    assert_eq!(&received, expected);
}

#[tokio::test]
async fn test_comment_heartbeat_bytes() {
    let (conn, mut client) = connect(quiet_config(), &[]).await;

    conn.send_comment("ping").await.unwrap();

    let mut received = vec![0u8; b": ping\n\n".len()];
    client.read_exact(&mut received).await.unwrap();
    assert_eq!(&received, b": ping\n\n");
}

#[tokio::test]
async fn test_all_fields_on_the_wire() {
    let (conn, mut client) = connect(quiet_config(), &[]).await;

    let event = SseEvent::new("first\nsecond")
        .unwrap()
        .with_event_type("multi")
        .unwrap()
        .with_id("evt-7")
        .unwrap()
        .with_retry_ms(1500);
    conn.send(&event).await.unwrap();

    let expected = b"retry: 1500\nid: evt-7\nevent: multi\ndata: first\ndata: second\n\n";
    let mut received = vec![0u8; expected.len()];
    client.read_exact(&mut received).await.unwrap();
    assert_eq!(&received[..], &expected[..]);
}

#[tokio::test]
async fn test_last_event_id_surfaced_verbatim() {
    let (conn, _client) = connect(quiet_config(), &[("last-event-id", "evt-41")]).await;
    assert_eq!(conn.last_event_id(), Some("evt-41"));

    let (conn, _client) = connect(quiet_config(), &[]).await;
    assert_eq!(conn.last_event_id(), None);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (conn, mut client) = connect(quiet_config(), &[]).await;

    conn.close().await.unwrap();
    conn.close().await.unwrap();
    assert!(!conn.is_open());

    assert!(matches!(
        conn.send(&SseEvent::new("late").unwrap()).await,
        Err(ConnError::Closed)
    ));
    assert!(matches!(
        conn.send_comment("late").await,
        Err(ConnError::Closed)
    ));

    timeout(Duration::from_secs(2), conn.done())
        .await
        .expect("done fires on local close");

    // The hijacked stream is torn down.
    let mut scratch = [0u8; 8];
    let n = client.read(&mut scratch).await.unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_peer_disconnect_fires_done() {
    let (conn, client) = connect(quiet_config(), &[]).await;

    drop(client);

    timeout(Duration::from_secs(2), conn.done())
        .await
        .expect("done fires on peer FIN");
    assert!(!conn.is_open());
    assert!(matches!(
        conn.send(&SseEvent::new("x").unwrap()).await,
        Err(ConnError::Closed)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_automatic_keep_alive() {
    let config = SseConfig {
        keep_alive: Some(Duration::from_secs(15)),
        ..SseConfig::default()
    };
    let (_conn, mut client) = connect(config, &[]).await;

    let expected = b": keep-alive\n\n";
    let mut received = vec![0u8; expected.len()];
    timeout(Duration::from_secs(60), client.read_exact(&mut received))
        .await
        .expect("keep-alive comment arrives")
        .unwrap();
    assert_eq!(&received, expected);
}

struct NoFlushHost {
    io: DuplexStream,
}

#[async_trait::async_trait]
impl Hijack for NoFlushHost {
    fn supports_flush(&self) -> bool {
        false
    }

    async fn hijack(self) -> Result<Hijacked, HandshakeError> {
        Ok(Hijacked {
            io: Box::new(self.io),
            buffered: bytes::Bytes::new(),
        })
    }
}

#[tokio::test]
async fn test_flushless_host_is_refused() {
    let (server_io, _client) = duplex(4096);
    let err = SseUpgrader::new(quiet_config())
        .upgrade(&request_head(&[]), NoFlushHost { io: server_io })
        .await
        .unwrap_err();
    assert!(matches!(err, HandshakeError::NotHijackable));
}
