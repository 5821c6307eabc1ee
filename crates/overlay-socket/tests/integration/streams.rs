//! Stream tests -- byte delivery in both disciplines, engine hand-off,
//! input overflow, stray frames.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use overlay_protocol::{encode_message, Message};
use overlay_socket::channel::ResolutionListener;
use overlay_socket::{ConnectionState, MemoryConfig, TransportHandle};
use parking_lot::Mutex;

use crate::harness::{connected_pair, read_exact, FakeEngineFactory, TestNet};

#[tokio::test]
async fn test_reliable_bytes_arrive_exact_and_ordered() {
    let net = TestNet::with_config(MemoryConfig {
        duplicate: 0.3,
        ..MemoryConfig::default()
    });
    let client = net.node("client").build();
    let server = net.node("server").build();
    let (c, s, _acceptor) = connected_pair(&client, &server, "svc").await.unwrap();

    let mut expected = Vec::new();
    for i in 0..200u32 {
        let chunk = format!("{i:04}|");
        c.send(chunk.as_bytes()).unwrap();
        expected.extend_from_slice(chunk.as_bytes());
    }
    let got = read_exact(&s, expected.len(), Duration::from_secs(5)).await.unwrap();
    assert_eq!(got, expected);
}

#[tokio::test]
async fn test_large_reliable_write_is_segmented_and_reassembled() {
    let net = TestNet::with_config(MemoryConfig {
        max_message_size: 1024,
        ..MemoryConfig::default()
    });
    let client = net.node("client").build();
    let server = net.node("server").build();
    let (c, s, _acceptor) = connected_pair(&client, &server, "svc").await.unwrap();

    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    c.send(&payload).unwrap();
    let got = read_exact(&s, payload.len(), Duration::from_secs(5)).await.unwrap();
    assert_eq!(got, payload);
}

#[tokio::test]
async fn test_one_engine_send_per_write() {
    let net = TestNet::new();
    let engines = Arc::new(FakeEngineFactory::default());
    let client = net.node("client").engines(engines.clone()).build();
    let server = net
        .node("server")
        .engines(Arc::new(FakeEngineFactory::default()))
        .build();
    let (c, s, _acceptor) = connected_pair(&client, &server, "svc").await.unwrap();

    c.send(b"first").unwrap();
    c.send(b"").unwrap();
    c.send(b"second").unwrap();
    c.send(b"third").unwrap();
    c.flush().unwrap();

    let engine = engines.last().unwrap();
    assert_eq!(
        engine.sent(),
        vec![
            Bytes::from_static(b"first"),
            Bytes::from_static(b"second"),
            Bytes::from_static(b"third"),
        ]
    );
    let got = read_exact(&s, 16, Duration::from_secs(2)).await.unwrap();
    assert_eq!(got, b"firstsecondthird");
}

#[tokio::test]
async fn test_unreliable_round_trip() {
    let net = TestNet::new();
    let client = net.node("client").reliable(false).build();
    let server = net.node("server").reliable(false).build();
    let (c, s, _acceptor) = connected_pair(&client, &server, "svc").await.unwrap();
    assert!(!c.is_reliable());

    c.send(b"ping").unwrap();
    c.flush().unwrap();
    assert_eq!(read_exact(&s, 4, Duration::from_secs(2)).await.unwrap(), b"ping");

    s.send(b"pong").unwrap();
    s.flush().unwrap();
    assert_eq!(read_exact(&c, 4, Duration::from_secs(2)).await.unwrap(), b"pong");
}

#[tokio::test]
async fn test_unreliable_buffer_splits_writes() {
    let net = TestNet::new();
    let client = net
        .node("client")
        .reliable(false)
        .output_buffer_max(3)
        .build();
    let server = net.node("server").reliable(false).build();
    let (c, s, _acceptor) = connected_pair(&client, &server, "svc").await.unwrap();

    c.send(b"hello").unwrap();
    c.flush().unwrap();

    let mut buf = [0u8; 16];
    let n = s.read(&mut buf, Duration::from_secs(2)).await.unwrap();
    assert_eq!(&buf[..n], b"hel");
    let n = s.read(&mut buf, Duration::from_secs(2)).await.unwrap();
    assert_eq!(&buf[..n], b"lo");
}

#[tokio::test]
async fn test_unreliable_input_overflow_drops_fragments() {
    let net = TestNet::new();
    let client = net.node("client").reliable(false).build();
    let server = net
        .node("server")
        .reliable(false)
        .input_queue_capacity(2)
        .build();
    let (c, s, _acceptor) = connected_pair(&client, &server, "svc").await.unwrap();

    for word in ["a", "b", "c", "d", "e"] {
        c.send(word.as_bytes()).unwrap();
        c.flush().unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(s.input_dropped(), 3);
    assert_eq!(read_exact(&s, 2, Duration::from_secs(1)).await.unwrap(), b"ab");
    let mut buf = [0u8; 4];
    assert!(s.read(&mut buf, Duration::from_millis(50)).await.unwrap_err().is_timeout());
}

/// Captures the first resolved handle.
struct Capture(Mutex<Option<Arc<dyn TransportHandle>>>);

impl ResolutionListener for Capture {
    fn on_resolved(&self, handle: Arc<dyn TransportHandle>) {
        self.0.lock().get_or_insert(handle);
    }
}

#[tokio::test]
async fn test_stray_frames_are_ignored() {
    let net = TestNet::new();
    let client = net.node("client").reliable(false).build();
    let server = net.node("server").reliable(false).build();
    let (c, s, _acceptor) = connected_pair(&client, &server, "svc").await.unwrap();

    let remote = s.local_address().unwrap().descriptor;
    let capture = Arc::new(Capture(Mutex::new(None)));
    client
        .ctx
        .channels
        .resolve_output_channel(&remote, Some(server.identity.node_id), capture.clone())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let handle = capture.0.lock().clone().expect("server channel resolves");

    // An engine frame on a plain connection, then garbage.
    let stray = encode_message(&Message::reliable(Bytes::from_static(b"junk"))).unwrap();
    handle.send(stray).unwrap();
    handle.send(Bytes::from_static(b"not a message")).unwrap();

    c.send(b"real").unwrap();
    c.flush().unwrap();
    assert_eq!(read_exact(&s, 4, Duration::from_secs(2)).await.unwrap(), b"real");
    assert_eq!(s.state(), ConnectionState::Connected);
}
