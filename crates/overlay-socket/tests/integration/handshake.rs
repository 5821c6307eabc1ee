//! Handshake tests -- connect, timeouts, admission, redundant delivery.

use std::time::Duration;

use overlay_protocol::ChannelType;
use overlay_socket::{ConnectionState, MemoryConfig, SocketError};

use crate::harness::{connected_pair, descriptor, read_exact, read_to_end, wait_state, TestNet};

#[tokio::test(start_paused = true)]
async fn test_connect_without_listener_times_out_on_deadline() {
    let net = TestNet::new();
    let client = net.node("client").build();
    let server = net.node("server").build();

    let conn = client.connection();
    conn.bind().unwrap();
    let start = tokio::time::Instant::now();
    let err = conn
        .connect(&server.address("nobody"), Duration::from_millis(1500))
        .await
        .unwrap_err();

    let elapsed = start.elapsed();
    assert!(matches!(err, SocketError::Timeout { operation: "connect" }));
    assert!(elapsed >= Duration::from_millis(1500), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1550), "returned late: {elapsed:?}");
    assert_eq!(conn.state(), ConnectionState::Bound);
}

#[tokio::test]
async fn test_connect_establishes_both_ends() {
    let net = TestNet::new();
    let client = net.node("client").build();
    let server = net.node("server").build();

    let (c, s, acceptor) = connected_pair(&client, &server, "svc").await.unwrap();
    assert_eq!(c.state(), ConnectionState::Connected);
    assert_eq!(s.state(), ConnectionState::Connected);
    assert!(c.is_reliable() && s.is_reliable());

    assert_eq!(c.remote_identity().unwrap(), server.identity);
    assert_eq!(s.remote_identity().unwrap(), client.identity);
    assert_eq!(c.remote_address(), s.local_address());
    assert_eq!(s.remote_address(), c.local_address());
    assert_eq!(acceptor.backlog_len(), 0);
}

#[tokio::test]
async fn test_responder_decides_reliability() {
    let net = TestNet::new();
    let client = net.node("client").reliable(true).build();
    let server = net.node("server").reliable(false).build();

    let (c, s, _acceptor) = connected_pair(&client, &server, "svc").await.unwrap();
    assert!(!c.is_reliable());
    assert!(!s.is_reliable());

    c.send(b"plain").unwrap();
    c.flush().unwrap();
    let got = read_exact(&s, 5, Duration::from_secs(2)).await.unwrap();
    assert_eq!(got, b"plain");
}

#[tokio::test]
async fn test_direct_transport_when_both_sides_offer_it() {
    let net = TestNet::with_config(MemoryConfig {
        direct: true,
        ..MemoryConfig::default()
    });
    let client = net.node("client").direct(true).build();
    let server = net.node("server").direct(true).build();
    let plain = net.node("plain").build();

    let (c, s, _acceptor) = connected_pair(&client, &server, "svc").await.unwrap();
    assert!(c.is_direct());
    assert!(s.is_direct());

    let (c2, _s2, _acceptor2) = connected_pair(&plain, &server, "svc2").await.unwrap();
    assert!(!c2.is_direct(), "direct needs both sides");
}

#[tokio::test]
async fn test_direct_falls_back_when_substrate_lacks_it() {
    let net = TestNet::new();
    let client = net.node("client").direct(true).build();
    let server = net.node("server").direct(true).build();

    let (c, s, _acceptor) = connected_pair(&client, &server, "svc").await.unwrap();
    assert!(!c.is_direct());
    assert!(!s.is_direct());
    assert_eq!(c.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_redundant_resolutions_create_one_connection() {
    let net = TestNet::with_config(MemoryConfig {
        redundant_resolutions: 3,
        ..MemoryConfig::default()
    });
    let client = net.node("client").build();
    let server = net.node("server").build();

    let (c, s, acceptor) = connected_pair(&client, &server, "svc").await.unwrap();
    assert!(net.stats().resolutions >= 4);
    let err = acceptor.accept(Duration::from_millis(200)).await.unwrap_err();
    assert!(err.is_timeout(), "only one connection expected, got {err:?}");

    c.send(b"once").unwrap();
    let got = read_exact(&s, 4, Duration::from_secs(2)).await.unwrap();
    assert_eq!(got, b"once");
}

#[tokio::test]
async fn test_duplicated_frames_create_one_connection() {
    let net = TestNet::with_config(MemoryConfig {
        duplicate: 1.0,
        ..MemoryConfig::default()
    });
    let client = net.node("client").build();
    let server = net.node("server").build();

    let (c, s, acceptor) = connected_pair(&client, &server, "svc").await.unwrap();
    assert!(acceptor.accept(Duration::from_millis(200)).await.unwrap_err().is_timeout());

    c.send(b"abc").unwrap();
    c.send(b"def").unwrap();
    let got = read_exact(&s, 6, Duration::from_secs(2)).await.unwrap();
    assert_eq!(got, b"abcdef");
    assert!(net.stats().duplicated > 0);
}

#[tokio::test]
async fn test_reconnect_after_timeout() {
    let net = TestNet::new();
    let client = net.node("client").build();
    let server = net.node("server").build();

    let conn = client.connection();
    conn.bind().unwrap();
    let err = conn
        .connect(&server.address("svc"), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    let acceptor = server.listen("svc").unwrap();
    let target = server.address("svc");
    let (connected, accepted) = tokio::join!(
        conn.connect(&target, Duration::from_secs(5)),
        acceptor.accept(Duration::from_secs(5)),
    );
    connected.unwrap();
    accepted.unwrap();
    assert_eq!(conn.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_secure_channel_admits_matching_secret() {
    let net = TestNet::new();
    let server = net.node("server").secret("s3cret").build();
    let client = net.node("client").secret("s3cret").build();
    let secure = descriptor("vault", ChannelType::SecureUnicast);

    let acceptor = server.listen_on(secure.clone()).unwrap();
    let target = overlay_protocol::SocketAddress::pinned(secure, server.identity.clone());
    let (dialed, accepted) = tokio::join!(
        client.dial(&target, Duration::from_secs(5)),
        acceptor.accept(Duration::from_secs(5)),
    );
    let c = dialed.unwrap();
    let s = accepted.unwrap();
    assert_eq!(c.state(), ConnectionState::Connected);
    assert_eq!(s.remote_identity().unwrap(), client.identity);
}

#[tokio::test(start_paused = true)]
async fn test_secure_channel_drops_bad_credential() {
    let net = TestNet::new();
    let server = net.node("server").secret("s3cret").build();
    let intruder = net.node("intruder").secret("guess").build();
    let secure = descriptor("vault", ChannelType::SecureUnicast);

    let acceptor = server.listen_on(secure.clone()).unwrap();
    let target = overlay_protocol::SocketAddress::pinned(secure, server.identity.clone());
    let err = intruder
        .dial(&target, Duration::from_millis(500))
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "rejection is observed as a timeout, got {err:?}");
    assert_eq!(acceptor.backlog_len(), 0);
}

#[tokio::test]
async fn test_secure_channel_without_credential_fails_fast() {
    let net = TestNet::new();
    let server = net.node("server").secret("s3cret").build();
    let anonymous = net.node("anonymous").build();
    let secure = descriptor("vault", ChannelType::SecureUnicast);

    let _acceptor = server.listen_on(secure.clone()).unwrap();
    let target = overlay_protocol::SocketAddress::pinned(secure, server.identity.clone());
    let err = anonymous
        .dial(&target, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, SocketError::InvalidArgument(_)));
}

#[tokio::test(start_paused = true)]
async fn test_target_pinned_to_other_node_is_not_reached() {
    let net = TestNet::new();
    let client = net.node("client").build();
    let server = net.node("server").build();
    let impostor = net.node("impostor").build();

    // Listener on `server`, client pinned to `impostor`.
    let _acceptor = server.listen("svc").unwrap();
    let target = overlay_protocol::SocketAddress::pinned(
        descriptor("svc", ChannelType::Unicast),
        impostor.identity.clone(),
    );
    let err = client
        .dial(&target, Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
}

// ============================================================================
// Traffic while the initiator is still connecting
// ============================================================================

/// Every resolution reports after `delay`, so the responder is connected
/// one resolution ahead of the initiator.
fn slow_resolution(delay: Duration) -> MemoryConfig {
    MemoryConfig {
        resolution_delay: delay,
        ..MemoryConfig::default()
    }
}

#[tokio::test]
async fn test_data_sent_during_connect_is_delivered_in_order() {
    for reliable in [false, true] {
        let net = TestNet::with_config(slow_resolution(Duration::from_millis(50)));
        let client = net.node("client").reliable(reliable).build();
        let server = net.node("server").reliable(reliable).build();
        let acceptor = server.listen("svc").unwrap();
        let target = server.address("svc");

        let responder = tokio::spawn(async move {
            let s = acceptor.accept(Duration::from_secs(5)).await?;
            s.send(b"early ")?;
            s.send(b"bird")?;
            s.flush()?;
            Ok::<_, SocketError>((s, acceptor))
        });
        let c = client.dial(&target, Duration::from_secs(5)).await.unwrap();
        let (_s, _acceptor) = responder.await.unwrap().unwrap();

        let got = read_exact(&c, 10, Duration::from_secs(2)).await.unwrap();
        assert_eq!(got, b"early bird", "reliable = {reliable}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_data_held_by_failed_connect_is_discarded() {
    let net = TestNet::with_config(slow_resolution(Duration::from_millis(100)));
    let client = net.node("client").reliable(false).build();
    let server = net.node("server").reliable(false).build();
    let first = server.listen("svc").unwrap();
    let second = server.listen("svc2").unwrap();

    // Responder connects at ~200ms; the initiator would need until ~300ms.
    let conn = client.connection();
    conn.bind().unwrap();
    let target = server.address("svc");
    let (connected, accepted) = tokio::join!(
        conn.connect(&target, Duration::from_millis(250)),
        async {
            let s = first.accept(Duration::from_secs(5)).await?;
            s.send(b"stale")?;
            s.flush()?;
            Ok::<_, SocketError>(s)
        },
    );
    let _stale = accepted.unwrap();
    assert!(connected.unwrap_err().is_timeout());
    assert_eq!(conn.state(), ConnectionState::Bound);

    let target = server.address("svc2");
    let (connected, accepted) = tokio::join!(
        conn.connect(&target, Duration::from_secs(5)),
        second.accept(Duration::from_secs(5)),
    );
    connected.unwrap();
    let fresh = accepted.unwrap();
    fresh.send(b"fresh").unwrap();
    fresh.flush().unwrap();

    let got = read_exact(&conn, 5, Duration::from_secs(2)).await.unwrap();
    assert_eq!(got, b"fresh");
}

#[tokio::test]
async fn test_close_during_connect_reaches_initiator() {
    for reliable in [false, true] {
        let net = TestNet::with_config(slow_resolution(Duration::from_millis(50)));
        let client = net.node("client").reliable(reliable).build();
        let server = net
            .node("server")
            .reliable(reliable)
            .close_timeout(Duration::from_secs(2))
            .build();
        let acceptor = server.listen("svc").unwrap();
        let target = server.address("svc");

        let responder = tokio::spawn(async move {
            let s = acceptor.accept(Duration::from_secs(5)).await?;
            s.send(b"bye")?;
            s.close().await?;
            Ok::<_, SocketError>(s)
        });
        let c = client.dial(&target, Duration::from_secs(5)).await.unwrap();

        let got = read_to_end(&c, Duration::from_secs(3)).await.unwrap();
        assert_eq!(got, b"bye", "reliable = {reliable}");
        let s = responder.await.unwrap().unwrap();
        assert_eq!(s.state(), ConnectionState::Closed);
        wait_state(&c, ConnectionState::Closed, Duration::from_secs(2)).await.unwrap();
        assert!(matches!(c.send(b"more"), Err(SocketError::Closed)));
    }
}
