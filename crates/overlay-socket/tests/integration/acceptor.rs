//! Acceptor tests -- backlog bounds, accept timing, shutdown.

use std::time::Duration;

use overlay_socket::{ConnectionState, SocketError};

use crate::harness::{read_exact, TestNet};

#[tokio::test(start_paused = true)]
async fn test_full_backlog_drops_extra_requests() {
    let net = TestNet::new();
    let server = net.node("server").backlog(2).build();
    let clients: Vec<_> = (0..3)
        .map(|i| net.node(&format!("client-{i}")).build())
        .collect();

    let acceptor = server.listen("svc").unwrap();
    let target = server.address("svc");
    let results = dial_all(&clients, &target).await;

    let connected = results.iter().filter(|r| r.is_ok()).count();
    let timed_out = results
        .iter()
        .filter(|r| matches!(r, Err(e) if e.is_timeout()))
        .count();
    assert_eq!(connected, 2);
    assert_eq!(timed_out, 1);
    assert_eq!(acceptor.backlog_len(), 2);

    for _ in 0..2 {
        let conn = acceptor.accept(Duration::from_millis(10)).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
    }
    assert_eq!(acceptor.backlog_len(), 0);
    assert!(acceptor.accept(Duration::from_millis(10)).await.unwrap_err().is_timeout());
}

async fn dial_all(
    clients: &[crate::harness::TestNode],
    target: &overlay_protocol::SocketAddress,
) -> Vec<overlay_socket::Result<overlay_socket::Connection>> {
    let mut tasks = Vec::new();
    for client in clients {
        let ctx = client.ctx.clone();
        let target = target.clone();
        tasks.push(tokio::spawn(async move {
            overlay_socket::Connection::dial(ctx, &target, Duration::from_millis(1000)).await
        }));
    }
    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.expect("dial task panicked"));
    }
    results
}

#[tokio::test(start_paused = true)]
async fn test_accept_on_empty_backlog_times_out() {
    let net = TestNet::new();
    let server = net.node("server").build();
    let acceptor = server.listen("svc").unwrap();

    let start = tokio::time::Instant::now();
    let err = acceptor.accept(Duration::from_millis(1000)).await.unwrap_err();
    assert!(matches!(err, SocketError::Timeout { operation: "accept" }));
    assert!(start.elapsed() >= Duration::from_millis(1000));
    assert!(start.elapsed() < Duration::from_millis(1050));
}

#[tokio::test]
async fn test_accept_waits_for_late_connector() {
    let net = TestNet::new();
    let server = net.node("server").build();
    let client = net.node("client").build();
    let acceptor = server.listen("svc").unwrap();
    let target = server.address("svc");

    let dial = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let conn = client.dial(&target, Duration::from_secs(5)).await?;
        conn.send(b"late")?;
        Ok::<_, SocketError>(conn)
    });
    let accepted = acceptor.accept(Duration::ZERO).await.unwrap();
    let _client_conn = dial.await.unwrap().unwrap();
    let got = read_exact(&accepted, 4, Duration::from_secs(2)).await.unwrap();
    assert_eq!(got, b"late");
}

#[tokio::test]
async fn test_close_drops_queued_connections() {
    let net = TestNet::new();
    let server = net.node("server").build();
    let client = net.node("client").build();
    let acceptor = server.listen("svc").unwrap();

    let conn = client
        .dial(&server.address("svc"), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(acceptor.backlog_len(), 1);
    // listen channel + both ephemeral channels
    assert_eq!(net.network.bound_count(), 3);

    acceptor.close().await;
    assert!(acceptor.is_closed());
    assert_eq!(acceptor.backlog_len(), 0);
    assert_eq!(net.network.bound_count(), 1, "only the client channel remains");
    assert!(matches!(
        acceptor.accept(Duration::from_millis(10)).await,
        Err(SocketError::Closed)
    ));
    drop(conn);
    assert_eq!(net.network.bound_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_closed_acceptor_ignores_new_requests() {
    let net = TestNet::new();
    let server = net.node("server").build();
    let client = net.node("client").build();
    let acceptor = server.listen("svc").unwrap();
    acceptor.close().await;

    let err = client
        .dial(&server.address("svc"), Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test]
async fn test_rebind_after_close() {
    let net = TestNet::new();
    let server = net.node("server").build();
    let first = server.listen("svc").unwrap();
    first.close().await;
    let second = server.listen("svc").unwrap();
    assert_eq!(second.local_address(), first.local_address());
    assert!(!second.is_closed());
}
