//! Transport Layer Tests
//!
//! Tests for the in-process and TCP transports:
//! - Connection establishment
//! - Round-trip message verification
//! - Close propagation to both ends
//! - Bounded receives
//! - Address-based dialling

use bytes::Bytes;
use std::time::Duration;
use turbine_core::Wait;
use turbine_transport::{
    Connector, Dialer, MemoryNetwork, TcpServer, TcpTransport, TransportError, TransportEvent,
    TransportReceiver, TransportSender, TransportServer,
};

// ============================================================================
// Memory transport
// ============================================================================

/// Data sent by the client arrives at the accepted server half and back
#[tokio::test]
async fn test_memory_echo() {
    let network = MemoryNetwork::new();
    let mut server = network.bind("mem:echo").unwrap();

    let accept_handle = tokio::spawn(async move {
        let (sender, mut receiver, _remote) = server.accept().await.unwrap();
        if let Some(TransportEvent::Data(data)) = receiver.recv().await {
            sender.send(data).await.unwrap();
        }
        (sender, receiver)
    });

    let (sender, mut receiver) = network.connector().connect("mem:echo").await.unwrap();
    sender.send(Bytes::from_static(b"ping")).await.unwrap();

    match receiver.recv().await {
        Some(TransportEvent::Data(data)) => assert_eq!(data.as_ref(), b"ping"),
        other => panic!("Expected Data event, got {:?}", other),
    }

    let _ = accept_handle.await;
}

/// Closing one end delivers a disconnect to both receivers
#[tokio::test]
async fn test_memory_close_propagates() {
    let network = MemoryNetwork::new();
    let mut server = network.bind("mem:close").unwrap();

    let (client_tx, mut client_rx) = network.connect("mem:close").await.unwrap();
    let (_server_tx, mut server_rx, _) = server.accept().await.unwrap();

    client_tx.close().await.unwrap();
    assert!(!client_tx.is_connected());

    assert!(matches!(
        server_rx.recv().await,
        Some(TransportEvent::Disconnected { .. })
    ));
    assert!(matches!(
        client_rx.recv().await,
        Some(TransportEvent::Disconnected { .. })
    ));
    assert!(matches!(
        client_tx.send(Bytes::from_static(b"late")).await,
        Err(TransportError::NotConnected)
    ));
}

/// Dropping a whole connection half ends the other receiver
#[tokio::test]
async fn test_memory_drop_ends_receiver() {
    let network = MemoryNetwork::new();
    let mut server = network.bind("mem:drop").unwrap();

    let (client_tx, client_rx) = network.connect("mem:drop").await.unwrap();
    let (_server_tx, mut server_rx, _) = server.accept().await.unwrap();

    drop(client_tx);
    drop(client_rx);

    let event = tokio::time::timeout(Duration::from_secs(1), server_rx.recv())
        .await
        .expect("receiver should not hang");
    assert!(event.is_none());
}

/// A silent peer makes recv_within time out
#[tokio::test]
async fn test_recv_within_times_out() {
    let network = MemoryNetwork::new();
    let _server = network.bind("mem:silent").unwrap();

    let (_tx, mut rx) = network.connect("mem:silent").await.unwrap();

    let result = rx
        .recv_within(Wait::For(Duration::from_millis(50)))
        .await;
    assert!(matches!(result, Err(TransportError::Timeout)));

    let result = rx.recv_within(Wait::Immediate).await;
    assert!(matches!(result, Err(TransportError::Timeout)));
}

/// Connecting to an unbound name fails fast
#[tokio::test]
async fn test_memory_connect_unbound() {
    let network = MemoryNetwork::new();
    let result = network.connect("mem:nobody").await;
    assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
}

// ============================================================================
// TCP transport
// ============================================================================

/// Length-prefixed frames survive the round trip, including large ones
#[tokio::test]
async fn test_tcp_echo() {
    let mut server = TcpServer::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();

    let accept_handle = tokio::spawn(async move {
        let (sender, mut receiver, _peer) = server.accept().await.unwrap();
        while let Some(TransportEvent::Data(data)) = receiver.recv().await {
            sender.send(data).await.unwrap();
        }
    });

    let transport = TcpTransport::new();
    let (sender, mut receiver) = transport.connect(&addr).await.unwrap();

    let small = Bytes::from("hello tcp");
    let large = Bytes::from(vec![0xAB; 200_000]);
    sender.send(small.clone()).await.unwrap();
    sender.send(large.clone()).await.unwrap();

    for expected in [small, large] {
        match receiver.recv().await {
            Some(TransportEvent::Data(received)) => assert_eq!(received, expected),
            other => panic!("Expected Data event, got {:?}", other),
        }
    }

    sender.close().await.unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(2), accept_handle).await;
}

/// Closing the client side shows up as a disconnect on the server side
#[tokio::test]
async fn test_tcp_close_propagates() {
    let mut server = TcpServer::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();

    let transport = TcpTransport::new();
    let (client_tx, mut client_rx) = transport.connect(&addr).await.unwrap();
    let (_server_tx, mut server_rx, _) = server.accept().await.unwrap();

    client_tx.close().await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), server_rx.recv())
        .await
        .expect("server should see the close");
    assert!(matches!(event, Some(TransportEvent::Disconnected { .. }) | None));

    let event = tokio::time::timeout(Duration::from_secs(2), client_rx.recv())
        .await
        .expect("client should see its own close");
    assert!(matches!(event, Some(TransportEvent::Disconnected { .. })));
}

// ============================================================================
// Dialer
// ============================================================================

/// mem: addresses use the attached network, others go over TCP
#[tokio::test]
async fn test_dialer_routes_by_scheme() {
    let network = MemoryNetwork::new();
    let _mem_server = network.bind("mem:node").unwrap();
    let mut tcp_server = TcpServer::bind("127.0.0.1:0").await.unwrap();
    let tcp_addr = tcp_server.local_addr().unwrap();

    let dialer = Dialer::new().with_memory(network);
    assert!(dialer.connect("mem:node").await.is_ok());

    let accept = tokio::spawn(async move { tcp_server.accept().await.is_ok() });
    assert!(dialer.connect(&tcp_addr).await.is_ok());
    assert!(accept.await.unwrap());

    let bare = Dialer::new();
    assert!(matches!(
        bare.connect("mem:node").await,
        Err(TransportError::InvalidAddress(_))
    ));
}
