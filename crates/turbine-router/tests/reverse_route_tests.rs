//! Reverse Route Tests
//!
//! Negotiating a route back over an outbound link:
//! - A silent peer times out
//! - An existing reverse route short-circuits the request
//! - A refusal and a dropped link are protocol errors
//! - Stopping the topology interrupts the wait

use std::sync::Arc;
use std::time::Duration;
use turbine_core::{
    codec, Message, Reply, ReverseRouteRequest, Role, ServerIdentity, ServerName, Wait,
};
use turbine_router::{Direction, Link, ReverseRouteNegotiator, RouterError, TopologyManager};
use turbine_transport::{
    MemoryNetwork, MemoryReceiver, MemorySender, MemoryServer, TransportEvent,
    TransportReceiver, TransportServer,
};

fn identity(s: &str) -> ServerIdentity {
    ServerIdentity::parse(s, &format!("mem:{}", s.trim_start_matches('/').replace('/', "."))).unwrap()
}

fn name(s: &str) -> ServerName {
    ServerName::parse(s).unwrap()
}

fn request(requester: &str) -> ReverseRouteRequest {
    ReverseRouteRequest {
        requester: identity(requester),
        role: Role::Peer,
        descendants: vec![],
        shortcut: None,
    }
}

/// Dial `mem:peer`, returning our link plus the accepted far end
async fn link_to_peer(
    network: &MemoryNetwork,
) -> (Arc<Link>, MemorySender, MemoryReceiver, MemoryServer) {
    let mut server = network.bind("mem:peer").unwrap();
    let (sender, _) = network.connect("mem:peer").await.unwrap();
    let (far_sender, far_receiver, _) = server.accept().await.unwrap();

    let link = Arc::new(Link::new(Arc::new(sender), Direction::Outbound));
    link.set_remote(identity("/peer"));
    (link, far_sender, far_receiver, server)
}

/// Read the next request id the far end receives
async fn next_request_id(receiver: &mut MemoryReceiver) -> u64 {
    match receiver.recv().await {
        Some(TransportEvent::Data(data)) => match codec::decode(&data).unwrap() {
            Message::ReverseRoute { id, .. } => id,
            other => panic!("expected REVERSE_ROUTE, got {}", other.type_name()),
        },
        other => panic!("expected data, got {:?}", other),
    }
}

/// A peer that never answers yields Timeout, not a protocol error
#[tokio::test]
async fn test_silent_peer_times_out() {
    let network = MemoryNetwork::new();
    let (link, _far_sender, _far_receiver, _server) = link_to_peer(&network).await;

    let topology = Arc::new(TopologyManager::new(identity("/local")));
    let negotiator = ReverseRouteNegotiator::new(topology.clone());

    let started = std::time::Instant::now();
    let result = negotiator
        .ensure_reverse_route(
            link.clone(),
            request("/local"),
            Wait::For(Duration::from_millis(200)),
        )
        .await;

    assert!(matches!(result, Err(RouterError::Timeout)), "got {:?}", result);
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(started.elapsed() < Duration::from_secs(5));
}

/// An existing reverse route counts as handled without asking again
#[tokio::test]
async fn test_existing_reverse_route_short_circuits() {
    let network = MemoryNetwork::new();
    let (link, _far_sender, mut far_receiver, _server) = link_to_peer(&network).await;

    let topology = Arc::new(TopologyManager::new(identity("/local")));
    topology.record_reverse_route(name("/peer"), "inbound-link".into());
    let negotiator = ReverseRouteNegotiator::new(topology);

    let handled = negotiator
        .ensure_reverse_route(link, request("/local"), Wait::Immediate)
        .await
        .unwrap();
    assert!(handled);

    // Nothing was sent to the peer
    let nothing = tokio::time::timeout(Duration::from_millis(50), far_receiver.recv()).await;
    assert!(nothing.is_err());
}

/// Accepted plus the inbound registration completes the negotiation
#[tokio::test]
async fn test_accepted_reverse_route_registers() {
    let network = MemoryNetwork::new();
    let (link, _far_sender, mut far_receiver, _server) = link_to_peer(&network).await;

    let topology = Arc::new(TopologyManager::new(identity("/local")));
    let negotiator = ReverseRouteNegotiator::new(topology.clone());
    let pending = negotiator.spawn(
        link.clone(),
        request("/local"),
        Wait::For(Duration::from_secs(5)),
    );

    let id = next_request_id(&mut far_receiver).await;
    // The peer dials back, then answers
    topology.record_reverse_route(name("/peer"), "inbound-link".into());
    link.complete(id, Reply::Accepted);

    assert!(pending.await.unwrap().unwrap());

    let again = negotiator
        .ensure_reverse_route(link, request("/local"), Wait::Immediate)
        .await
        .unwrap();
    assert!(again);
}

/// A refusal is a protocol error
#[tokio::test]
async fn test_refusal_is_protocol_error() {
    let network = MemoryNetwork::new();
    let (link, _far_sender, mut far_receiver, _server) = link_to_peer(&network).await;

    let topology = Arc::new(TopologyManager::new(identity("/local")));
    let negotiator = ReverseRouteNegotiator::new(topology);
    let pending = negotiator.spawn(
        link.clone(),
        request("/local"),
        Wait::For(Duration::from_secs(5)),
    );

    let id = next_request_id(&mut far_receiver).await;
    link.complete(id, Reply::Refused("no".into()));

    assert!(matches!(
        pending.await.unwrap(),
        Err(RouterError::Protocol(_))
    ));
}

/// A link closing under the negotiation is a protocol error
#[tokio::test]
async fn test_link_loss_is_protocol_error() {
    let network = MemoryNetwork::new();
    let (link, _far_sender, mut far_receiver, _server) = link_to_peer(&network).await;

    let topology = Arc::new(TopologyManager::new(identity("/local")));
    let negotiator = ReverseRouteNegotiator::new(topology);
    let pending = negotiator.spawn(
        link.clone(),
        request("/local"),
        Wait::For(Duration::from_secs(5)),
    );

    next_request_id(&mut far_receiver).await;
    link.close().await;

    assert!(matches!(
        pending.await.unwrap(),
        Err(RouterError::Protocol(_))
    ));
}

/// Stopping the topology interrupts a negotiation that would wait forever
#[tokio::test]
async fn test_stop_interrupts_negotiation() {
    let network = MemoryNetwork::new();
    let (link, _far_sender, mut far_receiver, _server) = link_to_peer(&network).await;

    let topology = Arc::new(TopologyManager::new(identity("/local")));
    let negotiator = ReverseRouteNegotiator::new(topology.clone());
    let pending = negotiator.spawn(link, request("/local"), Wait::Forever);

    next_request_id(&mut far_receiver).await;
    topology.stop();

    let result = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(RouterError::Interrupted)));
}

/// A link without a completed handshake cannot negotiate
#[tokio::test]
async fn test_anonymous_link_is_rejected() {
    let network = MemoryNetwork::new();
    let _server = network.bind("mem:anon").unwrap();
    let (sender, _receiver) = network.connect("mem:anon").await.unwrap();
    let link = Arc::new(Link::new(Arc::new(sender), Direction::Outbound));

    let negotiator = ReverseRouteNegotiator::new(Arc::new(TopologyManager::new(identity("/local"))));
    let result = negotiator
        .ensure_reverse_route(link, request("/local"), Wait::Immediate)
        .await;
    assert!(matches!(result, Err(RouterError::Protocol(_))));
}
