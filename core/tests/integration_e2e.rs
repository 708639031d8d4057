//! End-to-end tests: two managers talking over an in-memory advertising
//! bearer.
//!
//! Run with: cargo test --test integration_e2e

use btmesh_core::bearer::{BearerKind, MemoryMedium};
use btmesh_core::layers::upper::AccessKey;
use btmesh_core::mesh::Publish;
use btmesh_core::models::generic_onoff::{
    GenericOnOffClient, GenericOnOffMessage, GenericOnOffServer, GENERIC_ON_OFF_GET,
    GENERIC_ON_OFF_STATUS,
};
use btmesh_core::message::MessageDecoder;
use btmesh_core::{
    AccessError, Address, ApplicationKey, Bearer, BearerError, Element, IvIndex, ManagerOptions,
    MeshAddress, MeshError, MeshEvent, MeshMessage, MeshNetwork, MeshNetworkManager,
    MessageContext, Model, ModelDelegate, ModelError, ModelId, NetworkKey, Node, RequestKey,
    SendTarget,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const NODE_A: Address = Address(0x0003);
const NODE_B: Address = Address(0x0005);
const STATUS_GROUP: Address = Address(0xC002);

fn node(name: &str, address: Address, device_key: u8) -> Node {
    let mut server = Model::new(ModelId::GENERIC_ON_OFF_SERVER);
    server.bind.push(0);
    let mut client = Model::new(ModelId::GENERIC_ON_OFF_CLIENT);
    client.bind.push(0);
    let mut node = Node::new(name, address, vec![Element::new(vec![server, client])]);
    node.network_keys.push(0);
    node.application_keys.push(0);
    node.device_key = Some([device_key; 16]);
    node
}

/// The same network seen from `local`: shared keys, both nodes known.
fn network(local: Address) -> MeshNetwork {
    let mut network = MeshNetwork::new("e2e");
    network.iv_index = IvIndex::new(0x0000_0010, false);
    network.network_keys.push(NetworkKey::new(
        0,
        hex_key("7dd7364cd842ad18c17c2b820c84c3d6"),
    ));
    network.application_keys.push(ApplicationKey::new(
        0,
        hex_key("63964771734fbd76e3b40519d1d94a48"),
        0,
    ));
    let a = node("A", NODE_A, 0xA0);
    let b = node("B", NODE_B, 0xB0);
    let (local_node, remote) = if local == NODE_A { (a, b) } else { (b, a) };
    network.local_node = Some(local_node);
    network.nodes.push(remote);
    network
}

fn hex_key(s: &str) -> [u8; 16] {
    hex::decode(s).unwrap().try_into().unwrap()
}

async fn start(
    network: MeshNetwork,
    medium: &MemoryMedium,
) -> (MeshNetworkManager, mpsc::UnboundedReceiver<MeshEvent>, Arc<dyn Bearer>) {
    let (manager, events) = MeshNetworkManager::start(network, ManagerOptions::default()).unwrap();
    let bearer: Arc<dyn Bearer> = Arc::new(medium.bearer(BearerKind::Advertising));
    manager.set_bearer(bearer.clone()).await.unwrap();
    bearer.open().await.unwrap();
    (manager, events, bearer)
}

async fn next_event(
    events: &mut mpsc::UnboundedReceiver<MeshEvent>,
    mut matches: impl FnMut(&MeshEvent) -> bool,
) -> MeshEvent {
    timeout(Duration::from_secs(60), async {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not received")
}

fn target(destination: Address, ttl: u8) -> SendTarget {
    SendTarget {
        source: None,
        destination: MeshAddress::new(destination),
        ttl: Some(ttl),
        key: RequestKey::Application(0),
    }
}

#[tokio::test(start_paused = true)]
async fn test_acknowledged_set_between_two_nodes() {
    let medium = MemoryMedium::new();
    let (a, _a_events, _a_bearer) = start(network(NODE_A), &medium).await;
    let (b, mut b_events, _b_bearer) = start(network(NODE_B), &medium).await;

    let state = Arc::new(Mutex::new(false));
    b.register_model(NODE_B, ModelId::GENERIC_ON_OFF_SERVER, GenericOnOffServer::new(state.clone()))
        .await
        .unwrap();

    let response = timeout(
        Duration::from_secs(30),
        a.send_acknowledged(GenericOnOffMessage::set(true), target(NODE_B, 4)),
    )
    .await
    .expect("no response within the acknowledgment timeout")
    .unwrap();

    assert_eq!(response.source, NODE_B);
    assert_eq!(response.pdu.opcode, GENERIC_ON_OFF_STATUS);
    assert_eq!(response.pdu.parameters, vec![1]);
    assert_eq!(response.key, AccessKey::Application(0));
    assert!(*state.lock());

    let received = next_event(&mut b_events, |e| matches!(e, MeshEvent::MessageReceived { .. })).await;
    match received {
        MeshEvent::MessageReceived { message, handled } => {
            assert!(handled);
            assert_eq!(message.source, NODE_A);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_get_is_answered_and_waited_for() {
    let medium = MemoryMedium::new();
    let (a, _a_events, _a_bearer) = start(network(NODE_A), &medium).await;
    let (b, _b_events, _b_bearer) = start(network(NODE_B), &medium).await;
    b.register_model(NODE_B, ModelId::GENERIC_ON_OFF_SERVER, GenericOnOffServer::new(Arc::new(Mutex::new(true))))
        .await
        .unwrap();

    let waiter = {
        let a = a.clone();
        tokio::spawn(async move {
            a.wait_for(GENERIC_ON_OFF_STATUS, NODE_B, Some(NODE_A), Duration::from_secs(10))
                .await
        })
    };
    tokio::task::yield_now().await;

    let mut handle = a
        .send(GenericOnOffMessage::get(), target(NODE_B, 3))
        .await
        .unwrap();
    assert_eq!(handle.opcode(), GENERIC_ON_OFF_GET);
    assert_eq!(handle.source(), NODE_A);

    let response = handle.completion().await.unwrap().unwrap();
    let waited = waiter.await.unwrap().unwrap();
    assert_eq!(response.pdu, waited.pdu);
    assert_eq!(waited.pdu.parameters, vec![1]);
}

#[tokio::test(start_paused = true)]
async fn test_device_key_message_reaches_remote_node() {
    let medium = MemoryMedium::new();
    let (a, _a_events, _a_bearer) = start(network(NODE_A), &medium).await;
    let (_b, mut b_events, _b_bearer) = start(network(NODE_B), &medium).await;

    let mut handle = a
        .send_with_device_key(btmesh_core::MeshMessage::new(0x8008, vec![]), NODE_B, Some(5))
        .await
        .unwrap();
    handle.completion().await.unwrap();

    let received = next_event(&mut b_events, |e| matches!(e, MeshEvent::MessageReceived { .. })).await;
    match received {
        MeshEvent::MessageReceived { message, handled } => {
            assert_eq!(message.key, AccessKey::Device);
            assert_eq!(message.pdu.opcode, 0x8008);
            // No model of B handles this opcode.
            assert!(!handled);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_publication_reaches_group_subscriber() {
    let medium = MemoryMedium::new();

    let mut a_network = network(NODE_A);
    if let Some(node) = a_network.local_node.as_mut() {
        let client = node.elements[0]
            .model_mut(ModelId::GENERIC_ON_OFF_CLIENT)
            .unwrap();
        client.subscribe.push(MeshAddress::new(STATUS_GROUP));
    }
    let mut b_network = network(NODE_B);
    if let Some(node) = b_network.local_node.as_mut() {
        let server = node.elements[0]
            .model_mut(ModelId::GENERIC_ON_OFF_SERVER)
            .unwrap();
        server.publish = Some(Publish::new(MeshAddress::new(STATUS_GROUP), 0));
    }

    let (a, mut a_events, _a_bearer) = start(a_network, &medium).await;
    let (b, _b_events, _b_bearer) = start(b_network, &medium).await;

    let last_status = Arc::new(Mutex::new(None));
    a.register_model(NODE_A, ModelId::GENERIC_ON_OFF_CLIENT, GenericOnOffClient::new(last_status.clone()))
        .await
        .unwrap();
    b.register_model(NODE_B, ModelId::GENERIC_ON_OFF_SERVER, GenericOnOffServer::new(Arc::new(Mutex::new(true))))
        .await
        .unwrap();

    let mut handle = b.publish(NODE_B, ModelId::GENERIC_ON_OFF_SERVER).await.unwrap();
    assert_eq!(handle.destination().address, STATUS_GROUP);
    assert_eq!(handle.completion().await.unwrap(), None);

    next_event(&mut a_events, |e| {
        matches!(e, MeshEvent::MessageReceived { message, handled: true } if message.destination.address == STATUS_GROUP)
    })
    .await;
    assert_eq!(*last_status.lock(), Some(true));
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_reports_hops() {
    let medium = MemoryMedium::new();
    let (a, _a_events, _a_bearer) = start(network(NODE_A), &medium).await;
    let (_b, mut b_events, _b_bearer) = start(network(NODE_B), &medium).await;

    a.send_heartbeat(NODE_B, 5, 0).await.unwrap();

    let event = next_event(&mut b_events, |e| matches!(e, MeshEvent::HeartbeatReceived { .. })).await;
    match event {
        MeshEvent::HeartbeatReceived {
            source,
            heartbeat,
            hops,
            ..
        } => {
            assert_eq!(source, NODE_A);
            assert_eq!(heartbeat.init_ttl, 5);
            assert_eq!(hops, 1);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_invalid_requests_fail_before_sending() {
    let medium = MemoryMedium::new();
    let mut tap = medium.tap();
    let (a, _a_events, _a_bearer) = start(network(NODE_A), &medium).await;

    let err = a
        .send(GenericOnOffMessage::get(), target(NODE_B, 128))
        .await
        .unwrap_err();
    assert_eq!(err, MeshError::Access(btmesh_core::AccessError::InvalidTtl(128)));

    let err = a
        .send(
            GenericOnOffMessage::get(),
            SendTarget {
                source: Some(Address(0x0042)),
                ..target(NODE_B, 4)
            },
        )
        .await
        .unwrap_err();
    assert_eq!(
        err,
        MeshError::Access(btmesh_core::AccessError::InvalidSource(Address(0x0042)))
    );

    assert!(tap.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_bearer_close_fails_pending_acknowledged_message() {
    let medium = MemoryMedium::new();
    let (a, mut a_events, a_bearer) = start(network(NODE_A), &medium).await;

    // Nobody answers at 0x0009.
    let mut handle = a
        .send(GenericOnOffMessage::get(), target(Address(0x0009), 4))
        .await
        .unwrap();
    a_bearer.close().await.unwrap();

    assert_eq!(
        handle.completion().await,
        Err(MeshError::Bearer(BearerError::Closed))
    );
    next_event(&mut a_events, |e| matches!(e, MeshEvent::BearerClosed(None))).await;
}

#[tokio::test(start_paused = true)]
async fn test_send_to_model_uses_element_address_and_bound_key() {
    let medium = MemoryMedium::new();
    let mut a_network = network(NODE_A);
    // A second element on B whose server is bound to key 1 first.
    a_network.application_keys.push(ApplicationKey::new(
        1,
        hex_key("0953fa93e7caac9638f58820220a398e"),
        0,
    ));
    let mut server = Model::new(ModelId::GENERIC_ON_OFF_SERVER);
    server.bind = vec![1, 0];
    a_network.nodes[0].elements.push(Element::new(vec![server]));
    a_network.nodes[0].elements[0]
        .model_mut(ModelId::GENERIC_ON_OFF_CLIENT)
        .unwrap()
        .bind
        .clear();

    let mut b_network = network(NODE_B);
    b_network.application_keys = a_network.application_keys.clone();
    if let Some(node) = b_network.local_node.as_mut() {
        let mut server = Model::new(ModelId::GENERIC_ON_OFF_SERVER);
        server.bind = vec![1, 0];
        node.elements.push(Element::new(vec![server]));
        node.application_keys.push(1);
    }

    let (a, _a_events, _a_bearer) = start(a_network, &medium).await;
    let (b, _b_events, _b_bearer) = start(b_network, &medium).await;
    let state = Arc::new(Mutex::new(false));
    b.register_model(
        NODE_B.offset(1),
        ModelId::GENERIC_ON_OFF_SERVER,
        GenericOnOffServer::new(state.clone()),
    )
    .await
    .unwrap();

    let mut handle = a
        .send_to_model(GenericOnOffMessage::set(true), NODE_B, 1, ModelId::GENERIC_ON_OFF_SERVER)
        .await
        .unwrap();
    assert_eq!(handle.destination().address, NODE_B.offset(1));
    let response = handle.completion().await.unwrap().unwrap();
    assert_eq!(response.source, NODE_B.offset(1));
    assert_eq!(response.key, AccessKey::Application(1));
    assert!(*state.lock());

    let err = a
        .send_to_model(GenericOnOffMessage::get(), NODE_B, 0, ModelId::GENERIC_ON_OFF_CLIENT)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        MeshError::Access(AccessError::ModelNotBound(ModelId::GENERIC_ON_OFF_CLIENT))
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancel_in_flight_and_after_completion() {
    let medium = MemoryMedium::new();
    let (a, _a_events, _a_bearer) = start(network(NODE_A), &medium).await;
    let (b, _b_events, _b_bearer) = start(network(NODE_B), &medium).await;
    b.register_model(NODE_B, ModelId::GENERIC_ON_OFF_SERVER, GenericOnOffServer::new(Arc::new(Mutex::new(true))))
        .await
        .unwrap();

    // Nobody answers at 0x0009.
    let mut acknowledged = a
        .send(GenericOnOffMessage::get(), target(Address(0x0009), 4))
        .await
        .unwrap();
    acknowledged.cancel().await.unwrap();
    assert_eq!(
        acknowledged.completion().await,
        Err(MeshError::Access(AccessError::Cancelled))
    );

    // Nobody acknowledges the segments either.
    let mut segmented = a
        .send(MeshMessage::new(0x8203, vec![0x5A; 40]), target(Address(0x0009), 4))
        .await
        .unwrap();
    a.cancel(&segmented).await.unwrap();
    assert_eq!(
        segmented.completion().await,
        Err(MeshError::Access(AccessError::Cancelled))
    );

    let mut answered = a
        .send(GenericOnOffMessage::get(), target(NODE_B, 4))
        .await
        .unwrap();
    let response = answered.completion().await.unwrap().unwrap();
    answered.cancel().await.unwrap();
    assert_eq!(answered.completion().await, Ok(Some(response)));

    // The engine is still serving requests.
    a.network().await.unwrap();
}

/// Server that rejects every Get it receives.
struct RejectingServer {
    received: Arc<Mutex<u32>>,
}

impl ModelDelegate for RejectingServer {
    type Message = ();

    fn decoders(&self) -> Vec<(u32, MessageDecoder<Self::Message>)> {
        fn decode(parameters: &[u8]) -> Option<()> {
            parameters.is_empty().then_some(())
        }
        vec![(GENERIC_ON_OFF_GET, decode as MessageDecoder<()>)]
    }

    fn handle(&mut self, _message: (), _context: &MessageContext) -> Result<Option<MeshMessage>, ModelError> {
        *self.received.lock() += 1;
        Err(ModelError::InvalidMessage)
    }
}

#[tokio::test(start_paused = true)]
async fn test_rejected_request_gets_no_response() {
    let medium = MemoryMedium::new();
    let (a, _a_events, _a_bearer) = start(network(NODE_A), &medium).await;
    let (b, _b_events, _b_bearer) = start(network(NODE_B), &medium).await;
    let received = Arc::new(Mutex::new(0));
    b.register_model(
        NODE_B,
        ModelId::GENERIC_ON_OFF_SERVER,
        RejectingServer {
            received: received.clone(),
        },
    )
    .await
    .unwrap();

    let err = a
        .send_acknowledged(GenericOnOffMessage::get(), target(NODE_B, 4))
        .await
        .unwrap_err();
    assert_eq!(err, MeshError::Access(AccessError::Timeout));
    assert!(*received.lock() >= 1);
}
