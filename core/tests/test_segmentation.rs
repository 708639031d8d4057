//! Segmentation and reassembly across the whole stack.
//!
//! Run with: cargo test --test test_segmentation

use btmesh_core::bearer::memory::Packet;
use btmesh_core::bearer::{BearerKind, MemoryMedium};
use btmesh_core::config::NetworkParameters;
use btmesh_core::effect::Effects;
use btmesh_core::layers::Security;
use btmesh_core::pdu::{Segment, SegmentKind};
use btmesh_core::sar::{IncomingSegment, Reassembler};
use btmesh_core::{
    Address, ApplicationKey, Bearer, Element, IvIndex, LowerTransportError, ManagerOptions,
    MeshAddress, MeshError, MeshEvent, MeshMessage, MeshNetwork, MeshNetworkManager, Model,
    ModelId, NetworkKey, Node, RequestKey, SendTarget,
};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

const NODE_A: Address = Address(0x0003);
const NODE_B: Address = Address(0x0005);
const VENDOR_TEST_OPCODE: u32 = 0x8050;

fn network(local: Address, remote: Address) -> MeshNetwork {
    let mut network = MeshNetwork::new("sar");
    network.iv_index = IvIndex::new(7, false);
    network.network_keys.push(NetworkKey::new(0, [0x5C; 16]));
    network.application_keys.push(ApplicationKey::new(0, [0x3A; 16], 0));
    for (address, slot) in [(local, true), (remote, false)] {
        let mut model = Model::new(ModelId::GENERIC_ON_OFF_CLIENT);
        model.bind.push(0);
        let mut node = Node::new(format!("{address}"), address, vec![Element::new(vec![model])]);
        node.network_keys.push(0);
        node.application_keys.push(0);
        if slot {
            network.local_node = Some(node);
        } else {
            network.nodes.push(node);
        }
    }
    network
}

fn options(params: NetworkParameters) -> ManagerOptions {
    ManagerOptions {
        parameters: params,
        ..ManagerOptions::default()
    }
}

async fn start(
    network: MeshNetwork,
    params: NetworkParameters,
    medium: &MemoryMedium,
) -> (MeshNetworkManager, mpsc::UnboundedReceiver<MeshEvent>, Arc<dyn Bearer>) {
    let (manager, events) = MeshNetworkManager::start(network, options(params)).unwrap();
    let bearer: Arc<dyn Bearer> = Arc::new(medium.bearer(BearerKind::Advertising));
    manager.set_bearer(bearer.clone()).await.unwrap();
    bearer.open().await.unwrap();
    (manager, events, bearer)
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
async fn test_unacknowledged_segments_exhaust_retransmissions() {
    let mut params = NetworkParameters::default();
    params.set_sar_unicast_retransmissions_count(2);
    params.set_sar_unicast_retransmissions_without_progress_count(2);
    params.set_sar_unicast_retransmissions_interval_step(Duration::from_millis(200));
    let interval = Duration::from_millis(200);

    let medium = MemoryMedium::new();
    let mut tap = medium.tap();
    // Node B is known but not on the medium: no Segment Acknowledgment ever comes.
    let (a, mut events, _bearer) = start(network(NODE_A, NODE_B), params, &medium).await;

    let started = Instant::now();
    let message = MeshMessage::new(VENDOR_TEST_OPCODE, vec![0x01, 0x02]).force_segmented();
    let mut handle = a.send(message, target(NODE_B, 0)).await.unwrap();
    let result = handle.completion().await;
    let elapsed = started.elapsed();

    assert_eq!(result, Err(MeshError::LowerTransport(LowerTransportError::Timeout)));
    assert!(elapsed >= interval * 2, "failed after {elapsed:?}");
    assert!(elapsed < interval * 2 + Duration::from_millis(50), "failed after {elapsed:?}");

    // One segment: the first transmission plus two retransmissions.
    let mut frames = 0;
    while let Ok(frame) = tap.try_recv() {
        assert!(matches!(frame.packet, Packet::Advertising { .. }));
        frames += 1;
    }
    assert_eq!(frames, 3);

    let failed = timeout(Duration::from_secs(1), async {
        loop {
            if let Some(MeshEvent::MessageFailed { id, error, .. }) = events.recv().await {
                return (id, error);
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(failed.0, handle.id());
    assert_eq!(failed.1, MeshError::LowerTransport(LowerTransportError::Timeout));
}

async fn deliver_segmented(message: MeshMessage) -> (Vec<u8>, bool) {
    let medium = MemoryMedium::new();
    let params = NetworkParameters::default();
    let (a, _a_events, _a_bearer) = start(network(NODE_A, NODE_B), params.clone(), &medium).await;
    let (_b, mut b_events, _b_bearer) = start(network(NODE_B, NODE_A), params, &medium).await;

    let mut handle = a.send(message, target(NODE_B, 5)).await.unwrap();
    assert_eq!(handle.completion().await.unwrap(), None);

    timeout(Duration::from_secs(30), async {
        loop {
            if let Some(MeshEvent::MessageReceived { message, .. }) = b_events.recv().await {
                return (message.pdu.parameters, message.segmented);
            }
        }
    })
    .await
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_long_message_is_reassembled_and_acknowledged() {
    let parameters: Vec<u8> = (0..=200u8).collect();
    let (received, segmented) =
        deliver_segmented(MeshMessage::new(VENDOR_TEST_OPCODE, parameters.clone())).await;
    assert!(segmented);
    assert_eq!(received, parameters);
}

#[tokio::test(start_paused = true)]
async fn test_high_security_uses_long_transmic() {
    let parameters = vec![0xEE; 30];
    let message = MeshMessage::new(VENDOR_TEST_OPCODE, parameters.clone()).with_security(Security::High);
    let (received, segmented) = deliver_segmented(message).await;
    assert!(segmented);
    assert_eq!(received, parameters);
}

#[tokio::test(start_paused = true)]
async fn test_queued_messages_to_same_destination_are_sent_in_order() {
    let medium = MemoryMedium::new();
    let params = NetworkParameters::default();
    let (a, _a_events, _a_bearer) = start(network(NODE_A, NODE_B), params.clone(), &medium).await;
    let (_b, mut b_events, _b_bearer) = start(network(NODE_B, NODE_A), params, &medium).await;

    let mut first = a
        .send(MeshMessage::new(VENDOR_TEST_OPCODE, vec![0x11; 40]), target(NODE_B, 5))
        .await
        .unwrap();
    let mut second = a
        .send(MeshMessage::new(VENDOR_TEST_OPCODE, vec![0x22; 40]), target(NODE_B, 5))
        .await
        .unwrap();
    assert_eq!(first.completion().await.unwrap(), None);
    assert_eq!(second.completion().await.unwrap(), None);

    let mut order = Vec::new();
    while order.len() < 2 {
        if let Some(MeshEvent::MessageReceived { message, .. }) = b_events.recv().await {
            order.push(message.pdu.parameters[0]);
        }
    }
    assert_eq!(order, vec![0x11, 0x22]);
}

// ============================================================================
// Reassembly in any order
// ============================================================================

const SEGMENT_SIZE: usize = 12;

fn segments(payload: &[u8], seq_zero: u16) -> Vec<Segment> {
    let chunks: Vec<&[u8]> = payload.chunks(SEGMENT_SIZE).collect();
    let seg_n = (chunks.len() - 1) as u8;
    chunks
        .into_iter()
        .enumerate()
        .map(|(seg_o, chunk)| Segment {
            kind: SegmentKind::Access {
                aid: Some(0x26),
                szmic: false,
            },
            seq_zero,
            seg_o: seg_o as u8,
            seg_n,
            payload: chunk.to_vec(),
        })
        .collect()
}

/// A payload and the order its segments arrive in, duplicates included.
fn arrival() -> impl Strategy<Value = (Vec<u8>, Vec<usize>)> {
    prop::collection::vec(any::<u8>(), 1..=380)
        .prop_flat_map(|payload| {
            let count = payload.len().div_ceil(SEGMENT_SIZE);
            let order = Just((0..count).collect::<Vec<_>>()).prop_shuffle();
            let duplicates = prop::collection::vec((0..count, any::<prop::sample::Index>()), 0..4);
            (Just(payload), order, duplicates)
        })
        .prop_map(|(payload, mut order, duplicates)| {
            for (segment, position) in duplicates {
                let at = position.index(order.len() + 1);
                order.insert(at, segment);
            }
            (payload, order)
        })
}

proptest! {
    #[test]
    fn test_reassembly_in_any_order((payload, order) in arrival()) {
        let params = NetworkParameters::default();
        let mut reassembler = Reassembler::new();
        let mut effects = Effects::new();
        let seq_zero = 0x0120;
        let segments = segments(&payload, seq_zero);

        let mut completed = Vec::new();
        for index in order {
            let incoming = IncomingSegment {
                source: NODE_A,
                destination: NODE_B,
                ttl: 4,
                sequence: u32::from(seq_zero) + index as u32,
                iv_index: 7,
                network_key_index: 0,
                segment: segments[index].clone(),
            };
            if let Some(message) = reassembler.handle(incoming, true, &params, Instant::now(), &mut effects) {
                completed.push(message);
            }
            effects.drain();
        }

        prop_assert_eq!(completed.len(), 1);
        prop_assert_eq!(&completed[0].data, &payload);
        prop_assert_eq!(completed[0].sequence, u32::from(seq_zero));
    }
}
