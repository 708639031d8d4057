//! Access layer: request validation, transaction identifiers, the lifecycle
//! of acknowledged messages, dispatch of received messages to models and
//! publication.

use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::upper::{AccessKey, AccessRequest, KeySelection, ReceivedAccess};
use super::AccessError;
use crate::address::{Address, MeshAddress};
use crate::config::NetworkParameters;
use crate::effect::{Effects, SendId, TimerKey};
use crate::keys::KeyIndex;
use crate::mesh::{MeshNetwork, ModelId, NetworkError, Node, PUBLISH_TTL_DEFAULT};
use crate::message::MeshMessage;
use crate::transaction::TRANSACTION_TIMEOUT;
use crate::MeshError;

/// Response delay range for requests sent to a unicast address, in ms.
const UNICAST_RESPONSE_DELAY_MS: (u64, u64) = (20, 50);
/// Response delay range for requests sent to a group or virtual address.
const MULTICAST_RESPONSE_DELAY_MS: (u64, u64) = (20, 500);

/// Key requested by the caller of a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKey {
    Application(KeyIndex),
    /// Device key of the destination node.
    Device,
    /// Device key of the local node, for responses of device-key models.
    OwnDevice,
}

/// What the access layer knows about the connected bearer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyContext {
    /// The bearer is a GATT connection to a proxy node.
    pub gatt: bool,
    /// Network key of the connected proxy, once known.
    pub network_key: Option<KeyIndex>,
}

/// A model a received message is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Route {
    pub element: Address,
    pub model: ModelId,
}

#[derive(Debug)]
struct OutgoingTransaction {
    tid: u8,
    started: Instant,
}

#[derive(Debug)]
struct AcknowledgedContext {
    request: AccessRequest,
    response_opcode: u32,
    retry_interval: Duration,
}

#[derive(Debug)]
struct PublicationRetransmission {
    request: AccessRequest,
    remaining: u8,
    interval: Duration,
}

#[derive(Debug, Default)]
pub struct AccessLayer {
    transactions: HashMap<(Address, Address), OutgoingTransaction>,
    acknowledged: HashMap<SendId, AcknowledgedContext>,
    publications: HashMap<(Address, ModelId), PublicationRetransmission>,
    delayed: HashMap<u64, AccessRequest>,
    next_delayed: u64,
}

fn local_node(network: &MeshNetwork) -> Result<&Node, MeshError> {
    Ok(network.local_node().ok_or(NetworkError::NoLocalNode)?)
}

/// TTL 1 is accepted: such messages stay on the local node.
fn is_valid_ttl(ttl: u8) -> bool {
    ttl <= 127
}

/// Unicast address of element `element` of the node at `node`, and the first
/// application key its `model` is bound to.
pub fn model_target(
    network: &MeshNetwork,
    node: Address,
    element: u8,
    model: ModelId,
) -> Result<(Address, KeyIndex), AccessError> {
    let target = network
        .node_with_address(node)
        .ok_or(AccessError::InvalidDestination(node))?;
    let address = target.unicast_address.offset(element);
    let bound = target
        .elements
        .get(usize::from(element))
        .and_then(|e| e.model(model))
        .ok_or(AccessError::ModelNotFound { element: address, model })?;
    let key = bound.bind.first().copied().ok_or(AccessError::ModelNotBound(model))?;
    Ok((address, key))
}

impl AccessLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks a send request and resolves its TTL and key. Fails before any
    /// traffic is generated.
    #[allow(clippy::too_many_arguments)]
    pub fn prepare(
        &self,
        id: SendId,
        message: &MeshMessage,
        source: Address,
        destination: MeshAddress,
        ttl: Option<u8>,
        key: RequestKey,
        network: &MeshNetwork,
        params: &NetworkParameters,
        proxy: ProxyContext,
    ) -> Result<AccessRequest, MeshError> {
        let node = local_node(network)?;
        if !node.contains_element(source) {
            return Err(AccessError::InvalidSource(source).into());
        }
        let ttl = ttl.or(node.default_ttl).unwrap_or(params.default_ttl);
        if !is_valid_ttl(ttl) {
            return Err(AccessError::InvalidTtl(ttl).into());
        }
        let address = destination.address;
        let valid_destination = match destination.virtual_label {
            _ if address.is_unassigned() => false,
            Some(label) => MeshAddress::from_label(label).address == address,
            None => !address.is_virtual(),
        };
        if !valid_destination {
            return Err(AccessError::InvalidDestination(address).into());
        }

        let (selection, network_key_index) = match key {
            RequestKey::Application(index) => {
                let app_key = network
                    .application_key(index)
                    .ok_or(NetworkError::NoApplicationKey(index))?;
                (KeySelection::Application(index), app_key.bound_network_key)
            }
            RequestKey::Device | RequestKey::OwnDevice => {
                if !address.is_unicast() {
                    return Err(AccessError::NoDeviceKey(address).into());
                }
                let target = network.node_with_address(address);
                let owner = match key {
                    RequestKey::OwnDevice => Some(node),
                    _ => target,
                };
                let device_key = owner
                    .and_then(|n| n.device_key)
                    .ok_or(AccessError::NoDeviceKey(address))?;
                let common = |k: &KeyIndex| target.map_or(true, |t| t.knows_network_key(*k));
                let network_key_index = proxy
                    .network_key
                    .filter(common)
                    .or_else(|| target.and_then(|t| t.network_keys.first().copied()))
                    .or_else(|| network.network_keys.first().map(|k| k.index))
                    .ok_or(NetworkError::NoNetworkKey(0))?;
                (
                    KeySelection::Device {
                        key: device_key,
                        network_key_index,
                    },
                    network_key_index,
                )
            }
        };
        if network.network_key(network_key_index).is_none() {
            return Err(NetworkError::NoNetworkKey(network_key_index).into());
        }

        if proxy.gatt && !network.is_local_unicast(address) {
            if ttl == 1 {
                return Err(AccessError::CannotRelay.into());
            }
            if let Some(proxy_key) = proxy.network_key {
                if proxy_key != network_key_index {
                    return Err(AccessError::NoCommonKeyWithProxy(network_key_index).into());
                }
            }
        }

        Ok(AccessRequest {
            id,
            source,
            destination,
            ttl,
            key: selection,
            pdu: message.to_access_pdu()?,
            security: message.security,
            force_segmented: message.segmented,
        })
    }

    /// Checks that `model` on `element` may send with `key`.
    pub fn check_binding(
        &self,
        element: Address,
        model: ModelId,
        key: KeyIndex,
        network: &MeshNetwork,
    ) -> Result<(), MeshError> {
        let node = local_node(network)?;
        let index = node
            .element_index(element)
            .ok_or(AccessError::InvalidElement(element))?;
        let bound = node
            .elements
            .get(index)
            .and_then(|e| e.model(model))
            .map(|m| m.is_bound_to(key))
            .unwrap_or(false);
        if !bound {
            return Err(AccessError::ModelNotBoundToAppKey { model, key }.into());
        }
        Ok(())
    }

    /// Fills in the TID of a transactional message. Consecutive messages from
    /// `source` to `destination` increment it; a message continuing a
    /// transaction younger than 6 s keeps it.
    pub fn assign_tid(&mut self, message: &mut MeshMessage, source: Address, destination: Address, now: Instant) {
        let Some(spec) = message.transaction else {
            return;
        };
        if spec.tid.is_some() {
            return;
        }
        let tid = match self.transactions.get_mut(&(source, destination)) {
            Some(last)
                if spec.continue_transaction
                    && now.saturating_duration_since(last.started) < TRANSACTION_TIMEOUT =>
            {
                last.tid
            }
            Some(last) => {
                last.tid = last.tid.wrapping_add(1);
                last.started = now;
                last.tid
            }
            None => {
                let tid = rand::thread_rng().gen();
                self.transactions
                    .insert((source, destination), OutgoingTransaction { tid, started: now });
                tid
            }
        };
        message.set_tid(tid);
    }

    /// Starts the response wait of an acknowledged request.
    pub fn register_acknowledged(
        &mut self,
        request: &AccessRequest,
        response_opcode: u32,
        params: &NetworkParameters,
        effects: &mut Effects,
    ) {
        let retry_interval = params.acknowledgment_message_interval(request.ttl, request.segment_count());
        effects.schedule(TimerKey::AcknowledgedRetry(request.id), retry_interval);
        effects.schedule(
            TimerKey::AcknowledgedTimeout(request.id),
            params.acknowledgment_message_timeout(),
        );
        self.acknowledged.insert(
            request.id,
            AcknowledgedContext {
                request: request.clone(),
                response_opcode,
                retry_interval,
            },
        );
    }

    pub fn is_awaiting_response(&self, id: SendId) -> bool {
        self.acknowledged.contains_key(&id)
    }

    /// Retry timer fired. Returns the request to send again, unless the
    /// target is still sending a segmented message to us.
    pub fn on_retry(
        &mut self,
        id: SendId,
        target_busy_sending: impl Fn(Address) -> bool,
        effects: &mut Effects,
    ) -> Option<AccessRequest> {
        let context = self.acknowledged.get_mut(&id)?;
        context.retry_interval *= 2;
        effects.schedule(TimerKey::AcknowledgedRetry(id), context.retry_interval);
        let target = context.request.destination.address;
        if target_busy_sending(target) {
            trace!(id, target = %target, "Retry skipped; target is sending to us");
            return None;
        }
        debug!(id, target = %target, "Resending acknowledged message");
        Some(context.request.clone())
    }

    /// Timeout fired. Returns whether the request was still waiting.
    pub fn on_timeout(&mut self, id: SendId, effects: &mut Effects) -> bool {
        if self.acknowledged.remove(&id).is_none() {
            return false;
        }
        warn!(id, "No response to acknowledged message");
        effects.cancel(TimerKey::AcknowledgedRetry(id));
        true
    }

    /// Matches a received message against the pending acknowledged requests.
    /// Only the first response resolves a request.
    pub fn on_response(&mut self, source: Address, opcode: u32, effects: &mut Effects) -> Option<SendId> {
        let id = self
            .acknowledged
            .iter()
            .filter(|(_, c)| {
                c.response_opcode == opcode
                    && (c.request.destination.address == source
                        || c.request.destination.address.is_multicast())
            })
            .map(|(id, _)| *id)
            .min()?;
        self.acknowledged.remove(&id);
        effects.cancel(TimerKey::AcknowledgedRetry(id));
        effects.cancel(TimerKey::AcknowledgedTimeout(id));
        Some(id)
    }

    /// Drops the response wait of `id`. Returns whether there was one.
    pub fn cancel(&mut self, id: SendId, effects: &mut Effects) -> bool {
        if self.acknowledged.remove(&id).is_none() {
            return false;
        }
        effects.cancel(TimerKey::AcknowledgedRetry(id));
        effects.cancel(TimerKey::AcknowledgedTimeout(id));
        true
    }

    /// Models a received message should be delivered to.
    pub fn routes(&self, received: &ReceivedAccess, network: &MeshNetwork) -> Vec<Route> {
        let Some(node) = network.local_node() else {
            return Vec::new();
        };
        let destination = received.destination.address;
        let mut routes = Vec::new();
        for (index, (element, e)) in node.elements_with_addresses().enumerate() {
            for model in &e.models {
                let addressed = if destination.is_unicast() {
                    destination == element
                } else if destination == Address::ALL_NODES {
                    index == 0 || model.is_subscribed_to(destination)
                } else {
                    model.is_subscribed_to(destination)
                };
                if !addressed {
                    continue;
                }
                let keyed = match received.key {
                    AccessKey::Application(key) => model.is_bound_to(key),
                    AccessKey::Device => true,
                };
                if keyed {
                    routes.push(Route {
                        element,
                        model: model.model_id,
                    });
                }
            }
        }
        routes
    }

    /// Parks a response for a random delay.
    pub fn schedule_response(&mut self, request: AccessRequest, to_multicast: bool, effects: &mut Effects) {
        let (min, max) = if to_multicast {
            MULTICAST_RESPONSE_DELAY_MS
        } else {
            UNICAST_RESPONSE_DELAY_MS
        };
        let delay = Duration::from_millis(rand::thread_rng().gen_range(min..=max));
        let token = self.next_delayed;
        self.next_delayed = self.next_delayed.wrapping_add(1);
        self.delayed.insert(token, request);
        effects.schedule(TimerKey::DelayedReply(token), delay);
    }

    pub fn take_response(&mut self, token: u64) -> Option<AccessRequest> {
        self.delayed.remove(&token)
    }

    /// Request for a publication of `message` by `model` on `element`,
    /// following the model's publish configuration.
    #[allow(clippy::too_many_arguments)]
    pub fn prepare_publication(
        &self,
        id: SendId,
        message: &MeshMessage,
        element: Address,
        model: ModelId,
        network: &MeshNetwork,
        params: &NetworkParameters,
        proxy: ProxyContext,
    ) -> Result<AccessRequest, MeshError> {
        let node = local_node(network)?;
        let publish = node
            .element_index(element)
            .and_then(|i| node.elements.get(i))
            .ok_or(AccessError::InvalidElement(element))?
            .model(model)
            .and_then(|m| m.publish.clone())
            .ok_or(AccessError::NoPublication(model))?;
        let ttl = (publish.ttl != PUBLISH_TTL_DEFAULT).then_some(publish.ttl);
        self.prepare(
            id,
            message,
            element,
            publish.address,
            ttl,
            RequestKey::Application(publish.app_key_index),
            network,
            params,
            proxy,
        )
    }

    /// Schedules the retransmissions of a publication just sent.
    pub fn start_publication_retransmissions(
        &mut self,
        element: Address,
        model: ModelId,
        request: AccessRequest,
        network: &MeshNetwork,
        effects: &mut Effects,
    ) {
        let retransmit = network
            .local_node()
            .and_then(|n| n.element_index(element).and_then(|i| n.elements.get(i)))
            .and_then(|e| e.model(model))
            .and_then(|m| m.publish.as_ref())
            .map(|p| p.retransmit);
        let timer = TimerKey::PublicationRetransmit { element, model };
        effects.cancel(timer);
        self.publications.remove(&(element, model));
        let Some(retransmit) = retransmit.filter(|r| r.count > 0) else {
            return;
        };
        let interval = retransmit.interval();
        effects.schedule(timer, interval);
        self.publications.insert(
            (element, model),
            PublicationRetransmission {
                request,
                remaining: retransmit.count,
                interval,
            },
        );
    }

    /// Publication retransmit timer fired: the request to send again.
    pub fn on_publication_retransmit(
        &mut self,
        element: Address,
        model: ModelId,
        effects: &mut Effects,
    ) -> Option<AccessRequest> {
        let state = self.publications.get_mut(&(element, model))?;
        state.remaining -= 1;
        let request = state.request.clone();
        if state.remaining > 0 {
            effects.schedule(TimerKey::PublicationRetransmit { element, model }, state.interval);
        } else {
            self.publications.remove(&(element, model));
        }
        Some(request)
    }
}
