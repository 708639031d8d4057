//! The processing task.
//!
//! Owns the network configuration and the state of every layer. Commands are
//! handled one at a time; the effects they produce are executed before the
//! next command is taken, so layer state never needs a lock.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use super::delegate::DelegateJob;
use super::timer::TimerRegistry;
use super::{
    Accepted, Command, Delivery, ManagerOptions, MeshEvent, ProxyFilterRequest, SendTarget,
};
use crate::address::{Address, MeshAddress};
use crate::bearer::{Bearer, BearerError, PduType};
use crate::config::NetworkParameters;
use crate::effect::{Effect, Effects, OutgoingPdu, SendId, TimerKey};
use crate::keys::KeyIndex;
use crate::layers::access::{model_target, ProxyContext, RequestKey};
use crate::layers::lower::UpperTransportPayload;
use crate::layers::network::ReceivedPdu;
use crate::layers::upper::{AccessRequest, ReceivedAccess, SendOutcome};
use crate::layers::{
    AccessError, AccessKey, AccessLayer, LowerTransportLayer, NetworkLayer, UpperTransportLayer,
};
use crate::mesh::{MeshNetwork, ModelId, NetworkError, Publish};
use crate::message::{AnyModel, MeshMessage, ModelRegistry};
use crate::pdu::{Heartbeat, NetworkPdu, ProxyConfigurationMessage};
use crate::proxy_filter::{ProxyFilter, ProxyFilterEvent, ProxyFilterSetup};
use crate::sar::LowerTransportError;
use crate::store::{self, Storage};
use crate::MeshError;

/// Id of segmented control messages, which nobody waits for.
const CONTROL_SEND_ID: SendId = 0;

struct PendingSend {
    destination: Address,
    acknowledged: bool,
    completion: oneshot::Sender<Delivery>,
}

struct Waiter {
    token: u64,
    destination: Option<Address>,
    reply: oneshot::Sender<Result<ReceivedAccess, MeshError>>,
}

pub(crate) struct Engine {
    network: MeshNetwork,
    params: NetworkParameters,
    storage: Arc<dyn Storage>,
    filter_setup: ProxyFilterSetup,
    registry: Arc<Mutex<ModelRegistry>>,

    network_layer: NetworkLayer,
    lower: LowerTransportLayer,
    upper: UpperTransportLayer,
    access: AccessLayer,
    proxy_filter: ProxyFilter,
    bearer: Option<Arc<dyn Bearer>>,

    timers: TimerRegistry,
    jobs: mpsc::UnboundedSender<DelegateJob>,
    sends: HashMap<SendId, PendingSend>,
    waiters: HashMap<(u32, Address), Waiter>,
    /// Sends that went out as a single PDU during the current command.
    unsegmented: Vec<SendId>,
    next_id: SendId,
    next_wait: u64,
    dirty: bool,
}

impl Engine {
    pub fn new(
        network: MeshNetwork,
        options: ManagerOptions,
        registry: Arc<Mutex<ModelRegistry>>,
        commands: mpsc::WeakSender<Command>,
        jobs: mpsc::UnboundedSender<DelegateJob>,
    ) -> Self {
        Self {
            lower: LowerTransportLayer::new(&options.parameters, &network),
            network,
            params: options.parameters,
            storage: options.storage,
            filter_setup: options.proxy_filter,
            registry,
            network_layer: NetworkLayer::new(),
            upper: UpperTransportLayer::new(),
            access: AccessLayer::new(),
            proxy_filter: ProxyFilter::new(),
            bearer: None,
            timers: TimerRegistry::new(commands),
            jobs,
            sends: HashMap::new(),
            waiters: HashMap::new(),
            unsegmented: Vec::new(),
            next_id: CONTROL_SEND_ID + 1,
            next_wait: 0,
            dirty: false,
        }
    }

    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            if matches!(command, Command::Shutdown) {
                info!("Mesh network manager shutting down");
                break;
            }
            self.handle(command);
            if self.dirty {
                self.persist();
            }
        }
        self.timers.cancel_all();
        for (_, pending) in self.sends.drain() {
            let _ = pending.completion.send(Err(MeshError::Shutdown));
        }
        for (_, waiter) in self.waiters.drain() {
            let _ = waiter.reply.send(Err(MeshError::Shutdown));
        }
        if self.dirty {
            self.persist();
        }
        debug!("Processing task finished");
    }

    fn persist(&mut self) {
        self.dirty = false;
        if let Err(e) = store::save_network(self.storage.as_ref(), &self.network) {
            error!(error = %e, "Failed to save the network configuration");
        }
    }

    fn handle(&mut self, command: Command) {
        let mut effects = Effects::new();
        match command {
            Command::Send {
                message,
                target,
                completion,
                reply,
            } => {
                let result = self.send(message, target, completion, &mut effects);
                let _ = reply.send(result);
            }
            Command::Publish {
                element,
                model,
                completion,
                reply,
            } => {
                let result = self.publish(element, model, Some(completion), &mut effects);
                let _ = reply.send(result);
            }
            Command::Cancel(id) => {
                if self.sends.contains_key(&id) {
                    debug!(id, "Message cancelled");
                    self.fail_send(id, AccessError::Cancelled.into(), &mut effects);
                }
            }
            Command::ResolveModel {
                node,
                element,
                model,
                reply,
            } => {
                let result = model_target(&self.network, node, element, model)
                    .map_err(MeshError::from);
                let _ = reply.send(result);
            }
            Command::Respond {
                element,
                model,
                response,
                request,
            } => self.respond(element, model, response, &request, &mut effects),
            Command::WaitFor {
                opcode,
                source,
                destination,
                timeout,
                reply,
            } => {
                if self.waiters.contains_key(&(opcode, source)) {
                    let _ = reply.send(Err(MeshError::WaitAlreadyPending));
                } else {
                    let token = self.next_wait;
                    self.next_wait += 1;
                    if !timeout.is_zero() {
                        effects.schedule(TimerKey::WaitTimeout(token), timeout);
                    }
                    self.waiters.insert(
                        (opcode, source),
                        Waiter {
                            token,
                            destination,
                            reply,
                        },
                    );
                }
            }
            Command::RegisterModel {
                element,
                model,
                delegate,
                reply,
            } => {
                let result = self.register_model(element, model, delegate, &mut effects);
                let _ = reply.send(result);
            }
            Command::SendHeartbeat {
                destination,
                init_ttl,
                network_key_index,
                reply,
            } => {
                let result =
                    self.send_heartbeat(destination, init_ttl, network_key_index, &mut effects);
                let _ = reply.send(result);
            }
            Command::SendBeacon {
                network_key_index,
                reply,
            } => {
                let _ = reply.send(self.send_beacon(network_key_index));
            }
            Command::ProxyFilter(request) => {
                match request {
                    ProxyFilterRequest::SetType(filter_type) => self.proxy_filter.set_type(filter_type),
                    ProxyFilterRequest::Add(addresses) => self.proxy_filter.add(&addresses),
                    ProxyFilterRequest::Remove(addresses) => self.proxy_filter.remove(&addresses),
                }
                if self.network_layer.proxy_network_key().is_some() {
                    self.flush_proxy_filter();
                }
            }
            Command::SetBearer(bearer) => {
                info!(gatt = bearer.is_gatt(), "Bearer attached");
                self.network_layer.set_proxy_network_key(None);
                self.proxy_filter.reset();
                self.bearer = Some(bearer);
            }
            Command::BearerOpened => {
                info!("Bearer open");
                self.emit(MeshEvent::BearerOpened);
            }
            Command::BearerClosed(reason) => self.on_bearer_closed(reason, &mut effects),
            Command::BearerData { data, pdu_type } => {
                self.on_bearer_data(&data, pdu_type, &mut effects)
            }
            Command::Timer(id) => {
                if self.timers.fire(id) {
                    self.on_timer(id.key, &mut effects);
                }
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.network.clone());
            }
            Command::Shutdown => {}
        }
        self.execute(effects);

        for id in std::mem::take(&mut self.unsegmented) {
            if self.sends.get(&id).is_some_and(|s| !s.acknowledged) {
                self.complete(id, Ok(None));
            }
        }
    }

    // ------------------------------------------------------------------
    // Effects
    // ------------------------------------------------------------------

    fn execute(&mut self, mut effects: Effects) {
        let mut queue: VecDeque<Effect> = effects.drain().collect();
        while let Some(effect) = queue.pop_front() {
            let mut more = Effects::new();
            match effect {
                Effect::Transmit(pdu) => self.transmit(pdu, &mut more),
                Effect::Schedule { timer, after } => self.timers.schedule(timer, after),
                Effect::Cancel(timer) => self.timers.cancel(timer),
                Effect::SegmentedCompleted {
                    id,
                    destination,
                    result,
                    ..
                } => self.on_segmented_completed(id, destination, result, &mut more),
            }
            queue.extend(more.drain());
        }
    }

    fn transmit(&mut self, pdu: OutgoingPdu, effects: &mut Effects) {
        let destination = pdu.destination;
        if self.network.is_local_unicast(destination) {
            let sequence = match pdu.sequence {
                Some(sequence) => sequence,
                None => match self.network_layer.next_sequence(pdu.source, &mut self.network) {
                    Some((sequence, persist)) => {
                        self.dirty |= persist;
                        sequence
                    }
                    None => {
                        warn!(source = %pdu.source, "Sequence numbers exhausted");
                        if let Some(id) = pdu.send_id {
                            self.fail_send(id, AccessError::SequenceExhausted(pdu.source).into(), effects);
                        }
                        return;
                    }
                },
            };
            self.loopback(&pdu, sequence, effects);
            return;
        }

        let encoded = match self.network_layer.encrypt(&pdu, &mut self.network) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(destination = %destination, error = %e, "Network PDU could not be encrypted");
                if let Some(id) = pdu.send_id {
                    self.fail_send(id, e, effects);
                }
                return;
            }
        };
        self.dirty |= encoded.persist;

        // TTL 1 never leaves the node.
        if pdu.ttl != 1 {
            if let Err(e) = self.send_to_bearer(&encoded.data, PduType::NetworkPdu) {
                debug!(destination = %destination, error = %e, "Network PDU not sent");
                if let Some(id) = pdu.send_id {
                    self.fail_send(id, e.into(), effects);
                }
            }
        }
        if !destination.is_unicast() && self.network.is_local_subscription(destination) {
            self.loopback(&pdu, encoded.sequence, effects);
        }
    }

    /// Hands a PDU addressed to this node straight to the lower transport
    /// layer, without network encryption.
    fn loopback(&mut self, pdu: &OutgoingPdu, sequence: u32, effects: &mut Effects) {
        trace!(source = %pdu.source, destination = %pdu.destination, sequence, "Loopback");
        let received = ReceivedPdu {
            pdu: NetworkPdu {
                iv_index: self.network.iv_index.transmit_index(),
                nid: 0,
                control: pdu.lower.is_control(),
                ttl: pdu.ttl,
                sequence,
                source: pdu.source,
                destination: pdu.destination,
                transport_pdu: pdu.lower.encode(),
            },
            network_key_index: pdu.network_key_index,
        };
        self.deliver(received, effects);
    }

    fn send_to_bearer(&self, data: &[u8], pdu_type: PduType) -> Result<(), BearerError> {
        let bearer = self.bearer.as_ref().ok_or(BearerError::Closed)?;
        bearer.send(data, pdu_type)?;

        if pdu_type == PduType::NetworkPdu && !bearer.is_gatt() {
            let transmit = self.network.local_node().and_then(|n| n.network_transmit);
            if let Some(transmit) = transmit.filter(|t| t.count > 0) {
                let bearer = bearer.clone();
                let data = data.to_vec();
                tokio::spawn(async move {
                    for _ in 0..transmit.count {
                        tokio::time::sleep(transmit.interval()).await;
                        if bearer.send(&data, PduType::NetworkPdu).is_err() {
                            break;
                        }
                    }
                });
            }
        }
        Ok(())
    }

    fn on_segmented_completed(
        &mut self,
        id: SendId,
        destination: Address,
        result: Result<(), LowerTransportError>,
        effects: &mut Effects,
    ) {
        if id != CONTROL_SEND_ID {
            match result {
                Ok(()) => {
                    if self.sends.get(&id).is_some_and(|s| !s.acknowledged) {
                        self.complete(id, Ok(None));
                    }
                }
                Err(e) => {
                    if self.sends.contains_key(&id) {
                        self.access.cancel(id, effects);
                        self.complete(id, Err(e.into()));
                    }
                }
            }
        }

        let started = self.upper.on_segmented_completed(
            destination,
            &mut self.network,
            &mut self.network_layer,
            &mut self.lower,
            &self.params,
            effects,
        );
        for (queued, outcome) in started {
            if let Err(e) = self.record_outcome(queued, outcome) {
                self.fail_send(queued, e, effects);
            }
        }
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    fn allocate_id(&mut self) -> SendId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(CONTROL_SEND_ID + 1);
        id
    }

    fn proxy_context(&self) -> ProxyContext {
        ProxyContext {
            gatt: self.bearer.as_ref().is_some_and(|b| b.is_gatt()),
            network_key: self.network_layer.proxy_network_key(),
        }
    }

    fn primary_element(&self) -> Result<Address, MeshError> {
        Ok(self
            .network
            .local_node()
            .map(|n| n.unicast_address)
            .ok_or(NetworkError::NoLocalNode)?)
    }

    fn record_outcome(
        &mut self,
        id: SendId,
        outcome: Result<(SendOutcome, bool), MeshError>,
    ) -> Result<(), MeshError> {
        let (outcome, persist) = outcome?;
        self.dirty |= persist;
        if outcome == SendOutcome::Sent {
            self.unsegmented.push(id);
        }
        Ok(())
    }

    fn transmit_request(&mut self, request: AccessRequest, effects: &mut Effects) -> Result<(), MeshError> {
        let id = request.id;
        let outcome = self.upper.send(
            request,
            &mut self.network,
            &mut self.network_layer,
            &mut self.lower,
            &self.params,
            effects,
        );
        self.record_outcome(id, outcome)
    }

    fn send(
        &mut self,
        mut message: MeshMessage,
        target: SendTarget,
        completion: oneshot::Sender<Delivery>,
        effects: &mut Effects,
    ) -> Result<Accepted, MeshError> {
        let source = match target.source {
            Some(source) => source,
            None => self.primary_element()?,
        };
        let id = self.allocate_id();
        self.access
            .assign_tid(&mut message, source, target.destination.address, Instant::now());
        let request = self.access.prepare(
            id,
            &message,
            source,
            target.destination,
            target.ttl,
            target.key,
            &self.network,
            &self.params,
            self.proxy_context(),
        )?;

        let response_opcode = message.response_opcode();
        if let Some(opcode) = response_opcode {
            self.access
                .register_acknowledged(&request, opcode, &self.params, effects);
        }
        self.sends.insert(
            id,
            PendingSend {
                destination: target.destination.address,
                acknowledged: response_opcode.is_some(),
                completion,
            },
        );
        debug!(
            id,
            source = %source,
            destination = %target.destination.address,
            opcode = format_args!("{:#06x}", message.opcode),
            "Sending access message"
        );
        if let Err(e) = self.transmit_request(request, effects) {
            self.sends.remove(&id);
            self.access.cancel(id, effects);
            return Err(e);
        }
        Ok(Accepted {
            id,
            source,
            destination: target.destination,
        })
    }

    fn publication(&self, element: Address, model: ModelId) -> Option<&Publish> {
        let node = self.network.local_node()?;
        node.elements
            .get(node.element_index(element)?)?
            .model(model)?
            .publish
            .as_ref()
    }

    fn publish(
        &mut self,
        element: Address,
        model: ModelId,
        completion: Option<oneshot::Sender<Delivery>>,
        effects: &mut Effects,
    ) -> Result<(Accepted, u32), MeshError> {
        let publish = self
            .publication(element, model)
            .cloned()
            .ok_or(AccessError::NoPublication(model))?;
        self.access
            .check_binding(element, model, publish.app_key_index, &self.network)?;
        let message = self
            .registry
            .lock()
            .get_mut(element, model)
            .and_then(|delegate| delegate.publication_message());
        let mut message = message.ok_or(AccessError::NoPublication(model))?;

        let id = self.allocate_id();
        self.access
            .assign_tid(&mut message, element, publish.address.address, Instant::now());
        let request = self.access.prepare_publication(
            id,
            &message,
            element,
            model,
            &self.network,
            &self.params,
            self.proxy_context(),
        )?;
        let destination = request.destination;
        if let Some(completion) = completion {
            self.sends.insert(
                id,
                PendingSend {
                    destination: destination.address,
                    acknowledged: false,
                    completion,
                },
            );
        }
        debug!(id, element = %element, model = %model, destination = %destination.address, "Publishing");
        if let Err(e) = self.transmit_request(request.clone(), effects) {
            self.sends.remove(&id);
            return Err(e);
        }
        self.access
            .start_publication_retransmissions(element, model, request, &self.network, effects);
        Ok((
            Accepted {
                id,
                source: element,
                destination,
            },
            message.opcode,
        ))
    }

    fn respond(
        &mut self,
        element: Address,
        model: ModelId,
        response: MeshMessage,
        request: &ReceivedAccess,
        effects: &mut Effects,
    ) {
        let key = match request.key {
            AccessKey::Application(index) => RequestKey::Application(index),
            AccessKey::Device => RequestKey::OwnDevice,
        };
        let id = self.allocate_id();
        match self.access.prepare(
            id,
            &response,
            element,
            MeshAddress::new(request.source),
            None,
            key,
            &self.network,
            &self.params,
            self.proxy_context(),
        ) {
            Ok(prepared) => {
                let to_multicast = request.destination.address.is_multicast();
                self.access.schedule_response(prepared, to_multicast, effects);
            }
            Err(e) => warn!(model = %model, destination = %request.source, error = %e, "Response dropped"),
        }
    }

    fn register_model(
        &mut self,
        element: Address,
        model: ModelId,
        delegate: Box<dyn AnyModel>,
        effects: &mut Effects,
    ) -> Result<(), MeshError> {
        let node = self.network.local_node().ok_or(NetworkError::NoLocalNode)?;
        let known = node
            .element_index(element)
            .and_then(|i| node.elements.get(i))
            .and_then(|e| e.model(model))
            .is_some();
        if !known {
            return Err(AccessError::InvalidElement(element).into());
        }
        self.registry.lock().insert(element, model, delegate);
        if let Some(period) = self.publication(element, model).and_then(Publish::period) {
            effects.schedule(TimerKey::PeriodicPublication { element, model }, period);
        }
        info!(element = %element, model = %model, "Model registered");
        Ok(())
    }

    fn send_heartbeat(
        &mut self,
        destination: Address,
        init_ttl: u8,
        network_key_index: KeyIndex,
        effects: &mut Effects,
    ) -> Result<(), MeshError> {
        let node = self.network.local_node().ok_or(NetworkError::NoLocalNode)?;
        let source = node.unicast_address;
        let features = u16::from(node.features.relay) | (u16::from(node.features.proxy) << 1);
        if init_ttl > 127 {
            return Err(AccessError::InvalidTtl(init_ttl).into());
        }
        if !destination.is_valid_destination() {
            return Err(AccessError::InvalidDestination(destination).into());
        }
        if self.network.network_key(network_key_index).is_none() {
            return Err(AccessError::KeyNotFound(network_key_index).into());
        }
        let heartbeat = Heartbeat { init_ttl, features };
        let persist = self.upper.send_control(
            Heartbeat::OPCODE,
            heartbeat.parameters(),
            source,
            destination,
            init_ttl,
            network_key_index,
            &mut self.network,
            &mut self.network_layer,
            &mut self.lower,
            &self.params,
            effects,
        )?;
        self.dirty |= persist;
        Ok(())
    }

    fn send_beacon(&mut self, network_key_index: KeyIndex) -> Result<(), MeshError> {
        let beacon = self
            .network_layer
            .beacon(network_key_index, &self.network)
            .ok_or(AccessError::KeyNotFound(network_key_index))?;
        self.send_to_bearer(&beacon, PduType::MeshBeacon)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    fn complete(&mut self, id: SendId, result: Delivery) {
        let Some(pending) = self.sends.remove(&id) else {
            return;
        };
        let destination = pending.destination;
        let event = match &result {
            Ok(_) => MeshEvent::MessageSent { id, destination },
            Err(e) => {
                warn!(id, destination = %destination, error = %e, "Message failed");
                MeshEvent::MessageFailed {
                    id,
                    destination,
                    error: e.clone(),
                }
            }
        };
        self.emit(event);
        let _ = pending.completion.send(result);
    }

    /// Stops every layer's work on `id` and reports `error`.
    fn fail_send(&mut self, id: SendId, error: MeshError, effects: &mut Effects) {
        self.access.cancel(id, effects);
        self.upper.cancel(id);
        self.lower.cancel(id, effects);
        self.complete(id, Err(error));
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn on_timer(&mut self, key: TimerKey, effects: &mut Effects) {
        if self.lower.on_timer(key, &self.params, effects) {
            return;
        }
        match key {
            TimerKey::AcknowledgedRetry(id) => {
                let lower = &self.lower;
                let retry = self
                    .access
                    .on_retry(id, |target| lower.is_receiving_from(target), effects);
                if let Some(request) = retry {
                    if let Err(e) = self.transmit_request(request, effects) {
                        self.fail_send(id, e, effects);
                    }
                }
            }
            TimerKey::AcknowledgedTimeout(id) => {
                if self.access.on_timeout(id, effects) {
                    self.lower.cancel(id, effects);
                    self.upper.cancel(id);
                    self.complete(id, Err(AccessError::Timeout.into()));
                }
            }
            TimerKey::DelayedReply(token) => {
                if let Some(response) = self.access.take_response(token) {
                    let destination = response.destination.address;
                    if let Err(e) = self.transmit_request(response, effects) {
                        warn!(destination = %destination, error = %e, "Response could not be sent");
                    }
                }
            }
            TimerKey::PublicationRetransmit { element, model } => {
                if let Some(request) = self.access.on_publication_retransmit(element, model, effects) {
                    if let Err(e) = self.transmit_request(request, effects) {
                        warn!(model = %model, error = %e, "Publication retransmission failed");
                    }
                }
            }
            TimerKey::PeriodicPublication { element, model } => {
                let Some(period) = self.publication(element, model).and_then(Publish::period) else {
                    debug!(model = %model, "Periodic publication stopped");
                    return;
                };
                effects.schedule(TimerKey::PeriodicPublication { element, model }, period);
                if let Err(e) = self.publish(element, model, None, effects) {
                    warn!(model = %model, error = %e, "Periodic publication failed");
                }
            }
            TimerKey::WaitTimeout(token) => {
                let key = self
                    .waiters
                    .iter()
                    .find(|(_, w)| w.token == token)
                    .map(|(k, _)| *k);
                if let Some(waiter) = key.and_then(|k| self.waiters.remove(&k)) {
                    let _ = waiter.reply.send(Err(AccessError::Timeout.into()));
                }
            }
            other => trace!(timer = ?other, "Unhandled timer"),
        }
    }

    // ------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------

    fn on_bearer_data(&mut self, data: &[u8], pdu_type: PduType, effects: &mut Effects) {
        match pdu_type {
            PduType::NetworkPdu => {
                let Some(received) = self.network_layer.receive(data, &self.network) else {
                    return;
                };
                self.learn_proxy_key(received.network_key_index);
                if self.network_layer.should_relay(&received, &self.network) {
                    if let Some(relayed) = self.network_layer.relay(&received, &self.network) {
                        if let Err(e) = self.send_to_bearer(&relayed, PduType::NetworkPdu) {
                            debug!(error = %e, "Relay failed");
                        }
                    }
                }
                let destination = received.pdu.destination;
                let local = self.network.is_local_unicast(destination)
                    || (!destination.is_unicast() && self.network.is_local_subscription(destination));
                if local {
                    self.deliver(received, effects);
                }
            }
            PduType::MeshBeacon => {
                let changes = self
                    .network_layer
                    .handle_beacon(data, &mut self.network, &self.params);
                if let Some(index) = changes.network_key_index {
                    self.learn_proxy_key(index);
                }
                self.dirty |= changes.is_changed();
                if let Some(iv_index) = changes.iv_index {
                    self.emit(MeshEvent::IvIndexUpdated(iv_index));
                }
                if let Some((network_key_index, phase)) = changes.key_refresh {
                    self.emit(MeshEvent::KeyRefreshPhaseChanged {
                        network_key_index,
                        phase,
                    });
                }
            }
            PduType::ProxyConfiguration => {
                let Some((message, index)) = self
                    .network_layer
                    .receive_proxy_configuration(data, &self.network)
                else {
                    return;
                };
                self.learn_proxy_key(index);
                match message {
                    ProxyConfigurationMessage::FilterStatus {
                        filter_type,
                        list_size,
                    } => {
                        for event in self.proxy_filter.on_status(filter_type, list_size) {
                            self.emit_filter_event(event);
                        }
                        self.flush_proxy_filter();
                    }
                    other => debug!(opcode = other.opcode(), "Unexpected proxy configuration message"),
                }
            }
            PduType::ProvisioningPdu => trace!("Provisioning PDU ignored"),
        }
    }

    fn deliver(&mut self, received: ReceivedPdu, effects: &mut Effects) {
        let upper = self
            .lower
            .receive(received, &self.network, &self.params, Instant::now(), effects);
        for (source, entry) in self.lower.drain_replay_updates() {
            self.network.replay_protection.insert(source, entry);
            self.dirty = true;
        }
        let Some(upper) = upper else {
            return;
        };
        match &upper.payload {
            UpperTransportPayload::Access { aid, szmic, data } => {
                match self.upper.decrypt(&upper, *aid, *szmic, data, &self.network) {
                    Some(access) => self.handle_access(access, effects),
                    None => debug!(source = %upper.source, "Access message could not be decrypted"),
                }
            }
            UpperTransportPayload::Control { opcode, parameters } => {
                self.handle_control(upper.source, upper.destination, upper.ttl, *opcode, parameters)
            }
        }
    }

    fn handle_access(&mut self, access: ReceivedAccess, effects: &mut Effects) {
        let opcode = access.pdu.opcode;
        debug!(
            source = %access.source,
            destination = %access.destination.address,
            opcode = format_args!("{opcode:#06x}"),
            "Access message received"
        );
        if let Some(id) = self.access.on_response(access.source, opcode, effects) {
            self.complete(id, Ok(Some(access.clone())));
        }

        let key = (opcode, access.source);
        let matches = self.waiters.get(&key).is_some_and(|w| {
            w.destination
                .map_or(true, |d| d == access.destination.address)
        });
        if matches {
            if let Some(waiter) = self.waiters.remove(&key) {
                effects.cancel(TimerKey::WaitTimeout(waiter.token));
                let _ = waiter.reply.send(Ok(access.clone()));
            }
        }

        let routes = self.access.routes(&access, &self.network);
        let _ = self.jobs.send(DelegateJob::Dispatch {
            message: access,
            routes,
        });
    }

    fn handle_control(&mut self, source: Address, destination: Address, ttl: u8, opcode: u8, parameters: &[u8]) {
        if opcode == Heartbeat::OPCODE {
            match Heartbeat::from_parameters(parameters) {
                Ok(heartbeat) => self.emit(MeshEvent::HeartbeatReceived {
                    source,
                    destination,
                    heartbeat,
                    hops: heartbeat.hops(ttl),
                }),
                Err(e) => debug!(source = %source, error = %e, "Invalid heartbeat"),
            }
            return;
        }
        self.emit(MeshEvent::ControlMessageReceived {
            source,
            destination,
            opcode,
            parameters: parameters.to_vec(),
        });
    }

    // ------------------------------------------------------------------
    // Bearer and proxy
    // ------------------------------------------------------------------

    /// The first message over a GATT bearer tells which network key the
    /// proxy uses; the filter is installed then.
    fn learn_proxy_key(&mut self, index: KeyIndex) {
        if self.network_layer.proxy_network_key().is_some() || !self.proxy_context().gatt {
            return;
        }
        info!(key = index, "Connected to proxy");
        self.network_layer.set_proxy_network_key(Some(index));
        self.proxy_filter.setup(&self.filter_setup, &self.network);
        self.flush_proxy_filter();
    }

    fn flush_proxy_filter(&mut self) {
        while let Some(request) = self.proxy_filter.next_request() {
            let sent = match self
                .network_layer
                .encrypt_proxy_configuration(&request, &mut self.network)
            {
                Ok(encoded) => {
                    self.dirty |= encoded.persist;
                    self.send_to_bearer(&encoded.data, PduType::ProxyConfiguration)
                        .map_err(MeshError::from)
                }
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                warn!(error = %e, "Proxy filter request not sent");
                let event = self.proxy_filter.reset();
                self.emit_filter_event(event);
                return;
            }
            trace!(opcode = request.opcode(), "Proxy filter request sent");
        }
    }

    fn on_bearer_closed(&mut self, reason: Option<BearerError>, effects: &mut Effects) {
        match &reason {
            Some(e) => warn!(error = %e, "Bearer closed"),
            None => info!("Bearer closed"),
        }
        self.network_layer.set_proxy_network_key(None);
        let event = self.proxy_filter.reset();
        self.emit_filter_event(event);

        self.lower.abort_all(LowerTransportError::Cancelled, effects);
        self.upper.drain_queued();
        let pending: Vec<SendId> = self.sends.keys().copied().collect();
        for id in pending {
            self.access.cancel(id, effects);
            self.complete(id, Err(BearerError::Closed.into()));
        }
        self.emit(MeshEvent::BearerClosed(reason));
    }

    fn emit(&self, event: MeshEvent) {
        if self.jobs.send(DelegateJob::Event(event)).is_err() {
            trace!("Delegate task gone; event dropped");
        }
    }

    fn emit_filter_event(&self, event: ProxyFilterEvent) {
        self.emit(match event {
            ProxyFilterEvent::Updated {
                filter_type,
                addresses,
            } => MeshEvent::ProxyFilterUpdated {
                filter_type,
                addresses,
            },
            ProxyFilterEvent::Acknowledged {
                filter_type,
                list_size,
            } => MeshEvent::ProxyFilterUpdateAcknowledged {
                filter_type,
                list_size,
            },
            ProxyFilterEvent::LimitReached { max } => MeshEvent::ProxyFilterLimitReached { max },
        });
    }
}
