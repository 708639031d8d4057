//! Mesh network manager
//!
//! [`MeshNetworkManager`] is a cheap, cloneable handle. Every operation is a
//! [`Command`] sent to a single processing task (the engine) that owns the
//! network configuration and every layer's state. Model delegates and
//! application events run on a second task so that application code cannot
//! stall protocol processing.

mod delegate;
mod engine;
pub mod timer;

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::address::{Address, MeshAddress};
use crate::bearer::{Bearer, BearerDelegate, BearerError, PduType};
use crate::config::NetworkParameters;
use crate::effect::SendId;
use crate::keys::{IvIndex, KeyIndex, KeyRefreshPhase};
use crate::layers::access::RequestKey;
use crate::layers::upper::ReceivedAccess;
use crate::mesh::{MeshNetwork, ModelId};
use crate::message::{erase, AnyModel, MeshMessage, ModelDelegate, ModelRegistry};
use crate::pdu::{Heartbeat, ProxyFilterType};
use crate::proxy_filter::ProxyFilterSetup;
use crate::store::{self, MemoryStorage, Storage};
use crate::MeshError;

use engine::Engine;
use timer::TimerId;

const COMMAND_CHANNEL_SIZE: usize = 256;

/// Terminal result of a send: the response for acknowledged messages.
pub type Delivery = Result<Option<ReceivedAccess>, MeshError>;

// ============================================================================
// EVENTS
// ============================================================================

/// Notifications for the application.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    BearerOpened,
    BearerClosed(Option<BearerError>),
    /// An access message addressed to this node. `handled` is false when no
    /// registered model supports its opcode.
    MessageReceived {
        message: ReceivedAccess,
        handled: bool,
    },
    MessageSent {
        id: SendId,
        destination: Address,
    },
    MessageFailed {
        id: SendId,
        destination: Address,
        error: MeshError,
    },
    ControlMessageReceived {
        source: Address,
        destination: Address,
        opcode: u8,
        parameters: Vec<u8>,
    },
    HeartbeatReceived {
        source: Address,
        destination: Address,
        heartbeat: Heartbeat,
        hops: u8,
    },
    ProxyFilterUpdated {
        filter_type: ProxyFilterType,
        addresses: Vec<Address>,
    },
    ProxyFilterUpdateAcknowledged {
        filter_type: ProxyFilterType,
        list_size: u16,
    },
    ProxyFilterLimitReached {
        max: u16,
    },
    IvIndexUpdated(IvIndex),
    KeyRefreshPhaseChanged {
        network_key_index: KeyIndex,
        phase: KeyRefreshPhase,
    },
}

// ============================================================================
// COMMANDS
// ============================================================================

/// Where an outgoing message goes and how it is secured.
#[derive(Debug, Clone, Copy)]
pub struct SendTarget {
    /// Local element; the primary element when `None`.
    pub source: Option<Address>,
    pub destination: MeshAddress,
    /// The node's default TTL when `None`.
    pub ttl: Option<u8>,
    pub key: RequestKey,
}

#[derive(Debug, Clone)]
pub enum ProxyFilterRequest {
    SetType(ProxyFilterType),
    Add(Vec<Address>),
    Remove(Vec<Address>),
}

type Reply<T> = oneshot::Sender<Result<T, MeshError>>;

/// A send the engine took on.
#[derive(Debug, Clone, Copy)]
pub struct Accepted {
    pub id: SendId,
    pub source: Address,
    pub destination: MeshAddress,
}

/// Work for the processing task.
pub enum Command {
    Send {
        message: MeshMessage,
        target: SendTarget,
        completion: oneshot::Sender<Delivery>,
        reply: Reply<Accepted>,
    },
    Publish {
        element: Address,
        model: ModelId,
        completion: oneshot::Sender<Delivery>,
        reply: Reply<(Accepted, u32)>,
    },
    Cancel(SendId),
    /// Element address and application key for sending to a model.
    ResolveModel {
        node: Address,
        element: u8,
        model: ModelId,
        reply: Reply<(Address, KeyIndex)>,
    },
    /// Response composed by a model delegate.
    Respond {
        element: Address,
        model: ModelId,
        response: MeshMessage,
        request: ReceivedAccess,
    },
    WaitFor {
        opcode: u32,
        source: Address,
        destination: Option<Address>,
        timeout: Duration,
        reply: oneshot::Sender<Result<ReceivedAccess, MeshError>>,
    },
    RegisterModel {
        element: Address,
        model: ModelId,
        delegate: Box<dyn AnyModel>,
        reply: Reply<()>,
    },
    SendHeartbeat {
        destination: Address,
        init_ttl: u8,
        network_key_index: KeyIndex,
        reply: Reply<()>,
    },
    SendBeacon {
        network_key_index: KeyIndex,
        reply: Reply<()>,
    },
    ProxyFilter(ProxyFilterRequest),
    SetBearer(Arc<dyn Bearer>),
    BearerOpened,
    BearerClosed(Option<BearerError>),
    BearerData {
        data: Vec<u8>,
        pdu_type: PduType,
    },
    Timer(TimerId),
    Snapshot(oneshot::Sender<MeshNetwork>),
    Shutdown,
}

// ============================================================================
// HANDLES
// ============================================================================

/// Settings of a manager.
#[derive(Clone)]
pub struct ManagerOptions {
    pub parameters: NetworkParameters,
    pub storage: Arc<dyn Storage>,
    pub proxy_filter: ProxyFilterSetup,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            parameters: NetworkParameters::default(),
            storage: Arc::new(MemoryStorage::new()),
            proxy_filter: ProxyFilterSetup::default(),
        }
    }
}

/// Handle of one outgoing message.
pub struct MessageHandle {
    id: SendId,
    source: Address,
    destination: MeshAddress,
    opcode: u32,
    commands: mpsc::Sender<Command>,
    completion: Option<oneshot::Receiver<Delivery>>,
    outcome: Option<Delivery>,
}

impl MessageHandle {
    fn new(accepted: Accepted, opcode: u32, commands: mpsc::Sender<Command>, completion: oneshot::Receiver<Delivery>) -> Self {
        Self {
            id: accepted.id,
            source: accepted.source,
            destination: accepted.destination,
            opcode,
            commands,
            completion: Some(completion),
            outcome: None,
        }
    }

    pub fn id(&self) -> SendId {
        self.id
    }

    pub fn source(&self) -> Address {
        self.source
    }

    pub fn destination(&self) -> MeshAddress {
        self.destination
    }

    pub fn opcode(&self) -> u32 {
        self.opcode
    }

    /// Waits for the message to be delivered, fail, or be cancelled. For
    /// acknowledged messages the result carries the response.
    pub async fn completion(&mut self) -> Delivery {
        if let Some(receiver) = self.completion.take() {
            let outcome = receiver.await.unwrap_or(Err(MeshError::Shutdown));
            self.outcome = Some(outcome);
        }
        self.outcome.clone().unwrap_or(Err(MeshError::Shutdown))
    }

    /// Cancels the message. Does nothing once it completed.
    pub async fn cancel(&self) -> Result<(), MeshError> {
        self.commands
            .send(Command::Cancel(self.id))
            .await
            .map_err(|_| MeshError::Shutdown)
    }
}

impl std::fmt::Debug for MessageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageHandle")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("opcode", &format_args!("{:#06x}", self.opcode))
            .finish()
    }
}

/// Feeds bearer callbacks into the processing task.
struct BearerBridge {
    commands: mpsc::Sender<Command>,
}

impl BearerBridge {
    fn post(&self, command: Command) {
        if let Err(e) = self.commands.try_send(command) {
            warn!(error = %e, "Bearer input dropped");
        }
    }
}

impl BearerDelegate for BearerBridge {
    fn bearer_did_open(&self) {
        self.post(Command::BearerOpened);
    }

    fn bearer_did_close(&self, error: Option<BearerError>) {
        self.post(Command::BearerClosed(error));
    }

    fn bearer_did_deliver(&self, data: Vec<u8>, pdu_type: PduType) {
        self.post(Command::BearerData { data, pdu_type });
    }
}

#[derive(Clone)]
pub struct MeshNetworkManager {
    commands: mpsc::Sender<Command>,
    registry: Arc<Mutex<ModelRegistry>>,
}

impl MeshNetworkManager {
    /// Starts the processing tasks for `network`. Must be called inside a
    /// tokio runtime.
    pub fn start(
        network: MeshNetwork,
        options: ManagerOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<MeshEvent>), MeshError> {
        options.parameters.validate()?;
        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (events, event_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Mutex::new(ModelRegistry::default()));

        let jobs = delegate::spawn(registry.clone(), commands.downgrade(), events);
        let engine = Engine::new(network, options, registry.clone(), commands.downgrade(), jobs);
        tokio::spawn(engine.run(command_rx));
        info!("Mesh network manager started");

        Ok((Self { commands, registry }, event_rx))
    }

    /// Starts with the configuration saved in `options.storage`.
    pub fn load(options: ManagerOptions) -> Result<(Self, mpsc::UnboundedReceiver<MeshEvent>), MeshError> {
        let network = store::load_network(options.storage.as_ref())?
            .ok_or_else(|| crate::mesh::NetworkError::InvalidDocument("nothing saved".into()))?;
        Self::start(network, options)
    }

    async fn post(&self, command: Command) -> Result<(), MeshError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| MeshError::Shutdown)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T, MeshError>>) -> Command,
    ) -> Result<T, MeshError> {
        let (reply, response) = oneshot::channel();
        self.post(command(reply)).await?;
        response.await.map_err(|_| MeshError::Shutdown)?
    }

    /// Attaches the bearer. The manager becomes its delegate; opening it is
    /// up to the caller.
    pub async fn set_bearer(&self, bearer: Arc<dyn Bearer>) -> Result<(), MeshError> {
        bearer.set_delegate(Arc::new(BearerBridge {
            commands: self.commands.clone(),
        }));
        self.post(Command::SetBearer(bearer)).await
    }

    /// Registers the delegate of `model` on the local `element`.
    pub async fn register_model<D: ModelDelegate>(
        &self,
        element: Address,
        model: ModelId,
        delegate: D,
    ) -> Result<(), MeshError> {
        let delegate = erase(delegate);
        self.request(|reply| Command::RegisterModel {
            element,
            model,
            delegate,
            reply,
        })
        .await
    }

    pub fn unregister_model(&self, element: Address, model: ModelId) -> bool {
        self.registry.lock().remove(element, model)
    }

    /// Sends `message`. Request errors are returned right away; delivery
    /// errors through [`MessageHandle::completion`].
    pub async fn send(&self, message: MeshMessage, target: SendTarget) -> Result<MessageHandle, MeshError> {
        let opcode = message.opcode;
        let (completion, completion_rx) = oneshot::channel();
        let accepted = self
            .request(|reply| Command::Send {
                message,
                target,
                completion,
                reply,
            })
            .await?;
        Ok(MessageHandle::new(accepted, opcode, self.commands.clone(), completion_rx))
    }

    /// Sends with an application key to `destination`.
    pub async fn send_to(
        &self,
        message: MeshMessage,
        destination: impl Into<MeshAddress>,
        app_key_index: KeyIndex,
    ) -> Result<MessageHandle, MeshError> {
        self.send(
            message,
            SendTarget {
                source: None,
                destination: destination.into(),
                ttl: None,
                key: RequestKey::Application(app_key_index),
            },
        )
        .await
    }

    /// Sends to `model` on element `element` of the node at `node`, with the
    /// first application key the model is bound to.
    pub async fn send_to_model(
        &self,
        message: MeshMessage,
        node: Address,
        element: u8,
        model: ModelId,
    ) -> Result<MessageHandle, MeshError> {
        let (destination, app_key_index) = self
            .request(|reply| Command::ResolveModel {
                node,
                element,
                model,
                reply,
            })
            .await?;
        self.send_to(message, destination, app_key_index).await
    }

    /// Sends with the device key of the remote node at `destination`.
    pub async fn send_with_device_key(
        &self,
        message: MeshMessage,
        destination: Address,
        ttl: Option<u8>,
    ) -> Result<MessageHandle, MeshError> {
        self.send(
            message,
            SendTarget {
                source: None,
                destination: MeshAddress::new(destination),
                ttl,
                key: RequestKey::Device,
            },
        )
        .await
    }

    /// Sends an acknowledged message and waits for its response.
    pub async fn send_acknowledged(
        &self,
        message: MeshMessage,
        target: SendTarget,
    ) -> Result<ReceivedAccess, MeshError> {
        if !message.is_acknowledged() {
            return Err(crate::message::ModelError::InvalidMessage.into());
        }
        let mut handle = self.send(message, target).await?;
        handle
            .completion()
            .await?
            .ok_or(MeshError::Access(crate::layers::AccessError::Timeout))
    }

    /// Publishes the message composed by the model's delegate to its
    /// configured publish address.
    pub async fn publish(&self, element: Address, model: ModelId) -> Result<MessageHandle, MeshError> {
        let (completion, completion_rx) = oneshot::channel();
        let (accepted, opcode) = self
            .request(|reply| Command::Publish {
                element,
                model,
                completion,
                reply,
            })
            .await?;
        Ok(MessageHandle::new(accepted, opcode, self.commands.clone(), completion_rx))
    }

    pub async fn cancel(&self, handle: &MessageHandle) -> Result<(), MeshError> {
        self.post(Command::Cancel(handle.id)).await
    }

    /// Waits for a message with `opcode` from `source`. A zero timeout waits
    /// forever. Only one wait per (opcode, source) may be pending.
    pub async fn wait_for(
        &self,
        opcode: u32,
        source: Address,
        destination: Option<Address>,
        timeout: Duration,
    ) -> Result<ReceivedAccess, MeshError> {
        self.request(|reply| Command::WaitFor {
            opcode,
            source,
            destination,
            timeout,
            reply,
        })
        .await
    }

    pub async fn send_heartbeat(
        &self,
        destination: Address,
        init_ttl: u8,
        network_key_index: KeyIndex,
    ) -> Result<(), MeshError> {
        self.request(|reply| Command::SendHeartbeat {
            destination,
            init_ttl,
            network_key_index,
            reply,
        })
        .await
    }

    /// Sends a Secure Network beacon reflecting the local state.
    pub async fn send_beacon(&self, network_key_index: KeyIndex) -> Result<(), MeshError> {
        self.request(|reply| Command::SendBeacon {
            network_key_index,
            reply,
        })
        .await
    }

    pub async fn set_proxy_filter_type(&self, filter_type: ProxyFilterType) -> Result<(), MeshError> {
        self.post(Command::ProxyFilter(ProxyFilterRequest::SetType(filter_type)))
            .await
    }

    pub async fn add_to_proxy_filter(&self, addresses: Vec<Address>) -> Result<(), MeshError> {
        self.post(Command::ProxyFilter(ProxyFilterRequest::Add(addresses)))
            .await
    }

    pub async fn remove_from_proxy_filter(&self, addresses: Vec<Address>) -> Result<(), MeshError> {
        self.post(Command::ProxyFilter(ProxyFilterRequest::Remove(addresses)))
            .await
    }

    /// Copy of the current network configuration.
    pub async fn network(&self) -> Result<MeshNetwork, MeshError> {
        let (reply, response) = oneshot::channel();
        self.post(Command::Snapshot(reply)).await?;
        response.await.map_err(|_| MeshError::Shutdown)
    }

    pub async fn shutdown(&self) -> Result<(), MeshError> {
        self.post(Command::Shutdown).await
    }
}
