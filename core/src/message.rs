//! Mesh messages and model delegates.
//!
//! A [`MeshMessage`] is the tagged representation of an access message: its
//! opcode, its encoded parameters and how it takes part in the
//! request/response exchange. Models register a [`ModelDelegate`] that owns a
//! decoder table (opcode → decoder) and handles its own message enum.

use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::address::{Address, MeshAddress};
use crate::layers::upper::{AccessKey, Security};
use crate::mesh::ModelId;
use crate::pdu::{AccessPdu, PduError};

/// Role of a message in the request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Unacknowledged,
    /// A request answered by a message with `response_opcode`.
    Acknowledged { response_opcode: u32 },
    Response,
}

/// Position of the Transaction Identifier in a message's parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionSpec {
    pub tid_offset: usize,
    /// Explicit TID; assigned by the access layer when `None`.
    pub tid: Option<u8>,
    /// Reuse the last TID when the previous transaction is still open.
    pub continue_transaction: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshMessage {
    pub opcode: u32,
    pub parameters: Vec<u8>,
    pub kind: MessageKind,
    pub security: Security,
    /// Send segmented even when the message fits one PDU.
    pub segmented: bool,
    pub transaction: Option<TransactionSpec>,
}

impl MeshMessage {
    pub fn new(opcode: u32, parameters: Vec<u8>) -> Self {
        Self {
            opcode,
            parameters,
            kind: MessageKind::Unacknowledged,
            security: Security::Low,
            segmented: false,
            transaction: None,
        }
    }

    pub fn acknowledged(opcode: u32, parameters: Vec<u8>, response_opcode: u32) -> Self {
        Self {
            kind: MessageKind::Acknowledged { response_opcode },
            ..Self::new(opcode, parameters)
        }
    }

    pub fn response(opcode: u32, parameters: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Response,
            ..Self::new(opcode, parameters)
        }
    }

    pub fn with_security(mut self, security: Security) -> Self {
        self.security = security;
        self
    }

    pub fn force_segmented(mut self) -> Self {
        self.segmented = true;
        self
    }

    /// Marks the byte at `tid_offset` as the TID, to be filled in when sent.
    pub fn with_transaction(mut self, tid_offset: usize) -> Self {
        self.transaction = Some(TransactionSpec {
            tid_offset,
            tid: None,
            continue_transaction: false,
        });
        self
    }

    pub fn response_opcode(&self) -> Option<u32> {
        match self.kind {
            MessageKind::Acknowledged { response_opcode } => Some(response_opcode),
            _ => None,
        }
    }

    pub fn is_acknowledged(&self) -> bool {
        self.response_opcode().is_some()
    }

    pub fn tid(&self) -> Option<u8> {
        let spec = self.transaction?;
        spec.tid.or_else(|| self.parameters.get(spec.tid_offset).copied())
    }

    pub fn set_tid(&mut self, tid: u8) {
        if let Some(spec) = self.transaction.as_mut() {
            spec.tid = Some(tid);
            if let Some(byte) = self.parameters.get_mut(spec.tid_offset) {
                *byte = tid;
            }
        }
    }

    pub fn to_access_pdu(&self) -> Result<AccessPdu, PduError> {
        AccessPdu::new(self.opcode, self.parameters.clone())
    }
}

/// Where and how a message reached a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageContext {
    pub source: Address,
    pub destination: MeshAddress,
    pub element: Address,
    pub model: ModelId,
    pub key: AccessKey,
    pub ttl: u8,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// The message is malformed or not valid in the current state. Requests
    /// rejected this way are dropped without a response.
    #[error("Invalid message")]
    InvalidMessage,
    #[error("Model failure: {0}")]
    Failed(String),
}

pub type MessageDecoder<M> = fn(&[u8]) -> Option<M>;

/// Application-side behaviour of one model instance.
pub trait ModelDelegate: Send + 'static {
    type Message: fmt::Debug + Send;

    /// Opcodes this model receives and their decoders.
    fn decoders(&self) -> Vec<(u32, MessageDecoder<Self::Message>)>;

    /// Whether the model is secured with the device key (configuration models).
    fn uses_device_key(&self) -> bool {
        false
    }

    /// Handles a decoded message. A returned message is sent back to the
    /// source as the response.
    fn handle(
        &mut self,
        message: Self::Message,
        context: &MessageContext,
    ) -> Result<Option<MeshMessage>, ModelError>;

    /// Message composed for periodic publication.
    fn publication_message(&mut self) -> Option<MeshMessage> {
        None
    }
}

/// Result of offering an access message to a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    /// The model has no decoder for the opcode.
    Unsupported,
    /// The decoder or the delegate rejected the message.
    Rejected(ModelError),
    Accepted(Option<MeshMessage>),
}

/// Object-safe view over a [`ModelDelegate`].
pub trait AnyModel: Send {
    fn supports(&self, opcode: u32) -> bool;
    fn uses_device_key(&self) -> bool;
    fn handle_pdu(&mut self, pdu: &AccessPdu, context: &MessageContext) -> Handled;
    fn publication_message(&mut self) -> Option<MeshMessage>;
}

struct ModelAdapter<D: ModelDelegate> {
    delegate: D,
    decoders: HashMap<u32, MessageDecoder<D::Message>>,
}

impl<D: ModelDelegate> AnyModel for ModelAdapter<D> {
    fn supports(&self, opcode: u32) -> bool {
        self.decoders.contains_key(&opcode)
    }

    fn uses_device_key(&self) -> bool {
        self.delegate.uses_device_key()
    }

    fn handle_pdu(&mut self, pdu: &AccessPdu, context: &MessageContext) -> Handled {
        let Some(decode) = self.decoders.get(&pdu.opcode) else {
            return Handled::Unsupported;
        };
        let Some(message) = decode(&pdu.parameters) else {
            return Handled::Rejected(ModelError::InvalidMessage);
        };
        match self.delegate.handle(message, context) {
            Ok(response) => Handled::Accepted(response),
            Err(e) => Handled::Rejected(e),
        }
    }

    fn publication_message(&mut self) -> Option<MeshMessage> {
        self.delegate.publication_message()
    }
}

/// Erases the delegate's message type.
pub fn erase<D: ModelDelegate>(delegate: D) -> Box<dyn AnyModel> {
    let decoders = delegate.decoders().into_iter().collect();
    Box::new(ModelAdapter { delegate, decoders })
}

/// Model delegates registered per (element, model).
#[derive(Default)]
pub struct ModelRegistry {
    models: HashMap<(Address, ModelId), Box<dyn AnyModel>>,
}

impl ModelRegistry {
    pub fn insert(&mut self, element: Address, model: ModelId, delegate: Box<dyn AnyModel>) {
        self.models.insert((element, model), delegate);
    }

    pub fn remove(&mut self, element: Address, model: ModelId) -> bool {
        self.models.remove(&(element, model)).is_some()
    }

    pub fn get_mut(&mut self, element: Address, model: ModelId) -> Option<&mut (dyn AnyModel + 'static)> {
        self.models.get_mut(&(element, model)).map(|m| m.as_mut())
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("models", &self.models.keys().collect::<Vec<_>>())
            .finish()
    }
}
