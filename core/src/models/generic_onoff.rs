//! Generic OnOff server and client.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::message::{MeshMessage, MessageContext, MessageDecoder, ModelDelegate, ModelError};
use crate::transaction::TransactionHelper;

pub const GENERIC_ON_OFF_GET: u32 = 0x8201;
pub const GENERIC_ON_OFF_SET: u32 = 0x8202;
pub const GENERIC_ON_OFF_SET_UNACKNOWLEDGED: u32 = 0x8203;
pub const GENERIC_ON_OFF_STATUS: u32 = 0x8204;

/// Generic Default Transition Time step resolutions, in milliseconds.
const STEP_RESOLUTIONS_MS: [u64; 4] = [100, 1_000, 10_000, 600_000];

/// Generic Default Transition Time encoded as one byte: 2-bit resolution and
/// 6-bit step count. 0x3F steps means unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionTime(pub u8);

impl TransitionTime {
    pub fn steps(self) -> u8 {
        self.0 & 0x3F
    }

    pub fn duration(self) -> Option<Duration> {
        let steps = self.steps();
        (steps != 0x3F).then(|| {
            Duration::from_millis(u64::from(steps) * STEP_RESOLUTIONS_MS[usize::from(self.0 >> 6)])
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenericOnOffMessage {
    Get,
    Set {
        on: bool,
        tid: u8,
        transition: Option<(TransitionTime, u8)>,
    },
    SetUnacknowledged {
        on: bool,
        tid: u8,
        transition: Option<(TransitionTime, u8)>,
    },
    Status {
        present: bool,
        target: Option<(bool, TransitionTime)>,
    },
}

fn decode_set(parameters: &[u8]) -> Option<(bool, u8, Option<(TransitionTime, u8)>)> {
    let on = match *parameters.first()? {
        0 => false,
        1 => true,
        _ => return None,
    };
    let tid = *parameters.get(1)?;
    let transition = match parameters.len() {
        2 => None,
        4 => Some((TransitionTime(parameters[2]), parameters[3])),
        _ => return None,
    };
    Some((on, tid, transition))
}

fn encode_set(on: bool, transition: Option<(TransitionTime, u8)>) -> Vec<u8> {
    let mut parameters = vec![u8::from(on), 0];
    if let Some((time, delay)) = transition {
        parameters.extend_from_slice(&[time.0, delay]);
    }
    parameters
}

impl GenericOnOffMessage {
    pub fn get() -> MeshMessage {
        MeshMessage::acknowledged(GENERIC_ON_OFF_GET, Vec::new(), GENERIC_ON_OFF_STATUS)
    }

    /// Acknowledged Set; the access layer fills in the TID.
    pub fn set(on: bool) -> MeshMessage {
        MeshMessage::acknowledged(GENERIC_ON_OFF_SET, encode_set(on, None), GENERIC_ON_OFF_STATUS)
            .with_transaction(1)
    }

    pub fn set_with_transition(on: bool, time: TransitionTime, delay: u8) -> MeshMessage {
        MeshMessage::acknowledged(
            GENERIC_ON_OFF_SET,
            encode_set(on, Some((time, delay))),
            GENERIC_ON_OFF_STATUS,
        )
        .with_transaction(1)
    }

    pub fn set_unacknowledged(on: bool) -> MeshMessage {
        MeshMessage::new(GENERIC_ON_OFF_SET_UNACKNOWLEDGED, encode_set(on, None)).with_transaction(1)
    }

    pub fn status(present: bool) -> MeshMessage {
        MeshMessage::response(GENERIC_ON_OFF_STATUS, vec![u8::from(present)])
    }

    fn decode_get(parameters: &[u8]) -> Option<Self> {
        parameters.is_empty().then_some(Self::Get)
    }

    fn decode_set(parameters: &[u8]) -> Option<Self> {
        let (on, tid, transition) = decode_set(parameters)?;
        Some(Self::Set { on, tid, transition })
    }

    fn decode_set_unacknowledged(parameters: &[u8]) -> Option<Self> {
        let (on, tid, transition) = decode_set(parameters)?;
        Some(Self::SetUnacknowledged { on, tid, transition })
    }

    fn decode_status(parameters: &[u8]) -> Option<Self> {
        let present = match *parameters.first()? {
            0 => false,
            1 => true,
            _ => return None,
        };
        let target = match parameters.len() {
            1 => None,
            3 => Some((parameters[1] == 1, TransitionTime(parameters[2]))),
            _ => return None,
        };
        Some(Self::Status { present, target })
    }
}

/// Server: holds the OnOff state and answers Get and Set.
pub struct GenericOnOffServer {
    state: Arc<Mutex<bool>>,
    transactions: TransactionHelper,
}

impl GenericOnOffServer {
    pub fn new(state: Arc<Mutex<bool>>) -> Self {
        Self {
            state,
            transactions: TransactionHelper::new(),
        }
    }

    fn status(&self) -> MeshMessage {
        GenericOnOffMessage::status(*self.state.lock())
    }
}

impl ModelDelegate for GenericOnOffServer {
    type Message = GenericOnOffMessage;

    fn decoders(&self) -> Vec<(u32, MessageDecoder<Self::Message>)> {
        vec![
            (GENERIC_ON_OFF_GET, GenericOnOffMessage::decode_get as MessageDecoder<_>),
            (GENERIC_ON_OFF_SET, GenericOnOffMessage::decode_set as MessageDecoder<_>),
            (
                GENERIC_ON_OFF_SET_UNACKNOWLEDGED,
                GenericOnOffMessage::decode_set_unacknowledged as MessageDecoder<_>,
            ),
        ]
    }

    fn handle(
        &mut self,
        message: Self::Message,
        context: &MessageContext,
    ) -> Result<Option<MeshMessage>, ModelError> {
        let (on, tid, acknowledged) = match message {
            GenericOnOffMessage::Get => return Ok(Some(self.status())),
            GenericOnOffMessage::Set { on, tid, .. } => (on, tid, true),
            GenericOnOffMessage::SetUnacknowledged { on, tid, .. } => (on, tid, false),
            GenericOnOffMessage::Status { .. } => return Err(ModelError::InvalidMessage),
        };
        let opcode = if acknowledged {
            GENERIC_ON_OFF_SET
        } else {
            GENERIC_ON_OFF_SET_UNACKNOWLEDGED
        };
        if self
            .transactions
            .is_new_transaction(opcode, tid, context.source, &context.destination)
        {
            debug!(source = %context.source, on, tid, "OnOff state set");
            *self.state.lock() = on;
        }
        Ok(acknowledged.then(|| self.status()))
    }

    fn publication_message(&mut self) -> Option<MeshMessage> {
        Some(self.status())
    }
}

/// Client: remembers the last Status it received.
#[derive(Default)]
pub struct GenericOnOffClient {
    last_status: Arc<Mutex<Option<bool>>>,
}

impl GenericOnOffClient {
    pub fn new(last_status: Arc<Mutex<Option<bool>>>) -> Self {
        Self { last_status }
    }
}

impl ModelDelegate for GenericOnOffClient {
    type Message = GenericOnOffMessage;

    fn decoders(&self) -> Vec<(u32, MessageDecoder<Self::Message>)> {
        vec![(
            GENERIC_ON_OFF_STATUS,
            GenericOnOffMessage::decode_status as MessageDecoder<_>,
        )]
    }

    fn handle(
        &mut self,
        message: Self::Message,
        _context: &MessageContext,
    ) -> Result<Option<MeshMessage>, ModelError> {
        match message {
            GenericOnOffMessage::Status { present, .. } => {
                *self.last_status.lock() = Some(present);
                Ok(None)
            }
            _ => Err(ModelError::InvalidMessage),
        }
    }
}
