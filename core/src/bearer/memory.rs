//! In-process bearer.
//!
//! A [`MemoryMedium`] is a shared broadcast channel standing in for the air.
//! Any number of [`MemoryBearer`]s attach to it; every frame one of them sends
//! reaches all the others that are open, never the sender itself.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::gatt::ProxyProtocolHandler;
use super::{Bearer, BearerDelegate, BearerError, PduType};

const MEDIUM_CAPACITY: usize = 1024;
/// ATT payload of the default 23-byte MTU.
pub const DEFAULT_GATT_MTU: usize = 20;

/// How a bearer frames its PDUs on the medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BearerKind {
    /// Proxy protocol packets of at most `mtu` bytes; carries proxy
    /// configuration messages.
    Gatt { mtu: usize },
    /// Whole advertising packets; network PDUs and beacons only.
    Advertising,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Advertising { data: Vec<u8>, pdu_type: PduType },
    Proxy(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub sender: u64,
    pub packet: Packet,
}

#[derive(Clone)]
pub struct MemoryMedium {
    sender: broadcast::Sender<Frame>,
    next_id: Arc<AtomicU64>,
}

impl MemoryMedium {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(MEDIUM_CAPACITY);
        Self {
            sender,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Observes every frame sent on the medium.
    pub fn tap(&self) -> broadcast::Receiver<Frame> {
        self.sender.subscribe()
    }

    pub fn bearer(&self, kind: BearerKind) -> MemoryBearer {
        MemoryBearer {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kind,
            medium: self.clone(),
            open: Arc::new(AtomicBool::new(false)),
            delegate: Arc::new(RwLock::new(None)),
            reader: Mutex::new(None),
        }
    }
}

impl Default for MemoryMedium {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MemoryBearer {
    id: u64,
    kind: BearerKind,
    medium: MemoryMedium,
    open: Arc<AtomicBool>,
    delegate: Arc<RwLock<Option<Arc<dyn BearerDelegate>>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryBearer {
    pub fn kind(&self) -> BearerKind {
        self.kind
    }

    fn delegate(&self) -> Option<Arc<dyn BearerDelegate>> {
        self.delegate.read().clone()
    }

    async fn read_loop(
        id: u64,
        kind: BearerKind,
        mut frames: broadcast::Receiver<Frame>,
        delegate: Arc<RwLock<Option<Arc<dyn BearerDelegate>>>>,
    ) {
        // Proxy packets are reassembled per sending bearer.
        let mut handlers: HashMap<u64, ProxyProtocolHandler> = HashMap::new();
        loop {
            let frame = match frames.recv().await {
                Ok(frame) => frame,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(bearer = id, skipped, "Memory bearer lagged; frames lost");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if frame.sender == id {
                continue;
            }
            let (data, pdu_type) = match frame.packet {
                Packet::Advertising { data, pdu_type } => (data, pdu_type),
                Packet::Proxy(packet) => {
                    match handlers.entry(frame.sender).or_default().reassemble(&packet) {
                        Some(message) => message,
                        None => continue,
                    }
                }
            };
            if pdu_type == PduType::ProxyConfiguration && kind == BearerKind::Advertising {
                continue;
            }
            trace!(bearer = id, %pdu_type, len = data.len(), "Memory bearer delivered PDU");
            let current = delegate.read().clone();
            if let Some(current) = current {
                current.bearer_did_deliver(data, pdu_type);
            }
        }
    }
}

#[async_trait]
impl Bearer for MemoryBearer {
    async fn open(&self) -> Result<(), BearerError> {
        if self.open.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let frames = self.medium.sender.subscribe();
        let task = tokio::spawn(Self::read_loop(
            self.id,
            self.kind,
            frames,
            self.delegate.clone(),
        ));
        *self.reader.lock() = Some(task);
        debug!(bearer = self.id, kind = ?self.kind, "Memory bearer open");
        if let Some(delegate) = self.delegate() {
            delegate.bearer_did_open();
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BearerError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(task) = self.reader.lock().take() {
            task.abort();
        }
        debug!(bearer = self.id, "Memory bearer closed");
        if let Some(delegate) = self.delegate() {
            delegate.bearer_did_close(None);
        }
        Ok(())
    }

    fn send(&self, data: &[u8], pdu_type: PduType) -> Result<(), BearerError> {
        if !self.is_open() {
            return Err(BearerError::Closed);
        }
        if !self.supports(pdu_type) {
            return Err(BearerError::Unsupported(pdu_type));
        }
        let packets = match self.kind {
            BearerKind::Gatt { mtu } => ProxyProtocolHandler::segment(data, pdu_type, mtu)
                .into_iter()
                .map(Packet::Proxy)
                .collect(),
            BearerKind::Advertising => vec![Packet::Advertising {
                data: data.to_vec(),
                pdu_type,
            }],
        };
        for packet in packets {
            // No receivers is not an error: nobody is listening.
            let _ = self.medium.sender.send(Frame {
                sender: self.id,
                packet,
            });
        }
        Ok(())
    }

    fn supports(&self, pdu_type: PduType) -> bool {
        match pdu_type {
            PduType::NetworkPdu | PduType::MeshBeacon => true,
            PduType::ProxyConfiguration => matches!(self.kind, BearerKind::Gatt { .. }),
            PduType::ProvisioningPdu => false,
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn set_delegate(&self, delegate: Arc<dyn BearerDelegate>) {
        *self.delegate.write() = Some(delegate);
    }
}

impl Drop for MemoryBearer {
    fn drop(&mut self) {
        if let Some(task) = self.reader.lock().take() {
            task.abort();
        }
    }
}
