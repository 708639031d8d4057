//! Segmentation and reassembly.
//!
//! - [`reassembly`] collects incoming segments per (source, SeqZero), acknowledges
//!   them and hands complete messages up.
//! - [`transmitter`] splits outgoing Upper Transport PDUs, paces the segments,
//!   retransmits unacknowledged ones and reports the outcome.

pub mod reassembly;
pub mod transmitter;

use thiserror::Error;

pub use reassembly::{message_sequence, IncomingSegment, ReassembledMessage, Reassembler};
pub use transmitter::{OutgoingSegmented, SegmentTransmitter};

/// Delivery failures of segmented messages.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LowerTransportError {
    #[error("Target node is busy and cannot accept the message")]
    Busy,
    #[error("Segment acknowledgment not received")]
    Timeout,
    #[error("Message sending cancelled")]
    Cancelled,
}
