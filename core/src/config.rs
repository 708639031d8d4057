//! Network parameters
//!
//! Tunables of the network and transport layers. Values use the Mesh Protocol
//! encodings (steps, counts) and are converted to `Duration`s on access:
//! - Default TTL
//! - SAR receiver: discard timeout, acknowledgment delay and retransmissions
//! - SAR transmitter: segment interval, unicast and multicast retransmissions
//! - Acknowledged message timeout and retry interval
//! - IV Index recovery policy
//! - Replay protection policy

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::replay::ReplayPolicy;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigError {
    #[error("Invalid default TTL: must be 2-127, got {0}")]
    InvalidDefaultTtl(u8),

    #[error("Invalid {name}: must be at most {max}, got {value}")]
    OutOfRange {
        name: String,
        max: u8,
        value: u8,
    },

    #[error("Invalid acknowledged message timeout: must be at least 30 s, got {0} ms")]
    InvalidAckTimeout(u64),

    #[error("Invalid acknowledged message interval: must be at least 2 s, got {0} ms")]
    InvalidAckInterval(u64),

    #[error("Invalid reassembly context limit: must be at least 1")]
    InvalidReassemblyLimit,
}

// ============================================================================
// NETWORK PARAMETERS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkParameters {
    /// TTL used when neither the message nor the node specifies one.
    pub default_ttl: u8,

    /// Incomplete timer: (n + 1) × 5 s.
    pub sar_discard_timeout: u8,
    /// Acknowledgment delay increment: n + 1.5 segment reception intervals.
    pub sar_acknowledgment_delay_increment: u8,
    /// Segment reception interval: (n + 1) × 10 ms.
    pub sar_receiver_segment_interval_step: u8,
    /// SegN above which acknowledgments are retransmitted.
    pub sar_segments_threshold: u8,
    pub sar_acknowledgment_retransmissions_count: u8,

    /// Interval between segments: (n + 1) × 10 ms.
    pub sar_segment_interval_step: u8,
    pub sar_unicast_retransmissions_count: u8,
    pub sar_unicast_retransmissions_without_progress_count: u8,
    /// Unicast retransmission interval step: (n + 1) × 25 ms.
    pub sar_unicast_retransmissions_interval_step: u8,
    /// Per-hop increment of the unicast retransmission interval: (n + 1) × 25 ms.
    pub sar_unicast_retransmissions_interval_increment: u8,
    pub sar_multicast_retransmissions_count: u8,
    /// Multicast retransmission interval: (n + 1) × 25 ms.
    pub sar_multicast_retransmissions_interval_step: u8,

    /// How long to wait for the response to an acknowledged message.
    pub acknowledgment_message_timeout_ms: u64,
    /// Base retry interval for acknowledged messages.
    pub acknowledgment_message_interval_ms: u64,

    /// Accept IV Index jumps larger than 42.
    pub allow_iv_index_recovery_over_42: bool,
    /// Skip the 96 h guard between IV Update state changes.
    pub iv_update_test_mode: bool,

    pub replay_policy: ReplayPolicy,
    /// Concurrent incoming segmented messages kept per source.
    ///
    /// Once a newer message from a source has started, replay protection
    /// rejects the remaining segments of any older SeqZero from it, so
    /// eviction only matters for contexts of the same message stream.
    pub max_reassembly_contexts_per_source: usize,
}

impl Default for NetworkParameters {
    fn default() -> Self {
        Self {
            default_ttl: 5,
            sar_discard_timeout: 0b0001,
            sar_acknowledgment_delay_increment: 0b001,
            sar_receiver_segment_interval_step: 0b0101,
            sar_segments_threshold: 0b00011,
            sar_acknowledgment_retransmissions_count: 0b00,
            sar_segment_interval_step: 0b0101,
            sar_unicast_retransmissions_count: 0b0010,
            sar_unicast_retransmissions_without_progress_count: 0b0010,
            sar_unicast_retransmissions_interval_step: 0b0111,
            sar_unicast_retransmissions_interval_increment: 0b0001,
            sar_multicast_retransmissions_count: 0b0010,
            sar_multicast_retransmissions_interval_step: 0b1001,
            acknowledgment_message_timeout_ms: 30_000,
            acknowledgment_message_interval_ms: 2_000,
            allow_iv_index_recovery_over_42: false,
            iv_update_test_mode: false,
            replay_policy: ReplayPolicy::Strict,
            max_reassembly_contexts_per_source: 4,
        }
    }
}

fn check(name: &str, value: u8, max: u8) -> Result<(), ConfigError> {
    if value > max {
        return Err(ConfigError::OutOfRange {
            name: name.to_string(),
            max,
            value,
        });
    }
    Ok(())
}

impl NetworkParameters {
    /// Validates a deserialized document.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(2..=127).contains(&self.default_ttl) {
            return Err(ConfigError::InvalidDefaultTtl(self.default_ttl));
        }
        check("SAR discard timeout", self.sar_discard_timeout, 0b1111)?;
        check(
            "SAR acknowledgment delay increment",
            self.sar_acknowledgment_delay_increment,
            0b111,
        )?;
        check(
            "SAR receiver segment interval step",
            self.sar_receiver_segment_interval_step,
            0b1111,
        )?;
        check("SAR segments threshold", self.sar_segments_threshold, 0b11111)?;
        check(
            "SAR acknowledgment retransmissions count",
            self.sar_acknowledgment_retransmissions_count,
            0b11,
        )?;
        check("SAR segment interval step", self.sar_segment_interval_step, 0b1111)?;
        check(
            "SAR unicast retransmissions count",
            self.sar_unicast_retransmissions_count,
            0b1111,
        )?;
        check(
            "SAR unicast retransmissions without progress count",
            self.sar_unicast_retransmissions_without_progress_count,
            0b1111,
        )?;
        check(
            "SAR unicast retransmissions interval step",
            self.sar_unicast_retransmissions_interval_step,
            0b1111,
        )?;
        check(
            "SAR unicast retransmissions interval increment",
            self.sar_unicast_retransmissions_interval_increment,
            0b1111,
        )?;
        check(
            "SAR multicast retransmissions count",
            self.sar_multicast_retransmissions_count,
            0b1111,
        )?;
        check(
            "SAR multicast retransmissions interval step",
            self.sar_multicast_retransmissions_interval_step,
            0b1111,
        )?;
        if self.acknowledgment_message_timeout_ms < 30_000 {
            return Err(ConfigError::InvalidAckTimeout(
                self.acknowledgment_message_timeout_ms,
            ));
        }
        if self.acknowledgment_message_interval_ms < 2_000 {
            return Err(ConfigError::InvalidAckInterval(
                self.acknowledgment_message_interval_ms,
            ));
        }
        if self.max_reassembly_contexts_per_source == 0 {
            return Err(ConfigError::InvalidReassemblyLimit);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Clamping setters
    // ------------------------------------------------------------------------

    pub fn set_default_ttl(&mut self, ttl: u8) {
        self.default_ttl = ttl.clamp(2, 127);
    }

    pub fn set_sar_discard_timeout(&mut self, timeout: Duration) {
        let steps = (timeout.as_secs() / 5).saturating_sub(1);
        self.sar_discard_timeout = steps.min(0b1111) as u8;
    }

    pub fn set_sar_unicast_retransmissions_count(&mut self, count: u8) {
        self.sar_unicast_retransmissions_count = count.min(0b1111);
    }

    pub fn set_sar_unicast_retransmissions_without_progress_count(&mut self, count: u8) {
        self.sar_unicast_retransmissions_without_progress_count = count.min(0b1111);
    }

    /// Sets the interval step in 25 ms units; values round down.
    pub fn set_sar_unicast_retransmissions_interval_step(&mut self, interval: Duration) {
        let steps = (interval.as_millis() / 25).saturating_sub(1);
        self.sar_unicast_retransmissions_interval_step = steps.min(0b1111) as u8;
    }

    pub fn set_sar_unicast_retransmissions_interval_increment(&mut self, increment: Duration) {
        let steps = (increment.as_millis() / 25).saturating_sub(1);
        self.sar_unicast_retransmissions_interval_increment = steps.min(0b1111) as u8;
    }

    pub fn set_sar_multicast_retransmissions_count(&mut self, count: u8) {
        self.sar_multicast_retransmissions_count = count.min(0b1111);
    }

    pub fn set_acknowledgment_message_timeout(&mut self, timeout: Duration) {
        self.acknowledgment_message_timeout_ms = (timeout.as_millis() as u64).max(30_000);
    }

    pub fn set_acknowledgment_message_interval(&mut self, interval: Duration) {
        self.acknowledgment_message_interval_ms = (interval.as_millis() as u64).max(2_000);
    }

    // ------------------------------------------------------------------------
    // Derived durations
    // ------------------------------------------------------------------------

    pub fn sar_discard_timeout(&self) -> Duration {
        Duration::from_secs((u64::from(self.sar_discard_timeout) + 1) * 5)
    }

    /// Delay increment in segment reception intervals (n + 1.5), in tenths.
    fn ack_delay_increment_tenths(&self) -> u64 {
        u64::from(self.sar_acknowledgment_delay_increment) * 10 + 15
    }

    pub fn sar_segment_reception_interval(&self) -> Duration {
        Duration::from_millis((u64::from(self.sar_receiver_segment_interval_step) + 1) * 10)
    }

    /// min(SegN + 0.5, delay increment) × segment reception interval.
    pub fn acknowledgment_timer_interval(&self, seg_n: u8) -> Duration {
        let segments_tenths = u64::from(seg_n) * 10 + 5;
        let tenths = segments_tenths.min(self.ack_delay_increment_tenths());
        self.sar_segment_reception_interval() * tenths as u32 / 10
    }

    /// Minimum spacing between repeated acknowledgments for a completed message.
    pub fn complete_acknowledgment_interval(&self) -> Duration {
        self.sar_segment_reception_interval() * self.ack_delay_increment_tenths() as u32 / 10
    }

    pub fn sar_segment_interval(&self) -> Duration {
        Duration::from_millis((u64::from(self.sar_segment_interval_step) + 1) * 10)
    }

    /// step + increment × (TTL − 1); just the step for TTL 0.
    pub fn sar_unicast_retransmissions_interval(&self, ttl: u8) -> Duration {
        let step = (u64::from(self.sar_unicast_retransmissions_interval_step) + 1) * 25;
        if ttl == 0 {
            return Duration::from_millis(step);
        }
        let increment = (u64::from(self.sar_unicast_retransmissions_interval_increment) + 1) * 25;
        Duration::from_millis(step + increment * (u64::from(ttl) - 1))
    }

    pub fn sar_multicast_retransmissions_interval(&self) -> Duration {
        Duration::from_millis((u64::from(self.sar_multicast_retransmissions_interval_step) + 1) * 25)
    }

    pub fn acknowledgment_message_timeout(&self) -> Duration {
        Duration::from_millis(self.acknowledgment_message_timeout_ms)
    }

    /// First retry interval for an acknowledged message; doubles after each retry.
    pub fn acknowledgment_message_interval(&self, ttl: u8, segment_count: usize) -> Duration {
        Duration::from_millis(
            self.acknowledgment_message_interval_ms
                + 50 * u64::from(ttl)
                + 50 * segment_count as u64,
        )
    }
}
