//! Replay protection.
//!
//! For every source the cache remembers the two most recently accepted
//! SeqAuth values (`last` and `previous`). SeqAuth is `IV Index << 24 | SEQ`,
//! for segmented messages the SEQ of the first segment (derived from SeqZero).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::address::Address;

/// SeqAuth of a PDU: 32-bit IV Index followed by the 24-bit sequence number.
pub fn seq_auth(iv_index: u32, sequence: u32) -> u64 {
    (u64::from(iv_index) << 24) | u64::from(sequence & 0x00FF_FFFF)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReplayPolicy {
    /// Accept only values above the last accepted one. Matches a single
    /// sequential processing context.
    #[default]
    Strict,
    /// Additionally accept a value that falls strictly between `previous`
    /// and `last`, once. For bearers that may reorder PDUs.
    TolerateReordering,
}

/// Replay state of one source, saved with the network configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayEntry {
    pub last: u64,
    pub previous: u64,
}

#[derive(Debug, Default)]
pub struct ReplayCache {
    policy: ReplayPolicy,
    entries: HashMap<Address, ReplayEntry>,
}

impl ReplayCache {
    pub fn new(policy: ReplayPolicy) -> Self {
        Self::restore(policy, HashMap::new())
    }

    /// A cache continuing from saved state.
    pub fn restore(policy: ReplayPolicy, entries: HashMap<Address, ReplayEntry>) -> Self {
        Self { policy, entries }
    }

    /// Checks `seq_auth` from `source` and records it when accepted.
    ///
    /// `reassembly_in_progress` allows further segments of the message that
    /// established the current `last` value.
    pub fn accept(&mut self, source: Address, seq_auth: u64, reassembly_in_progress: bool) -> bool {
        let Some(entry) = self.entries.get_mut(&source) else {
            self.entries.insert(
                source,
                ReplayEntry {
                    last: seq_auth,
                    previous: seq_auth,
                },
            );
            return true;
        };

        let missed = self.policy == ReplayPolicy::TolerateReordering
            && entry.previous < seq_auth
            && seq_auth < entry.last;
        let accepted = seq_auth > entry.last
            || missed
            || (reassembly_in_progress && seq_auth == entry.last);
        if !accepted {
            return false;
        }

        if missed {
            entry.previous = seq_auth;
        } else {
            entry.previous = entry.last.min(seq_auth);
            entry.last = seq_auth;
        }
        true
    }

    /// Last accepted SeqAuth from `source`.
    pub fn last(&self, source: Address) -> Option<u64> {
        self.entries.get(&source).map(|e| e.last)
    }

    pub fn entry(&self, source: Address) -> Option<ReplayEntry> {
        self.entries.get(&source).copied()
    }
}
