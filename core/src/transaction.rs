//! Detection of repeated transactional messages.
//!
//! Clients resend a transactional message (for example a Set with a TID)
//! several times. A server must apply it only once: a message is a
//! continuation of the previous transaction when it comes from the same
//! source to the same destination with the same TID less than
//! [`TRANSACTION_TIMEOUT`] after the last message of that transaction.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::address::{Address, MeshAddress};

pub const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(6);

#[derive(Debug, Clone, Copy)]
struct LastTransaction {
    source: Address,
    destination: Address,
    tid: u8,
    timestamp: Instant,
}

/// Thread-safe; one record per opcode.
#[derive(Debug, Default)]
pub struct TransactionHelper {
    last: Mutex<HashMap<u32, LastTransaction>>,
}

impl TransactionHelper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_new_transaction(
        &self,
        opcode: u32,
        tid: u8,
        source: Address,
        destination: &MeshAddress,
    ) -> bool {
        self.is_new_transaction_at(opcode, tid, source, destination, Instant::now())
    }

    pub fn is_new_transaction_at(
        &self,
        opcode: u32,
        tid: u8,
        source: Address,
        destination: &MeshAddress,
        now: Instant,
    ) -> bool {
        let mut last = self.last.lock();
        if let Some(previous) = last.get_mut(&opcode) {
            let continuation = previous.source == source
                && previous.destination == destination.address
                && previous.tid == tid
                && now.saturating_duration_since(previous.timestamp) < TRANSACTION_TIMEOUT;
            if continuation {
                // Each retransmission extends the window.
                previous.timestamp = now;
                return false;
            }
        }
        last.insert(
            opcode,
            LastTransaction {
                source,
                destination: destination.address,
                tid,
                timestamp: now,
            },
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const SET: u32 = 0x8202;

    fn dst() -> MeshAddress {
        MeshAddress::new(Address(0x0005))
    }

    #[test]
    fn test_same_tid_within_window_is_continuation() {
        let helper = TransactionHelper::new();
        let start = Instant::now();
        assert!(helper.is_new_transaction_at(SET, 7, Address(3), &dst(), start));
        assert!(!helper.is_new_transaction_at(SET, 7, Address(3), &dst(), start + Duration::from_secs(1)));
    }

    #[test]
    fn test_same_tid_after_window_is_new() {
        let helper = TransactionHelper::new();
        let start = Instant::now();
        assert!(helper.is_new_transaction_at(SET, 7, Address(3), &dst(), start));
        assert!(helper.is_new_transaction_at(SET, 7, Address(3), &dst(), start + Duration::from_secs(10)));
    }

    #[test]
    fn test_retransmissions_extend_the_window() {
        let helper = TransactionHelper::new();
        let start = Instant::now();
        let results: Vec<bool> = [0, 4, 8]
            .into_iter()
            .map(|secs| {
                helper.is_new_transaction_at(SET, 7, Address(3), &dst(), start + Duration::from_secs(secs))
            })
            .collect();
        assert_eq!(results, vec![true, false, false]);
    }

    #[test]
    fn test_different_source_or_tid_is_new() {
        let helper = TransactionHelper::new();
        let start = Instant::now();
        assert!(helper.is_new_transaction_at(SET, 7, Address(3), &dst(), start));
        assert!(helper.is_new_transaction_at(SET, 7, Address(4), &dst(), start));
        assert!(helper.is_new_transaction_at(SET, 8, Address(4), &dst(), start));
        // The record was replaced by the last call.
        assert!(!helper.is_new_transaction_at(SET, 8, Address(4), &dst(), start));
    }

    #[test]
    fn test_opcodes_are_independent_across_threads() {
        let helper = Arc::new(TransactionHelper::new());
        let handles: Vec<_> = (0..8u32)
            .map(|i| {
                let helper = Arc::clone(&helper);
                std::thread::spawn(move || {
                    let start = Instant::now();
                    let opcode = 0x8200 + i;
                    let first = helper.is_new_transaction_at(opcode, 1, Address(3), &dst(), start);
                    let repeat = helper.is_new_transaction_at(opcode, 1, Address(3), &dst(), start);
                    (first, repeat)
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), (true, false));
        }
    }
}
