//! Stream-management ledger.
//!
//! Tracks how many stanzas have been sent and received on a stream, mod
//! 2^32, and retains every sent-but-unacknowledged stanza for replay after
//! a resumption. The writer task records sends, the reader task applies
//! inbound acks; both sides go through one mutex (see [`crate::session`]).
//!
//! All counter arithmetic is wrapping: an acknowledgment is interpreted
//! relative to the last acknowledged count, never compared absolutely, so
//! behavior at the 2^32 boundary matches unbounded counters.

use std::collections::VecDeque;

use crate::error::{Result, WireError};
use crate::frame::Stanza;

/// Sent/received counters plus the unacknowledged replay buffer.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    sent: u32,
    acked: u32,
    received: u32,
    unacked: VecDeque<(u32, Stanza)>,
}

impl Ledger {
    /// Fresh ledger for a newly enabled stream
    pub fn new() -> Self {
        Self::default()
    }

    /// Count of stanzas written to the transport, mod 2^32
    pub fn sent(&self) -> u32 {
        self.sent
    }

    /// Count of our stanzas the peer has acknowledged, mod 2^32
    pub fn acked(&self) -> u32 {
        self.acked
    }

    /// Count of peer stanzas we have received, mod 2^32.
    /// This is the `h` we report in outbound acks.
    pub fn received(&self) -> u32 {
        self.received
    }

    /// Number of sent stanzas not yet acknowledged
    pub fn outstanding(&self) -> u32 {
        self.sent.wrapping_sub(self.acked)
    }

    /// Record one stanza actually written; returns its sequence number
    pub fn record_sent(&mut self, stanza: Stanza) -> u32 {
        self.sent = self.sent.wrapping_add(1);
        self.unacked.push_back((self.sent, stanza));
        self.sent
    }

    /// Record one inbound stanza; returns the updated received count
    pub fn record_received(&mut self) -> u32 {
        self.received = self.received.wrapping_add(1);
        self.received
    }

    /// Apply an inbound acknowledgment carrying received-count `h`.
    ///
    /// Trims every unacknowledged entry the ack covers. An `h` that claims
    /// more than is outstanding means the two sides have diverged and is a
    /// protocol error, not something to clamp.
    pub fn apply_ack(&mut self, h: u32) -> Result<()> {
        let newly = h.wrapping_sub(self.acked);
        let outstanding = self.outstanding();
        if newly > outstanding {
            return Err(WireError::Protocol(format!(
                "ack h={h} covers {newly} stanzas but only {outstanding} are outstanding"
            )));
        }
        for _ in 0..newly {
            self.unacked.pop_front();
        }
        self.acked = h;
        Ok(())
    }

    /// Unacknowledged stanzas in original send order, for replay.
    ///
    /// Entries stay in the ledger; they are only removed by a covering ack.
    pub fn unacked_stanzas(&self) -> Vec<Stanza> {
        self.unacked.iter().map(|(_, s)| s.clone()).collect()
    }

    /// Sequence numbers currently awaiting acknowledgment
    pub fn unacked_seqs(&self) -> Vec<u32> {
        self.unacked.iter().map(|(seq, _)| *seq).collect()
    }
}

/// Everything needed to resume a broken stream on a new connection attempt.
#[derive(Debug, Clone)]
pub struct ResumeState {
    /// Resumption token issued by the peer when stream management was enabled
    pub token: String,
    /// Ledger carried over from the broken stream
    pub ledger: Ledger,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stanza(n: u32) -> Stanza {
        Stanza::message(format!("m{n}"))
    }

    #[test]
    fn test_ack_trims_fifo_in_order() {
        let mut ledger = Ledger::new();
        for n in 1..=5 {
            ledger.record_sent(stanza(n));
        }
        assert_eq!(ledger.outstanding(), 5);

        ledger.apply_ack(3).unwrap();
        assert_eq!(ledger.outstanding(), 2);
        assert_eq!(
            ledger.unacked_stanzas(),
            vec![stanza(4), stanza(5)]
        );
        assert_eq!(ledger.unacked_seqs(), vec![4, 5]);
    }

    #[test]
    fn test_ack_overrun_is_protocol_error() {
        let mut ledger = Ledger::new();
        ledger.record_sent(stanza(1));
        assert!(ledger.apply_ack(2).is_err());
    }

    #[test]
    fn test_duplicate_ack_is_noop() {
        let mut ledger = Ledger::new();
        ledger.record_sent(stanza(1));
        ledger.record_sent(stanza(2));
        ledger.apply_ack(2).unwrap();
        ledger.apply_ack(2).unwrap();
        assert_eq!(ledger.outstanding(), 0);
    }

    #[test]
    fn test_counters_wrap_at_boundary() {
        let mut ledger = Ledger {
            sent: u32::MAX - 1,
            acked: u32::MAX - 1,
            ..Default::default()
        };

        // Two sends wrap the counter through 2^32
        let s1 = ledger.record_sent(stanza(1));
        let s2 = ledger.record_sent(stanza(2));
        assert_eq!(s1, u32::MAX);
        assert_eq!(s2, 0);
        assert_eq!(ledger.outstanding(), 2);

        // An ack for the wrapped count trims both entries
        ledger.apply_ack(0).unwrap();
        assert_eq!(ledger.outstanding(), 0);
        assert_eq!(ledger.acked(), 0);
    }

    #[test]
    fn test_received_counter_wraps() {
        let mut ledger = Ledger {
            received: u32::MAX,
            ..Default::default()
        };
        assert_eq!(ledger.record_received(), 0);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Trimming with wrapped counters must match what unbounded
            /// arithmetic would do.
            #[test]
            fn ack_matches_unbounded_model(
                start in any::<u32>(),
                sends in 0u64..200,
                ack_delta in 0u64..200,
            ) {
                let acked_count = ack_delta.min(sends);

                let mut ledger = Ledger {
                    sent: start,
                    acked: start,
                    ..Default::default()
                };
                for n in 0..sends {
                    ledger.record_sent(stanza(n as u32));
                }

                let h = start.wrapping_add(acked_count as u32);
                ledger.apply_ack(h).unwrap();

                // Unbounded model: sends - acked_count remain, oldest trimmed
                prop_assert_eq!(ledger.outstanding() as u64, sends - acked_count);
                let expected: Vec<Stanza> =
                    (acked_count..sends).map(|n| stanza(n as u32)).collect();
                prop_assert_eq!(ledger.unacked_stanzas(), expected);
            }

            /// Acks beyond the outstanding window are always rejected.
            #[test]
            fn overrun_always_rejected(
                start in any::<u32>(),
                sends in 0u32..50,
                overrun in 1u32..1000,
            ) {
                let mut ledger = Ledger {
                    sent: start,
                    acked: start,
                    ..Default::default()
                };
                for n in 0..sends {
                    ledger.record_sent(stanza(n));
                }
                let h = start.wrapping_add(sends).wrapping_add(overrun);
                prop_assert!(ledger.apply_ack(h).is_err());
            }
        }
    }
}
