//! Per-flow message identity and acknowledgment records.
//!
//! A message is identified by the flow it belongs to plus a counter that
//! increases monotonically within that flow. Counter 0 opens the flow (SYN).
//!
//! `SequenceTracker` hands out counters for one flow and remembers which of
//! them the peer has acknowledged. The acknowledged set is bounded: once it
//! reaches `ACKED_GC_THRESHOLD` entries the lowest `ACKED_GC_DISCARD` are
//! dropped, which keeps recent acknowledgments visible to late timers.

use std::collections::BTreeSet;
use std::fmt;

/// Identifier of a logical sub-flow on a channel.
pub type FlowId = u16;

/// Maximum number of acknowledged counters kept before GC runs.
const ACKED_GC_THRESHOLD: usize = 1024;
/// Number of oldest counters discarded when GC runs.
const ACKED_GC_DISCARD: usize = 512;

/// Identity of one message within a sub-flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SequenceNumber {
    flow: FlowId,
    num: u32,
}

impl SequenceNumber {
    pub fn new(flow: FlowId, num: u32) -> Self {
        Self { flow, num }
    }

    pub fn flow(&self) -> FlowId {
        self.flow
    }

    pub fn num(&self) -> u32 {
        self.num
    }

    /// Whether this is the message that opens its flow.
    pub fn is_syn(&self) -> bool {
        self.num == 0
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.flow, self.num)
    }
}

/// Counter allocation and acknowledgment bookkeeping for one flow.
#[derive(Debug, Clone)]
pub struct SequenceTracker {
    flow: FlowId,
    next_num: u32,
    acked: BTreeSet<u32>,
}

impl SequenceTracker {
    pub fn new(flow: FlowId) -> Self {
        Self {
            flow,
            next_num: 0,
            acked: BTreeSet::new(),
        }
    }

    pub fn flow(&self) -> FlowId {
        self.flow
    }

    /// Allocate the next sequence number for this flow.
    pub fn next_sequence(&mut self) -> SequenceNumber {
        let num = self.next_num;
        self.next_num = self.next_num.wrapping_add(1);
        SequenceNumber::new(self.flow, num)
    }

    /// Record that `num` was acknowledged by the peer.
    ///
    /// Returns `false` if it had already been recorded.
    pub fn record_ack(&mut self, num: u32) -> bool {
        if !self.acked.insert(num) {
            return false;
        }
        if self.acked.len() >= ACKED_GC_THRESHOLD {
            self.gc();
        }
        true
    }

    pub fn is_acked(&self, num: u32) -> bool {
        self.acked.contains(&num)
    }

    fn gc(&mut self) {
        let to_remove: Vec<u32> = self
            .acked
            .iter()
            .copied()
            .take(ACKED_GC_DISCARD)
            .collect();
        for num in to_remove {
            self.acked.remove(&num);
        }
    }

    #[cfg(test)]
    fn acked_count(&self) -> usize {
        self.acked.len()
    }
}
