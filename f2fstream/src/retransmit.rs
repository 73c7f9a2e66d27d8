//! Tracking of unacknowledged messages and their retransmission.
//!
//! Every transmission attempt of a message lives in the `SentTable` under
//! its sequence number until it is acknowledged, cancelled or exhausted.
//! Timers do not carry message state. A timer remembers only
//! `(sequence, attempt)` and looks the message up when it fires, so a timer
//! that lost a race with an acknowledgment (or with a newer attempt) finds
//! nothing to do.
//!
//! Retransmission timeouts grow as `2^attempt` times a jittered multiple of
//! the channel latency. An acknowledgment of a first attempt is an RTT
//! sample, and it also marks every message sent before it that is still
//! pending as presumed lost. An acknowledgment of a retransmit cannot be
//! attributed to one attempt and only inflates the latency estimate.
//!
//! The presumed-loss rule assumes the link delivers a flow's messages in
//! order. Over a reordering path it can trigger spurious retransmissions.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::buffer::PooledBuffer;
use crate::rtt::LatencyEstimator;
use crate::scheduler::TimerHandle;
use crate::sequence::{FlowId, SequenceNumber, SequenceTracker};

/// Highest attempt number that is still transmitted.
pub const MAX_ATTEMPTS: u32 = 10;

/// One in-flight, unacknowledged message.
#[derive(Debug)]
pub struct SentMessage {
    sequence: SequenceNumber,
    payload: PooledBuffer,
    created_at: Instant,
    attempt: u32,
    datagram: bool,
    rst: bool,
    timer: Option<TimerHandle>,
}

impl SentMessage {
    /// A first attempt. `None` payload makes a reset message.
    pub fn new(
        sequence: SequenceNumber,
        payload: Option<PooledBuffer>,
        datagram: bool,
        now: Instant,
    ) -> Self {
        let rst = payload.is_none();
        Self {
            sequence,
            payload: payload.unwrap_or_else(PooledBuffer::empty),
            created_at: now,
            attempt: 0,
            datagram,
            rst,
            timer: None,
        }
    }

    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_datagram(&self) -> bool {
        self.datagram
    }

    pub fn is_reset(&self) -> bool {
        self.rst
    }

    /// Whether this message opens its flow.
    pub fn is_syn(&self) -> bool {
        self.sequence.is_syn() && !self.rst
    }

    pub fn payload(&self) -> &PooledBuffer {
        &self.payload
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

/// What to put on the wire for one attempt.
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub sequence: SequenceNumber,
    pub attempt: u32,
    pub payload: PooledBuffer,
    pub syn: bool,
    pub rst: bool,
    pub datagram: bool,
}

/// Result of arming a message for transmission.
#[derive(Debug)]
pub enum Transmission {
    /// Send now; a retransmit timer is armed.
    Send(Outgoing),
    /// Retransmitted too soon after the previous attempt; only the timer
    /// was armed.
    Suppressed,
    /// Attempts exhausted. The message is no longer tracked.
    Abandoned(SentMessage),
    /// The table was cleared; the message was dropped untracked.
    Discarded,
}

/// Result of forgetting an acknowledged message.
#[derive(Debug, PartialEq, Eq)]
pub enum Forgotten {
    /// Nothing was tracked under that sequence.
    NotTracked,
    /// A first attempt was acknowledged; these earlier messages are
    /// presumed lost.
    FirstAttempt { presumed_lost: Vec<SequenceNumber> },
    /// A retransmitted message was acknowledged.
    Retransmit,
}

/// The sent-message table of one endpoint, with its latency estimate.
#[derive(Debug)]
pub struct SentTable {
    messages: HashMap<SequenceNumber, SentMessage>,
    outstanding_bytes: usize,
    latency: LatencyEstimator,
    acks: HashMap<FlowId, SequenceTracker>,
    max_attempts: u32,
    closed: bool,
}

impl SentTable {
    pub fn new(latency: LatencyEstimator, max_attempts: u32) -> Self {
        Self {
            messages: HashMap::new(),
            outstanding_bytes: 0,
            latency,
            acks: HashMap::new(),
            max_attempts,
            closed: false,
        }
    }

    /// Track `msg` and arm its retransmit timer.
    ///
    /// `schedule` receives `(sequence, attempt, delay)` and returns the
    /// handle of the armed timer.
    pub fn arm<F>(&mut self, mut msg: SentMessage, now: Instant, schedule: F) -> Transmission
    where
        F: FnOnce(SequenceNumber, u32, Duration) -> TimerHandle,
    {
        if self.closed {
            tracing::debug!(seq = %msg.sequence, "sent table closed, discarding");
            msg.cancel_timer();
            return Transmission::Discarded;
        }
        if msg.attempt > self.max_attempts {
            msg.cancel_timer();
            return Transmission::Abandoned(msg);
        }

        let seq = msg.sequence;
        let delay = self.latency.jittered_delay(msg.attempt);
        tracing::trace!(
            seq = %seq,
            attempt = msg.attempt,
            delay_ms = delay.as_millis() as u64,
            latency_ms = self.latency.latency().as_millis() as u64,
            "retransmit timer armed"
        );
        msg.timer = Some(schedule(seq, msg.attempt, delay));

        let previous = msg.created_at;
        msg.created_at = now;
        let suppressed = msg.attempt > 0
            && previous
                .checked_add(self.latency.latency())
                .map_or(true, |due| due > now);
        if suppressed {
            msg.created_at = previous;
        }

        let outgoing = Outgoing {
            sequence: seq,
            attempt: msg.attempt,
            payload: msg.payload.clone(),
            syn: msg.is_syn(),
            rst: msg.rst,
            datagram: msg.datagram,
        };

        self.outstanding_bytes += msg.len();
        if let Some(mut replaced) = self.messages.insert(seq, msg) {
            replaced.cancel_timer();
            self.outstanding_bytes -= replaced.len();
        }

        if suppressed {
            tracing::warn!(seq = %seq, "skipping over-aggressive retransmission");
            return Transmission::Suppressed;
        }
        Transmission::Send(outgoing)
    }

    /// Take `seq` out of the table for its next attempt.
    ///
    /// With `expected_attempt`, the entry is only taken if it is still on
    /// that attempt. Returns `None` if there is nothing to retransmit;
    /// acknowledged and reset messages are released here.
    pub fn take_for_retransmit(
        &mut self,
        seq: SequenceNumber,
        expected_attempt: Option<u32>,
    ) -> Option<SentMessage> {
        if self.closed {
            return None;
        }
        let mut msg = self.messages.remove(&seq)?;
        if let Some(expected) = expected_attempt {
            if msg.attempt != expected {
                tracing::warn!(
                    seq = %seq,
                    expected,
                    current = msg.attempt,
                    "stale retransmit timer"
                );
                self.messages.insert(seq, msg);
                return None;
            }
        }

        msg.cancel_timer();
        self.outstanding_bytes -= msg.len();
        if msg.rst || self.is_acked(seq) {
            return None;
        }
        msg.attempt += 1;
        tracing::debug!(seq = %seq, attempt = msg.attempt, "retransmitting");
        Some(msg)
    }

    /// Stop tracking an acknowledged message and learn from its timing.
    pub fn forget(&mut self, seq: SequenceNumber, now: Instant) -> Forgotten {
        let Some(mut msg) = self.messages.remove(&seq) else {
            return Forgotten::NotTracked;
        };
        msg.cancel_timer();
        self.outstanding_bytes -= msg.len();
        self.acks
            .entry(seq.flow())
            .or_insert_with(|| SequenceTracker::new(seq.flow()))
            .record_ack(seq.num());

        if msg.attempt > 0 {
            self.latency.inflate();
            tracing::debug!(
                seq = %seq,
                attempt = msg.attempt,
                latency_ms = self.latency.latency().as_millis() as u64,
                "ack of retransmit, inflating latency"
            );
            return Forgotten::Retransmit;
        }

        let sample = now.saturating_duration_since(msg.created_at);
        self.latency.update(sample);
        let mut presumed_lost: Vec<(Instant, SequenceNumber)> = self
            .messages
            .values()
            .filter(|m| m.created_at < msg.created_at)
            .map(|m| (m.created_at, m.sequence))
            .collect();
        presumed_lost.sort();
        tracing::debug!(
            seq = %seq,
            sample_ms = sample.as_millis() as u64,
            latency_ms = self.latency.latency().as_millis() as u64,
            presumed_lost = presumed_lost.len(),
            "ack"
        );
        Forgotten::FirstAttempt {
            presumed_lost: presumed_lost.into_iter().map(|(_, s)| s).collect(),
        }
    }

    /// Release every message of `flow`. Returns how many were dropped.
    pub fn purge_flow(&mut self, flow: FlowId) -> usize {
        let doomed: Vec<SequenceNumber> = self
            .messages
            .keys()
            .filter(|s| s.flow() == flow)
            .copied()
            .collect();
        for seq in &doomed {
            if let Some(mut msg) = self.messages.remove(seq) {
                msg.cancel_timer();
                self.outstanding_bytes -= msg.len();
            }
        }
        self.acks.remove(&flow);
        doomed.len()
    }

    /// Cancel and release everything. The table accepts nothing afterwards.
    pub fn clear(&mut self) -> usize {
        self.closed = true;
        let count = self.messages.len();
        for (_, mut msg) in self.messages.drain() {
            msg.cancel_timer();
        }
        self.acks.clear();
        self.outstanding_bytes = 0;
        count
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Flows that still carry acknowledgement history.
    pub fn tracked_flows(&self) -> usize {
        self.acks.len()
    }

    pub fn is_acked(&self, seq: SequenceNumber) -> bool {
        self.acks
            .get(&seq.flow())
            .is_some_and(|t| t.is_acked(seq.num()))
    }

    pub fn get(&self, seq: SequenceNumber) -> Option<&SentMessage> {
        self.messages.get(&seq)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn outstanding_bytes(&self) -> usize {
        self.outstanding_bytes
    }

    pub fn latency(&self) -> &LatencyEstimator {
        &self.latency
    }
}
