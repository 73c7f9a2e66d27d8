//! Per-channel token bucket pacing.
//!
//! Each channel owns a bucket of byte tokens and a FIFO backlog of messages
//! waiting for tokens. Tokens arrive through `refill`; messages arrive
//! through `enqueue`. Both attempt a drain, which moves messages from the
//! head of the backlog into the shared `SendQueue` while tokens last.
//!
//! The backlog is bounded by `max_backlog_bytes`, recomputed after every
//! drain as `base + rate * window`, so a channel that has recently moved a
//! lot of data may buffer proportionally more. A message that does not fit
//! is dropped on the spot.
//!
//! The effective token cap is the backpressure limit when the peer has
//! advertised one, otherwise `max_available_tokens`. Tokens that would
//! exceed the cap are handed back to the caller so the group can give them
//! to sibling channels.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::frame::{DataMessage, MAX_DATAGRAM_SIZE};
use crate::rate::RateAverage;
use crate::send_queue::{OutboundDatagram, SendQueue};

/// Default bucket size: 16 full datagrams.
const DEFAULT_MAX_AVAILABLE_TOKENS: usize = 16 * MAX_DATAGRAM_SIZE;
/// Backlog allowance independent of observed rate.
const BASE_MAX_BACKLOG_BYTES: usize = 2 * MAX_DATAGRAM_SIZE;
/// How much recent throughput the backlog may hold.
const MAX_DYN_BACKLOG: Duration = Duration::from_millis(1000);
/// Reciprocal of how close to its limit a bucket must be to count as
/// backpressure limited (10 = 90% full).
const BACKPRESSURE_LIMITATION_THRESHOLD: usize = 10;
/// Idle time after which a channel's limiter may be discarded.
const OVERLAY_FORWARD_TIMEOUT: Duration = Duration::from_secs(120);

/// Tuning for a channel limiter.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    pub max_available_tokens: usize,
    pub base_backlog_bytes: usize,
    pub backlog_window: Duration,
    pub backpressure_threshold: usize,
    pub forward_timeout: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_available_tokens: DEFAULT_MAX_AVAILABLE_TOKENS,
            base_backlog_bytes: BASE_MAX_BACKLOG_BYTES,
            backlog_window: MAX_DYN_BACKLOG,
            backpressure_threshold: BACKPRESSURE_LIMITATION_THRESHOLD,
            forward_timeout: OVERLAY_FORWARD_TIMEOUT,
        }
    }
}

#[derive(Debug)]
struct QueuedMessage {
    wire_size: usize,
    message: DataMessage,
}

#[derive(Debug)]
struct BucketState {
    available_tokens: usize,
    max_available_tokens: usize,
    backpressure_limit: Option<usize>,
    backlog: VecDeque<QueuedMessage>,
    backlog_bytes: usize,
    max_backlog_bytes: usize,
    upload_rate: RateAverage,
    last_sent_at: Instant,
    sent_bytes: u64,
    dropped: u64,
}

impl BucketState {
    fn effective_max(&self) -> usize {
        self.backpressure_limit.unwrap_or(self.max_available_tokens)
    }
}

/// Token bucket pacing one channel's outbound messages.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    channel_id: u32,
    config: LimiterConfig,
    state: Mutex<BucketState>,
    sink: Arc<SendQueue>,
}

impl TokenBucketLimiter {
    pub fn new(channel_id: u32, sink: Arc<SendQueue>) -> Self {
        Self::with_config(channel_id, sink, LimiterConfig::default())
    }

    pub fn with_config(channel_id: u32, sink: Arc<SendQueue>, config: LimiterConfig) -> Self {
        let now = Instant::now();
        let state = BucketState {
            available_tokens: 0,
            max_available_tokens: config.max_available_tokens,
            backpressure_limit: None,
            backlog: VecDeque::new(),
            backlog_bytes: 0,
            max_backlog_bytes: config.base_backlog_bytes,
            upload_rate: RateAverage::upload_default(now),
            last_sent_at: now,
            sent_bytes: 0,
            dropped: 0,
        };
        Self {
            channel_id,
            config,
            state: Mutex::new(state),
            sink,
        }
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    /// Add up to `tokens` to the bucket and drain the backlog.
    ///
    /// Returns how many of the offered tokens were kept; the rest
    /// (`tokens - returned`) overflowed the cap and belong to the caller.
    pub fn refill(&self, tokens: usize) -> usize {
        let mut st = self.state.lock();
        let max_tokens = st.effective_max();
        st.available_tokens = st.available_tokens.saturating_add(tokens);
        tracing::trace!(
            channel_id = self.channel_id,
            tokens,
            available = st.available_tokens,
            "refilling bucket"
        );

        self.drain(&mut st);

        if st.available_tokens > max_tokens {
            let overflow = st.available_tokens - max_tokens;
            tracing::trace!(
                channel_id = self.channel_id,
                overflow,
                max_tokens,
                "bucket overflow"
            );
            st.available_tokens = max_tokens;
            return tokens - overflow;
        }
        tokens
    }

    /// Queue `message` for pacing.
    ///
    /// Returns `false` if the message would push the backlog past
    /// `max_backlog_bytes`; it is dropped, and its payload released, before
    /// this returns.
    pub fn enqueue(&self, message: DataMessage) -> bool {
        let wire_size = message.wire_size();
        let mut st = self.state.lock();
        if wire_size + st.backlog_bytes > st.max_backlog_bytes {
            tracing::trace!(
                channel_id = self.channel_id,
                wire_size,
                backlog_bytes = st.backlog_bytes,
                max_backlog_bytes = st.max_backlog_bytes,
                seq = %message.sequence(),
                "dropping message, backlog full"
            );
            st.dropped += 1;
            drop(message);
            return false;
        }
        st.backlog_bytes += wire_size;
        st.backlog.push_back(QueuedMessage { wire_size, message });
        self.drain(&mut st);
        true
    }

    fn drain(&self, st: &mut BucketState) {
        // Only start with a full datagram's worth of tokens.
        if st.available_tokens < MAX_DATAGRAM_SIZE {
            tracing::trace!(
                channel_id = self.channel_id,
                available = st.available_tokens,
                "not enough tokens to send a packet"
            );
            return;
        }

        let mut bytes = 0usize;
        let mut packets = 0usize;
        while let Some(head) = st.backlog.front() {
            if st.available_tokens < head.wire_size {
                break;
            }
            let Some(queued) = st.backlog.pop_front() else {
                break;
            };
            st.available_tokens -= queued.wire_size;
            st.backlog_bytes -= queued.wire_size;
            bytes += queued.wire_size;
            packets += 1;
            self.sink.push(OutboundDatagram {
                channel_id: self.channel_id,
                wire_size: queued.wire_size,
                message: queued.message,
            });
        }
        if packets > 0 {
            self.sink.notify();
        }

        let now = Instant::now();
        st.upload_rate.add_value(bytes as u64, now);
        let rate = st.upload_rate.average(now);
        st.max_backlog_bytes = (self.config.base_backlog_bytes as f64
            + self.config.backlog_window.as_millis() as f64 * rate / 1000.0)
            .round() as usize;
        if packets > 0 {
            st.last_sent_at = now;
        }
        st.sent_bytes += bytes as u64;

        tracing::trace!(
            channel_id = self.channel_id,
            packets,
            bytes,
            backlog_bytes = st.backlog_bytes,
            rate,
            max_backlog_bytes = st.max_backlog_bytes,
            tokens = st.available_tokens,
            "drained backlog"
        );
    }

    /// Apply (or with `None`, lift) the peer's backpressure limit.
    ///
    /// When the new cap is below the tokens currently held, the excess is
    /// removed from the bucket and returned.
    pub fn set_backpressure_limit(&self, limit: Option<usize>) -> usize {
        let mut st = self.state.lock();
        st.backpressure_limit = limit;
        let max_tokens = st.effective_max();
        if st.available_tokens > max_tokens {
            let trimmed = st.available_tokens - max_tokens;
            st.available_tokens = max_tokens;
            return trimmed;
        }
        0
    }

    /// Whether a tighter-than-nominal backpressure limit is what is
    /// holding this channel back.
    pub fn is_backpressure_limited(&self) -> bool {
        let st = self.state.lock();
        match st.backpressure_limit {
            Some(limit) if limit < st.max_available_tokens => {
                limit.saturating_sub(st.available_tokens) * self.config.backpressure_threshold
                    < limit
            }
            _ => false,
        }
    }

    /// Release every backlog entry without sending, newest first.
    pub fn clear(&self) {
        let mut st = self.state.lock();
        while let Some(queued) = st.backlog.pop_back() {
            drop(queued);
        }
        st.backlog_bytes = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().backlog_bytes == 0
    }

    pub fn is_expired(&self) -> bool {
        self.state.lock().last_sent_at.elapsed() > self.config.forward_timeout
    }

    pub fn available_tokens(&self) -> usize {
        self.state.lock().available_tokens
    }

    pub fn max_available_tokens(&self) -> usize {
        self.state.lock().max_available_tokens
    }

    pub fn backpressure_limit(&self) -> Option<usize> {
        self.state.lock().backpressure_limit
    }

    pub fn effective_max(&self) -> usize {
        self.state.lock().effective_max()
    }

    pub fn backlog_bytes(&self) -> usize {
        self.state.lock().backlog_bytes
    }

    pub fn backlog_len(&self) -> usize {
        self.state.lock().backlog.len()
    }

    pub fn max_backlog_bytes(&self) -> usize {
        self.state.lock().max_backlog_bytes
    }

    /// Backlog bytes still admissible right now.
    pub fn headroom(&self) -> usize {
        let st = self.state.lock();
        st.max_backlog_bytes.saturating_sub(st.backlog_bytes)
    }

    /// Total wire bytes handed to the send queue.
    pub fn sent_bytes(&self) -> u64 {
        self.state.lock().sent_bytes
    }

    /// Messages dropped at admission.
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }
}
