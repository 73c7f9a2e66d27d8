//! The set of channel limiters sharing one link's send budget.
//!
//! Each refill tick hands the link's token budget to its channels in turn.
//! A channel that cannot hold its share returns the overflow, which goes to
//! the channels after it. The starting channel rotates every tick so no
//! channel is always first in line.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::limiter::{LimiterConfig, TokenBucketLimiter};
use crate::send_queue::SendQueue;

#[derive(Debug, Default)]
struct GroupState {
    limiters: HashMap<u32, Arc<TokenBucketLimiter>>,
    /// Channel ids in creation order, used for rotation.
    order: Vec<u32>,
    next_start: usize,
}

/// Limiters for every channel of one link.
#[derive(Debug)]
pub struct LimiterGroup {
    sink: Arc<SendQueue>,
    config: LimiterConfig,
    state: Mutex<GroupState>,
}

impl LimiterGroup {
    pub fn new(sink: Arc<SendQueue>) -> Self {
        Self::with_config(sink, LimiterConfig::default())
    }

    pub fn with_config(sink: Arc<SendQueue>, config: LimiterConfig) -> Self {
        Self {
            sink,
            config,
            state: Mutex::new(GroupState::default()),
        }
    }

    pub fn sink(&self) -> &Arc<SendQueue> {
        &self.sink
    }

    /// The limiter for `channel_id`, created on first use.
    pub fn limiter(&self, channel_id: u32) -> Arc<TokenBucketLimiter> {
        let mut st = self.state.lock();
        if let Some(existing) = st.limiters.get(&channel_id) {
            return Arc::clone(existing);
        }
        let limiter = Arc::new(TokenBucketLimiter::with_config(
            channel_id,
            Arc::clone(&self.sink),
            self.config.clone(),
        ));
        st.limiters.insert(channel_id, Arc::clone(&limiter));
        st.order.push(channel_id);
        tracing::debug!(channel_id, "created channel limiter");
        limiter
    }

    pub fn get(&self, channel_id: u32) -> Option<Arc<TokenBucketLimiter>> {
        self.state.lock().limiters.get(&channel_id).cloned()
    }

    /// Drop a channel's limiter, releasing its backlog unsent.
    pub fn remove(&self, channel_id: u32) -> Option<Arc<TokenBucketLimiter>> {
        let removed = {
            let mut st = self.state.lock();
            st.order.retain(|id| *id != channel_id);
            st.limiters.remove(&channel_id)
        };
        if let Some(limiter) = &removed {
            limiter.clear();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.state.lock().limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().limiters.is_empty()
    }

    /// Distribute `tokens` across all channels.
    ///
    /// Returns the tokens no channel could hold.
    pub fn refill_all(&self, tokens: usize) -> usize {
        let limiters = self.rotation();
        self.distribute(tokens, &limiters)
    }

    /// Apply a backpressure limit to one channel and give any tokens it
    /// loses to the other channels.
    ///
    /// Returns the tokens no channel could hold.
    pub fn set_backpressure_limit(&self, channel_id: u32, limit: Option<usize>) -> usize {
        let trimmed = self.limiter(channel_id).set_backpressure_limit(limit);
        if trimmed == 0 {
            return 0;
        }
        let siblings: Vec<_> = self
            .rotation()
            .into_iter()
            .filter(|l| l.channel_id() != channel_id)
            .collect();
        self.distribute(trimmed, &siblings)
    }

    /// Remove channels that are idle past their timeout and have nothing
    /// queued. Returns how many were removed.
    pub fn prune_expired(&self) -> usize {
        let mut st = self.state.lock();
        let expired: Vec<u32> = st
            .limiters
            .iter()
            .filter(|(_, l)| l.is_empty() && l.is_expired())
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            st.limiters.remove(id);
            tracing::debug!(channel_id = *id, "pruned expired channel limiter");
        }
        st.order.retain(|id| !expired.contains(id));
        expired.len()
    }

    /// Refill every `interval` at `bytes_per_sec`, pruning idle channels.
    pub fn spawn_refill(
        self: Arc<Self>,
        interval: Duration,
        bytes_per_sec: usize,
    ) -> JoinHandle<()> {
        let per_tick = (bytes_per_sec as f64 * interval.as_secs_f64()).round() as usize;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let unused = self.refill_all(per_tick);
                if unused > 0 {
                    tracing::trace!(unused, per_tick, "refill tick left tokens unused");
                }
                self.prune_expired();
            }
        })
    }

    fn rotation(&self) -> Vec<Arc<TokenBucketLimiter>> {
        let mut st = self.state.lock();
        let n = st.order.len();
        if n == 0 {
            return Vec::new();
        }
        let start = st.next_start % n;
        st.next_start = (start + 1) % n;
        (0..n)
            .filter_map(|i| st.limiters.get(&st.order[(start + i) % n]).cloned())
            .collect()
    }

    fn distribute(&self, tokens: usize, limiters: &[Arc<TokenBucketLimiter>]) -> usize {
        let mut remaining = tokens;
        for (i, limiter) in limiters.iter().enumerate() {
            if remaining == 0 {
                break;
            }
            let share = remaining / (limiters.len() - i);
            let share = if share == 0 { remaining } else { share };
            remaining -= limiter.refill(share);
        }
        remaining
    }
}
