//! The network layer a channel endpoint sends through.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::frame::{DataMessage, Frame};
use crate::limiter_group::LimiterGroup;
use crate::readiness::ReadyEvent;
use crate::send_queue::SendQueue;

/// What an endpoint needs from the connection below it.
///
/// No method may block.
pub trait NetworkLink: Send + Sync {
    /// Hand a framed message to the send path. Returns `false` if it was
    /// dropped on admission.
    fn send(&self, message: DataMessage) -> bool;

    /// Bytes the channel's send queue could hold, ignoring what it holds now.
    fn potential_capacity(&self, channel_id: u32) -> usize;

    /// Bytes the channel's send queue can take right now.
    fn current_capacity(&self, channel_id: u32) -> usize;

    /// Apply the receive window the peer advertised. Negative means none.
    fn update_backpressure(&self, channel_id: u32, window: i32);

    /// Whether the connection handshake has completed.
    fn handshake_received(&self) -> bool;

    fn is_ready_for_write(&self) -> bool;

    /// Completes once the link can take writes, immediately if it already
    /// can.
    fn ready_for_write(&self) -> oneshot::Receiver<()>;
}

/// `NetworkLink` that paces every channel through a token bucket.
///
/// Paced datagrams end up in the group's `SendQueue`, which the physical
/// send task drains.
#[derive(Debug)]
pub struct PacedLink {
    group: Arc<LimiterGroup>,
    handshake: AtomicBool,
    ready: ReadyEvent,
}

impl PacedLink {
    pub fn new(group: Arc<LimiterGroup>) -> Self {
        Self {
            group,
            handshake: AtomicBool::new(false),
            ready: ReadyEvent::new(),
        }
    }

    pub fn group(&self) -> &Arc<LimiterGroup> {
        &self.group
    }

    pub fn send_queue(&self) -> &Arc<SendQueue> {
        self.group.sink()
    }

    pub fn mark_handshake_received(&self) {
        if !self.handshake.swap(true, Ordering::AcqRel) {
            tracing::info!("link handshake received");
        }
    }

    /// Next paced frame, if one is queued.
    pub fn try_next_frame(&self) -> Option<Frame> {
        self.send_queue().pop().map(|d| d.into_frame())
    }

    /// Wait for the next paced frame. Meant for the single send task.
    pub async fn next_frame(&self) -> Frame {
        loop {
            if let Some(frame) = self.try_next_frame() {
                return frame;
            }
            self.send_queue().notified().await;
        }
    }

    /// Signal write readiness to every waiter.
    pub fn mark_ready(&self) {
        if self.ready.fire() {
            tracing::info!("link ready for write");
        }
    }
}

impl NetworkLink for PacedLink {
    fn send(&self, message: DataMessage) -> bool {
        self.group.limiter(message.channel_id).enqueue(message)
    }

    fn potential_capacity(&self, channel_id: u32) -> usize {
        self.group.limiter(channel_id).max_backlog_bytes()
    }

    fn current_capacity(&self, channel_id: u32) -> usize {
        self.group.limiter(channel_id).headroom()
    }

    fn update_backpressure(&self, channel_id: u32, window: i32) {
        let limit = usize::try_from(window).ok();
        let unused = self.group.set_backpressure_limit(channel_id, limit);
        if unused > 0 {
            tracing::trace!(channel_id, window, unused, "backpressure left tokens unused");
        }
    }

    fn handshake_received(&self) -> bool {
        self.handshake.load(Ordering::Acquire)
    }

    fn is_ready_for_write(&self) -> bool {
        self.ready.is_fired()
    }

    fn ready_for_write(&self) -> oneshot::Receiver<()> {
        self.ready.wait()
    }
}
