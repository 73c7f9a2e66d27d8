//! Hand-off between channel pacing and the physical send task.
//!
//! Limiters push paced datagrams from inside their own lock; the send task
//! pops them without taking any lock. `notify()` wakes a send task parked
//! in `notified()` once a drain pass has queued at least one datagram.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::SegQueue;
use tokio::sync::Notify;

use crate::frame::{DataMessage, Frame};

/// A paced message ready for the wire.
#[derive(Debug)]
pub struct OutboundDatagram {
    pub channel_id: u32,
    pub wire_size: usize,
    pub message: DataMessage,
}

impl OutboundDatagram {
    pub fn into_frame(self) -> Frame {
        Frame::ServiceData(self.message)
    }
}

/// Lock-free queue of datagrams waiting for the send task.
#[derive(Debug, Default)]
pub struct SendQueue {
    queue: SegQueue<OutboundDatagram>,
    notify: Notify,
    queued_bytes: AtomicU64,
    queued_packets: AtomicU64,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, datagram: OutboundDatagram) {
        self.queued_bytes
            .fetch_add(datagram.wire_size as u64, Ordering::Relaxed);
        self.queued_packets.fetch_add(1, Ordering::Relaxed);
        self.queue.push(datagram);
    }

    pub fn pop(&self) -> Option<OutboundDatagram> {
        self.queue.pop()
    }

    /// Wake the send task.
    pub fn notify(&self) {
        self.notify.notify_one();
    }

    /// Wait until a drain pass signals new datagrams.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Total wire bytes ever queued.
    pub fn queued_bytes(&self) -> u64 {
        self.queued_bytes.load(Ordering::Relaxed)
    }

    /// Total datagrams ever queued.
    pub fn queued_packets(&self) -> u64 {
        self.queued_packets.load(Ordering::Relaxed)
    }
}
