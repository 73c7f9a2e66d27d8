//! Reliable, flow-multiplexed service channel endpoint.
//!
//! A `ChannelEndpoint` carries many sub-flows (delegates) over one channel
//! of a peer link. Outbound messages are tracked until acknowledged and
//! retransmitted on a jittered, exponentially backed-off timer; inbound
//! messages are offered to delegates and acknowledged.
//!
//! Locking: the sent table and the flow scheduler have separate mutexes.
//! When both are needed the sent table is taken first. Neither is held while
//! a delegate callback runs or while a message is handed to the link. Both
//! refuse new work once cleared by `close`, so a racing write, timer or
//! registration sees the closure under the same lock it would mutate.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::buffer::PooledBuffer;
use crate::delegate::ChannelDelegate;
use crate::error::{F2fStreamError, Result};
use crate::flow::FlowScheduler;
use crate::frame::{ControlFlags, DataMessage, Frame, MAX_SERVICE_MESSAGE_SIZE};
use crate::link::NetworkLink;
use crate::retransmit::{Forgotten, SentMessage, SentTable, Transmission, MAX_ATTEMPTS};
use crate::rtt::LatencyEstimator;
use crate::scheduler::{Scheduler, TimerHandle};
use crate::sequence::{FlowId, SequenceNumber};

/// Tuning for a channel endpoint.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub channel_id: u32,
    /// `true` on the side that opened the channel. That side is started by
    /// the link handshake; the other by the first inbound message.
    pub outgoing: bool,
    /// Highest attempt number that is still sent.
    pub max_attempts: u32,
    pub min_rto_factor: f64,
    pub max_rto_factor: f64,
    pub ewma_weight: f64,
    pub initial_latency: Duration,
    pub max_message_size: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            channel_id: 0,
            outgoing: true,
            max_attempts: MAX_ATTEMPTS,
            min_rto_factor: 2.0,
            max_rto_factor: 3.0,
            ewma_weight: 0.25,
            initial_latency: Duration::from_millis(1000),
            max_message_size: MAX_SERVICE_MESSAGE_SIZE,
        }
    }
}

/// Endpoint lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Created,
    Started,
    Closed,
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EndpointState::Created => "created",
            EndpointState::Started => "started",
            EndpointState::Closed => "closed",
        };
        f.write_str(name)
    }
}

struct Inner {
    config: EndpointConfig,
    link: Arc<dyn NetworkLink>,
    scheduler: Arc<dyn Scheduler>,
    state: Mutex<EndpointState>,
    sent: Mutex<SentTable>,
    flows: Mutex<FlowScheduler>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

/// One endpoint of a multiplexed service channel.
///
/// Cheap to clone; clones share the same endpoint.
#[derive(Clone)]
pub struct ChannelEndpoint {
    inner: Arc<Inner>,
}

impl ChannelEndpoint {
    /// Create an endpoint on `link`, using `scheduler` for retransmit
    /// timers and readiness callbacks.
    ///
    /// `scheduler` must not run tasks inline from `schedule`.
    pub fn new(
        config: EndpointConfig,
        link: Arc<dyn NetworkLink>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let latency = LatencyEstimator::with_params(
            config.initial_latency,
            config.ewma_weight,
            config.min_rto_factor,
            config.max_rto_factor,
        );
        let sent = SentTable::new(latency, config.max_attempts);
        let inner = Arc::new(Inner {
            config,
            link,
            scheduler,
            state: Mutex::new(EndpointState::Created),
            sent: Mutex::new(sent),
            flows: Mutex::new(FlowScheduler::new()),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        inner.scheduler.on_signal(
            inner.link.ready_for_write(),
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    ChannelEndpoint { inner }.notify_ready();
                }
            }),
        );

        tracing::info!(
            channel_id = inner.config.channel_id,
            outgoing = inner.config.outgoing,
            "service channel endpoint created"
        );
        Self { inner }
    }

    pub fn channel_id(&self) -> u32 {
        self.inner.config.channel_id
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.inner.config
    }

    pub fn state(&self) -> EndpointState {
        *self.inner.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == EndpointState::Closed
    }

    /// Whether data has started to flow. The opening side is started once
    /// the link handshake is done.
    pub fn is_started(&self) -> bool {
        let mut state = self.inner.state.lock();
        match *state {
            EndpointState::Started => true,
            EndpointState::Closed => false,
            EndpointState::Created => {
                if self.inner.config.outgoing && self.inner.link.handshake_received() {
                    *state = EndpointState::Started;
                    tracing::info!(
                        channel_id = self.channel_id(),
                        "endpoint started by handshake"
                    );
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Move from `Created` to `Started`.
    pub fn start(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        match *state {
            EndpointState::Created => {
                *state = EndpointState::Started;
                tracing::info!(channel_id = self.channel_id(), "endpoint started");
                Ok(())
            }
            EndpointState::Started => Ok(()),
            EndpointState::Closed => Err(F2fStreamError::InvalidStateTransition {
                from: EndpointState::Closed.to_string(),
                to: EndpointState::Started.to_string(),
            }),
        }
    }

    /// Attach `delegate` as the owner of `flow`.
    ///
    /// If the link is already writable the delegate is told right away.
    pub fn register_delegate(
        &self,
        flow: FlowId,
        delegate: Arc<dyn ChannelDelegate>,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(F2fStreamError::EndpointClosed(self.channel_id()));
        }
        self.inner
            .flows
            .lock()
            .register(flow, Arc::clone(&delegate))
            .map_err(|e| match e {
                F2fStreamError::SchedulerClosed => {
                    F2fStreamError::EndpointClosed(self.channel_id())
                }
                other => other,
            })?;
        tracing::debug!(channel_id = self.channel_id(), flow, "delegate registered");
        if self.inner.link.is_ready_for_write() {
            delegate.channel_is_ready(self);
        }
        Ok(())
    }

    /// Detach `delegate` and drop its unacknowledged messages. Returns
    /// `false` if it was not attached.
    pub fn unregister_delegate(&self, delegate: &Arc<dyn ChannelDelegate>) -> bool {
        let Some(flow) = self.inner.flows.lock().unregister(delegate) else {
            return false;
        };
        let purged = self.inner.sent.lock().purge_flow(flow);
        tracing::debug!(channel_id = self.channel_id(), flow, purged, "delegate unregistered");
        true
    }

    /// Send `payload` as message `counter` of `flow`, tracking it until it
    /// is acknowledged. A `None` payload sends a reset.
    pub fn write(
        &self,
        flow: FlowId,
        counter: u32,
        payload: Option<PooledBuffer>,
        datagram: bool,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(F2fStreamError::EndpointClosed(self.channel_id()));
        }
        if let Some(p) = &payload {
            let max = self.inner.config.max_message_size;
            if p.len() > max {
                return Err(F2fStreamError::PayloadTooLarge { size: p.len(), max });
            }
        }
        if let Err(e) = self.inner.flows.lock().touch(flow) {
            tracing::warn!(channel_id = self.channel_id(), flow, "unknown message sender");
            return Err(e);
        }

        let seq = SequenceNumber::new(flow, counter);
        let msg = SentMessage::new(seq, payload, datagram, Instant::now());
        let outcome = {
            let mut sent = self.inner.sent.lock();
            sent.arm(msg, Instant::now(), |s, a, d| self.schedule_retransmit(s, a, d))
        };
        if matches!(outcome, Transmission::Discarded) {
            return Err(F2fStreamError::EndpointClosed(self.channel_id()));
        }
        self.dispatch(outcome);
        Ok(())
    }

    /// Handle an inbound frame from the link.
    pub fn on_receive(&self, frame: Frame) {
        if self.is_closed() {
            return;
        }
        if !self.is_started() {
            // Only fails once closed, which was checked above.
            let _ = self.start();
        }
        let msg = match frame {
            Frame::ServiceData(msg) => msg,
            other => {
                tracing::warn!(
                    channel_id = self.channel_id(),
                    frame_type = ?other.frame_type(),
                    "dropping inbound frame that is not service data"
                );
                return;
            }
        };
        if msg.channel_id != self.channel_id() {
            tracing::warn!(
                channel_id = self.channel_id(),
                got = msg.channel_id,
                "dropping service data for another channel"
            );
            return;
        }
        tracing::trace!(
            channel_id = self.channel_id(),
            seq = %msg.sequence(),
            flags = msg.flags.0,
            len = msg.payload.len(),
            "incoming message"
        );
        self.inner
            .bytes_in
            .fetch_add(msg.payload.len() as u64, Ordering::Relaxed);

        self.inner.link.update_backpressure(self.channel_id(), msg.window);

        if msg.is_ack() {
            for num in &msg.acks {
                self.forget(SequenceNumber::new(msg.flow, *num));
            }
        }

        let delegates = self.inner.flows.lock().snapshot();
        let mut window = 0;
        for d in &delegates {
            if d.channel_got_message(self, &msg) {
                window = d.queue_capacity(self);
                break;
            }
        }

        if !msg.is_ack() && !msg.is_rst() {
            tracing::trace!(
                channel_id = self.channel_id(),
                seq = %msg.sequence(),
                window,
                "ack enqueued"
            );
            let ack = DataMessage::acknowledge(
                self.channel_id(),
                window,
                msg.flow,
                vec![msg.num],
                msg.datagram,
            );
            self.inner.link.send(ack);
        }
    }

    /// Stop retransmitting `seq`; it was acknowledged.
    ///
    /// Returns `false` if it was not being tracked.
    pub fn forget(&self, seq: SequenceNumber) -> bool {
        let outcomes = {
            let mut sent = self.inner.sent.lock();
            let now = Instant::now();
            let presumed_lost = match sent.forget(seq, now) {
                Forgotten::NotTracked => return false,
                Forgotten::Retransmit => Vec::new(),
                Forgotten::FirstAttempt { presumed_lost } => presumed_lost,
            };
            let mut outcomes = Vec::with_capacity(presumed_lost.len());
            for lost in presumed_lost {
                if let Some(msg) = sent.take_for_retransmit(lost, None) {
                    let outcome = sent.arm(msg, now, |s, a, d| self.schedule_retransmit(s, a, d));
                    outcomes.push(outcome);
                }
            }
            outcomes
        };
        for outcome in outcomes {
            self.dispatch(outcome);
        }
        true
    }

    /// Bytes `delegate` may write now, given its place in line.
    pub fn get_write_capacity(&self, delegate: &Arc<dyn ChannelDelegate>) -> usize {
        let network = self.inner.link.current_capacity(self.channel_id());
        self.inner
            .flows
            .lock()
            .write_capacity(delegate, network, self.inner.config.max_message_size)
    }

    /// Each delegate's even share of what the link could hold.
    pub fn get_potential_write_capacity(&self) -> usize {
        let network = self.inner.link.potential_capacity(self.channel_id());
        self.inner.flows.lock().potential_capacity(network)
    }

    /// Close the endpoint: cancel every retransmission, release every
    /// tracked payload and tell each delegate once.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == EndpointState::Closed {
                return;
            }
            *state = EndpointState::Closed;
        }
        let released = self.inner.sent.lock().clear();
        let delegates = self.inner.flows.lock().clear();
        tracing::info!(
            channel_id = self.channel_id(),
            released,
            delegates = delegates.len(),
            bytes_in = self.bytes_in(),
            bytes_out = self.bytes_out(),
            "endpoint closed"
        );
        for d in &delegates {
            d.channel_did_close(self);
        }
    }

    /// Smoothed round-trip latency.
    pub fn latency(&self) -> Duration {
        self.inner.sent.lock().latency().latency()
    }

    pub fn min_latency(&self) -> Option<Duration> {
        self.inner.sent.lock().latency().min_latency()
    }

    /// Payload bytes sent but not yet acknowledged.
    pub fn outstanding_bytes(&self) -> usize {
        self.inner.sent.lock().outstanding_bytes()
    }

    pub fn bytes_in(&self) -> u64 {
        self.inner.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.inner.bytes_out.load(Ordering::Relaxed)
    }

    /// The payload tracked under `seq`, if it is still unacknowledged.
    pub fn message(&self, seq: SequenceNumber) -> Option<PooledBuffer> {
        self.inner.sent.lock().get(seq).map(|m| m.payload().clone())
    }

    pub fn flow_order(&self) -> Vec<FlowId> {
        self.inner.flows.lock().flow_order().to_vec()
    }

    pub fn delegate_count(&self) -> usize {
        self.inner.flows.lock().len()
    }

    fn schedule_retransmit(
        &self,
        seq: SequenceNumber,
        attempt: u32,
        delay: Duration,
    ) -> TimerHandle {
        let weak = Arc::downgrade(&self.inner);
        self.inner.scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    ChannelEndpoint { inner }.on_timer(seq, attempt);
                }
            }),
        )
    }

    fn on_timer(&self, seq: SequenceNumber, attempt: u32) {
        if self.is_closed() {
            return;
        }
        let outcome = {
            let mut sent = self.inner.sent.lock();
            if sent.get(seq).is_some() && self.inner.flows.lock().lookup(seq.flow()).is_none() {
                let purged = sent.purge_flow(seq.flow());
                tracing::warn!(
                    channel_id = self.channel_id(),
                    seq = %seq,
                    purged,
                    "retransmit timer for unknown flow"
                );
                return;
            }
            match sent.take_for_retransmit(seq, Some(attempt)) {
                Some(msg) => sent.arm(msg, Instant::now(), |s, a, d| {
                    self.schedule_retransmit(s, a, d)
                }),
                None => return,
            }
        };
        self.dispatch(outcome);
    }

    fn dispatch(&self, outcome: Transmission) {
        match outcome {
            Transmission::Send(out) => {
                let len = out.payload.len();
                let mut msg = DataMessage::data(self.channel_id(), out.sequence, out.payload);
                if out.syn {
                    msg.flags.insert(ControlFlags::SYN);
                }
                if out.rst {
                    msg.flags.insert(ControlFlags::RST);
                }
                msg.datagram = out.datagram;
                if !self.inner.link.send(msg) {
                    tracing::trace!(
                        channel_id = self.channel_id(),
                        seq = %out.sequence,
                        attempt = out.attempt,
                        "message dropped at admission, timer will retry"
                    );
                }
                self.inner.bytes_out.fetch_add(len as u64, Ordering::Relaxed);
            }
            Transmission::Suppressed | Transmission::Discarded => {}
            Transmission::Abandoned(msg) => self.abandon_flow(msg.sequence()),
        }
    }

    /// Tear down the flow of a message that ran out of attempts.
    fn abandon_flow(&self, seq: SequenceNumber) {
        let flow = seq.flow();
        tracing::warn!(
            channel_id = self.channel_id(),
            seq = %seq,
            "closing flow, message sent too many times without acknowledgement"
        );
        let purged = self.inner.sent.lock().purge_flow(flow);
        let delegate = self.inner.flows.lock().unregister_flow(flow);
        match delegate {
            Some(d) => {
                tracing::debug!(channel_id = self.channel_id(), flow, purged, "flow torn down");
                d.channel_did_close(self);
            }
            None => {
                tracing::warn!(
                    channel_id = self.channel_id(),
                    flow,
                    "exhausted message for unknown flow"
                );
            }
        }
    }

    fn notify_ready(&self) {
        if self.is_closed() {
            return;
        }
        tracing::info!(channel_id = self.channel_id(), "link marked ready for write");
        let delegates = self.inner.flows.lock().snapshot();
        for d in &delegates {
            d.channel_is_ready(self);
        }
    }
}

impl fmt::Debug for ChannelEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelEndpoint")
            .field("channel_id", &self.channel_id())
            .field("state", &self.state())
            .field("outgoing", &self.inner.config.outgoing)
            .finish()
    }
}
