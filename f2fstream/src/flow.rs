//! Fair scheduling of the sub-flows sharing one channel.
//!
//! Delegates are kept in registration order, which decides who is offered
//! inbound messages first. Write-capable delegates also sit in the flow
//! order: whoever wrote most recently moves to the tail, and capacity is
//! handed out from the head.

use std::sync::Arc;

use crate::delegate::ChannelDelegate;
use crate::error::{F2fStreamError, Result};
use crate::sequence::FlowId;

/// Registered delegates and their scheduling order.
#[derive(Default)]
pub struct FlowScheduler {
    delegates: Vec<(FlowId, Arc<dyn ChannelDelegate>)>,
    flow_order: Vec<FlowId>,
    closed: bool,
}

fn same_delegate(a: &Arc<dyn ChannelDelegate>, b: &Arc<dyn ChannelDelegate>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

impl FlowScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, flow: FlowId, delegate: Arc<dyn ChannelDelegate>) -> Result<()> {
        if self.closed {
            return Err(F2fStreamError::SchedulerClosed);
        }
        if self.delegates.iter().any(|(f, _)| *f == flow) {
            return Err(F2fStreamError::FlowAlreadyRegistered(flow));
        }
        if delegate.writes_messages() {
            self.flow_order.push(flow);
        }
        self.delegates.push((flow, delegate));
        Ok(())
    }

    /// Remove `delegate` wherever it is registered. Returns its flow, or
    /// `None` if it was not registered.
    pub fn unregister(&mut self, delegate: &Arc<dyn ChannelDelegate>) -> Option<FlowId> {
        let idx = self
            .delegates
            .iter()
            .position(|(_, d)| same_delegate(d, delegate))?;
        let (flow, _) = self.delegates.remove(idx);
        self.flow_order.retain(|f| *f != flow);
        Some(flow)
    }

    /// Remove whichever delegate owns `flow`.
    pub fn unregister_flow(&mut self, flow: FlowId) -> Option<Arc<dyn ChannelDelegate>> {
        let idx = self.delegates.iter().position(|(f, _)| *f == flow)?;
        let (_, delegate) = self.delegates.remove(idx);
        self.flow_order.retain(|f| *f != flow);
        Some(delegate)
    }

    /// Move `flow` to the back of the line after it wrote.
    pub fn touch(&mut self, flow: FlowId) -> Result<()> {
        if !self.delegates.iter().any(|(f, _)| *f == flow) {
            return Err(F2fStreamError::UnknownFlow(flow));
        }
        self.flow_order.retain(|f| *f != flow);
        self.flow_order.push(flow);
        Ok(())
    }

    /// Bytes `delegate` may write now out of `network_capacity`, in whole
    /// units of `unit` bytes.
    ///
    /// Capacity is split into rounds of one unit per delegate. Every
    /// delegate gets the full rounds; the partial round left over goes to
    /// delegates in flow order, so the head of the line may get one unit
    /// more than the tail.
    pub fn write_capacity(
        &self,
        delegate: &Arc<dyn ChannelDelegate>,
        network_capacity: usize,
        unit: usize,
    ) -> usize {
        let n = self.delegates.len();
        if n == 0 || unit == 0 {
            return 0;
        }
        let mut full_units = network_capacity / (n * unit);
        let priority = self
            .delegates
            .iter()
            .find(|(_, d)| same_delegate(d, delegate))
            .and_then(|(flow, _)| self.flow_order.iter().position(|f| f == flow))
            .unwrap_or(n);

        let remainder =
            network_capacity as i64 - (full_units * n * unit) as i64 - (priority * unit) as i64;
        if remainder >= unit as i64 {
            full_units += 1;
        }
        full_units * unit
    }

    /// `network_capacity` split evenly across all delegates.
    pub fn potential_capacity(&self, network_capacity: usize) -> usize {
        match self.delegates.len() {
            0 => 0,
            n => network_capacity / n,
        }
    }

    /// Delegates in registration order.
    pub fn snapshot(&self) -> Vec<Arc<dyn ChannelDelegate>> {
        self.delegates.iter().map(|(_, d)| Arc::clone(d)).collect()
    }

    /// Delegate owning `flow`, if any.
    pub fn lookup(&self, flow: FlowId) -> Option<Arc<dyn ChannelDelegate>> {
        self.delegates
            .iter()
            .find(|(f, _)| *f == flow)
            .map(|(_, d)| Arc::clone(d))
    }

    pub fn flow_order(&self) -> &[FlowId] {
        &self.flow_order
    }

    pub fn len(&self) -> usize {
        self.delegates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delegates.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Drop every delegate and refuse registrations from now on.
    pub fn clear(&mut self) -> Vec<Arc<dyn ChannelDelegate>> {
        self.closed = true;
        self.flow_order.clear();
        self.delegates.drain(..).map(|(_, d)| d).collect()
    }
}

impl std::fmt::Debug for FlowScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let flows: Vec<FlowId> = self.delegates.iter().map(|(flow, _)| *flow).collect();
        f.debug_struct("FlowScheduler")
            .field("delegates", &flows)
            .field("flow_order", &self.flow_order)
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::ChannelEndpoint;
    use crate::frame::DataMessage;

    struct Stub {
        writes: bool,
    }

    impl ChannelDelegate for Stub {
        fn channel_is_ready(&self, _: &ChannelEndpoint) {}
        fn channel_got_message(&self, _: &ChannelEndpoint, _: &DataMessage) -> bool {
            false
        }
        fn channel_did_close(&self, _: &ChannelEndpoint) {}
        fn queue_capacity(&self, _: &ChannelEndpoint) -> i32 {
            0
        }
        fn writes_messages(&self) -> bool {
            self.writes
        }
    }

    fn stub(writes: bool) -> Arc<dyn ChannelDelegate> {
        Arc::new(Stub { writes })
    }

    #[test]
    fn duplicate_flow_rejected() {
        let mut s = FlowScheduler::new();
        s.register(1, stub(true)).unwrap();
        assert!(matches!(
            s.register(1, stub(true)),
            Err(F2fStreamError::FlowAlreadyRegistered(1))
        ));
    }

    #[test]
    fn cleared_scheduler_refuses_registration() {
        let mut s = FlowScheduler::new();
        let d = stub(true);
        s.register(1, Arc::clone(&d)).unwrap();
        assert!(s.lookup(1).is_some_and(|found| same_delegate(&found, &d)));

        assert_eq!(s.clear().len(), 1);
        assert!(s.is_closed());
        assert!(s.lookup(1).is_none());
        assert!(matches!(s.register(2, stub(true)), Err(F2fStreamError::SchedulerClosed)));
        assert!(s.is_empty());
    }

    #[test]
    fn readers_stay_out_of_flow_order() {
        let mut s = FlowScheduler::new();
        s.register(1, stub(true)).unwrap();
        s.register(2, stub(false)).unwrap();
        assert_eq!(s.flow_order(), &[1]);
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn touch_moves_to_tail() {
        let mut s = FlowScheduler::new();
        for flow in 1..=3 {
            s.register(flow, stub(true)).unwrap();
        }
        s.touch(1).unwrap();
        assert_eq!(s.flow_order(), &[2, 3, 1]);
        assert!(matches!(s.touch(9), Err(F2fStreamError::UnknownFlow(9))));
    }

    #[test]
    fn unregister_is_idempotent() {
        let mut s = FlowScheduler::new();
        let d = stub(true);
        s.register(4, Arc::clone(&d)).unwrap();
        assert_eq!(s.unregister(&d), Some(4));
        assert_eq!(s.unregister(&d), None);
        assert!(s.is_empty());
        assert!(s.flow_order().is_empty());
    }

    #[test]
    fn leftover_units_go_to_head_of_line() {
        let mut s = FlowScheduler::new();
        let a = stub(true);
        let b = stub(true);
        let c = stub(true);
        s.register(1, Arc::clone(&a)).unwrap();
        s.register(2, Arc::clone(&b)).unwrap();
        s.register(3, Arc::clone(&c)).unwrap();

        // One full round plus two spare units.
        let cap = 5 * 1024;
        assert_eq!(s.write_capacity(&a, cap, 1024), 2048);
        assert_eq!(s.write_capacity(&b, cap, 1024), 2048);
        assert_eq!(s.write_capacity(&c, cap, 1024), 1024);

        s.touch(1).unwrap();
        assert_eq!(s.write_capacity(&a, cap, 1024), 1024);
        assert_eq!(s.write_capacity(&c, cap, 1024), 2048);
    }

    #[test]
    fn capacity_without_delegates_is_zero() {
        let s = FlowScheduler::new();
        assert_eq!(s.potential_capacity(10_000), 0);
        assert_eq!(s.write_capacity(&stub(true), 10_000, 1024), 0);
    }

    #[test]
    fn potential_capacity_split_evenly() {
        let mut s = FlowScheduler::new();
        s.register(1, stub(true)).unwrap();
        s.register(2, stub(false)).unwrap();
        assert_eq!(s.potential_capacity(3000), 1500);
    }
}
