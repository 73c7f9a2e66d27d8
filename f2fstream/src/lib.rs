//! f2fstream -- paced, reliable multiplexed service channels for a
//! friend-to-friend overlay.
//!
//! Two layers share each peer link:
//! - **Pacing**: a token bucket per channel meters datagrams onto the link,
//!   sizing its backlog from observed throughput and the peer's window.
//! - **Reliability**: a channel endpoint tracks every message until it is
//!   acknowledged, retransmits on a latency-derived timer, and shares the
//!   channel fairly among its sub-flows.

pub mod buffer;
pub mod delegate;
pub mod endpoint;
pub mod error;
pub mod flow;
pub mod frame;
pub mod limiter;
pub mod limiter_group;
pub mod link;
pub mod rate;
pub mod readiness;
pub mod retransmit;
pub mod rtt;
pub mod scheduler;
pub mod send_queue;
pub mod sequence;

// Re-export key public types at crate root.
pub use buffer::{BufferPool, PooledBuffer};
pub use delegate::ChannelDelegate;
pub use endpoint::{ChannelEndpoint, EndpointConfig, EndpointState};
pub use error::{F2fStreamError, Result};
pub use flow::FlowScheduler;
pub use frame::{ControlFlags, DataMessage, Frame};
pub use limiter::{LimiterConfig, TokenBucketLimiter};
pub use limiter_group::LimiterGroup;
pub use link::{NetworkLink, PacedLink};
pub use readiness::ReadyEvent;
pub use rtt::LatencyEstimator;
pub use scheduler::{Scheduler, TimerHandle, TokioScheduler};
pub use send_queue::{OutboundDatagram, SendQueue};
pub use sequence::{FlowId, SequenceNumber, SequenceTracker};
