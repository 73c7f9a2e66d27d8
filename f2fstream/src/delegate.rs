//! The capability a sub-flow offers to the channel it rides on.

use crate::endpoint::ChannelEndpoint;
use crate::frame::DataMessage;

/// A logical sub-flow sharing a channel.
///
/// Callbacks are invoked without any endpoint lock held, so an
/// implementation may call back into the endpoint (`write`,
/// `get_write_capacity`, `unregister_delegate`) from inside them.
pub trait ChannelDelegate: Send + Sync {
    /// The channel can accept writes. Called once per readiness edge.
    fn channel_is_ready(&self, endpoint: &ChannelEndpoint);

    /// Offer an inbound message. Return `true` if this delegate consumed it.
    fn channel_got_message(&self, endpoint: &ChannelEndpoint, message: &DataMessage) -> bool;

    /// The channel, or this delegate's flow on it, is gone.
    fn channel_did_close(&self, endpoint: &ChannelEndpoint);

    /// Receive window to advertise to the peer after a consumed message.
    fn queue_capacity(&self, endpoint: &ChannelEndpoint) -> i32;

    /// Whether this sub-flow sends data and so takes part in fair
    /// scheduling.
    fn writes_messages(&self) -> bool;
}
