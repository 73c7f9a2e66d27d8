use thiserror::Error;

use crate::sequence::FlowId;

/// All errors produced by the f2fstream channel layer.
#[derive(Debug, Error)]
pub enum F2fStreamError {
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort { expected: usize, actual: usize },

    #[error("unknown frame type: 0x{0:02x}")]
    UnknownFrameType(u8),

    #[error("payload too large: {size} bytes exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("flow {0} is not registered on this channel")]
    UnknownFlow(FlowId),

    #[error("flow {0} already has a delegate")]
    FlowAlreadyRegistered(FlowId),

    #[error("flow scheduler is closed")]
    SchedulerClosed,

    #[error("channel {0} is closed")]
    EndpointClosed(u32),

    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },
}

pub type Result<T> = std::result::Result<T, F2fStreamError>;
