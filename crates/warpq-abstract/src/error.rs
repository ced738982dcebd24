use thiserror::Error;

use crate::event::AgentId;
use crate::time::Time;

/// Failures surfaced by the queue family. None of these are recoverable
/// inside the queue; callers are expected to abort with the diagnostic.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueueError {
    #[error("agent {0} is not registered with this event queue")]
    UnknownAgent(AgentId),

    #[error("anti-message scheduled for delivery to agent {receiver} at {receive_time}")]
    AntiMessageDelivery { receiver: AgentId, receive_time: Time },

    #[error(
        "agent {receiver} scheduled to process an event at {receive_time}, \
         at or below its LVT of {lvt}"
    )]
    CausalityViolation {
        receiver: AgentId,
        receive_time: Time,
        lvt: Time,
    },

    #[error("structural invariant violated: {0}")]
    InvariantViolation(String),
}
