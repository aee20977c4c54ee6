//! Relay core: who is online, how frames reach them, and how a stored
//! message moves through its delivery statuses.

pub mod registry;
pub mod relay;
pub mod sweeper;
pub mod writer;

pub use registry::ConnectionRegistry;
pub use relay::{
    RejectReason, Relay, RelayError, RelayOptions, SubmitMessage, SubmitOutcome,
    TransitionOutcome,
};
pub use sweeper::{spawn_expiry_sweeper, sweep_expired};
pub use writer::{ConnectionWriter, Frame, Transport, WriteError, WriterConfig};

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
