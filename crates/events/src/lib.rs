//! Committed-mutation events and the ingress contract between the write path
//! and downstream consumers.

pub mod envelope;
pub mod event;
pub mod listener;

pub use envelope::{EnvelopeError, EventEnvelope};
pub use event::Event;
pub use listener::CommitListener;
