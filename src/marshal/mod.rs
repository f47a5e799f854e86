//! Consumer-thread marshaling and the events it carries

pub mod consumer;
pub mod event;

pub use consumer::{channel, ConsumerLoop, Marshal, Outbox};
pub use event::{ChainId, Event, QueueId};
