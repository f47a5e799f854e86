//! Engine handle, entity tables and counter tracking

pub(crate) mod handle;
mod observer;
pub mod tracker;

pub use handle::{EngineHandle, HandleConfig};
pub use tracker::EntityCounterTracker;
