//! devctl control core
//!
//! Issues commands to remote entities through a protocol engine and reflects
//! the engine's asynchronous notifications onto a single consumer thread.
//!
//! - `engine`: the protocol engine seam and a simulated engine
//! - `marshal`: consumer-thread marshaling and the events it delivers
//! - `command`: sequential command queues and parallel command chains
//! - `registry`: the engine handle and per-entity counter tracking

pub mod command;
pub mod engine;
pub mod marshal;
pub mod registry;

pub use command::{CommandChain, CommandExecutionError, CommandQueue, CommandSet};
pub use engine::{ProtocolEngine, SimConfig, SimEntity, SimulatedEngine};
pub use marshal::{ConsumerLoop, Event};
pub use registry::{EngineHandle, EntityCounterTracker, HandleConfig};
