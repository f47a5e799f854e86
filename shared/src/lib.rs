//! devctl Shared Protocol Types
//!
//! This crate provides the protocol-level vocabulary shared by the control
//! core and any engine implementation: entity identifiers, command status
//! codes, command descriptions, entity diagnostics and the counter bookkeeping
//! primitives.

pub mod command;
pub mod counter;
pub mod diagnostics;
pub mod status;

use std::fmt;

pub use command::{AccessType, AcmpCommand, AemCommand, CommandKind, StreamIdentification};
pub use counter::{
    CounterDelta, CounterKey, CounterScope, StatisticsCounterFlag, StreamInputCounterFlag,
    StreamInputCounters,
};
pub use diagnostics::Diagnostics;
pub use status::{AemCommandStatus, ControlStatus, ExecutorError, ExecutorResult};

/// Index of a stream descriptor inside the current configuration
pub type StreamIndex = u16;

/// Generic descriptor index
pub type DescriptorIndex = u16;

/// Index of a configuration descriptor
pub type ConfigurationIndex = u16;

/// Opaque 64-bit identifier of a remote entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntityId(u64);

impl EntityId {
    /// The "no entity" identifier
    pub const NULL: EntityId = EntityId(0);

    /// Wrap a raw 64-bit identifier
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw 64-bit value
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Check if this is the null identifier
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for EntityId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

/// Default values for the control core
pub mod defaults {
    use std::time::Duration;

    /// Automatic discovery delay applied to a freshly installed engine
    pub const DISCOVERY_DELAY: Duration = Duration::from_secs(0);

    /// Simulated engine round-trip for a single command
    pub const SIM_COMMAND_LATENCY: Duration = Duration::from_millis(2);
}
