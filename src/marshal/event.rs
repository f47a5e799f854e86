//! Consumer-visible events

use crate::command::CommandErrorInfo;
use devctl_shared::{CounterKey, CounterScope, EntityId, ExecutorResult, StreamIndex};
use std::collections::BTreeMap;
use std::fmt;

/// Identifies a command queue for the lifetime of its engine handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueId(pub u64);

/// Identifies a command chain for the lifetime of its engine handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChainId(pub u64);

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue#{}", self.0)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chain#{}", self.0)
    }
}

/// Events delivered to the consumer, in the order they were marshaled
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// An engine was installed
    EngineOnline,
    /// The installed engine was released
    EngineOffline,
    /// An entity became known
    EntityOnline(EntityId),
    /// An entity went away
    EntityOffline(EntityId),
    /// Pending deltas of one counter scope changed
    ///
    /// An empty map means every counter of the scope was cleared.
    CounterDeltaChanged {
        entity: EntityId,
        scope: CounterScope,
        deltas: BTreeMap<CounterKey, u64>,
    },
    /// A stream input entered or left the over-latency state
    StreamInputLatencyErrorChanged {
        entity: EntityId,
        stream: StreamIndex,
        error: bool,
    },
    /// A queue is about to run command `current` of `total` (1-based)
    QueueProgress {
        queue: QueueId,
        entity: EntityId,
        current: usize,
        total: usize,
    },
    /// A queue finished
    QueueCompleted {
        queue: QueueId,
        entity: EntityId,
        result: ExecutorResult,
    },
    /// Every command of a chain's set reported completion
    ChainSetCompleted { chain: ChainId, set: usize, error: bool },
    /// Commands completed so far across the whole chain
    ChainProgress { chain: ChainId, completed: usize, total: usize },
    /// The last set of a chain completed
    ChainCompleted {
        chain: ChainId,
        error: bool,
        errors: Vec<CommandErrorInfo>,
    },
}

impl Event {
    /// Entity this event is about, if any
    pub fn entity(&self) -> Option<EntityId> {
        match self {
            Event::EntityOnline(id) | Event::EntityOffline(id) => Some(*id),
            Event::CounterDeltaChanged { entity, .. }
            | Event::StreamInputLatencyErrorChanged { entity, .. }
            | Event::QueueProgress { entity, .. }
            | Event::QueueCompleted { entity, .. } => Some(*entity),
            _ => None,
        }
    }
}
