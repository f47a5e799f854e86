//! Protocol engine abstraction
//!
//! The engine owns the wire protocol, discovery and the entity models. It
//! runs on its own thread(s): every handler passed to it and every observer
//! notification is invoked from there, never from the caller's thread.

use devctl_shared::{
    AccessType, AcmpCommand, AemCommand, AemCommandStatus, ControlStatus, Diagnostics, EntityId,
    StatisticsCounterFlag, StreamIdentification, StreamIndex, StreamInputCounters,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Invoked right before a command is handed to the engine
pub type BeginHandler = Box<dyn FnOnce(EntityId) + Send + 'static>;

/// Invoked exactly once with the outcome of an entity command
pub type AemResultHandler = Box<dyn FnOnce(EntityId, AemCommandStatus) + Send + 'static>;

/// Invoked exactly once with the outcome of a stream connection command
pub type ControlResultHandler =
    Box<dyn FnOnce(StreamIdentification, StreamIdentification, ControlStatus) + Send + 'static>;

/// Invoked exactly once with the outcome of an exclusive access request
pub type ExclusiveAccessHandler =
    Box<dyn FnOnce(EntityId, AemCommandStatus, Option<ExclusiveAccessToken>) + Send + 'static>;

/// Safe-to-read view of a live entity model
pub type ControlledEntityGuard = Arc<dyn ControlledEntity>;

/// Remote exclusive access over one entity
///
/// Dropping the token gives the access back to the entity.
pub struct ExclusiveAccessToken {
    entity: EntityId,
    access: AccessType,
    release: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl ExclusiveAccessToken {
    /// Create a token that runs `release` when dropped
    pub fn new(entity: EntityId, access: AccessType, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            entity,
            access,
            release: Some(Box::new(release)),
        }
    }

    pub fn entity(&self) -> EntityId {
        self.entity
    }

    pub fn access_type(&self) -> AccessType {
        self.access
    }
}

impl Drop for ExclusiveAccessToken {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for ExclusiveAccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExclusiveAccessToken")
            .field("entity", &self.entity)
            .field("access", &self.access)
            .finish()
    }
}

/// Walks the live model of an entity
pub trait EntityModelVisitor {
    /// Called once for the entity node
    fn visit_entity(&mut self, _entity: &dyn ControlledEntity) {}

    /// Called for every stream input of the current configuration
    fn visit_stream_input(
        &mut self,
        _entity: &dyn ControlledEntity,
        _stream: StreamIndex,
        _counters: Option<&StreamInputCounters>,
    ) {
    }
}

/// Live model of an entity, as maintained by the engine
pub trait ControlledEntity: Send + Sync {
    fn entity_id(&self) -> EntityId;

    /// Current value of an engine-side statistics counter
    fn statistics_counter(&self, flag: StatisticsCounterFlag) -> u64;

    /// Connection state of a stream input, `None` if there is no such stream
    fn is_stream_input_connected(&self, stream: StreamIndex) -> Option<bool>;

    /// Latest diagnostics computed by the engine
    fn diagnostics(&self) -> Diagnostics;

    /// Visit the entity model
    fn accept(&self, visitor: &mut dyn EntityModelVisitor);
}

/// Notifications delivered by the engine, from the engine thread(s)
pub trait EngineObserver: Send + Sync {
    fn on_entity_online(&self, _entity: &dyn ControlledEntity) {}

    fn on_entity_offline(&self, _entity: EntityId) {}

    fn on_stream_input_counters_changed(
        &self,
        _entity: &dyn ControlledEntity,
        _stream: StreamIndex,
        _counters: &StreamInputCounters,
    ) {
    }

    fn on_statistics_counter_changed(&self, _entity: EntityId, _flag: StatisticsCounterFlag, _value: u64) {}

    fn on_diagnostics_changed(&self, _entity: &dyn ControlledEntity, _diagnostics: &Diagnostics) {}
}

/// The protocol engine collaborator
pub trait ProtocolEngine: Send + Sync {
    fn register_observer(&self, observer: Arc<dyn EngineObserver>);

    fn unregister_observer(&self, observer: &Arc<dyn EngineObserver>);

    /// Live discovery cadence setting
    fn set_automatic_discovery_delay(&self, delay: Duration);

    fn controlled_entity(&self, entity: EntityId) -> Option<ControlledEntityGuard>;

    fn request_exclusive_access(&self, entity: EntityId, access: AccessType, handler: ExclusiveAccessHandler);

    fn send_aem_command(&self, entity: EntityId, command: AemCommand, handler: AemResultHandler);

    fn send_acmp_command(
        &self,
        talker: StreamIdentification,
        listener: StreamIdentification,
        command: AcmpCommand,
        handler: ControlResultHandler,
    );
}

/// Identity comparison for observer trait objects (data pointer only)
pub fn same_observer(a: &Arc<dyn EngineObserver>, b: &Arc<dyn EngineObserver>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}
