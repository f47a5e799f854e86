//! Engine handle
//!
//! Owns the current protocol engine and the consumer-side view of the
//! entities it manages. Engine notifications arrive on the engine thread and
//! are turned into marshaled units: the table mutation and the event it
//! produces always run together on the consumer thread.

use super::observer::HandleObserver;
use super::tracker::EntityCounterTracker;
use crate::command::queue::QueueInner;
use crate::command::{CommandChain, CommandQueue};
use crate::engine::traits::same_observer;
use crate::engine::{
    AemResultHandler, ControlResultHandler, ControlledEntityGuard, EngineObserver, ExclusiveAccessHandler,
    ProtocolEngine,
};
use crate::marshal::{self, ChainId, ConsumerLoop, Event, Marshal, QueueId};
use devctl_shared::{
    defaults, AccessType, AcmpCommand, AemCommand, AemCommandStatus, ControlStatus, CounterKey, CounterScope,
    EntityId, StreamIdentification, StreamIndex,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Engine handle configuration
#[derive(Debug, Clone)]
pub struct HandleConfig {
    /// Automatic discovery delay, applied to every engine that gets installed
    pub discovery_delay: Duration,
    /// Exclusive access requested by queues that need it
    pub exclusive_access: AccessType,
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self {
            discovery_delay: defaults::DISCOVERY_DELAY,
            exclusive_access: AccessType::Lock,
        }
    }
}

struct Installed {
    engine: Arc<dyn ProtocolEngine>,
    observer: Arc<dyn EngineObserver>,
    /// EngineOnline was emitted for this install
    announced: bool,
}

#[derive(Default)]
pub(crate) struct Tables {
    pub(crate) entities: BTreeSet<EntityId>,
    pub(crate) trackers: HashMap<EntityId, EntityCounterTracker>,
    queues: HashMap<QueueId, Arc<QueueInner>>,
}

pub(crate) struct HandleShared {
    config: Mutex<HandleConfig>,
    engine: RwLock<Option<Installed>>,
    /// Bumped on every install and release; marshaled work from an older
    /// engine is dropped
    generation: AtomicU64,
    tables: Mutex<Tables>,
    marshal: Marshal,
    next_id: AtomicU64,
}

impl HandleShared {
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn marshal(&self) -> &Marshal {
        &self.marshal
    }

    pub(crate) fn tables(&self) -> parking_lot::MutexGuard<'_, Tables> {
        self.tables.lock()
    }

    fn engine(&self) -> Option<Arc<dyn ProtocolEngine>> {
        self.engine.read().as_ref().map(|installed| installed.engine.clone())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Drop for HandleShared {
    fn drop(&mut self) {
        for queue in self.tables.get_mut().queues.values() {
            queue.invalidate();
        }
        if let Some(installed) = self.engine.get_mut().take() {
            installed.engine.unregister_observer(&installed.observer);
        }
    }
}

/// Shared entry point to the control core
///
/// Cloning is cheap; every clone refers to the same engine and tables.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<HandleShared>,
}

impl EngineHandle {
    /// Create a handle and the consumer loop its events are delivered to
    pub fn new(config: HandleConfig) -> (Self, ConsumerLoop) {
        let (marshal, consumer) = marshal::channel();
        let handle = Self {
            shared: Arc::new(HandleShared {
                config: Mutex::new(config),
                engine: RwLock::new(None),
                generation: AtomicU64::new(0),
                tables: Mutex::new(Tables::default()),
                marshal,
                next_id: AtomicU64::new(1),
            }),
        };
        (handle, consumer)
    }

    pub(crate) fn from_shared(shared: Arc<HandleShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn downgrade(&self) -> Weak<HandleShared> {
        Arc::downgrade(&self.shared)
    }

    pub(crate) fn marshal(&self) -> Marshal {
        self.shared.marshal.clone()
    }

    /// Install `engine`, releasing the current one first
    ///
    /// The observer is registered before the install is confirmed. If a
    /// concurrent `set_engine` or `release_engine` took the slot in between,
    /// the registration is rolled back and nothing is announced.
    pub fn set_engine(&self, engine: Arc<dyn ProtocolEngine>) {
        self.release_engine();

        let observer: Arc<dyn EngineObserver> = {
            let mut slot = self.shared.engine.write();
            let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let observer: Arc<dyn EngineObserver> = Arc::new(HandleObserver::new(self.downgrade(), generation));
            *slot = Some(Installed {
                engine: engine.clone(),
                observer: observer.clone(),
                announced: false,
            });
            observer
        };

        engine.register_observer(observer.clone());

        {
            let mut slot = self.shared.engine.write();
            if let Some(installed) = slot
                .as_mut()
                .filter(|installed| same_observer(&installed.observer, &observer))
            {
                engine.set_automatic_discovery_delay(self.shared.config.lock().discovery_delay);
                installed.announced = true;
                info!("Engine online");
                self.shared.marshal.emit(Event::EngineOnline);
                return;
            }
        }

        debug!("Engine replaced while installing, rolling back");
        engine.unregister_observer(&observer);
    }

    /// Release the current engine, if any
    pub fn release_engine(&self) {
        let installed = {
            let mut slot = self.shared.engine.write();
            let installed = slot.take();
            if installed.is_some() {
                self.shared.generation.fetch_add(1, Ordering::SeqCst);
            }
            installed
        };
        let Some(installed) = installed else {
            return;
        };

        installed.engine.unregister_observer(&installed.observer);
        {
            let mut tables = self.shared.tables.lock();
            tables.entities.clear();
            tables.trackers.clear();
        }

        if installed.announced {
            info!("Engine offline");
            self.shared.marshal.emit(Event::EngineOffline);
        }
    }

    pub fn has_engine(&self) -> bool {
        self.shared.engine.read().is_some()
    }

    /// Live model of a known entity
    pub fn entity(&self, id: EntityId) -> Option<ControlledEntityGuard> {
        if !self.shared.tables.lock().entities.contains(&id) {
            return None;
        }
        self.shared.engine()?.controlled_entity(id)
    }

    /// Entities currently known to the consumer
    pub fn known_entities(&self) -> Vec<EntityId> {
        self.shared.tables.lock().entities.iter().copied().collect()
    }

    /// Call `f` for every known entity that still has a live model
    ///
    /// The entity set is snapshotted under the lock and `f` runs outside of
    /// it, so `f` may call back into the handle.
    pub fn foreach_entity(&self, mut f: impl FnMut(EntityId, &ControlledEntityGuard)) {
        let entities: Vec<(EntityId, ControlledEntityGuard)> = {
            let tables = self.shared.tables.lock();
            let Some(engine) = self.shared.engine() else {
                return;
            };
            tables
                .entities
                .iter()
                .filter_map(|id| engine.controlled_entity(*id).map(|entity| (*id, entity)))
                .collect()
        };

        for (id, entity) in &entities {
            f(*id, entity);
        }
    }

    /// Build and start a sequential command queue for `entity`
    ///
    /// Returns `None` if the builder left the queue invalid, in which case
    /// it is discarded without running.
    pub fn create_command_queue(
        &self,
        entity: EntityId,
        requires_exclusive_access: bool,
        builder: impl FnOnce(&mut CommandQueue),
    ) -> Option<QueueId> {
        let id = QueueId(self.shared.next_id());
        let mut queue = CommandQueue::new(id, entity, requires_exclusive_access, self.downgrade(), self.marshal());
        builder(&mut queue);

        if !queue.is_valid() {
            debug!(entity = %entity, "Discarding empty command queue");
            return None;
        }

        let inner = queue.into_inner();
        let handle = self.downgrade();
        inner.set_completion_handler(Box::new(move |id| {
            if let Some(shared) = handle.upgrade() {
                shared.tables.lock().queues.remove(&id);
            }
        }));
        self.shared.tables.lock().queues.insert(id, inner.clone());

        debug!(queue = %id, entity = %entity, "Starting command queue");
        inner.start();
        Some(id)
    }

    pub fn active_queue_count(&self) -> usize {
        self.shared.tables.lock().queues.len()
    }

    /// Create an empty command chain
    pub fn create_command_chain(&self) -> CommandChain {
        CommandChain::new(ChainId(self.shared.next_id()), self.downgrade(), self.marshal())
    }

    /// Pending deltas of one counter scope of `entity`
    pub fn counter_deltas(&self, entity: EntityId, scope: CounterScope) -> BTreeMap<CounterKey, u64> {
        self.shared
            .tables
            .lock()
            .trackers
            .get(&entity)
            .map(|tracker| tracker.deltas(scope))
            .unwrap_or_default()
    }

    /// Pending deltas of every counter of `entity`
    pub fn all_counter_deltas(&self, entity: EntityId) -> BTreeMap<CounterKey, u64> {
        self.shared
            .tables
            .lock()
            .trackers
            .get(&entity)
            .map(EntityCounterTracker::all_deltas)
            .unwrap_or_default()
    }

    /// Whether a stream input of `entity` is currently over latency
    ///
    /// False for unknown entities and streams that never reported.
    pub fn stream_input_latency_error(&self, entity: EntityId, stream: StreamIndex) -> bool {
        self.shared
            .tables
            .lock()
            .trackers
            .get(&entity)
            .is_some_and(|tracker| tracker.latency_error(stream))
    }

    /// Acknowledge one counter of `entity`, notifying the new deltas of its scope
    pub fn clear_counter(&self, entity: EntityId, key: CounterKey) {
        let deltas = {
            let mut tables = self.shared.tables.lock();
            let Some(tracker) = tables.trackers.get_mut(&entity) else {
                return;
            };
            if !tracker.clear_counter(&key) {
                return;
            }
            tracker.deltas(key.scope())
        };

        self.shared.marshal.emit(Event::CounterDeltaChanged {
            entity,
            scope: key.scope(),
            deltas,
        });
    }

    /// Acknowledge every counter of `entity`
    pub fn clear_all_counters(&self, entity: EntityId) {
        let Some(live) = self.entity(entity) else {
            return;
        };
        let scopes = {
            let mut tables = self.shared.tables.lock();
            let Some(tracker) = tables.trackers.get_mut(&entity) else {
                return;
            };
            tracker.clear_all(live.as_ref())
        };

        for scope in scopes {
            self.shared.marshal.emit(Event::CounterDeltaChanged {
                entity,
                scope,
                deltas: BTreeMap::new(),
            });
        }
    }

    /// Forwarded live to the installed engine and kept for future ones
    pub fn set_automatic_discovery_delay(&self, delay: Duration) {
        self.shared.config.lock().discovery_delay = delay;
        if let Some(engine) = self.shared.engine() {
            engine.set_automatic_discovery_delay(delay);
        }
    }

    pub fn exclusive_access_type(&self) -> AccessType {
        self.shared.config.lock().exclusive_access
    }

    /// Without an engine the handler is told the entity is unknown
    pub fn request_exclusive_access(&self, entity: EntityId, access: AccessType, handler: ExclusiveAccessHandler) {
        match self.shared.engine() {
            Some(engine) => engine.request_exclusive_access(entity, access, handler),
            None => handler(entity, AemCommandStatus::UnknownEntity, None),
        }
    }

    /// Without an engine the handler is told the entity is unknown
    pub fn send_aem_command(&self, entity: EntityId, command: AemCommand, handler: AemResultHandler) {
        match self.shared.engine() {
            Some(engine) => engine.send_aem_command(entity, command, handler),
            None => {
                warn!(entity = %entity, "No engine for {}", command.kind());
                handler(entity, AemCommandStatus::UnknownEntity);
            }
        }
    }

    pub fn send_acmp_command(
        &self,
        talker: StreamIdentification,
        listener: StreamIdentification,
        command: AcmpCommand,
        handler: ControlResultHandler,
    ) {
        match self.shared.engine() {
            Some(engine) => engine.send_acmp_command(talker, listener, command, handler),
            None => {
                warn!(entity = %listener.entity, "No engine for {}", command.kind());
                handler(talker, listener, ControlStatus::UnknownEntity);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{SimConfig, SimEntity, SimulatedEngine};
    use devctl_shared::{StatisticsCounterFlag, StreamInputCounterFlag, StreamInputCounters};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    async fn next(events: &mut ConsumerLoop) -> Event {
        timeout(WAIT, events.recv()).await.unwrap().unwrap()
    }

    async fn wait_for(events: &mut ConsumerLoop, expected: Event) -> Vec<Event> {
        let mut seen = Vec::new();
        loop {
            let event = next(events).await;
            let done = event == expected;
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    fn stream_counters(interrupted: u32, unlocked: u32) -> StreamInputCounters {
        let mut counters = StreamInputCounters::new();
        counters.insert(StreamInputCounterFlag::StreamInterrupted, interrupted);
        counters.insert(StreamInputCounterFlag::MediaUnlocked, unlocked);
        counters
    }

    fn interrupted() -> CounterKey {
        CounterKey::StreamInput {
            stream: 0,
            flag: StreamInputCounterFlag::StreamInterrupted,
        }
    }

    fn unlocked() -> CounterKey {
        CounterKey::StreamInput {
            stream: 0,
            flag: StreamInputCounterFlag::MediaUnlocked,
        }
    }

    #[tokio::test]
    async fn test_engine_lifecycle_events() {
        let (handle, mut events) = EngineHandle::new(HandleConfig::default());

        // Nothing installed yet
        handle.release_engine();

        let engine = SimulatedEngine::new(SimConfig::default());
        handle.set_engine(engine.clone());
        assert!(handle.has_engine());
        assert_eq!(engine.observer_count(), 1);
        assert_eq!(engine.discovery_delay(), Some(defaults::DISCOVERY_DELAY));

        handle.release_engine();
        handle.release_engine();
        assert!(!handle.has_engine());
        assert_eq!(engine.observer_count(), 0);

        assert_eq!(events.drain(), vec![Event::EngineOnline, Event::EngineOffline]);
    }

    #[tokio::test]
    async fn test_swap_releases_previous_engine() {
        let (handle, mut events) = EngineHandle::new(HandleConfig::default());
        let first = SimulatedEngine::new(SimConfig::default());
        let second = SimulatedEngine::new(SimConfig::default());

        handle.set_engine(first.clone());
        handle.set_engine(second.clone());
        assert_eq!(first.observer_count(), 0);
        assert_eq!(second.observer_count(), 1);

        assert_eq!(
            events.drain(),
            vec![Event::EngineOnline, Event::EngineOffline, Event::EngineOnline]
        );
    }

    /// Delegates to a simulated engine and runs a hook from inside
    /// `register_observer`, the window where a concurrent caller can swap
    /// the engine out
    struct HookedEngine {
        inner: Arc<SimulatedEngine>,
        on_register: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl HookedEngine {
        fn new(on_register: impl FnOnce() + Send + 'static) -> Arc<Self> {
            Arc::new(Self {
                inner: SimulatedEngine::new(SimConfig::default()),
                on_register: Mutex::new(Some(Box::new(on_register))),
            })
        }
    }

    impl ProtocolEngine for HookedEngine {
        fn register_observer(&self, observer: Arc<dyn EngineObserver>) {
            self.inner.register_observer(observer);
            let hook = self.on_register.lock().take();
            if let Some(hook) = hook {
                hook();
            }
        }

        fn unregister_observer(&self, observer: &Arc<dyn EngineObserver>) {
            self.inner.unregister_observer(observer);
        }

        fn set_automatic_discovery_delay(&self, delay: Duration) {
            self.inner.set_automatic_discovery_delay(delay);
        }

        fn controlled_entity(&self, entity: EntityId) -> Option<ControlledEntityGuard> {
            self.inner.controlled_entity(entity)
        }

        fn request_exclusive_access(&self, entity: EntityId, access: AccessType, handler: ExclusiveAccessHandler) {
            self.inner.request_exclusive_access(entity, access, handler);
        }

        fn send_aem_command(&self, entity: EntityId, command: AemCommand, handler: AemResultHandler) {
            self.inner.send_aem_command(entity, command, handler);
        }

        fn send_acmp_command(
            &self,
            talker: StreamIdentification,
            listener: StreamIdentification,
            command: AcmpCommand,
            handler: ControlResultHandler,
        ) {
            self.inner.send_acmp_command(talker, listener, command, handler);
        }
    }

    #[tokio::test]
    async fn test_release_during_install_rolls_back() {
        let (handle, mut events) = EngineHandle::new(HandleConfig::default());
        let releaser = handle.clone();
        let engine = HookedEngine::new(move || releaser.release_engine());

        handle.set_engine(engine.clone());
        assert!(!handle.has_engine());
        assert_eq!(engine.inner.observer_count(), 0);
        assert_eq!(engine.inner.discovery_delay(), None);
        // Never announced, so no offline either
        assert!(events.drain().is_empty());
    }

    #[tokio::test]
    async fn test_swap_during_install_keeps_winner() {
        let (handle, mut events) = EngineHandle::new(HandleConfig::default());
        let winner = SimulatedEngine::new(SimConfig::default());
        let swapper = handle.clone();
        let installed = winner.clone();
        let loser = HookedEngine::new(move || swapper.set_engine(installed));

        handle.set_engine(loser.clone());
        assert_eq!(loser.inner.observer_count(), 0);
        assert_eq!(loser.inner.discovery_delay(), None);
        assert_eq!(winner.observer_count(), 1);
        assert_eq!(winner.discovery_delay(), Some(defaults::DISCOVERY_DELAY));
        assert_eq!(events.drain(), vec![Event::EngineOnline]);

        handle.release_engine();
        assert_eq!(events.drain(), vec![Event::EngineOffline]);
    }

    #[tokio::test]
    async fn test_discovery_delay_is_buffered() {
        let (handle, _events) = EngineHandle::new(HandleConfig::default());
        handle.set_automatic_discovery_delay(Duration::from_secs(3));

        let engine = SimulatedEngine::new(SimConfig::default());
        handle.set_engine(engine.clone());
        assert_eq!(engine.discovery_delay(), Some(Duration::from_secs(3)));

        handle.set_automatic_discovery_delay(Duration::from_secs(7));
        assert_eq!(engine.discovery_delay(), Some(Duration::from_secs(7)));
    }

    #[tokio::test]
    async fn test_entity_online_offline() {
        let (handle, mut events) = EngineHandle::new(HandleConfig::default());
        let engine = SimulatedEngine::new(SimConfig::default());
        handle.set_engine(engine.clone());
        let id = EntityId::new(0x42);

        engine.add_entity(SimEntity::new(id).with_statistics(StatisticsCounterFlag::AecpTimeouts, 2));
        wait_for(&mut events, Event::EntityOnline(id)).await;
        assert_eq!(handle.known_entities(), vec![id]);
        assert!(handle.entity(id).is_some());

        let mut expected = BTreeMap::new();
        expected.insert(CounterKey::Statistics(StatisticsCounterFlag::AecpTimeouts), 2);
        assert_eq!(handle.counter_deltas(id, CounterScope::Statistics), expected);

        engine.remove_entity(id).unwrap();
        wait_for(&mut events, Event::EntityOffline(id)).await;
        assert!(handle.known_entities().is_empty());
        assert!(handle.entity(id).is_none());
        assert!(handle.all_counter_deltas(id).is_empty());
    }

    #[tokio::test]
    async fn test_per_entity_event_order() {
        let (handle, mut events) = EngineHandle::new(HandleConfig::default());
        let engine = SimulatedEngine::new(SimConfig::default());
        handle.set_engine(engine.clone());
        let a = EntityId::new(1);
        let b = EntityId::new(2);

        for _ in 0..3 {
            engine.add_entity(SimEntity::new(a));
            engine.add_entity(SimEntity::new(b));
            engine.remove_entity(b).unwrap();
            engine.remove_entity(a).unwrap();
        }

        let mut per_entity: HashMap<EntityId, Vec<Event>> = HashMap::new();
        let mut remaining = 12;
        while remaining > 0 {
            let event = next(&mut events).await;
            if let Some(entity) = event.entity() {
                per_entity.entry(entity).or_default().push(event);
                remaining -= 1;
            }
        }
        for id in [a, b] {
            let expected: Vec<Event> = (0..3)
                .flat_map(|_| [Event::EntityOnline(id), Event::EntityOffline(id)])
                .collect();
            assert_eq!(per_entity[&id], expected);
        }
    }

    #[tokio::test]
    async fn test_stream_counters_filtered_and_tracked() {
        let (handle, mut events) = EngineHandle::new(HandleConfig::default());
        let engine = SimulatedEngine::new(SimConfig::default());
        handle.set_engine(engine.clone());
        let id = EntityId::new(7);
        engine.add_entity(SimEntity::new(id).with_stream_input(0, false, stream_counters(10, 4)));
        wait_for(&mut events, Event::EntityOnline(id)).await;

        // Not connected: media unlocked is ignored
        let mut update = stream_counters(10, 9);
        update.insert(StreamInputCounterFlag::FramesRx, 1_000);
        engine.update_stream_input_counters(id, 0, update).unwrap();

        engine.update_stream_input_counters(id, 0, stream_counters(13, 9)).unwrap();
        let seen = wait_for(
            &mut events,
            Event::CounterDeltaChanged {
                entity: id,
                scope: CounterScope::StreamInput(0),
                deltas: [(interrupted(), 3)].into_iter().collect(),
            },
        )
        .await;
        assert_eq!(seen.len(), 1);

        engine.set_stream_input_connected(id, 0, true).unwrap();
        engine.update_stream_input_counters(id, 0, stream_counters(13, 11)).unwrap();
        wait_for(
            &mut events,
            Event::CounterDeltaChanged {
                entity: id,
                scope: CounterScope::StreamInput(0),
                deltas: [(interrupted(), 3), (unlocked(), 7)].into_iter().collect(),
            },
        )
        .await;
    }

    #[tokio::test]
    async fn test_stream_input_latency_errors() {
        let (handle, mut events) = EngineHandle::new(HandleConfig::default());
        let engine = SimulatedEngine::new(SimConfig::default());
        handle.set_engine(engine.clone());
        let id = EntityId::new(9);
        engine.add_entity(
            SimEntity::new(id)
                .with_stream_input(0, true, stream_counters(0, 0))
                .with_stream_input(1, true, stream_counters(0, 0))
                .with_stream_input_latency_error(0, true),
        );
        wait_for(&mut events, Event::EntityOnline(id)).await;
        assert!(handle.stream_input_latency_error(id, 0));
        assert!(!handle.stream_input_latency_error(id, 1));

        // Stream 0 unchanged, only stream 1 is notified
        engine.update_stream_input_latency_error(id, 1, true).unwrap();
        assert_eq!(
            next(&mut events).await,
            Event::StreamInputLatencyErrorChanged {
                entity: id,
                stream: 1,
                error: true,
            }
        );

        // Same state again, nothing to notify
        engine.update_stream_input_latency_error(id, 1, true).unwrap();
        engine.update_stream_input_latency_error(id, 0, false).unwrap();
        assert_eq!(
            next(&mut events).await,
            Event::StreamInputLatencyErrorChanged {
                entity: id,
                stream: 0,
                error: false,
            }
        );
        assert!(!handle.stream_input_latency_error(id, 0));
        assert!(handle.stream_input_latency_error(id, 1));

        engine.remove_entity(id).unwrap();
        wait_for(&mut events, Event::EntityOffline(id)).await;
        assert!(!handle.stream_input_latency_error(id, 1));
    }

    #[tokio::test]
    async fn test_clear_counters() {
        let (handle, mut events) = EngineHandle::new(HandleConfig::default());
        let engine = SimulatedEngine::new(SimConfig::default());
        handle.set_engine(engine.clone());
        let id = EntityId::new(8);
        let retries = CounterKey::Statistics(StatisticsCounterFlag::AecpRetries);
        engine.add_entity(
            SimEntity::new(id)
                .with_statistics(StatisticsCounterFlag::AecpRetries, 5)
                .with_stream_input(0, true, stream_counters(0, 0)),
        );
        wait_for(&mut events, Event::EntityOnline(id)).await;

        handle.clear_counter(id, retries);
        assert_eq!(
            next(&mut events).await,
            Event::CounterDeltaChanged {
                entity: id,
                scope: CounterScope::Statistics,
                deltas: BTreeMap::new(),
            }
        );

        // Nothing pending, nothing notified
        handle.clear_counter(id, retries);
        assert!(events.drain().is_empty());

        // Entity reset its counter
        engine
            .update_statistics_counter(id, StatisticsCounterFlag::AecpRetries, 3)
            .unwrap();
        assert_eq!(
            next(&mut events).await,
            Event::CounterDeltaChanged {
                entity: id,
                scope: CounterScope::Statistics,
                deltas: [(retries, 3)].into_iter().collect(),
            }
        );

        engine.update_stream_input_counters(id, 0, stream_counters(2, 0)).unwrap();
        next(&mut events).await;
        assert_eq!(handle.all_counter_deltas(id).len(), 2);

        handle.clear_all_counters(id);
        let cleared = events.drain();
        assert_eq!(cleared.len(), 2);
        assert!(cleared
            .iter()
            .all(|e| matches!(e, Event::CounterDeltaChanged { deltas, .. } if deltas.is_empty())));
        assert!(handle.all_counter_deltas(id).is_empty());
    }

    #[tokio::test]
    async fn test_stale_notifications_are_dropped() {
        let (handle, mut events) = EngineHandle::new(HandleConfig::default());
        let engine = SimulatedEngine::new(SimConfig::default());
        handle.set_engine(engine.clone());
        let id = EntityId::new(5);

        engine.add_entity(SimEntity::new(id));
        // Let the engine deliver the notification without consuming it
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.release_engine();

        let events = events.drain();
        assert_eq!(events, vec![Event::EngineOnline, Event::EngineOffline]);
        assert!(handle.known_entities().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_foreach_entity_races_with_offline() {
        let (handle, mut events) = EngineHandle::new(HandleConfig::default());
        let engine = SimulatedEngine::new(SimConfig::default());
        handle.set_engine(engine.clone());
        let ids: Vec<EntityId> = (1..=16).map(EntityId::new).collect();
        for id in &ids {
            engine.add_entity(SimEntity::new(*id));
        }
        let mut online = 0;
        while online < ids.len() {
            if matches!(next(&mut events).await, Event::EntityOnline(_)) {
                online += 1;
            }
        }

        let remover = {
            let engine = engine.clone();
            let ids = ids.clone();
            tokio::spawn(async move {
                for id in ids.iter().step_by(2) {
                    engine.remove_entity(*id).unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        for _ in 0..50 {
            let mut visited = Vec::new();
            handle.foreach_entity(|id, entity| {
                assert_eq!(entity.entity_id(), id);
                // Re-entering the handle from the callback must not deadlock
                let _ = handle.known_entities();
                visited.push(id);
            });
            let mut sorted = visited.clone();
            sorted.sort();
            sorted.dedup();
            assert_eq!(sorted, visited);
            events.drain();
            tokio::task::yield_now().await;
        }
        remover.await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_invalidates_active_queues() {
        let (handle, mut events) = EngineHandle::new(HandleConfig::default());
        let engine = SimulatedEngine::new(SimConfig::default());
        let id = EntityId::new(3);
        engine.add_entity(SimEntity::new(id));
        handle.set_engine(engine.clone());

        handle.create_command_queue(id, false, |queue| {
            queue.add_aem_command(AemCommand::LockEntity);
            queue.add_aem_command(AemCommand::UnlockEntity);
        });
        drop(handle);
        assert_eq!(engine.observer_count(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = events.drain();
        assert!(!events.iter().any(|e| matches!(e, Event::QueueCompleted { .. })));
        assert!(engine.executed_commands().len() <= 1);
    }
}
