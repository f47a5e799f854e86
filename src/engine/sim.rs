//! Simulated Protocol Engine
//!
//! An in-process engine with scripted entities. All commands and
//! notifications are executed in order by a single background task, which
//! plays the role of the engine's network thread.

use super::traits::{
    same_observer, AemResultHandler, ControlResultHandler, ControlledEntity, ControlledEntityGuard,
    EngineObserver, EntityModelVisitor, ExclusiveAccessHandler, ExclusiveAccessToken, ProtocolEngine,
};
use anyhow::{anyhow, Result};
use devctl_shared::{
    defaults, AccessType, AcmpCommand, AemCommand, AemCommandStatus, CommandKind, ControlStatus, Diagnostics,
    EntityId,
    StatisticsCounterFlag, StreamIdentification, StreamIndex, StreamInputCounters,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Configuration for the simulated engine
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Time the engine takes to answer a command
    pub command_latency: Duration,
    /// Exclusive access answer for entities that were not scripted
    pub exclusive_access: AemCommandStatus,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            command_latency: defaults::SIM_COMMAND_LATENCY,
            exclusive_access: AemCommandStatus::Success,
        }
    }
}

enum Work {
    /// Answer to a command, delayed by the command latency
    Command(Box<dyn FnOnce() + Send>),
    /// Observer notification, delivered immediately
    Notify(Box<dyn FnOnce() + Send>),
}

#[derive(Debug, Clone, Default)]
struct SimStreamInput {
    connected: bool,
    counters: StreamInputCounters,
}

#[derive(Debug, Default)]
struct SimEntityState {
    statistics: BTreeMap<StatisticsCounterFlag, u64>,
    stream_inputs: BTreeMap<StreamIndex, SimStreamInput>,
    diagnostics: Diagnostics,
    aem_responses: HashMap<CommandKind, VecDeque<AemCommandStatus>>,
    control_responses: HashMap<CommandKind, VecDeque<ControlStatus>>,
    exclusive_access: Option<AemCommandStatus>,
}

/// A scripted remote entity
pub struct SimEntity {
    id: EntityId,
    state: Mutex<SimEntityState>,
}

impl SimEntity {
    /// Create an entity with no streams and all statistics at zero
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            state: Mutex::new(SimEntityState::default()),
        }
    }

    /// Add a stream input with initial counter values
    pub fn with_stream_input(self, stream: StreamIndex, connected: bool, counters: StreamInputCounters) -> Self {
        self.state
            .lock()
            .stream_inputs
            .insert(stream, SimStreamInput { connected, counters });
        self
    }

    /// Set the initial value of a statistics counter
    pub fn with_statistics(self, flag: StatisticsCounterFlag, value: u64) -> Self {
        self.state.lock().statistics.insert(flag, value);
        self
    }

    /// Flag a stream input as over latency from the start
    pub fn with_stream_input_latency_error(self, stream: StreamIndex, error: bool) -> Self {
        self.state
            .lock()
            .diagnostics
            .stream_input_over_latency
            .insert(stream, error);
        self
    }

    fn next_aem_response(&self, kind: CommandKind) -> AemCommandStatus {
        self.state
            .lock()
            .aem_responses
            .get_mut(&kind)
            .and_then(|responses| responses.pop_front())
            .unwrap_or(AemCommandStatus::Success)
    }

    fn next_control_response(&self, kind: CommandKind) -> ControlStatus {
        self.state
            .lock()
            .control_responses
            .get_mut(&kind)
            .and_then(|responses| responses.pop_front())
            .unwrap_or(ControlStatus::Success)
    }
}

impl ControlledEntity for SimEntity {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn statistics_counter(&self, flag: StatisticsCounterFlag) -> u64 {
        self.state.lock().statistics.get(&flag).copied().unwrap_or(0)
    }

    fn is_stream_input_connected(&self, stream: StreamIndex) -> Option<bool> {
        self.state.lock().stream_inputs.get(&stream).map(|s| s.connected)
    }

    fn diagnostics(&self) -> Diagnostics {
        self.state.lock().diagnostics.clone()
    }

    fn accept(&self, visitor: &mut dyn EntityModelVisitor) {
        // Copy the model out so the visitor may call back into this entity
        let streams: Vec<(StreamIndex, StreamInputCounters)> = self
            .state
            .lock()
            .stream_inputs
            .iter()
            .map(|(index, stream)| (*index, stream.counters.clone()))
            .collect();

        visitor.visit_entity(self);
        for (index, counters) in &streams {
            visitor.visit_stream_input(self, *index, Some(counters));
        }
    }
}

struct SimShared {
    config: SimConfig,
    entities: Mutex<HashMap<EntityId, Arc<SimEntity>>>,
    observers: Mutex<Vec<Arc<dyn EngineObserver>>>,
    discovery_delay: Mutex<Option<Duration>>,
    executed: Mutex<Vec<(EntityId, CommandKind)>>,
    tokens_granted: AtomicUsize,
    tokens_released: AtomicUsize,
}

impl SimShared {
    fn entity(&self, id: EntityId) -> Option<Arc<SimEntity>> {
        self.entities.lock().get(&id).cloned()
    }

    fn observers(&self) -> Vec<Arc<dyn EngineObserver>> {
        self.observers.lock().clone()
    }
}

/// In-process protocol engine
pub struct SimulatedEngine {
    shared: Arc<SimShared>,
    work_tx: mpsc::UnboundedSender<Work>,
}

impl SimulatedEngine {
    /// Create a new engine and start its engine task
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: SimConfig) -> Arc<Self> {
        let (work_tx, work_rx) = mpsc::unbounded_channel::<Work>();
        let latency = config.command_latency;

        let shared = Arc::new(SimShared {
            config,
            entities: Mutex::new(HashMap::new()),
            observers: Mutex::new(Vec::new()),
            discovery_delay: Mutex::new(None),
            executed: Mutex::new(Vec::new()),
            tokens_granted: AtomicUsize::new(0),
            tokens_released: AtomicUsize::new(0),
        });

        tokio::spawn(async move {
            engine_loop(work_rx, latency).await;
        });

        Arc::new(Self { shared, work_tx })
    }

    fn post(&self, work: Work) {
        if self.work_tx.send(work).is_err() {
            debug!("[SIM] Engine task stopped, dropping work");
        }
    }

    /// Deliver a notification to the observers registered right now
    fn notify(&self, f: impl Fn(&dyn EngineObserver) + Send + 'static) {
        let observers = self.shared.observers();
        if observers.is_empty() {
            return;
        }
        self.post(Work::Notify(Box::new(move || {
            for observer in &observers {
                f(observer.as_ref());
            }
        })));
    }

    /// Bring an entity online
    pub fn add_entity(&self, entity: SimEntity) -> Arc<SimEntity> {
        let entity = Arc::new(entity);
        self.shared.entities.lock().insert(entity.id, entity.clone());

        let online = entity.clone();
        self.notify(move |observer| observer.on_entity_online(online.as_ref()));
        entity
    }

    /// Take an entity offline
    pub fn remove_entity(&self, id: EntityId) -> Result<()> {
        self.shared
            .entities
            .lock()
            .remove(&id)
            .ok_or_else(|| anyhow!("Entity not found: {}", id))?;

        self.notify(move |observer| observer.on_entity_offline(id));
        Ok(())
    }

    /// Update some counters of a stream input and notify observers
    pub fn update_stream_input_counters(
        &self,
        id: EntityId,
        stream: StreamIndex,
        counters: StreamInputCounters,
    ) -> Result<()> {
        let entity = self.shared.entity(id).ok_or_else(|| anyhow!("Entity not found: {}", id))?;
        {
            let mut state = entity.state.lock();
            let input = state
                .stream_inputs
                .get_mut(&stream)
                .ok_or_else(|| anyhow!("Stream input {} not found on {}", stream, id))?;
            input.counters.extend(counters.iter().map(|(flag, value)| (*flag, *value)));
        }

        self.notify(move |observer| observer.on_stream_input_counters_changed(entity.as_ref(), stream, &counters));
        Ok(())
    }

    /// Set a statistics counter and notify observers
    pub fn update_statistics_counter(&self, id: EntityId, flag: StatisticsCounterFlag, value: u64) -> Result<()> {
        let entity = self.shared.entity(id).ok_or_else(|| anyhow!("Entity not found: {}", id))?;
        entity.state.lock().statistics.insert(flag, value);

        self.notify(move |observer| observer.on_statistics_counter_changed(id, flag, value));
        Ok(())
    }

    /// Flag or unflag a stream input as over latency and notify observers
    ///
    /// Observers receive the full diagnostics of the entity, like any
    /// engine-side recomputation would report them.
    pub fn update_stream_input_latency_error(&self, id: EntityId, stream: StreamIndex, error: bool) -> Result<()> {
        let entity = self.shared.entity(id).ok_or_else(|| anyhow!("Entity not found: {}", id))?;
        let diagnostics = {
            let mut state = entity.state.lock();
            state.diagnostics.stream_input_over_latency.insert(stream, error);
            state.diagnostics.clone()
        };

        self.notify(move |observer| observer.on_diagnostics_changed(entity.as_ref(), &diagnostics));
        Ok(())
    }

    /// Change the connection state of a stream input
    pub fn set_stream_input_connected(&self, id: EntityId, stream: StreamIndex, connected: bool) -> Result<()> {
        let entity = self.shared.entity(id).ok_or_else(|| anyhow!("Entity not found: {}", id))?;
        let mut state = entity.state.lock();
        let input = state
            .stream_inputs
            .get_mut(&stream)
            .ok_or_else(|| anyhow!("Stream input {} not found on {}", stream, id))?;
        input.connected = connected;
        Ok(())
    }

    /// Queue a one-shot answer for the next command of `kind` sent to `id`
    pub fn script_aem_status(&self, id: EntityId, kind: CommandKind, status: AemCommandStatus) -> Result<()> {
        let entity = self.shared.entity(id).ok_or_else(|| anyhow!("Entity not found: {}", id))?;
        entity
            .state
            .lock()
            .aem_responses
            .entry(kind)
            .or_default()
            .push_back(status);
        Ok(())
    }

    /// Queue a one-shot answer for the next connection command of `kind`
    /// targeting a stream of listener `id`
    pub fn script_control_status(&self, id: EntityId, kind: CommandKind, status: ControlStatus) -> Result<()> {
        let entity = self.shared.entity(id).ok_or_else(|| anyhow!("Entity not found: {}", id))?;
        entity
            .state
            .lock()
            .control_responses
            .entry(kind)
            .or_default()
            .push_back(status);
        Ok(())
    }

    /// Answer every exclusive access request to `id` with `status`
    pub fn set_exclusive_access_status(&self, id: EntityId, status: AemCommandStatus) -> Result<()> {
        let entity = self.shared.entity(id).ok_or_else(|| anyhow!("Entity not found: {}", id))?;
        entity.state.lock().exclusive_access = Some(status);
        Ok(())
    }

    /// Commands executed so far, in execution order
    pub fn executed_commands(&self) -> Vec<(EntityId, CommandKind)> {
        self.shared.executed.lock().clone()
    }

    pub fn tokens_granted(&self) -> usize {
        self.shared.tokens_granted.load(Ordering::SeqCst)
    }

    pub fn tokens_released(&self) -> usize {
        self.shared.tokens_released.load(Ordering::SeqCst)
    }

    pub fn observer_count(&self) -> usize {
        self.shared.observers.lock().len()
    }

    pub fn discovery_delay(&self) -> Option<Duration> {
        *self.shared.discovery_delay.lock()
    }
}

impl ProtocolEngine for SimulatedEngine {
    fn register_observer(&self, observer: Arc<dyn EngineObserver>) {
        self.shared.observers.lock().push(observer.clone());

        // Replay entities that were already online
        let online: Vec<Arc<SimEntity>> = self.shared.entities.lock().values().cloned().collect();
        if online.is_empty() {
            return;
        }
        self.post(Work::Notify(Box::new(move || {
            for entity in &online {
                observer.on_entity_online(entity.as_ref());
            }
        })));
    }

    fn unregister_observer(&self, observer: &Arc<dyn EngineObserver>) {
        self.shared
            .observers
            .lock()
            .retain(|registered| !same_observer(registered, observer));
    }

    fn set_automatic_discovery_delay(&self, delay: Duration) {
        *self.shared.discovery_delay.lock() = Some(delay);
    }

    fn controlled_entity(&self, entity: EntityId) -> Option<ControlledEntityGuard> {
        self.shared
            .entity(entity)
            .map(|entity| entity as ControlledEntityGuard)
    }

    fn request_exclusive_access(&self, entity: EntityId, access: AccessType, handler: ExclusiveAccessHandler) {
        let shared = self.shared.clone();
        self.post(Work::Command(Box::new(move || {
            let Some(target) = shared.entity(entity) else {
                handler(entity, AemCommandStatus::UnknownEntity, None);
                return;
            };

            let status = target
                .state
                .lock()
                .exclusive_access
                .unwrap_or(shared.config.exclusive_access);
            if !status.is_success() {
                handler(entity, status, None);
                return;
            }

            shared.tokens_granted.fetch_add(1, Ordering::SeqCst);
            let weak: Weak<SimShared> = Arc::downgrade(&shared);
            let token = ExclusiveAccessToken::new(entity, access, move || {
                if let Some(shared) = weak.upgrade() {
                    shared.tokens_released.fetch_add(1, Ordering::SeqCst);
                }
            });
            trace!("[SIM] Granted {:?} on {}", access, entity);
            handler(entity, AemCommandStatus::Success, Some(token));
        })));
    }

    fn send_aem_command(&self, entity: EntityId, command: AemCommand, handler: AemResultHandler) {
        let shared = self.shared.clone();
        self.post(Work::Command(Box::new(move || {
            let kind = command.kind();
            let Some(target) = shared.entity(entity) else {
                handler(entity, AemCommandStatus::UnknownEntity);
                return;
            };

            let status = target.next_aem_response(kind);
            shared.executed.lock().push((entity, kind));
            trace!("[SIM] {} on {} -> {}", kind, entity, status);
            handler(entity, status);
        })));
    }

    fn send_acmp_command(
        &self,
        talker: StreamIdentification,
        listener: StreamIdentification,
        command: AcmpCommand,
        handler: ControlResultHandler,
    ) {
        let shared = self.shared.clone();
        self.post(Work::Command(Box::new(move || {
            let kind = command.kind();
            let Some(target) = shared.entity(listener.entity) else {
                handler(talker, listener, ControlStatus::UnknownEntity);
                return;
            };
            if shared.entity(talker.entity).is_none() {
                handler(talker, listener, ControlStatus::TalkerUnknownId);
                return;
            }

            let status = target.next_control_response(kind);
            shared.executed.lock().push((listener.entity, kind));

            if status.is_success() {
                let mut state = target.state.lock();
                if let Some(input) = state.stream_inputs.get_mut(&listener.stream) {
                    input.connected = command == AcmpCommand::ConnectStream;
                }
            }
            handler(talker, listener, status);
        })));
    }
}

/// The engine thread
async fn engine_loop(mut work_rx: mpsc::UnboundedReceiver<Work>, latency: Duration) {
    while let Some(work) = work_rx.recv().await {
        match work {
            Work::Command(answer) => {
                if !latency.is_zero() {
                    tokio::time::sleep(latency).await;
                }
                answer();
            }
            Work::Notify(notify) => notify(),
        }
    }
    debug!("[SIM] Engine task stopped");
}
