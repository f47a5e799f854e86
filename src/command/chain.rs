//! Command chains: sequences of parallel command sets
//!
//! Every command of a set is dispatched at once; the chain moves on to the
//! next set when every command of the current one reported completion. A
//! failing set never stops the chain, its error is only accumulated.

use crate::marshal::{ChainId, Event, Marshal};
use crate::registry::handle::HandleShared;
use crate::registry::EngineHandle;
use devctl_shared::{
    AcmpCommand, AemCommand, AemCommandStatus, CommandKind, ControlStatus, EntityId, StreamIdentification,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Classified outcome of a single chained command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CommandExecutionError {
    #[default]
    NoError,
    /// The engine gave up waiting for the entity
    Timeout,
    /// The entity answered with a failure
    CommandFailure,
}

impl CommandExecutionError {
    pub fn from_aem_status(status: AemCommandStatus) -> Self {
        match status {
            AemCommandStatus::Success => Self::NoError,
            AemCommandStatus::TimedOut => Self::Timeout,
            _ => Self::CommandFailure,
        }
    }

    pub fn from_control_status(status: ControlStatus) -> Self {
        match status {
            ControlStatus::Success => Self::NoError,
            ControlStatus::TimedOut => Self::Timeout,
            _ => Self::CommandFailure,
        }
    }

    pub fn is_error(self) -> bool {
        self != Self::NoError
    }
}

/// Diagnostic record of a failed chained command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandErrorInfo {
    pub entity: EntityId,
    pub error: CommandExecutionError,
    pub command: Option<CommandKind>,
}

/// Dispatch function of a chained command
///
/// Returns false if nothing was submitted, which completes the command
/// right away. Otherwise the command must eventually call
/// [`CommandSetHandle::invoke_command_completed`] with its index.
pub type AsyncCommand = Box<dyn FnOnce(&CommandSetHandle, usize) -> bool + Send + 'static>;

/// Outcome of a command set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetOutcome {
    pub error: bool,
    pub timeouts: usize,
    pub errors: Vec<CommandErrorInfo>,
}

type SetCompletion = Box<dyn FnOnce(SetOutcome) + Send + 'static>;
type SetProgress = Box<dyn Fn() + Send + Sync + 'static>;

/// A batch of commands dispatched in parallel
#[derive(Default)]
pub struct CommandSet {
    commands: Vec<AsyncCommand>,
}

impl CommandSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn append(&mut self, command: impl FnOnce(&CommandSetHandle, usize) -> bool + Send + 'static) -> &mut Self {
        self.commands.push(Box::new(command));
        self
    }

    /// Append an entity command, classified from its status
    pub fn append_aem(&mut self, entity: EntityId, command: AemCommand) -> &mut Self {
        self.append(move |set, index| {
            let Some(handle) = set.engine_handle() else {
                return false;
            };
            let kind = command.kind();
            let set = set.clone();
            handle.send_aem_command(
                entity,
                command,
                Box::new(move |entity, status| {
                    let error = CommandExecutionError::from_aem_status(status);
                    if error.is_error() {
                        set.add_error_info(entity, error, Some(kind));
                    }
                    set.invoke_command_completed(index, error);
                }),
            );
            true
        })
    }

    /// Append a stream connection command, classified from its status
    ///
    /// Errors are attributed to the listener.
    pub fn append_acmp(
        &mut self,
        talker: StreamIdentification,
        listener: StreamIdentification,
        command: AcmpCommand,
    ) -> &mut Self {
        self.append(move |set, index| {
            let Some(handle) = set.engine_handle() else {
                return false;
            };
            let kind = command.kind();
            let set = set.clone();
            handle.send_acmp_command(
                talker,
                listener,
                command,
                Box::new(move |_talker, listener, status| {
                    let error = CommandExecutionError::from_control_status(status);
                    if error.is_error() {
                        set.add_error_info(listener.entity, error, Some(kind));
                    }
                    set.invoke_command_completed(index, error);
                }),
            );
            true
        })
    }

    /// Run the set on its own, `on_complete` fires once every command completed
    pub fn exec(self, handle: &EngineHandle, on_complete: impl FnOnce(SetOutcome) + Send + 'static) {
        self.run(handle.downgrade(), None, Box::new(on_complete));
    }

    fn run(self, handle: Weak<HandleShared>, progress: Option<SetProgress>, on_complete: SetCompletion) {
        let total = self.commands.len();
        let set = CommandSetHandle {
            inner: Arc::new(SetInner {
                handle,
                total,
                progress,
                state: Mutex::new(SetState {
                    reported: vec![false; total],
                    on_complete: Some(on_complete),
                    ..SetState::default()
                }),
            }),
        };

        if total == 0 {
            set.inner.signal();
            return;
        }

        for (index, command) in self.commands.into_iter().enumerate() {
            if !command(&set, index) {
                set.invoke_command_completed(index, CommandExecutionError::NoError);
            }
        }
    }
}

/// A running set, as seen by its commands
#[derive(Clone)]
pub struct CommandSetHandle {
    inner: Arc<SetInner>,
}

struct SetInner {
    handle: Weak<HandleShared>,
    total: usize,
    progress: Option<SetProgress>,
    state: Mutex<SetState>,
}

#[derive(Default)]
struct SetState {
    completed: usize,
    reported: Vec<bool>,
    error: bool,
    timeouts: usize,
    errors: Vec<CommandErrorInfo>,
    on_complete: Option<SetCompletion>,
}

impl CommandSetHandle {
    /// Engine handle the set runs against, if it is still alive
    pub fn engine_handle(&self) -> Option<EngineHandle> {
        self.inner.handle.upgrade().map(EngineHandle::from_shared)
    }

    pub fn add_error_info(&self, entity: EntityId, error: CommandExecutionError, command: Option<CommandKind>) {
        self.inner
            .state
            .lock()
            .errors
            .push(CommandErrorInfo { entity, error, command });
    }

    /// Report the completion of command `index`
    ///
    /// Completions for an index that already reported are ignored.
    pub fn invoke_command_completed(&self, index: usize, error: CommandExecutionError) {
        let done = {
            let mut state = self.inner.state.lock();
            match state.reported.get_mut(index) {
                Some(reported) if !*reported => *reported = true,
                _ => {
                    warn!("Ignoring extra completion for command {} of {}", index, self.inner.total);
                    return;
                }
            }
            state.completed += 1;
            if error.is_error() {
                state.error = true;
            }
            if error == CommandExecutionError::Timeout {
                state.timeouts += 1;
            }
            state.completed == self.inner.total
        };

        if let Some(progress) = &self.inner.progress {
            progress();
        }
        if done {
            self.inner.signal();
        }
    }
}

impl SetInner {
    fn signal(&self) {
        let (on_complete, outcome) = {
            let mut state = self.state.lock();
            let outcome = SetOutcome {
                error: state.error,
                timeouts: state.timeouts,
                errors: std::mem::take(&mut state.errors),
            };
            (state.on_complete.take(), outcome)
        };
        if let Some(on_complete) = on_complete {
            on_complete(outcome);
        }
    }
}

/// An ordered list of command sets
pub struct CommandChain {
    id: ChainId,
    handle: Weak<HandleShared>,
    marshal: Marshal,
    sets: Vec<CommandSet>,
}

struct ChainInner {
    id: ChainId,
    handle: Weak<HandleShared>,
    marshal: Marshal,
    total: usize,
    state: Mutex<ChainState>,
}

struct ChainState {
    pending: VecDeque<CommandSet>,
    current: usize,
    completed: usize,
    error: bool,
    errors: Vec<CommandErrorInfo>,
    /// A caller is inside the dispatch loop of `run_next`
    driving: bool,
    /// The running set completed while `driving` was held
    advance: bool,
}

impl CommandChain {
    pub(crate) fn new(id: ChainId, handle: Weak<HandleShared>, marshal: Marshal) -> Self {
        Self {
            id,
            handle,
            marshal,
            sets: Vec::new(),
        }
    }

    pub fn id(&self) -> ChainId {
        self.id
    }

    /// Append an empty set and return it for filling
    pub fn new_set(&mut self) -> &mut CommandSet {
        self.sets.push(CommandSet::new());
        let last = self.sets.len() - 1;
        &mut self.sets[last]
    }

    pub fn push_set(&mut self, set: CommandSet) {
        self.sets.push(set);
    }

    pub fn set_count(&self) -> usize {
        self.sets.len()
    }

    pub fn command_count(&self) -> usize {
        self.sets.iter().map(CommandSet::len).sum()
    }

    /// Run every set in order
    pub fn exec(self) {
        debug!(chain = %self.id, "Starting chain of {} sets", self.sets.len());
        let chain = Arc::new(ChainInner {
            id: self.id,
            handle: self.handle,
            marshal: self.marshal,
            total: self.sets.iter().map(CommandSet::len).sum(),
            state: Mutex::new(ChainState {
                pending: self.sets.into(),
                current: 0,
                completed: 0,
                error: false,
                errors: Vec::new(),
                driving: false,
                advance: false,
            }),
        });
        chain.run_next();
    }
}

impl ChainInner {
    /// Dispatch sets until one is left running in the background
    ///
    /// Sets that complete before `run` returns are picked up by this loop, so
    /// a long run of synchronous sets does not nest.
    fn run_next(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.driving {
                state.advance = true;
                return;
            }
            state.driving = true;
        }

        loop {
            let (set, index) = {
                let mut state = self.state.lock();
                state.advance = false;
                (state.pending.pop_front(), state.current)
            };

            let Some(set) = set else {
                let (error, errors) = {
                    let mut state = self.state.lock();
                    state.driving = false;
                    (state.error, std::mem::take(&mut state.errors))
                };
                debug!(chain = %self.id, "Chain completed, error={}", error);
                self.marshal.emit(Event::ChainCompleted {
                    chain: self.id,
                    error,
                    errors,
                });
                return;
            };

            let progress: SetProgress = {
                let chain = self.clone();
                Box::new(move || chain.on_command_completed())
            };
            let chain = self.clone();
            set.run(
                self.handle.clone(),
                Some(progress),
                Box::new(move |outcome| chain.on_set_completed(index, outcome)),
            );

            let mut state = self.state.lock();
            if !state.advance {
                state.driving = false;
                return;
            }
        }
    }

    fn on_command_completed(&self) {
        let completed = {
            let mut state = self.state.lock();
            state.completed += 1;
            state.completed
        };
        self.marshal.emit(Event::ChainProgress {
            chain: self.id,
            completed,
            total: self.total,
        });
    }

    fn on_set_completed(self: &Arc<Self>, index: usize, outcome: SetOutcome) {
        if outcome.timeouts > 0 {
            debug!(chain = %self.id, "Set {} had {} timeouts", index, outcome.timeouts);
        }
        {
            let mut state = self.state.lock();
            state.error |= outcome.error;
            state.errors.extend(outcome.errors);
            state.current += 1;
        }
        self.marshal.emit(Event::ChainSetCompleted {
            chain: self.id,
            set: index,
            error: outcome.error,
        });
        self.run_next();
    }
}
