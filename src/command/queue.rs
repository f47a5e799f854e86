//! Sequential per-entity command queue
//!
//! A queue runs its commands strictly one after the other against a single
//! entity, optionally under a remote exclusive access token. The next
//! command is only dispatched once the engine reported the result of the
//! previous one, and the first failure terminates the queue.

use crate::engine::{AemResultHandler, BeginHandler, ExclusiveAccessToken};
use crate::marshal::{Event, Marshal, QueueId};
use crate::registry::handle::HandleShared;
use crate::registry::EngineHandle;
use devctl_shared::{AemCommand, AemCommandStatus, EntityId, ExecutorError, ExecutorResult};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// A deferred engine operation
///
/// Must eventually invoke the result handler exactly once.
pub type Command = Box<dyn FnOnce(&EngineHandle, EntityId, BeginHandler, AemResultHandler) + Send + 'static>;

/// Called on the consumer thread once the queue finished
pub(crate) type CompletionHandler = Box<dyn FnOnce(QueueId) + Send + 'static>;

/// Builder-side view of a queue, handed to the closure passed to
/// [`EngineHandle::create_command_queue`]
pub struct CommandQueue {
    inner: Arc<QueueInner>,
}

pub(crate) struct QueueInner {
    id: QueueId,
    entity: EntityId,
    exclusive: bool,
    marshal: Marshal,
    /// `None` once invalidated
    handle: Mutex<Option<Weak<HandleShared>>>,
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    commands: Vec<Option<Command>>,
    next: usize,
    token: Option<ExclusiveAccessToken>,
    completion: Option<CompletionHandler>,
    started: bool,
    finished: bool,
    /// A caller is inside the dispatch loop of `process_next`
    dispatching: bool,
    /// A success arrived while `dispatching` was held
    result_ready: bool,
}

impl CommandQueue {
    pub(crate) fn new(id: QueueId, entity: EntityId, exclusive: bool, handle: Weak<HandleShared>, marshal: Marshal) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                id,
                entity,
                exclusive,
                marshal,
                handle: Mutex::new(Some(handle)),
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    pub fn id(&self) -> QueueId {
        self.inner.id
    }

    pub fn entity_id(&self) -> EntityId {
        self.inner.entity
    }

    pub fn requires_exclusive_access(&self) -> bool {
        self.inner.exclusive
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a deferred engine operation
    ///
    /// The operation receives a no-op begin handler and a result handler
    /// that feeds the outcome back into this queue.
    pub fn add_command<F>(&mut self, command: F)
    where
        F: FnOnce(&EngineHandle, EntityId, BeginHandler, AemResultHandler) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        debug_assert!(!state.started, "Command added to a started queue");
        state.commands.push(Some(Box::new(command)));
    }

    /// Remove every command added so far
    pub fn clear(&mut self) {
        let mut state = self.inner.state.lock();
        debug_assert!(!state.started, "Started queue cleared");
        state.commands.clear();
    }

    /// Append an entity command
    pub fn add_aem_command(&mut self, command: AemCommand) {
        self.add_command(move |handle, entity, begin, result| {
            begin(entity);
            handle.send_aem_command(entity, command, result);
        });
    }

    /// Bound to a live engine handle, targets a real entity, and has work
    pub fn is_valid(&self) -> bool {
        self.inner.handle().is_some() && !self.inner.entity.is_null() && !self.is_empty()
    }

    pub(crate) fn into_inner(self) -> Arc<QueueInner> {
        self.inner
    }
}

impl QueueInner {
    fn handle(&self) -> Option<EngineHandle> {
        self.handle
            .lock()
            .as_ref()
            .and_then(Weak::upgrade)
            .map(EngineHandle::from_shared)
    }

    fn is_invalidated(&self) -> bool {
        self.handle.lock().is_none()
    }

    pub(crate) fn set_completion_handler(&self, completion: CompletionHandler) {
        self.state.lock().completion = Some(completion);
    }

    /// Begin execution, requesting exclusive access first if needed
    pub(crate) fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.started || state.commands.is_empty() {
                return;
            }
            state.started = true;
        }

        if !self.exclusive {
            self.process_next();
            return;
        }

        let Some(handle) = self.handle() else {
            self.finish(Err(ExecutorError::Aborted));
            return;
        };

        let queue = Arc::downgrade(self);
        handle.request_exclusive_access(
            self.entity,
            handle.exclusive_access_type(),
            Box::new(move |_entity, status, token| {
                if let Some(queue) = queue.upgrade() {
                    queue.on_exclusive_access(status, token);
                }
            }),
        );
    }

    fn on_exclusive_access(self: &Arc<Self>, status: AemCommandStatus, token: Option<ExclusiveAccessToken>) {
        if self.is_invalidated() {
            return;
        }

        match status {
            AemCommandStatus::Success => {
                self.state.lock().token = token;
                self.process_next();
            }
            AemCommandStatus::NotImplemented | AemCommandStatus::NotSupported => {
                debug!(queue = %self.id, entity = %self.entity, "Exclusive access {}, proceeding without it", status);
                self.process_next();
            }
            AemCommandStatus::UnknownEntity => self.finish(Err(ExecutorError::UnknownEntity)),
            status => self.finish(Err(ExecutorError::ProtocolError(status))),
        }
    }

    /// Run commands until one is left waiting on its result
    ///
    /// Results delivered before the command returns are picked up by this
    /// loop instead of nesting another dispatch.
    fn process_next(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.dispatching {
                state.result_ready = true;
                return;
            }
            state.dispatching = true;
        }

        loop {
            let dispatched = self.dispatch_next();
            let mut state = self.state.lock();
            if dispatched && state.result_ready && !state.finished {
                state.result_ready = false;
                continue;
            }
            state.dispatching = false;
            state.result_ready = false;
            return;
        }
    }

    /// Dispatch the command under the cursor, or finish if there is none
    ///
    /// Returns false when nothing was handed to the engine.
    fn dispatch_next(self: &Arc<Self>) -> bool {
        let (index, total, command) = {
            let mut state = self.state.lock();
            if state.finished {
                return false;
            }
            let total = state.commands.len();
            if state.next >= total {
                drop(state);
                self.finish(Ok(()));
                return false;
            }
            let index = state.next;
            state.next += 1;
            (index, total, state.commands[index].take())
        };

        self.marshal.emit(Event::QueueProgress {
            queue: self.id,
            entity: self.entity,
            current: index + 1,
            total,
        });

        let Some(command) = command else {
            self.finish(Err(ExecutorError::InternalError));
            return false;
        };

        let Some(handle) = self.handle() else {
            if !self.is_invalidated() {
                self.finish(Err(ExecutorError::Aborted));
            }
            return false;
        };

        trace!(queue = %self.id, entity = %self.entity, "Dispatching command {}/{}", index + 1, total);

        let queue = Arc::downgrade(self);
        let result: AemResultHandler = Box::new(move |entity, status| {
            if let Some(queue) = queue.upgrade() {
                queue.process_result(entity, status);
            }
        });
        command(&handle, self.entity, Box::new(|_| {}), result);
        true
    }

    /// Re-entry point for engine results, callable from any thread
    pub(crate) fn process_result(self: &Arc<Self>, entity: EntityId, status: AemCommandStatus) {
        if self.is_invalidated() || self.state.lock().finished {
            return;
        }
        debug_assert_eq!(entity, self.entity, "Result for another entity");

        if status.is_success() {
            self.process_next();
        } else {
            debug!(queue = %self.id, entity = %self.entity, "Command failed: {}", status);
            self.finish(Err(ExecutorError::ProtocolError(status)));
        }
    }

    /// Release the token, report the outcome and notify the owner, once
    fn finish(&self, result: ExecutorResult) {
        let (token, completion, had_commands) = {
            let mut state = self.state.lock();
            if state.finished {
                warn!(queue = %self.id, "Queue finished twice");
                return;
            }
            state.finished = true;
            (state.token.take(), state.completion.take(), !state.commands.is_empty())
        };

        drop(token);

        if had_commands {
            self.marshal.emit(Event::QueueCompleted {
                queue: self.id,
                entity: self.entity,
                result,
            });
        }

        if let Some(completion) = completion {
            let id = self.id;
            self.marshal.invoke(move |_| completion(id));
        }
    }

    /// Detach from the engine handle, late results become no-ops
    pub(crate) fn invalidate(&self) {
        *self.handle.lock() = None;
        let mut state = self.state.lock();
        state.completion = None;
        state.token = None;
    }
}
