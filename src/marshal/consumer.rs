//! Marshaling onto the consumer thread
//!
//! Engine-thread code never touches consumer state directly. It posts either
//! a plain event or a task through a [`Marshal`]; the single [`ConsumerLoop`]
//! runs tasks and yields events in the order they were posted. A task
//! performs its state mutation and emits its events as one unit.

use super::event::Event;
use futures::Stream;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::trace;

/// Events emitted by a task running on the consumer thread
#[derive(Debug, Default)]
pub struct Outbox {
    events: Vec<Event>,
}

impl Outbox {
    pub fn emit(&mut self, event: Event) {
        self.events.push(event);
    }
}

type Task = Box<dyn FnOnce(&mut Outbox) + Send + 'static>;

enum Message {
    Event(Event),
    Task(Task),
}

/// Create a connected marshal / consumer pair
pub fn channel() -> (Marshal, ConsumerLoop) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Marshal { tx },
        ConsumerLoop {
            rx,
            pending: VecDeque::new(),
        },
    )
}

/// Posts work to the consumer thread, from any thread
#[derive(Clone)]
pub struct Marshal {
    tx: mpsc::UnboundedSender<Message>,
}

impl Marshal {
    /// Run `task` on the consumer thread
    pub fn invoke(&self, task: impl FnOnce(&mut Outbox) + Send + 'static) {
        if self.tx.send(Message::Task(Box::new(task))).is_err() {
            trace!("Consumer gone, dropping task");
        }
    }

    /// Deliver `event` to the consumer
    pub fn emit(&self, event: Event) {
        if self.tx.send(Message::Event(event)).is_err() {
            trace!("Consumer gone, dropping event");
        }
    }
}

/// The consumer side: runs marshaled tasks and yields events
///
/// Ends once every [`Marshal`] has been dropped and the backlog is drained.
pub struct ConsumerLoop {
    rx: mpsc::UnboundedReceiver<Message>,
    pending: VecDeque<Event>,
}

impl ConsumerLoop {
    /// Wait for the next event, running marshaled tasks along the way
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            let message = self.rx.recv().await?;
            if let Some(event) = self.dispatch(message) {
                return Some(event);
            }
        }
    }

    /// Next event if one is ready, without waiting
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            let message = self.rx.try_recv().ok()?;
            if let Some(event) = self.dispatch(message) {
                return Some(event);
            }
        }
    }

    /// Run every task and collect every event that is ready right now
    pub fn drain(&mut self) -> Vec<Event> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    fn dispatch(&mut self, message: Message) -> Option<Event> {
        match message {
            Message::Event(event) => Some(event),
            Message::Task(task) => {
                let mut outbox = Outbox::default();
                task(&mut outbox);
                self.pending.extend(outbox.events);
                self.pending.pop_front()
            }
        }
    }
}

impl Stream for ConsumerLoop {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        let this = self.get_mut();
        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(event));
            }
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(message)) => {
                    if let Some(event) = this.dispatch(message) {
                        return Poll::Ready(Some(event));
                    }
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
