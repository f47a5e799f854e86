//! Engine notifications, marshaled onto the consumer thread

use super::handle::HandleShared;
use super::tracker::EntityCounterTracker;
use crate::engine::{ControlledEntity, EngineObserver};
use crate::marshal::{Event, Outbox};
use devctl_shared::{
    CounterKey, CounterScope, Diagnostics, EntityId, StatisticsCounterFlag, StreamIndex, StreamInputCounterFlag,
    StreamInputCounters,
};
use std::sync::Weak;
use tracing::{debug, trace};

/// Observer registered by the engine handle on the engine it installs
///
/// Anything that needs the live engine runs right away on the engine
/// thread. The table update and its event are then marshaled as one unit,
/// tagged with the generation of the install so that notifications from a
/// released engine are dropped.
pub(crate) struct HandleObserver {
    handle: Weak<HandleShared>,
    generation: u64,
}

impl HandleObserver {
    pub(crate) fn new(handle: Weak<HandleShared>, generation: u64) -> Self {
        Self { handle, generation }
    }

    fn marshal(&self, task: impl FnOnce(&HandleShared, &mut Outbox) + Send + 'static) {
        let Some(shared) = self.handle.upgrade() else {
            return;
        };
        let handle = self.handle.clone();
        let generation = self.generation;
        shared.marshal().invoke(move |out| {
            let Some(shared) = handle.upgrade() else {
                return;
            };
            if shared.generation() != generation {
                trace!("Dropping notification from a released engine");
                return;
            }
            task(shared.as_ref(), out);
        });
    }
}

/// Error flags worth tracking for a stream input
///
/// Media unlocked only counts while the stream is connected.
fn error_counters(connected: bool, counters: &StreamInputCounters) -> Vec<(StreamInputCounterFlag, u64)> {
    counters
        .iter()
        .filter(|(flag, _)| flag.is_error())
        .filter(|(flag, _)| connected || **flag != StreamInputCounterFlag::MediaUnlocked)
        .map(|(flag, value)| (*flag, u64::from(*value)))
        .collect()
}

fn update_counters(
    shared: &HandleShared,
    out: &mut Outbox,
    entity: EntityId,
    scope: CounterScope,
    updates: impl IntoIterator<Item = (CounterKey, u64)>,
) {
    let deltas = {
        let mut tables = shared.tables();
        let Some(tracker) = tables.trackers.get_mut(&entity) else {
            return;
        };
        let mut changed = false;
        for (key, value) in updates {
            changed |= tracker.set_counter(key, value);
        }
        if !changed {
            return;
        }
        tracker.deltas(scope)
    };
    out.emit(Event::CounterDeltaChanged { entity, scope, deltas });
}

impl EngineObserver for HandleObserver {
    fn on_entity_online(&self, entity: &dyn ControlledEntity) {
        let id = entity.entity_id();
        let tracker = EntityCounterTracker::from_snapshot(entity);
        debug!(entity = %id, "Entity online");

        self.marshal(move |shared, out| {
            {
                let mut tables = shared.tables();
                tables.entities.insert(id);
                tables.trackers.insert(id, tracker);
            }
            out.emit(Event::EntityOnline(id));
        });
    }

    fn on_entity_offline(&self, id: EntityId) {
        debug!(entity = %id, "Entity offline");

        self.marshal(move |shared, out| {
            let known = {
                let mut tables = shared.tables();
                tables.trackers.remove(&id);
                tables.entities.remove(&id)
            };
            if known {
                out.emit(Event::EntityOffline(id));
            }
        });
    }

    fn on_stream_input_counters_changed(
        &self,
        entity: &dyn ControlledEntity,
        stream: StreamIndex,
        counters: &StreamInputCounters,
    ) {
        let id = entity.entity_id();
        let connected = entity.is_stream_input_connected(stream).unwrap_or(false);
        let updates: Vec<(CounterKey, u64)> = error_counters(connected, counters)
            .into_iter()
            .map(|(flag, value)| (CounterKey::StreamInput { stream, flag }, value))
            .collect();
        if updates.is_empty() {
            return;
        }

        self.marshal(move |shared, out| {
            update_counters(shared, out, id, CounterScope::StreamInput(stream), updates);
        });
    }

    fn on_statistics_counter_changed(&self, id: EntityId, flag: StatisticsCounterFlag, value: u64) {
        self.marshal(move |shared, out| {
            update_counters(shared, out, id, CounterScope::Statistics, [(CounterKey::Statistics(flag), value)]);
        });
    }

    fn on_diagnostics_changed(&self, entity: &dyn ControlledEntity, diagnostics: &Diagnostics) {
        let id = entity.entity_id();
        let latency = diagnostics.stream_input_over_latency.clone();

        self.marshal(move |shared, out| {
            let changed: Vec<(StreamIndex, bool)> = {
                let mut tables = shared.tables();
                let Some(tracker) = tables.trackers.get_mut(&id) else {
                    return;
                };
                latency
                    .into_iter()
                    .filter(|(stream, error)| tracker.set_latency_error(*stream, *error))
                    .collect()
            };
            for (stream, error) in changed {
                out.emit(Event::StreamInputLatencyErrorChanged {
                    entity: id,
                    stream,
                    error,
                });
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_counters_filter() {
        let mut counters = StreamInputCounters::new();
        counters.insert(StreamInputCounterFlag::MediaLocked, 1);
        counters.insert(StreamInputCounterFlag::MediaUnlocked, 2);
        counters.insert(StreamInputCounterFlag::SeqNumMismatch, 3);
        counters.insert(StreamInputCounterFlag::FramesRx, 4);

        assert_eq!(
            error_counters(false, &counters),
            vec![(StreamInputCounterFlag::SeqNumMismatch, 3)]
        );
        assert_eq!(
            error_counters(true, &counters),
            vec![
                (StreamInputCounterFlag::MediaUnlocked, 2),
                (StreamInputCounterFlag::SeqNumMismatch, 3)
            ]
        );
    }
}
