//! Per-entity delta counter and latency error tracking

use crate::engine::{ControlledEntity, EntityModelVisitor};
use devctl_shared::{CounterDelta, CounterKey, CounterScope, StatisticsCounterFlag, StreamIndex, StreamInputCounters};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

const STATISTICS_FLAGS: [StatisticsCounterFlag; 3] = [
    StatisticsCounterFlag::AecpRetries,
    StatisticsCounterFlag::AecpTimeouts,
    StatisticsCounterFlag::AecpUnexpectedResponses,
];

/// Tracks every counter of one entity as a [`CounterDelta`], along with
/// the over-latency state of its stream inputs
#[derive(Debug, Clone, Default)]
pub struct EntityCounterTracker {
    counters: BTreeMap<CounterKey, CounterDelta>,
    latency_errors: BTreeMap<StreamIndex, bool>,
}

/// How baselines are taken from a live entity model
enum SnapshotMode {
    /// Statistics from zero, stream inputs from their current value
    Init,
    /// Everything acknowledged at its current value
    Clear,
}

/// Reads counter values out of a live entity model
struct SnapshotVisitor<'a> {
    tracker: &'a mut EntityCounterTracker,
    mode: SnapshotMode,
    scopes: BTreeSet<CounterScope>,
}

impl EntityModelVisitor for SnapshotVisitor<'_> {
    fn visit_entity(&mut self, entity: &dyn ControlledEntity) {
        for flag in STATISTICS_FLAGS {
            let value = entity.statistics_counter(flag);
            let baseline = match self.mode {
                SnapshotMode::Init => 0,
                SnapshotMode::Clear => value,
            };
            self.tracker
                .insert(CounterKey::Statistics(flag), CounterDelta::new(value, baseline));
        }
        self.scopes.insert(CounterScope::Statistics);
    }

    fn visit_stream_input(
        &mut self,
        _entity: &dyn ControlledEntity,
        stream: StreamIndex,
        counters: Option<&StreamInputCounters>,
    ) {
        let Some(counters) = counters else {
            return;
        };
        for (flag, value) in counters {
            let value = u64::from(*value);
            self.tracker
                .insert(CounterKey::StreamInput { stream, flag: *flag }, CounterDelta::new(value, value));
        }
        self.scopes.insert(CounterScope::StreamInput(stream));
    }
}

impl EntityCounterTracker {
    /// Build a tracker from the live model of an entity
    ///
    /// Statistics counters start with a zero baseline so errors seen during
    /// enumeration are visible right away. Stream input counters start at
    /// the value the entity reports, hiding history from before discovery.
    pub fn from_snapshot(entity: &dyn ControlledEntity) -> Self {
        let mut tracker = Self::default();
        let mut visitor = SnapshotVisitor {
            tracker: &mut tracker,
            mode: SnapshotMode::Init,
            scopes: BTreeSet::new(),
        };
        entity.accept(&mut visitor);
        tracker.latency_errors = entity.diagnostics().stream_input_over_latency;
        tracker
    }

    pub fn insert(&mut self, key: CounterKey, counter: CounterDelta) {
        self.counters.insert(key, counter);
    }

    pub fn get(&self, key: &CounterKey) -> Option<CounterDelta> {
        self.counters.get(key).copied()
    }

    /// Store a new raw value, returns true if the consumer should be notified
    ///
    /// Keys seen for the first time start from a zero baseline.
    pub fn set_counter(&mut self, key: CounterKey, value: u64) -> bool {
        self.counters.entry(key).or_default().set(value)
    }

    /// Acknowledge the pending delta of `key`, returns true if there was one
    ///
    /// Clearing a counter that is not tracked is a caller bug: it asserts in
    /// debug builds and is a logged no-op otherwise.
    pub fn clear_counter(&mut self, key: &CounterKey) -> bool {
        self.try_clear_counter(key).unwrap_or_else(|| {
            debug_assert!(false, "Clearing untracked counter {}", key);
            warn!("Clearing untracked counter {}", key);
            false
        })
    }

    /// `None` if `key` is not tracked
    fn try_clear_counter(&mut self, key: &CounterKey) -> Option<bool> {
        self.counters.get_mut(key).map(CounterDelta::clear)
    }

    /// Over-latency state of a stream input, false if never reported
    pub fn latency_error(&self, stream: StreamIndex) -> bool {
        self.latency_errors.get(&stream).copied().unwrap_or(false)
    }

    /// Store the over-latency state of a stream input, returns true if it changed
    pub fn set_latency_error(&mut self, stream: StreamIndex, error: bool) -> bool {
        let current = self.latency_errors.entry(stream).or_default();
        let changed = *current != error;
        *current = error;
        changed
    }

    /// Pending deltas of one scope, keys without a delta are omitted
    pub fn deltas(&self, scope: CounterScope) -> BTreeMap<CounterKey, u64> {
        self.counters
            .iter()
            .filter(|(key, _)| key.scope() == scope)
            .filter_map(|(key, counter)| counter.delta().map(|delta| (*key, delta)))
            .collect()
    }

    /// Pending deltas of every scope
    pub fn all_deltas(&self) -> BTreeMap<CounterKey, u64> {
        self.counters
            .iter()
            .filter_map(|(key, counter)| counter.delta().map(|delta| (*key, delta)))
            .collect()
    }

    /// Every scope that has at least one tracked counter
    pub fn scopes(&self) -> BTreeSet<CounterScope> {
        self.counters.keys().map(CounterKey::scope).collect()
    }

    /// Refresh from the live model and acknowledge everything
    ///
    /// Returns every scope that was cleared, so an empty delta map can be
    /// notified for each of them.
    pub fn clear_all(&mut self, entity: &dyn ControlledEntity) -> Vec<CounterScope> {
        let mut visitor = SnapshotVisitor {
            tracker: self,
            mode: SnapshotMode::Clear,
            scopes: BTreeSet::new(),
        };
        entity.accept(&mut visitor);
        let mut scopes = visitor.scopes;

        for (key, counter) in self.counters.iter_mut() {
            counter.clear();
            scopes.insert(key.scope());
        }
        scopes.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SimEntity;
    use devctl_shared::{EntityId, StreamInputCounterFlag};

    fn retries() -> CounterKey {
        CounterKey::Statistics(StatisticsCounterFlag::AecpRetries)
    }

    fn interrupted(stream: StreamIndex) -> CounterKey {
        CounterKey::StreamInput {
            stream,
            flag: StreamInputCounterFlag::StreamInterrupted,
        }
    }

    fn entity() -> SimEntity {
        let mut counters = StreamInputCounters::new();
        counters.insert(StreamInputCounterFlag::StreamInterrupted, 12);
        counters.insert(StreamInputCounterFlag::SeqNumMismatch, 0);
        SimEntity::new(EntityId::new(1))
            .with_statistics(StatisticsCounterFlag::AecpRetries, 5)
            .with_stream_input(0, true, counters)
    }

    #[test]
    fn test_snapshot_baselines() {
        let tracker = EntityCounterTracker::from_snapshot(&entity());

        assert_eq!(tracker.get(&retries()), Some(CounterDelta::new(5, 0)));
        assert_eq!(tracker.get(&interrupted(0)), Some(CounterDelta::new(12, 12)));

        let mut expected = BTreeMap::new();
        expected.insert(retries(), 5);
        assert_eq!(tracker.all_deltas(), expected);
        assert!(tracker.deltas(CounterScope::StreamInput(0)).is_empty());
    }

    #[test]
    fn test_clear_and_reset_scenario() {
        let mut tracker = EntityCounterTracker::from_snapshot(&entity());
        assert_eq!(tracker.deltas(CounterScope::Statistics).get(&retries()), Some(&5));

        assert!(tracker.clear_counter(&retries()));
        assert!(tracker.deltas(CounterScope::Statistics).is_empty());

        assert!(tracker.set_counter(retries(), 3));
        let mut expected = BTreeMap::new();
        expected.insert(retries(), 3);
        assert_eq!(tracker.deltas(CounterScope::Statistics), expected);
    }

    #[test]
    fn test_clear_without_delta_changes_nothing() {
        let mut tracker = EntityCounterTracker::from_snapshot(&entity());
        let before = tracker.get(&interrupted(0));
        assert!(!tracker.clear_counter(&interrupted(0)));
        assert_eq!(tracker.get(&interrupted(0)), before);
    }

    #[test]
    fn test_increasing_sequence_keeps_baseline() {
        let mut tracker = EntityCounterTracker::from_snapshot(&entity());
        for value in 13..40 {
            assert!(tracker.set_counter(interrupted(0), value));
            assert_eq!(tracker.get(&interrupted(0)).unwrap().last_clear_count(), 12);
        }
        assert!(!tracker.set_counter(interrupted(0), 39));
    }

    #[test]
    fn test_unknown_key_starts_from_zero() {
        let mut tracker = EntityCounterTracker::default();
        assert!(tracker.set_counter(interrupted(4), 2));
        assert_eq!(tracker.deltas(CounterScope::StreamInput(4)).get(&interrupted(4)), Some(&2));
    }

    #[test]
    fn test_clear_unknown_key_is_noop() {
        let mut tracker = EntityCounterTracker::default();
        assert_eq!(tracker.try_clear_counter(&retries()), None);
        assert!(tracker.all_deltas().is_empty());
        assert!(tracker.scopes().is_empty());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Clearing untracked counter")]
    fn test_clear_unknown_key_asserts_in_debug() {
        EntityCounterTracker::default().clear_counter(&retries());
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn test_clear_unknown_key_returns_false_in_release() {
        let mut tracker = EntityCounterTracker::default();
        assert!(!tracker.clear_counter(&retries()));
        assert!(tracker.all_deltas().is_empty());
    }

    #[test]
    fn test_latency_errors_seeded_from_diagnostics() {
        let live = entity()
            .with_stream_input_latency_error(0, true)
            .with_stream_input_latency_error(1, false);
        let tracker = EntityCounterTracker::from_snapshot(&live);
        assert!(tracker.latency_error(0));
        assert!(!tracker.latency_error(1));
        assert!(!tracker.latency_error(7));
    }

    #[test]
    fn test_latency_error_change_detection() {
        let mut tracker = EntityCounterTracker::default();
        assert!(!tracker.set_latency_error(0, false));
        assert!(tracker.set_latency_error(0, true));
        assert!(!tracker.set_latency_error(0, true));
        assert!(tracker.latency_error(0));
        assert!(tracker.set_latency_error(0, false));
        assert!(!tracker.latency_error(0));
    }

    #[test]
    fn test_clear_all_keeps_latency_errors() {
        let live = entity().with_stream_input_latency_error(0, true);
        let mut tracker = EntityCounterTracker::from_snapshot(&live);
        tracker.clear_all(&live);
        assert!(tracker.latency_error(0));
    }

    #[test]
    fn test_clear_all() {
        let live = entity();
        let mut tracker = EntityCounterTracker::from_snapshot(&live);
        tracker.set_counter(interrupted(0), 20);
        tracker.set_counter(interrupted(3), 1);

        let scopes = tracker.clear_all(&live);
        assert!(tracker.all_deltas().is_empty());
        assert_eq!(
            scopes,
            vec![
                CounterScope::StreamInput(0),
                CounterScope::StreamInput(3),
                CounterScope::Statistics,
            ]
        );
    }
}
