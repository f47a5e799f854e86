//! Delta Counters
//!
//! Turns a remote entity's raw, monotonically increasing counters into
//! "errors since last acknowledged" values. Counters may be reset by the
//! entity or wrap at their native width; both are detected as a value going
//! backwards and handled by resetting the acknowledged baseline.

use std::collections::BTreeMap;
use std::fmt;

use crate::StreamIndex;

/// Counters reported by a stream input descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StreamInputCounterFlag {
    MediaLocked,
    MediaUnlocked,
    StreamInterrupted,
    SeqNumMismatch,
    MediaReset,
    TimestampUncertain,
    UnsupportedFormat,
    LateTimestamp,
    EarlyTimestamp,
    FramesRx,
}

impl StreamInputCounterFlag {
    /// Check if an increment of this counter denotes an error
    pub fn is_error(self) -> bool {
        matches!(
            self,
            StreamInputCounterFlag::MediaUnlocked
                | StreamInputCounterFlag::StreamInterrupted
                | StreamInputCounterFlag::SeqNumMismatch
                | StreamInputCounterFlag::LateTimestamp
                | StreamInputCounterFlag::EarlyTimestamp
                | StreamInputCounterFlag::UnsupportedFormat
        )
    }
}

/// Counters maintained by the engine itself for each entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StatisticsCounterFlag {
    AecpRetries,
    AecpTimeouts,
    AecpUnexpectedResponses,
}

/// Raw stream input counter values, as the entity reports them (32-bit)
pub type StreamInputCounters = BTreeMap<StreamInputCounterFlag, u32>;

/// Group of counters notified together
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CounterScope {
    StreamInput(StreamIndex),
    Statistics,
}

/// Identifies one tracked counter of an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CounterKey {
    StreamInput {
        stream: StreamIndex,
        flag: StreamInputCounterFlag,
    },
    Statistics(StatisticsCounterFlag),
}

impl CounterKey {
    /// Scope this counter is notified in
    pub fn scope(&self) -> CounterScope {
        match self {
            CounterKey::StreamInput { stream, .. } => CounterScope::StreamInput(*stream),
            CounterKey::Statistics(_) => CounterScope::Statistics,
        }
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CounterKey::StreamInput { stream, flag } => write!(f, "StreamInput[{}].{:?}", stream, flag),
            CounterKey::Statistics(flag) => write!(f, "Statistics.{:?}", flag),
        }
    }
}

/// Current value of a counter versus the value it had when last cleared
///
/// `last_clear_count <= current_count` always holds: the baseline only ever
/// moves up to the current value, or back to zero when a reset is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterDelta {
    current_count: u64,
    last_clear_count: u64,
}

impl CounterDelta {
    pub fn new(current_count: u64, last_clear_count: u64) -> Self {
        debug_assert!(last_clear_count <= current_count, "Baseline ahead of counter");
        Self {
            current_count,
            last_clear_count: last_clear_count.min(current_count),
        }
    }

    pub fn current_count(&self) -> u64 {
        self.current_count
    }

    pub fn last_clear_count(&self) -> u64 {
        self.last_clear_count
    }

    /// Pending delta, `None` when nothing happened since the last clear
    pub fn delta(&self) -> Option<u64> {
        if self.current_count != self.last_clear_count {
            Some(self.current_count.wrapping_sub(self.last_clear_count))
        } else {
            None
        }
    }

    /// Store a new counter value, returns true if a notification should fire
    pub fn set(&mut self, value: u64) -> bool {
        let mut changed = false;

        // Counter went backwards: the entity reset or the counter wrapped.
        // Any pending error state is dropped.
        if value < self.current_count {
            self.last_clear_count = 0;
            changed = true;
        }

        if value > self.current_count {
            changed = true;
        }

        self.current_count = value;

        changed
    }

    /// Acknowledge the pending delta, returns true if there was one
    pub fn clear(&mut self) -> bool {
        if self.last_clear_count != self.current_count {
            self.last_clear_count = self.current_count;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_baseline_is_visible() {
        let counter = CounterDelta::new(5, 0);
        assert_eq!(counter.delta(), Some(5));
    }

    #[test]
    fn test_snapshot_baseline_hides_history() {
        let counter = CounterDelta::new(42, 42);
        assert_eq!(counter.delta(), None);
    }

    #[test]
    fn test_increasing_values_never_reset_baseline() {
        let mut counter = CounterDelta::new(10, 10);
        for value in [11, 15, 15, 100, 1_000] {
            counter.set(value);
            assert_eq!(counter.last_clear_count(), 10);
        }
        assert_eq!(counter.delta(), Some(990));
    }

    #[test]
    fn test_increment_notifies() {
        let mut counter = CounterDelta::new(3, 3);
        assert!(counter.set(4));
        assert!(!counter.set(4));
    }

    #[test]
    fn test_reset_detection() {
        let mut counter = CounterDelta::new(50, 40);
        assert!(counter.set(7));
        assert_eq!(counter.last_clear_count(), 0);
        assert_eq!(counter.current_count(), 7);
        assert_eq!(counter.delta(), Some(7));
    }

    #[test]
    fn test_wrap_to_zero() {
        let mut counter = CounterDelta::new(u32::MAX as u64, 0);
        assert!(counter.set(0));
        assert_eq!(counter.delta(), None);
        assert!(counter.set(2));
        assert_eq!(counter.delta(), Some(2));
    }

    #[test]
    fn test_clear() {
        let mut counter = CounterDelta::new(5, 0);
        assert!(counter.clear());
        assert_eq!(counter.delta(), None);
        assert!(!counter.clear());
        assert_eq!(counter, CounterDelta::new(5, 5));
    }

    #[test]
    fn test_clear_then_reset_scenario() {
        let mut counter = CounterDelta::new(5, 0);
        assert_eq!(counter.delta(), Some(5));
        assert!(counter.clear());
        assert_eq!(counter.delta(), None);
        assert!(counter.set(3));
        assert_eq!(counter.delta(), Some(3));
    }

    #[test]
    fn test_key_scope() {
        let key = CounterKey::StreamInput {
            stream: 2,
            flag: StreamInputCounterFlag::SeqNumMismatch,
        };
        assert_eq!(key.scope(), CounterScope::StreamInput(2));
        assert_eq!(
            CounterKey::Statistics(StatisticsCounterFlag::AecpRetries).scope(),
            CounterScope::Statistics
        );
    }

    #[test]
    fn test_error_flags() {
        assert!(StreamInputCounterFlag::StreamInterrupted.is_error());
        assert!(StreamInputCounterFlag::MediaUnlocked.is_error());
        assert!(!StreamInputCounterFlag::MediaLocked.is_error());
        assert!(!StreamInputCounterFlag::FramesRx.is_error());
    }
}
