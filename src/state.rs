//! Run state and counters shared between producers, the controller and the sender loop

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Draining = 3,
}

impl RunState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => RunState::Starting,
            2 => RunState::Running,
            3 => RunState::Draining,
            _ => RunState::Stopped,
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Stopped => write!(f, "stopped"),
            RunState::Starting => write!(f, "starting"),
            RunState::Running => write!(f, "running"),
            RunState::Draining => write!(f, "draining"),
        }
    }
}

/// Lock-free cell holding the current [`RunState`].
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: RunState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> RunState {
        RunState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: RunState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move from `from` to `to`, returning the observed state on failure.
    pub fn transition(&self, from: RunState, to: RunState) -> Result<(), RunState> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(RunState::from_u8)
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new(RunState::Stopped)
    }
}

/// Pipeline counters. Updated with relaxed atomics; read as a snapshot.
#[derive(Debug, Default)]
pub struct ForwarderStats {
    pub enqueued: AtomicU64,
    pub dropped_overflow: AtomicU64,
    pub dropped_not_running: AtomicU64,
    pub delivered_records: AtomicU64,
    pub delivered_batches: AtomicU64,
    pub dropped_records: AtomicU64,
    pub dropped_batches: AtomicU64,
    pub retries: AtomicU64,
    /// Records taken off the queue whose batch is not resolved yet
    pub in_flight: AtomicU64,
}

impl ForwarderStats {
    pub fn incr(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn sub(counter: &AtomicU64, n: u64) {
        counter.fetch_sub(n, Ordering::Relaxed);
    }

    /// Reset `counter` to zero and return what it held.
    pub fn take(counter: &AtomicU64) -> u64 {
        counter.swap(0, Ordering::Relaxed)
    }

    pub fn snapshot(&self, queued: usize) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        StatsSnapshot {
            enqueued: load(&self.enqueued),
            dropped_overflow: load(&self.dropped_overflow),
            dropped_not_running: load(&self.dropped_not_running),
            delivered_records: load(&self.delivered_records),
            delivered_batches: load(&self.delivered_batches),
            dropped_records: load(&self.dropped_records),
            dropped_batches: load(&self.dropped_batches),
            retries: load(&self.retries),
            in_flight: load(&self.in_flight),
            queued,
        }
    }
}

/// Point-in-time copy of [`ForwarderStats`] plus queue occupancy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub enqueued: u64,
    pub dropped_overflow: u64,
    pub dropped_not_running: u64,
    pub delivered_records: u64,
    pub delivered_batches: u64,
    pub dropped_records: u64,
    pub dropped_batches: u64,
    pub retries: u64,
    pub in_flight: u64,
    pub queued: usize,
}

impl StatsSnapshot {
    /// Records accepted but neither delivered nor dropped yet.
    pub fn unflushed(&self) -> u64 {
        self.queued as u64 + self.in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let cell = StateCell::default();
        assert_eq!(cell.get(), RunState::Stopped);

        assert!(cell.transition(RunState::Stopped, RunState::Starting).is_ok());
        assert_eq!(
            cell.transition(RunState::Stopped, RunState::Starting),
            Err(RunState::Starting)
        );

        cell.set(RunState::Draining);
        assert_eq!(cell.get(), RunState::Draining);
        assert_eq!(cell.get().to_string(), "draining");
    }

    #[test]
    fn test_snapshot_unflushed() {
        let stats = ForwarderStats::default();
        ForwarderStats::add(&stats.in_flight, 5);
        ForwarderStats::sub(&stats.in_flight, 2);
        assert_eq!(ForwarderStats::incr(&stats.enqueued), 1);

        let snapshot = stats.snapshot(4);
        assert_eq!(snapshot.in_flight, 3);
        assert_eq!(snapshot.unflushed(), 7);
        assert_eq!(snapshot.enqueued, 1);

        assert_eq!(ForwarderStats::take(&stats.in_flight), 3);
        assert_eq!(stats.snapshot(0).in_flight, 0);
    }
}
