//! State tracking with call gating.
//!
//! A [`StateDrive`] stores the current state of its owner together with the
//! calls that arrived before the state they require. Owners describe their
//! gated operations as a call enum, ask [`StateDrive::admit`] whether a call
//! may run now, and replay whatever [`StateDrive::set_state`] hands back.
//!
//! Queued calls are keyed by the state they *require*. A transition releases
//! every bucket from the lowest up to and including the new state, in
//! ascending order, each bucket in original call order. A single transition
//! can therefore release several levels at once, and calls queued for a level
//! that was already passed still run.
//!
//! The drive never invokes calls itself; owners keep it behind a lock and must
//! release that lock before replaying.

use std::collections::BTreeMap;
use std::fmt;

/// Gated state holder for an owner with call type `C`.
pub struct StateDrive<S, C> {
    state: S,
    queue: BTreeMap<S, Vec<C>>,
}

impl<S: Copy + Ord + fmt::Debug, C> StateDrive<S, C> {
    /// Create a drive in `initial` state with nothing queued.
    pub fn new(initial: S) -> Self {
        Self {
            state: initial,
            queue: BTreeMap::new(),
        }
    }

    /// Current state
    pub fn state(&self) -> S {
        self.state
    }

    /// Gate `call` on `required`.
    ///
    /// Returns the call back when it may execute now, otherwise queues it and
    /// returns `None`.
    pub fn admit(&mut self, required: S, call: C) -> Option<C> {
        if self.state >= required {
            Some(call)
        } else {
            self.queue.entry(required).or_default().push(call);
            None
        }
    }

    /// Store `state` and release the calls it satisfies.
    pub fn set_state(&mut self, state: S) -> Vec<C> {
        self.state = state;
        self.release()
    }

    /// Calls whose required state is at or below the current state.
    pub fn release(&mut self) -> Vec<C> {
        let pending = self.queue.split_off(&self.state);
        let mut ready = std::mem::replace(&mut self.queue, pending);
        // split_off keeps the current level on the pending side
        if let Some(current) = self.queue.remove(&self.state) {
            ready.insert(self.state, current);
        }
        ready.into_values().flatten().collect()
    }

    /// Number of queued calls
    pub fn pending(&self) -> usize {
        self.queue.values().map(Vec::len).sum()
    }

    /// Drop every queued call.
    pub fn clear(&mut self) -> Vec<C> {
        std::mem::take(&mut self.queue).into_values().flatten().collect()
    }
}

impl<S: fmt::Debug, C> fmt::Debug for StateDrive<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateDrive")
            .field("state", &self.state)
            .field("queued_levels", &self.queue.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    enum Level {
        Low = 1,
        Mid = 2,
        High = 3,
    }

    #[test]
    fn test_admit_when_reached() {
        let mut drive: StateDrive<Level, &str> = StateDrive::new(Level::Mid);
        assert_eq!(drive.admit(Level::Low, "a"), Some("a"));
        assert_eq!(drive.admit(Level::Mid, "b"), Some("b"));
        assert_eq!(drive.admit(Level::High, "c"), None);
        assert_eq!(drive.pending(), 1);
    }

    #[test]
    fn test_cascade_ascending_then_fifo() {
        let mut drive = StateDrive::new(Level::Low);
        assert!(drive.admit(Level::High, "h1").is_none());
        assert!(drive.admit(Level::Mid, "m1").is_none());
        assert!(drive.admit(Level::High, "h2").is_none());
        assert!(drive.admit(Level::Mid, "m2").is_none());

        assert_eq!(drive.set_state(Level::High), vec!["m1", "m2", "h1", "h2"]);
        assert_eq!(drive.pending(), 0);
    }

    #[test]
    fn test_partial_release_keeps_higher_levels() {
        let mut drive = StateDrive::new(Level::Low);
        drive.admit(Level::High, "h");
        drive.admit(Level::Mid, "m");

        assert_eq!(drive.set_state(Level::Mid), vec!["m"]);
        assert_eq!(drive.pending(), 1);
        // Going back down releases nothing
        assert!(drive.set_state(Level::Low).is_empty());
        assert_eq!(drive.set_state(Level::High), vec!["h"]);
    }

    #[test]
    fn test_clear() {
        let mut drive = StateDrive::new(Level::Low);
        drive.admit(Level::High, 1);
        drive.admit(Level::Mid, 2);
        assert_eq!(drive.clear(), vec![2, 1]);
        assert!(drive.set_state(Level::High).is_empty());
    }

    fn level(n: u8) -> Level {
        match n % 3 {
            0 => Level::Low,
            1 => Level::Mid,
            _ => Level::High,
        }
    }

    proptest! {
        #[test]
        fn queued_calls_run_once_in_call_order_per_level(
            requirements in proptest::collection::vec(0u8..3, 0..40),
            target in 0u8..3,
        ) {
            let mut drive = StateDrive::new(Level::Low);
            drive.set_state(Level::Low);
            let mut immediate = Vec::new();
            for (i, r) in requirements.iter().enumerate() {
                if let Some(call) = drive.admit(level(*r), i) {
                    immediate.push(call);
                }
            }
            let target = level(target);
            let released = drive.set_state(target);
            let rest = drive.set_state(Level::High);

            // every call runs exactly once overall
            let mut all: Vec<usize> = immediate.iter().chain(&released).chain(&rest).copied().collect();
            all.sort();
            prop_assert_eq!(all, (0..requirements.len()).collect::<Vec<_>>());

            // released calls are exactly those whose level was reached, grouped
            // by ascending level and in call order inside a level
            let mut expected: Vec<(Level, usize)> = requirements
                .iter()
                .enumerate()
                .filter(|(_, r)| level(**r) > Level::Low && level(**r) <= target)
                .map(|(i, r)| (level(*r), i))
                .collect();
            expected.sort();
            prop_assert_eq!(released, expected.into_iter().map(|(_, i)| i).collect::<Vec<_>>());
        }
    }
}
