use std::{
    collections::{HashSet, VecDeque},
    sync::Mutex,
};

use crate::types::{ChatId, MessageId};

/// Default number of markers retained.
pub const DEFAULT_DEDUP_CAPACITY: usize = 4096;

/// Identity of an inbound event.
pub type DedupKey = (ChatId, MessageId);

/// Bounded marker set that collapses duplicate dispatch when several
/// listeners observe the same chat.
///
/// A marker means dispatch was attempted, not that delivery succeeded.
/// Oldest markers are evicted first once capacity is exceeded.
pub struct DedupGuard {
    capacity: usize,
    // std Mutex: every operation is a synchronous set lookup, never held
    // across `.await`.
    state: Mutex<DedupState>,
}

#[derive(Default)]
struct DedupState {
    markers: HashSet<DedupKey>,
    order: VecDeque<DedupKey>,
}

impl Default for DedupGuard {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}

impl DedupGuard {
    /// A zero capacity is treated as one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(DedupState::default()),
        }
    }

    /// Returns `true` if `key` was already marked, marking it otherwise.
    pub fn seen(&self, key: DedupKey) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.markers.insert(key) {
            return true;
        }
        state.order.push_back(key);
        while state.order.len() > self.capacity {
            if let Some(oldest) = state.order.pop_front() {
                state.markers.remove(&oldest);
            }
        }
        false
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .order
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(10)]
    fn repeated_calls_report_seen_after_first(#[case] n: usize) {
        let guard = DedupGuard::new(16);
        let results: Vec<bool> = (0..n).map(|_| guard.seen((100, 1))).collect();
        let mut expected = vec![true; n];
        expected[0] = false;
        assert_eq!(results, expected);
    }

    #[test]
    fn keys_are_per_chat() {
        let guard = DedupGuard::default();
        assert!(!guard.seen((100, 1)));
        assert!(!guard.seen((200, 1)));
        assert!(guard.seen((100, 1)));
    }

    #[test]
    fn oldest_markers_are_evicted() {
        let guard = DedupGuard::new(3);
        for id in 1..=4 {
            assert!(!guard.seen((1, id)));
        }
        assert_eq!(guard.len(), 3);
        // (1, 1) fell out of the window.
        assert!(!guard.seen((1, 1)));
        assert!(guard.seen((1, 4)));
    }

    #[test]
    fn zero_capacity_still_suppresses_immediate_repeat() {
        let guard = DedupGuard::new(0);
        assert_eq!(guard.capacity(), 1);
        assert!(!guard.seen((1, 1)));
        assert!(guard.seen((1, 1)));
    }
}
