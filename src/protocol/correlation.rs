//! Macro correlation ids.
//!
//! Each macro command carries a 1-byte id that the device echoes back in its
//! acknowledgement. Ids rotate round-robin over 0-255, skipping any id still
//! in the recent window so that a late ack for an older command cannot be
//! mistaken for the current one.

use std::collections::VecDeque;

/// Number of recently issued ids that are not reassigned.
pub const RECENT_WINDOW: usize = 50;

const ID_SPACE: u16 = 256;

/// Allocates macro correlation ids and tracks the one awaiting an ack.
#[derive(Debug, Clone)]
pub struct MacroCorrelator {
    next_id: u8,
    recent: VecDeque<u8>,
    capacity: usize,
    awaiting: Option<u8>,
}

impl Default for MacroCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl MacroCorrelator {
    /// Create with the standard 50-id recent window.
    pub fn new() -> Self {
        Self::with_window(RECENT_WINDOW)
    }

    /// Create with a custom recent-window size (clamped to 1..=256).
    pub fn with_window(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, ID_SPACE as usize);
        Self {
            next_id: 0,
            recent: VecDeque::with_capacity(capacity + 1),
            capacity,
            awaiting: None,
        }
    }

    /// Allocate the next free id.
    ///
    /// If all 256 candidates are in the recent window the oldest entry is
    /// reclaimed.
    pub fn allocate(&mut self) -> u8 {
        let mut chosen = None;
        for _ in 0..ID_SPACE {
            let candidate = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.recent.contains(&candidate) {
                chosen = Some(candidate);
                break;
            }
        }

        let id = match chosen {
            Some(id) => id,
            None => {
                let reclaimed = self.recent.pop_front().unwrap_or(self.next_id);
                tracing::debug!("Macro id space exhausted, reclaiming id {}", reclaimed);
                reclaimed
            },
        };

        self.recent.push_back(id);
        if self.recent.len() > self.capacity {
            self.recent.pop_front();
        }
        id
    }

    /// Record `id` as the single id awaiting acknowledgement.
    pub fn mark_awaiting(&mut self, id: u8) {
        self.awaiting = Some(id);
    }

    /// Id currently awaiting acknowledgement.
    pub fn awaiting(&self) -> Option<u8> {
        self.awaiting
    }

    /// Clear the awaiting id without an ack (send failed).
    pub fn clear_awaiting(&mut self) {
        self.awaiting = None;
    }

    /// Match an inbound ack id. Returns true and clears the awaiting id on match.
    pub fn acknowledge(&mut self, id: u8) -> bool {
        if self.awaiting == Some(id) {
            self.awaiting = None;
            true
        } else {
            false
        }
    }

    /// Ids in the recent window, oldest first.
    pub fn recent(&self) -> impl Iterator<Item = u8> + '_ {
        self.recent.iter().copied()
    }

    /// Forget all allocation state.
    pub fn reset(&mut self) {
        self.next_id = 0;
        self.recent.clear();
        self.awaiting = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_round_robin_from_zero() {
        let mut ids = MacroCorrelator::new();
        assert_eq!(ids.allocate(), 0);
        assert_eq!(ids.allocate(), 1);
        assert_eq!(ids.allocate(), 2);
    }

    #[test]
    fn test_window_bounded() {
        let mut ids = MacroCorrelator::new();
        for _ in 0..120 {
            ids.allocate();
        }
        assert_eq!(ids.recent().count(), RECENT_WINDOW);
        assert_eq!(ids.recent().next(), Some(70));
    }

    #[test]
    fn test_no_reuse_within_window() {
        let mut ids = MacroCorrelator::new();
        let mut history: Vec<u8> = Vec::new();
        for _ in 0..2000 {
            let id = ids.allocate();
            let window_start = history.len().saturating_sub(RECENT_WINDOW);
            assert!(!history[window_start..].contains(&id));
            history.push(id);
        }
    }

    #[test]
    fn test_wraps_after_255() {
        let mut ids = MacroCorrelator::new();
        let seen: Vec<u8> = (0..257).map(|_| ids.allocate()).collect();
        assert_eq!(seen[255], 255);
        assert_eq!(seen[256], 0);
    }

    #[test]
    fn test_exhaustion_reclaims_oldest() {
        let mut ids = MacroCorrelator::with_window(256);
        let first: HashSet<u8> = (0..256).map(|_| ids.allocate()).collect();
        assert_eq!(first.len(), 256);

        // Every id is in the window now: the oldest (0) is reclaimed, then 1.
        assert_eq!(ids.allocate(), 0);
        assert_eq!(ids.allocate(), 1);
        assert_eq!(ids.recent().count(), 256);
        assert_eq!(ids.recent().last(), Some(1));
    }

    #[test]
    fn test_acknowledge() {
        let mut ids = MacroCorrelator::new();
        let id = ids.allocate();
        ids.mark_awaiting(id);
        assert!(!ids.acknowledge(id.wrapping_add(1)));
        assert_eq!(ids.awaiting(), Some(id));
        assert!(ids.acknowledge(id));
        assert_eq!(ids.awaiting(), None);
        assert!(!ids.acknowledge(id));
    }

    #[test]
    fn test_only_latest_macro_is_acknowledged() {
        let mut ids = MacroCorrelator::new();
        let older = ids.allocate();
        ids.mark_awaiting(older);
        let latest = ids.allocate();
        ids.mark_awaiting(latest);

        assert!(ids.recent().any(|id| id == older));
        assert!(!ids.acknowledge(older));
        assert!(ids.acknowledge(latest));
    }

    #[test]
    fn test_reset() {
        let mut ids = MacroCorrelator::new();
        ids.allocate();
        let id = ids.allocate();
        ids.mark_awaiting(id);
        ids.reset();
        assert_eq!(ids.awaiting(), None);
        assert_eq!(ids.recent().count(), 0);
        assert_eq!(ids.allocate(), 0);
    }
}
