//! Packet id deduplication
//!
//! Every block is sent twice, so roughly half of all datagrams are
//! duplicates. The window remembers the last `size` ids in a ring indexed by
//! `id % size`; an id older than the newest minus `size` has expired and can
//! no longer be told apart from a duplicate, so it is dropped as stale.

/// Result of checking one id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    /// First sighting; deliver it
    Fresh,
    /// Already delivered
    Duplicate,
    /// Older than the window
    Stale,
}

/// Sliding window of recently delivered ids
#[derive(Debug)]
pub struct DedupWindow {
    slots: Vec<Option<u64>>,
    highest: Option<u64>,
    /// Consecutive stale ids seen
    stale_run: usize,
    resyncs: u64,
}

impl DedupWindow {
    pub fn new(size: usize) -> Self {
        Self {
            slots: vec![None; size.max(1)],
            highest: None,
            stale_run: 0,
            resyncs: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Newest id delivered so far
    pub fn highest(&self) -> Option<u64> {
        self.highest
    }

    /// Times the window was reset after a sender restart
    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    /// Check and record `id`
    pub fn check(&mut self, id: u64) -> DedupOutcome {
        let size = self.slots.len() as u64;

        if let Some(highest) = self.highest {
            if highest >= size && id <= highest - size {
                self.stale_run += 1;
                // A long run of old ids means the sender restarted its counter
                if self.stale_run <= self.slots.len() {
                    return DedupOutcome::Stale;
                }
                tracing::info!(
                    "Packet ids restarted at {} (previous {}), resetting dedup window",
                    id,
                    highest
                );
                self.reset();
                self.resyncs += 1;
            }
        }
        self.stale_run = 0;

        let index = (id % size) as usize;
        if self.slots[index] == Some(id) {
            return DedupOutcome::Duplicate;
        }

        self.slots[index] = Some(id);
        self.highest = Some(self.highest.map_or(id, |h| h.max(id)));
        DedupOutcome::Fresh
    }

    /// Forget every id
    pub fn reset(&mut self) {
        self.slots.fill(None);
        self.highest = None;
        self.stale_run = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_duplicate_delivered_once() {
        let mut window = DedupWindow::new(48);
        assert_eq!(window.check(7), DedupOutcome::Fresh);
        assert_eq!(window.check(7), DedupOutcome::Duplicate);
        assert_eq!(window.check(8), DedupOutcome::Fresh);
        assert_eq!(window.check(7), DedupOutcome::Duplicate);
    }

    #[test]
    fn test_reordered_ids_within_window() {
        let mut window = DedupWindow::new(8);
        for id in [10, 12, 11, 14, 13] {
            assert_eq!(window.check(id), DedupOutcome::Fresh);
        }
        assert_eq!(window.check(11), DedupOutcome::Duplicate);
        assert_eq!(window.highest(), Some(14));
    }

    #[test]
    fn test_expired_ids_are_stale() {
        let mut window = DedupWindow::new(8);
        window.check(100);
        assert_eq!(window.check(92), DedupOutcome::Stale);
        assert_eq!(window.check(93), DedupOutcome::Fresh);
    }

    #[test]
    fn test_sender_restart_resyncs() {
        let mut window = DedupWindow::new(4);
        for id in 1000..1010 {
            window.check(id);
        }

        // Restarted counter: the first few are dropped, then the window resets
        let outcomes: Vec<_> = (0..6).map(|id| window.check(id)).collect();
        assert_eq!(&outcomes[..4], &[DedupOutcome::Stale; 4]);
        assert_eq!(outcomes[4], DedupOutcome::Fresh);
        assert_eq!(outcomes[5], DedupOutcome::Fresh);
        assert_eq!(window.resyncs(), 1);
        assert_eq!(window.highest(), Some(5));
    }

    proptest! {
        #[test]
        fn each_id_delivered_exactly_once(
            ids in proptest::collection::vec(0u64..40, 1..400),
        ) {
            let mut window = DedupWindow::new(48);
            let mut delivered = HashSet::new();
            for id in &ids {
                if window.check(*id) == DedupOutcome::Fresh {
                    prop_assert!(delivered.insert(*id), "id {} delivered twice", id);
                }
            }
            let distinct: HashSet<_> = ids.iter().copied().collect();
            prop_assert_eq!(delivered, distinct);
        }

        #[test]
        fn never_redelivers_without_resync(
            ids in proptest::collection::vec(0u64..1000, 1..400),
        ) {
            let mut window = DedupWindow::new(16);
            let mut delivered = HashSet::new();
            let mut repeated = false;
            for id in &ids {
                if window.check(*id) == DedupOutcome::Fresh && !delivered.insert(*id) {
                    repeated = true;
                }
            }
            prop_assert!(!repeated || window.resyncs() > 0);
        }
    }
}
