use std::collections::{HashMap, HashSet, VecDeque};

use crate::common::types::FrameId;
use crate::storage::buffer::error::BufferPoolError;

/// LRU-K frame replacement policy.
///
/// Frames with fewer than `k` recorded accesses sit in a cold queue ordered
/// by first access; their backward K-distance is infinite, so they are
/// evicted first, oldest first. Once a frame's access count reaches `k` it
/// migrates to a warm queue kept in least-recently-used order. Eviction
/// scans the cold queue head, then the warm queue head, skipping frames
/// marked non-evictable.
///
/// The replacer has no lock of its own; the buffer pool's global mutex owns
/// it, the same way the manager owns its replacer state elsewhere in the
/// storage layer.
pub struct LruKReplacer {
    num_frames: usize,
    k: usize,
    /// Access count per tracked frame
    access_counts: HashMap<FrameId, usize>,
    /// Frames with count < k, in order of first access (FIFO)
    cold_queue: VecDeque<FrameId>,
    /// Frames with count >= k, least recently used at the front
    warm_queue: VecDeque<FrameId>,
    non_evictable: HashSet<FrameId>,
    /// Number of tracked frames that are currently evictable
    curr_size: usize,
}

impl LruKReplacer {
    pub fn new(num_frames: usize, k: usize) -> Self {
        assert!(k >= 1, "LRU-K requires k >= 1");
        Self {
            num_frames,
            k,
            access_counts: HashMap::new(),
            cold_queue: VecDeque::new(),
            warm_queue: VecDeque::new(),
            non_evictable: HashSet::new(),
            curr_size: 0,
        }
    }

    /// Record an access to `frame_id`, tracking it on first sight. Newly
    /// tracked frames start evictable with a single cold access.
    pub fn record_access(&mut self, frame_id: FrameId) {
        match self.access_counts.get_mut(&frame_id) {
            None => {
                assert!(
                    self.access_counts.len() < self.num_frames,
                    "replacer already tracks {} frames",
                    self.num_frames
                );
                self.access_counts.insert(frame_id, 1);
                self.cold_queue.push_back(frame_id);
                self.curr_size += 1;
            }
            Some(count) => {
                let was_warm = *count >= self.k;
                *count += 1;
                if was_warm {
                    // Refresh LRU position
                    Self::remove_from(&mut self.warm_queue, frame_id);
                    self.warm_queue.push_back(frame_id);
                } else if *count >= self.k {
                    // Crossed the K threshold: cold -> warm tail
                    Self::remove_from(&mut self.cold_queue, frame_id);
                    self.warm_queue.push_back(frame_id);
                }
            }
        }
    }

    /// Toggle a frame's evictability, adjusting `size()`. Untracked frames
    /// are ignored.
    pub fn set_evictable(&mut self, frame_id: FrameId, evictable: bool) {
        if !self.access_counts.contains_key(&frame_id) {
            return;
        }
        if evictable {
            if self.non_evictable.remove(&frame_id) {
                self.curr_size += 1;
            }
        } else if self.non_evictable.insert(frame_id) {
            self.curr_size -= 1;
        }
    }

    /// Choose and untrack a victim: the oldest evictable cold frame if one
    /// exists, otherwise the least recently used evictable warm frame
    pub fn evict(&mut self) -> Option<FrameId> {
        if self.curr_size == 0 {
            return None;
        }
        let victim = Self::scan(&self.cold_queue, &self.non_evictable)
            .or_else(|| Self::scan(&self.warm_queue, &self.non_evictable))?;
        self.forget(victim);
        Some(victim)
    }

    /// Force-untrack a frame regardless of its K-distance. Untracked frames
    /// are a no-op; non-evictable frames cannot be removed.
    pub fn remove(&mut self, frame_id: FrameId) -> Result<(), BufferPoolError> {
        if !self.access_counts.contains_key(&frame_id) {
            return Ok(());
        }
        if self.non_evictable.contains(&frame_id) {
            return Err(BufferPoolError::FrameNotEvictable(frame_id));
        }
        self.forget(frame_id);
        Ok(())
    }

    /// Number of tracked frames that are currently evictable
    pub fn size(&self) -> usize {
        self.curr_size
    }

    fn forget(&mut self, frame_id: FrameId) {
        let count = self.access_counts.remove(&frame_id).unwrap_or(0);
        if count >= self.k {
            Self::remove_from(&mut self.warm_queue, frame_id);
        } else {
            Self::remove_from(&mut self.cold_queue, frame_id);
        }
        self.curr_size -= 1;
    }

    fn scan(queue: &VecDeque<FrameId>, non_evictable: &HashSet<FrameId>) -> Option<FrameId> {
        queue.iter().copied().find(|id| !non_evictable.contains(id))
    }

    fn remove_from(queue: &mut VecDeque<FrameId>, frame_id: FrameId) {
        if let Some(pos) = queue.iter().position(|&id| id == frame_id) {
            queue.remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cold_frames_evicted_oldest_first() {
        let mut replacer = LruKReplacer::new(4, 2);
        replacer.record_access(0);
        replacer.record_access(1);
        replacer.record_access(2);

        assert_eq!(replacer.size(), 3);
        assert_eq!(replacer.evict(), Some(0));
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), None);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_cold_before_warm() {
        // K=2, 3 frames: access 1,2,3,1,2 leaves only frame 3 cold
        let mut replacer = LruKReplacer::new(3, 2);
        for frame in [1, 2, 3, 1, 2] {
            replacer.record_access(frame);
        }
        for frame in [1, 2, 3] {
            replacer.set_evictable(frame, true);
        }

        assert_eq!(replacer.evict(), Some(3));

        // Frame 1 becomes the most recently used warm frame; 2 goes first
        replacer.record_access(1);
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), Some(1));
    }

    #[test]
    fn test_warm_queue_is_lru_on_kth_access() {
        let mut replacer = LruKReplacer::new(3, 2);
        replacer.record_access(1);
        replacer.record_access(2);
        // Promote in reverse order: 2 warms before 1
        replacer.record_access(2);
        replacer.record_access(1);

        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), Some(1));
    }

    #[test]
    fn test_non_evictable_frames_are_skipped() {
        let mut replacer = LruKReplacer::new(3, 2);
        replacer.record_access(1);
        replacer.record_access(2);
        replacer.set_evictable(1, false);

        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), None);

        replacer.set_evictable(1, true);
        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(1));
    }

    #[test]
    fn test_set_evictable_is_idempotent() {
        let mut replacer = LruKReplacer::new(2, 2);
        replacer.record_access(0);
        replacer.set_evictable(0, false);
        replacer.set_evictable(0, false);
        assert_eq!(replacer.size(), 0);
        replacer.set_evictable(0, true);
        replacer.set_evictable(0, true);
        assert_eq!(replacer.size(), 1);
        // Untracked frames are ignored entirely
        replacer.set_evictable(7, true);
        assert_eq!(replacer.size(), 1);
    }

    #[test]
    fn test_remove_untracks_and_rejects_pinned() {
        let mut replacer = LruKReplacer::new(3, 2);
        replacer.record_access(1);
        replacer.record_access(2);
        replacer.set_evictable(2, false);

        assert!(replacer.remove(2).is_err());
        assert!(replacer.remove(1).is_ok());
        assert!(replacer.remove(9).is_ok(), "untracked remove is a no-op");
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_long_trace_matches_policy() {
        // Mirrors the classic LRU-K acceptance trace with 7 frames, K=2
        let mut replacer = LruKReplacer::new(7, 2);
        for frame in [1, 2, 3, 4, 5, 6] {
            replacer.record_access(frame);
        }
        for frame in [1, 2, 3, 4, 5] {
            replacer.set_evictable(frame, true);
        }
        replacer.set_evictable(6, false);
        assert_eq!(replacer.size(), 5);

        replacer.record_access(1);

        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), Some(3));
        assert_eq!(replacer.evict(), Some(4));
        assert_eq!(replacer.size(), 2);

        for frame in [3, 4, 5, 4] {
            replacer.record_access(frame);
        }
        replacer.set_evictable(3, true);
        replacer.set_evictable(4, true);
        assert_eq!(replacer.size(), 4);

        // 3 has one access since its earlier eviction: still cold
        assert_eq!(replacer.evict(), Some(3));

        replacer.set_evictable(6, true);
        assert_eq!(replacer.evict(), Some(6));

        replacer.set_evictable(1, false);
        assert_eq!(replacer.size(), 2);
        assert_eq!(replacer.evict(), Some(5));

        replacer.record_access(1);
        replacer.record_access(1);
        replacer.set_evictable(1, true);
        assert_eq!(replacer.size(), 2);

        assert_eq!(replacer.evict(), Some(4));
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.size(), 0);
    }
}
