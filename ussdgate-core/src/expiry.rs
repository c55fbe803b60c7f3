// ABOUTME: Indexed binary min-heap ordering pending sessions by absolute expiry time.
// ABOUTME: Stable handles allow O(log n) removal and rescheduling of already-queued entries.

use tokio::time::Instant;

/// Stable reference to an entry in an [`ExpiryQueue`].
///
/// Handles carry a generation so that a handle kept after its entry was
/// removed never resolves to a newer entry that reused the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExpiryHandle {
    slot: usize,
    generation: u64,
}

#[derive(Debug)]
struct Slot<K> {
    key: K,
    expires_at: Instant,
    heap_index: usize,
    generation: u64,
}

/// Min-heap of keys ordered by `expires_at`.
///
/// Entries live in an arena of slots; the heap itself only stores slot
/// numbers and every swap writes the new position back into the slot, which
/// is what makes removal of an arbitrary entry possible without a scan.
#[derive(Debug)]
pub struct ExpiryQueue<K> {
    slots: Vec<Option<Slot<K>>>,
    free: Vec<usize>,
    heap: Vec<usize>,
    next_generation: u64,
}

impl<K> Default for ExpiryQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> ExpiryQueue<K> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            heap: Vec::new(),
            next_generation: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Insert a key and return the handle used for later removal or rescheduling.
    pub fn push(&mut self, key: K, expires_at: Instant) -> ExpiryHandle {
        let generation = self.next_generation;
        self.next_generation += 1;

        let heap_index = self.heap.len();
        let slot = Slot {
            key,
            expires_at,
            heap_index,
            generation,
        };
        let slot_no = match self.free.pop() {
            Some(n) => {
                self.slots[n] = Some(slot);
                n
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.heap.push(slot_no);
        self.sift_up(heap_index);

        ExpiryHandle {
            slot: slot_no,
            generation,
        }
    }

    /// Earliest-expiring entry, without removing it.
    pub fn peek_min(&self) -> Option<(&K, Instant)> {
        let slot_no = *self.heap.first()?;
        self.slots[slot_no]
            .as_ref()
            .map(|slot| (&slot.key, slot.expires_at))
    }

    /// Remove and return the earliest-expiring entry.
    pub fn pop_min(&mut self) -> Option<(K, Instant)> {
        if self.heap.is_empty() {
            return None;
        }
        self.remove_at(0)
    }

    /// Pop the minimum only if it expires at or before `now`.
    pub fn pop_expired(&mut self, now: Instant) -> Option<K> {
        match self.peek_min() {
            Some((_, expires_at)) if expires_at <= now => self.pop_min().map(|(key, _)| key),
            _ => None,
        }
    }

    pub fn contains(&self, handle: ExpiryHandle) -> bool {
        self.resolve(handle).is_some()
    }

    pub fn expires_at(&self, handle: ExpiryHandle) -> Option<Instant> {
        self.resolve(handle).map(|slot| slot.expires_at)
    }

    /// Remove a specific entry. Returns `None` for stale handles.
    pub fn remove(&mut self, handle: ExpiryHandle) -> Option<(K, Instant)> {
        let heap_index = self.resolve(handle)?.heap_index;
        self.remove_at(heap_index)
    }

    /// Move an entry to a new expiry time. Returns `false` for stale handles.
    pub fn reschedule(&mut self, handle: ExpiryHandle, expires_at: Instant) -> bool {
        let Some(slot) = self.resolve_mut(handle) else {
            return false;
        };
        slot.expires_at = expires_at;
        let heap_index = slot.heap_index;
        self.fix(heap_index);
        true
    }

    fn resolve(&self, handle: ExpiryHandle) -> Option<&Slot<K>> {
        self.slots
            .get(handle.slot)?
            .as_ref()
            .filter(|slot| slot.generation == handle.generation)
    }

    fn resolve_mut(&mut self, handle: ExpiryHandle) -> Option<&mut Slot<K>> {
        self.slots
            .get_mut(handle.slot)?
            .as_mut()
            .filter(|slot| slot.generation == handle.generation)
    }

    fn remove_at(&mut self, heap_index: usize) -> Option<(K, Instant)> {
        let last = self.heap.len().checked_sub(1)?;
        if heap_index != last {
            self.swap(heap_index, last);
        }
        let slot_no = self.heap.pop()?;
        let slot = self.slots[slot_no].take()?;
        self.free.push(slot_no);
        if heap_index < self.heap.len() {
            self.fix(heap_index);
        }
        Some((slot.key, slot.expires_at))
    }

    fn fix(&mut self, heap_index: usize) {
        if !self.sift_up(heap_index) {
            self.sift_down(heap_index);
        }
    }

    fn deadline(&self, heap_index: usize) -> Instant {
        match &self.slots[self.heap[heap_index]] {
            Some(slot) => slot.expires_at,
            None => unreachable!("heap references an empty slot"),
        }
    }

    /// Returns true if the entry moved.
    fn sift_up(&mut self, mut i: usize) -> bool {
        let start = i;
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.deadline(i) >= self.deadline(parent) {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
        i != start
    }

    fn sift_down(&mut self, mut i: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * i + 1;
            let right = left + 1;
            let mut smallest = i;
            if left < len && self.deadline(left) < self.deadline(smallest) {
                smallest = left;
            }
            if right < len && self.deadline(right) < self.deadline(smallest) {
                smallest = right;
            }
            if smallest == i {
                break;
            }
            self.swap(i, smallest);
            i = smallest;
        }
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        for idx in [i, j] {
            let slot_no = self.heap[idx];
            if let Some(slot) = self.slots[slot_no].as_mut() {
                slot.heap_index = idx;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn at(base: Instant, secs: u64) -> Instant {
        base + Duration::from_secs(secs)
    }

    #[test]
    fn test_pop_min_returns_entries_in_expiry_order() {
        let base = Instant::now();
        let mut queue = ExpiryQueue::new();
        for (key, secs) in [("c", 30), ("a", 10), ("e", 50), ("b", 20), ("d", 40)] {
            queue.push(key, at(base, secs));
        }

        let order: Vec<&str> = std::iter::from_fn(|| queue.pop_min().map(|(k, _)| k)).collect();
        assert_eq!(order, vec!["a", "b", "c", "d", "e"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_remove_arbitrary_entry_keeps_heap_order() {
        let base = Instant::now();
        let mut queue = ExpiryQueue::new();
        let handles: Vec<_> = (0..10u64)
            .map(|i| queue.push(i, at(base, 100 - i * 7)))
            .collect();

        assert_eq!(queue.remove(handles[4]).map(|(k, _)| k), Some(4));
        assert_eq!(queue.remove(handles[9]).map(|(k, _)| k), Some(9));
        assert_eq!(queue.len(), 8);

        let mut last = None;
        while let Some((_, expires_at)) = queue.pop_min() {
            if let Some(prev) = last {
                assert!(prev <= expires_at);
            }
            last = Some(expires_at);
        }
    }

    #[test]
    fn test_stale_handle_is_ignored() {
        let base = Instant::now();
        let mut queue = ExpiryQueue::new();
        let old = queue.push("old", at(base, 5));
        assert!(queue.remove(old).is_some());

        // The freed slot is reused by the next push.
        let new = queue.push("new", at(base, 6));
        assert!(!queue.contains(old));
        assert!(queue.remove(old).is_none());
        assert!(!queue.reschedule(old, at(base, 99)));
        assert_eq!(queue.expires_at(new), Some(at(base, 6)));
    }

    #[test]
    fn test_reschedule_moves_entry() {
        let base = Instant::now();
        let mut queue = ExpiryQueue::new();
        let a = queue.push("a", at(base, 1));
        queue.push("b", at(base, 2));
        queue.push("c", at(base, 3));

        assert!(queue.reschedule(a, at(base, 10)));
        assert_eq!(queue.peek_min().map(|(k, _)| *k), Some("b"));

        let order: Vec<_> = std::iter::from_fn(|| queue.pop_min().map(|(k, _)| k)).collect();
        assert_eq!(order, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_pop_expired_stops_at_future_entry() {
        let base = Instant::now();
        let mut queue = ExpiryQueue::new();
        queue.push("past", at(base, 1));
        queue.push("now", at(base, 2));
        queue.push("future", at(base, 3));

        let now = at(base, 2);
        assert_eq!(queue.pop_expired(now), Some("past"));
        assert_eq!(queue.pop_expired(now), Some("now"));
        assert_eq!(queue.pop_expired(now), None);
        assert_eq!(queue.len(), 1);
    }
}
