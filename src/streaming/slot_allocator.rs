use bit_vec::BitVec;

/// Index into the renderer's pool of chunk slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub u32);

impl SlotId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// How freed slots are handed out again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotDiscipline {
    /// One vertex buffer per slot; plain LIFO reuse
    DiscreteChunks,
    /// One storage buffer indexed by slot; lowest free index first, which
    /// keeps the used prefix of the buffer short
    IndexedStorage,
}

impl SlotDiscipline {
    pub fn from_use_vbo(use_vbo: bool) -> Self {
        if use_vbo {
            SlotDiscipline::DiscreteChunks
        } else {
            SlotDiscipline::IndexedStorage
        }
    }
}

/// Free-list allocator for chunk slots with frame-deferred release
///
/// A slot referenced by a draw submitted this frame is not recycled on
/// release; it waits until `frames_in_flight` frame boundaries have passed.
#[derive(Debug)]
pub struct BufferSlotAllocator {
    discipline: SlotDiscipline,
    capacity: u32,
    /// Popped from the back
    free: Vec<SlotId>,
    in_use: BitVec,
    /// Frame number of the last draw that referenced each slot
    last_reference: Vec<Option<u64>>,
    /// Released slots waiting for their draws to retire, with the frame they become reusable
    deferred: Vec<(SlotId, u64)>,
    frame: u64,
    frames_in_flight: u32,
}

impl BufferSlotAllocator {
    pub fn new(capacity: u32, discipline: SlotDiscipline, frames_in_flight: u32) -> Self {
        let mut allocator = Self {
            discipline,
            capacity: 0,
            free: Vec::new(),
            in_use: BitVec::new(),
            last_reference: Vec::new(),
            deferred: Vec::new(),
            frame: 0,
            frames_in_flight: frames_in_flight.max(1),
        };
        allocator.reset(capacity, discipline);
        allocator
    }

    /// Drop all bookkeeping and fill the free list so slot 0 is handed out first
    pub fn reset(&mut self, capacity: u32, discipline: SlotDiscipline) {
        self.discipline = discipline;
        self.capacity = capacity;
        self.free = (0..capacity).rev().map(SlotId).collect();
        self.in_use = BitVec::from_elem(capacity as usize, false);
        self.last_reference = vec![None; capacity as usize];
        self.deferred.clear();
    }

    pub fn acquire_slot(&mut self) -> Option<SlotId> {
        let slot = self.free.pop()?;
        self.in_use.set(slot.index(), true);
        Some(slot)
    }

    pub fn release_slot(&mut self, slot: SlotId) {
        if self.in_use.get(slot.index()) != Some(true) {
            log::warn!(
                "[BufferSlotAllocator::release_slot] Slot {} released while not in use",
                slot.0
            );
            return;
        }
        self.in_use.set(slot.index(), false);

        let ready_at = self.last_reference[slot.index()]
            .map(|frame| frame + self.frames_in_flight as u64)
            .filter(|&ready_at| ready_at > self.frame);
        match ready_at {
            Some(ready_at) => self.deferred.push((slot, ready_at)),
            None => self.recycle(slot),
        }
    }

    /// Record that a draw submitted this frame reads from `slot`
    pub fn mark_referenced(&mut self, slot: SlotId) {
        if let Some(entry) = self.last_reference.get_mut(slot.index()) {
            *entry = Some(self.frame);
        }
    }

    /// Frame boundary; returns how many deferred slots became free
    pub fn end_frame(&mut self) -> usize {
        self.frame += 1;
        let frame = self.frame;
        let mut ready = Vec::new();
        self.deferred.retain(|&(slot, ready_at)| {
            if ready_at <= frame {
                ready.push(slot);
                false
            } else {
                true
            }
        });
        let recycled = ready.len();
        for slot in ready {
            self.recycle(slot);
        }
        recycled
    }

    /// Change the capacity after a budget update
    ///
    /// Growing adds free slots. Shrinking drops free slots at or above the new
    /// capacity; in-use ones are discarded when released.
    pub fn resize(&mut self, capacity: u32) {
        if capacity == self.capacity {
            return;
        }
        let old = self.capacity;
        self.capacity = capacity;
        if capacity > old {
            if self.in_use.len() < capacity as usize {
                let grow = capacity as usize - self.in_use.len();
                self.in_use.grow(grow, false);
                self.last_reference.resize(capacity as usize, None);
            }
            for index in (old..capacity).rev() {
                let slot = SlotId(index);
                let waiting = self.deferred.iter().any(|&(deferred, _)| deferred == slot);
                if !self.is_in_use(slot) && !waiting {
                    self.push_free(slot);
                }
            }
        } else {
            self.free.retain(|slot| slot.0 < capacity);
        }
        log::info!(
            "[BufferSlotAllocator::resize] Slot capacity {} -> {}",
            old,
            capacity
        );
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn discipline(&self) -> SlotDiscipline {
        self.discipline
    }

    pub fn num_free_slots(&self) -> usize {
        self.free.len()
    }

    pub fn num_in_use(&self) -> usize {
        self.in_use.iter().filter(|&used| used).count()
    }

    /// Slots released but still referenced by in-flight draws
    pub fn num_deferred(&self) -> usize {
        self.deferred.len()
    }

    pub fn is_in_use(&self, slot: SlotId) -> bool {
        self.in_use.get(slot.index()) == Some(true)
    }

    /// Highest slot index currently held, if any
    pub fn biggest_slot_index_in_use(&self) -> Option<SlotId> {
        (0..self.in_use.len())
            .rev()
            .find(|&index| self.in_use.get(index) == Some(true))
            .map(|index| SlotId(index as u32))
    }

    pub fn current_frame(&self) -> u64 {
        self.frame
    }

    fn recycle(&mut self, slot: SlotId) {
        self.last_reference[slot.index()] = None;
        if slot.0 < self.capacity {
            self.push_free(slot);
        }
    }

    fn push_free(&mut self, slot: SlotId) {
        match self.discipline {
            SlotDiscipline::DiscreteChunks => self.free.push(slot),
            SlotDiscipline::IndexedStorage => {
                // Kept in descending order so `pop` yields the lowest index.
                let position = self
                    .free
                    .binary_search_by(|held| slot.cmp(held))
                    .unwrap_or_else(|position| position);
                self.free.insert(position, slot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_zero_first() {
        let mut slots = BufferSlotAllocator::new(4, SlotDiscipline::DiscreteChunks, 1);
        assert_eq!(slots.acquire_slot(), Some(SlotId(0)));
        assert_eq!(slots.acquire_slot(), Some(SlotId(1)));
        assert_eq!(slots.num_free_slots(), 2);
        assert_eq!(slots.biggest_slot_index_in_use(), Some(SlotId(1)));
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut slots = BufferSlotAllocator::new(1, SlotDiscipline::DiscreteChunks, 1);
        assert!(slots.acquire_slot().is_some());
        assert_eq!(slots.acquire_slot(), None);
    }

    #[test]
    fn test_vbo_reuse_is_lifo() {
        let mut slots = BufferSlotAllocator::new(4, SlotDiscipline::DiscreteChunks, 1);
        let a = slots.acquire_slot().unwrap();
        let b = slots.acquire_slot().unwrap();
        let _c = slots.acquire_slot().unwrap();
        slots.release_slot(a);
        slots.release_slot(b);
        assert_eq!(slots.acquire_slot(), Some(b));
    }

    #[test]
    fn test_ssbo_reuse_prefers_lowest() {
        let mut slots = BufferSlotAllocator::new(4, SlotDiscipline::IndexedStorage, 1);
        let a = slots.acquire_slot().unwrap();
        let b = slots.acquire_slot().unwrap();
        let _c = slots.acquire_slot().unwrap();
        slots.release_slot(b);
        slots.release_slot(a);
        assert_eq!(slots.acquire_slot(), Some(SlotId(0)));
        assert_eq!(slots.acquire_slot(), Some(SlotId(1)));
        assert_eq!(slots.acquire_slot(), Some(SlotId(3)));
    }

    #[test]
    fn test_referenced_slot_waits_for_frame_boundary() {
        let mut slots = BufferSlotAllocator::new(1, SlotDiscipline::DiscreteChunks, 1);
        let slot = slots.acquire_slot().unwrap();
        slots.mark_referenced(slot);
        slots.release_slot(slot);

        assert_eq!(slots.acquire_slot(), None);
        assert_eq!(slots.num_deferred(), 1);
        assert_eq!(slots.end_frame(), 1);
        assert_eq!(slots.acquire_slot(), Some(slot));
    }

    #[test]
    fn test_reference_from_older_frame_does_not_defer() {
        let mut slots = BufferSlotAllocator::new(1, SlotDiscipline::DiscreteChunks, 1);
        let slot = slots.acquire_slot().unwrap();
        slots.mark_referenced(slot);
        slots.end_frame();
        slots.release_slot(slot);
        assert_eq!(slots.acquire_slot(), Some(slot));
    }

    #[test]
    fn test_double_release_is_ignored() {
        let mut slots = BufferSlotAllocator::new(2, SlotDiscipline::DiscreteChunks, 1);
        let slot = slots.acquire_slot().unwrap();
        slots.release_slot(slot);
        slots.release_slot(slot);
        assert_eq!(slots.num_free_slots(), 2);
    }

    #[test]
    fn test_shrink_discards_high_slots() {
        let mut slots = BufferSlotAllocator::new(4, SlotDiscipline::IndexedStorage, 1);
        let held: Vec<_> = (0..4).map(|_| slots.acquire_slot().unwrap()).collect();
        slots.resize(2);
        slots.release_slot(held[3]);
        slots.release_slot(held[1]);
        assert_eq!(slots.num_free_slots(), 1);

        slots.resize(3);
        assert_eq!(slots.num_free_slots(), 1);
        slots.release_slot(held[2]);
        assert_eq!(slots.num_free_slots(), 2);
        assert_eq!(slots.acquire_slot(), Some(SlotId(1)));
        assert_eq!(slots.acquire_slot(), Some(SlotId(2)));
    }
}
