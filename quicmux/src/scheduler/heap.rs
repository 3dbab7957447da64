//! Indexed binary min-heap of scheduled alarms.
//!
//! Every slot move writes the new position back into the alarm's registry
//! record, so `heap_index` is exact at all times and `fix`/`remove` by index
//! are O(log n).

use super::alarm::AlarmId;
use crate::clock::Timestamp;
use ahash::AHashMap;

/// Scheduling record kept for every registered alarm.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HeapItem {
    /// Deadline snapshot taken when the alarm was last scheduled.
    pub deadline: Timestamp,
    /// Position in the heap, `None` while not scheduled.
    pub heap_index: Option<usize>,
    /// Tie-breaker among equal deadlines. Larger means scheduled later.
    pub insertion_order: u64,
}

pub(crate) type Registry = AHashMap<AlarmId, HeapItem>;

#[derive(Debug, Clone, Copy)]
struct Slot {
    alarm: AlarmId,
    deadline: Timestamp,
    order: u64,
}

impl Slot {
    #[inline]
    fn key(&self) -> (Timestamp, u64) {
        (self.deadline, self.order)
    }
}

#[derive(Debug, Default)]
pub(crate) struct AlarmHeap {
    slots: Vec<Slot>,
}

impl AlarmHeap {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn peek(&self) -> Option<(AlarmId, Timestamp)> {
        self.slots.first().map(|s| (s.alarm, s.deadline))
    }

    /// Insert a registered, unscheduled alarm using its registry snapshot.
    pub fn push(&mut self, registry: &mut Registry, alarm: AlarmId) {
        let item = record(registry, alarm);
        debug_assert!(item.heap_index.is_none(), "alarm {} pushed twice", alarm);
        self.slots.push(Slot {
            alarm,
            deadline: item.deadline,
            order: item.insertion_order,
        });
        let index = self.slots.len() - 1;
        self.place(registry, index);
        self.sift_up(registry, index);
    }

    pub fn pop(&mut self, registry: &mut Registry) -> Option<AlarmId> {
        if self.slots.is_empty() {
            return None;
        }
        Some(self.remove(registry, 0))
    }

    /// Remove the slot at `index`.
    pub fn remove(&mut self, registry: &mut Registry, index: usize) -> AlarmId {
        let last = self.slots.len() - 1;
        if index != last {
            self.swap(registry, index, last);
        }
        let slot = self.slots.swap_remove(last);
        record(registry, slot.alarm).heap_index = None;
        if index < self.slots.len() {
            self.restore(registry, index);
        }
        slot.alarm
    }

    /// Re-read the registry snapshot for the slot at `index` and restore
    /// heap order.
    pub fn fix(&mut self, registry: &mut Registry, index: usize) {
        let alarm = self.slots[index].alarm;
        let item = record(registry, alarm);
        self.slots[index].deadline = item.deadline;
        self.slots[index].order = item.insertion_order;
        self.restore(registry, index);
    }

    fn restore(&mut self, registry: &mut Registry, index: usize) {
        let moved = self.sift_down(registry, index);
        if moved == index {
            self.sift_up(registry, index);
        }
    }

    fn sift_up(&mut self, registry: &mut Registry, mut index: usize) -> usize {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.slots[index].key() >= self.slots[parent].key() {
                break;
            }
            self.swap(registry, index, parent);
            index = parent;
        }
        index
    }

    fn sift_down(&mut self, registry: &mut Registry, mut index: usize) -> usize {
        let len = self.slots.len();
        loop {
            let left = 2 * index + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let mut smallest = left;
            if right < len && self.slots[right].key() < self.slots[left].key() {
                smallest = right;
            }
            if self.slots[smallest].key() >= self.slots[index].key() {
                break;
            }
            self.swap(registry, index, smallest);
            index = smallest;
        }
        index
    }

    fn swap(&mut self, registry: &mut Registry, a: usize, b: usize) {
        self.slots.swap(a, b);
        self.place(registry, a);
        self.place(registry, b);
    }

    fn place(&mut self, registry: &mut Registry, index: usize) {
        let alarm = self.slots[index].alarm;
        record(registry, alarm).heap_index = Some(index);
    }

    /// Panics if heap order or any registry back-index is wrong.
    #[cfg(test)]
    pub fn assert_consistent(&self, registry: &Registry) {
        for (i, slot) in self.slots.iter().enumerate() {
            if i > 0 {
                let parent = (i - 1) / 2;
                assert!(
                    self.slots[parent].key() <= slot.key(),
                    "heap order violated at {}",
                    i
                );
            }
            let item = registry
                .get(&slot.alarm)
                .unwrap_or_else(|| panic!("slot {} has no registry record", i));
            assert_eq!(item.heap_index, Some(i), "stale heap_index for {}", slot.alarm);
            assert_eq!(item.deadline, slot.deadline);
        }
    }
}

/// Registry lookup from inside the heap. A miss means the heap and registry
/// disagree, which is unrecoverable.
fn record(registry: &mut Registry, alarm: AlarmId) -> &mut HeapItem {
    match registry.get_mut(&alarm) {
        Some(item) => item,
        None => panic!("alarm {} is in the scheduler heap but not registered", alarm),
    }
}
