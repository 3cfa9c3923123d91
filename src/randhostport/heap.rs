//! An array-backed binary min-heap of candidate host ports, ordered by the
//! number of pods using each port.
//!
//! Every entry records its own position in the backing array, and the heap
//! keeps a by-port index of those positions so that an arbitrary port can be
//! re-prioritized or removed in `O(log n)`.

use crate::pod::PortMap;

/// A candidate host port and the number of running pods that hold it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortEntry {
    pub port: u16,
    pub quantity: u64,
    heap_index: usize,
}

#[derive(Debug, Default)]
pub struct PortHeap {
    entries: Vec<PortEntry>,
    positions: PortMap<usize>,
}

// === impl PortEntry ===

impl PortEntry {
    pub fn new(port: u16, quantity: u64) -> Self {
        Self {
            port,
            quantity,
            heap_index: 0,
        }
    }

    /// The entry's position in the heap when it was last observed.
    pub fn heap_index(&self) -> usize {
        self.heap_index
    }
}

// === impl PortHeap ===

impl PortHeap {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            positions: PortMap::with_capacity_and_hasher(capacity, Default::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the least-used entry without removing it.
    pub fn peek(&self) -> Option<&PortEntry> {
        self.entries.first()
    }

    pub fn position(&self, port: u16) -> Option<usize> {
        self.positions.get(&port).copied()
    }

    pub fn get(&self, port: u16) -> Option<&PortEntry> {
        self.position(port).map(|index| &self.entries[index])
    }

    pub fn iter(&self) -> impl Iterator<Item = &PortEntry> + '_ {
        self.entries.iter()
    }

    /// Inserts an entry for a port that is not yet in the heap.
    pub fn push(&mut self, mut entry: PortEntry) {
        debug_assert!(
            !self.positions.contains_key(&entry.port),
            "port {} is already in the heap",
            entry.port
        );
        let index = self.entries.len();
        entry.heap_index = index;
        self.positions.insert(entry.port, index);
        self.entries.push(entry);
        self.up(index);
    }

    /// Removes and returns the least-used entry.
    pub fn pop(&mut self) -> Option<PortEntry> {
        let last = self.entries.len().checked_sub(1)?;
        self.swap(0, last);
        let entry = self.take_last()?;
        self.down(0);
        Some(entry)
    }

    /// Removes and returns the entry at `index`.
    pub fn remove_at(&mut self, index: usize) -> Option<PortEntry> {
        let last = self.entries.len().checked_sub(1)?;
        if index > last {
            return None;
        }
        if index != last {
            self.swap(index, last);
        }
        let entry = self.take_last()?;
        if index < self.entries.len() {
            self.fix(index);
        }
        Some(entry)
    }

    /// Sets the quantity of the entry at `index` and restores heap order.
    pub fn update(&mut self, index: usize, quantity: u64) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.quantity = quantity;
            self.fix(index);
        }
    }

    /// Restores heap order after the entry at `index` changed.
    pub fn fix(&mut self, index: usize) {
        if index >= self.entries.len() {
            return;
        }
        if !self.down(index) {
            self.up(index);
        }
    }

    fn take_last(&mut self) -> Option<PortEntry> {
        let entry = self.entries.pop()?;
        self.positions.remove(&entry.port);
        Some(entry)
    }

    fn less(&self, i: usize, j: usize) -> bool {
        self.entries[i].quantity < self.entries[j].quantity
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.entries.swap(i, j);
        for index in [i, j] {
            let entry = &mut self.entries[index];
            entry.heap_index = index;
            self.positions.insert(entry.port, index);
        }
    }

    fn up(&mut self, mut child: usize) {
        while child > 0 {
            let parent = (child - 1) / 2;
            if !self.less(child, parent) {
                break;
            }
            self.swap(parent, child);
            child = parent;
        }
    }

    /// Sifts the entry at `start` down; returns whether it moved.
    fn down(&mut self, start: usize) -> bool {
        let len = self.entries.len();
        let mut parent = start;
        loop {
            let left = 2 * parent + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child = if right < len && self.less(right, left) {
                right
            } else {
                left
            };
            if !self.less(child, parent) {
                break;
            }
            self.swap(parent, child);
            parent = child;
        }
        parent > start
    }
}

#[cfg(test)]
pub(crate) fn assert_heap_invariants(heap: &PortHeap) {
    assert_eq!(
        heap.entries.len(),
        heap.positions.len(),
        "every entry must be indexed exactly once"
    );
    for (index, entry) in heap.entries.iter().enumerate() {
        assert_eq!(entry.heap_index, index, "port {} heap index", entry.port);
        assert_eq!(
            heap.positions.get(&entry.port),
            Some(&index),
            "port {} position",
            entry.port
        );
        if index > 0 {
            let parent = &heap.entries[(index - 1) / 2];
            assert!(
                parent.quantity <= entry.quantity,
                "parent {:?} must not exceed child {:?}",
                parent,
                entry
            );
        }
    }
}
