use super::heap::{PortEntry, PortHeap};
use parking_lot::Mutex;
use std::ops::RangeInclusive;

/// A thread-safe registry of candidate host ports that hands out the
/// least-used ports first.
///
/// Every operation holds the cache's lock for its whole duration; multi-step
/// allocations go through [`PortCache::reserve`] so that concurrent admissions
/// never observe a half-finished reservation.
#[derive(Debug, Default)]
pub struct PortCache {
    heap: Mutex<PortHeap>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("port {port} is not tracked by the hostport cache")]
    NotFound { port: u16 },

    #[error("cannot reserve {requested} host ports: only {available} are available")]
    Exhausted { requested: usize, available: usize },
}

// === impl PortCache ===

impl PortCache {
    /// Creates a cache tracking every port in `ports`, each unused.
    pub fn new(ports: RangeInclusive<u16>) -> Self {
        let mut heap = PortHeap::with_capacity(ports.len());
        for port in ports {
            heap.push(PortEntry::new(port, 0));
        }
        Self {
            heap: Mutex::new(heap),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    /// Inserts an entry, or overwrites the quantity of the port's existing
    /// entry in place.
    pub fn push(&self, entry: PortEntry) {
        let mut heap = self.heap.lock();
        match heap.position(entry.port) {
            Some(index) => heap.update(index, entry.quantity),
            None => heap.push(entry),
        }
    }

    /// Returns a snapshot of the port's entry.
    pub fn get(&self, port: u16) -> Option<PortEntry> {
        self.heap.lock().get(port).cloned()
    }

    pub fn inc_quantity(&self, port: u16) -> Result<(), Error> {
        self.modify(port, |quantity| quantity.saturating_add(1))
    }

    /// Decrements the port's quantity, stopping at zero.
    pub fn dec_quantity(&self, port: u16) -> Result<(), Error> {
        self.modify(port, |quantity| quantity.saturating_sub(1))
    }

    /// Overwrites the quantity of a tracked port.
    ///
    /// Unlike [`PortCache::push`], this never starts tracking a new port.
    pub fn set_quantity(&self, port: u16, quantity: u64) -> Result<(), Error> {
        self.modify(port, |_| quantity)
    }

    /// Removes and returns the least-used entry.
    pub fn pop(&self) -> Option<PortEntry> {
        self.heap.lock().pop()
    }

    /// Removes and returns the entry for `port`.
    pub fn pop_port(&self, port: u16) -> Option<PortEntry> {
        let mut heap = self.heap.lock();
        let index = heap.position(port)?;
        heap.remove_at(index)
    }

    /// Atomically reserves the `count` least-used ports, counting one more
    /// user against each of them.
    ///
    /// Returned entries are in allocation order and reflect the incremented
    /// quantities.
    pub fn reserve(&self, count: usize) -> Result<Vec<PortEntry>, Error> {
        let mut heap = self.heap.lock();
        if count > heap.len() {
            return Err(Error::Exhausted {
                requested: count,
                available: heap.len(),
            });
        }

        let mut reserved = Vec::with_capacity(count);
        while reserved.len() < count {
            match heap.pop() {
                Some(mut entry) => {
                    entry.quantity = entry.quantity.saturating_add(1);
                    reserved.push(entry);
                }
                None => break,
            }
        }
        for entry in &reserved {
            heap.push(entry.clone());
        }

        Ok(reserved
            .into_iter()
            .map(|entry| heap.get(entry.port).cloned().unwrap_or(entry))
            .collect())
    }

    /// Returns a snapshot of every tracked port, ordered by port number.
    pub fn entries(&self) -> Vec<PortEntry> {
        let mut entries = self.heap.lock().iter().cloned().collect::<Vec<_>>();
        entries.sort_by_key(|e| e.port);
        entries
    }

    fn modify(&self, port: u16, f: impl FnOnce(u64) -> u64) -> Result<(), Error> {
        let mut heap = self.heap.lock();
        let index = heap.position(port).ok_or(Error::NotFound { port })?;
        let quantity = f(heap.get(port).map(|e| e.quantity).unwrap_or_default());
        heap.update(index, quantity);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        super::heap::assert_heap_invariants(&self.heap.lock());
    }
}
