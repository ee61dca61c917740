//! Fixed-capacity record ring used by the propagating channel variants.

use crate::record::Record;

/// Circular buffer of record slots with two cursors and an explicit `full`
/// flag, so that `read == write` is unambiguous: it means empty unless `full`
/// is set.
#[derive(Debug)]
pub(crate) struct RecordRing {
    slots: Box<[Option<Record>]>,
    read: usize,
    write: usize,
    full: bool,
}

impl RecordRing {
    /// Allocate a ring with `capacity` slots. Capacity must be at least 2;
    /// callers clamp via configuration before construction.
    pub(crate) fn new(capacity: usize) -> Self {
        debug_assert!(capacity >= 2);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            read: 0,
            write: 0,
            full: false,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        !self.full && self.read == self.write
    }

    pub(crate) fn is_full(&self) -> bool {
        self.full
    }

    /// Push a record into the write slot. Returns the record back if the ring
    /// is full.
    pub(crate) fn push(&mut self, record: Record) -> Result<(), Record> {
        if self.full {
            return Err(record);
        }
        self.slots[self.write] = Some(record);
        self.write = (self.write + 1) % self.slots.len();
        if self.write == self.read {
            self.full = true;
        }
        Ok(())
    }

    /// Pop the oldest record, or `None` when empty.
    pub(crate) fn pop(&mut self) -> Option<Record> {
        if self.is_empty() {
            return None;
        }
        let record = self.slots[self.read].take();
        self.read = (self.read + 1) % self.slots.len();
        self.full = false;
        record
    }

    /// Drop all buffered records and reset the cursors.
    pub(crate) fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.read = 0;
        self.write = 0;
        self.full = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(n: u8) -> Record {
        Record::copy_from_slice(&[n])
    }

    #[test]
    fn empty_and_full_are_distinguished_at_equal_cursors() {
        let mut ring = RecordRing::new(2);
        assert!(ring.is_empty());
        assert!(!ring.is_full());

        ring.push(rec(1)).unwrap();
        ring.push(rec(2)).unwrap();
        // Cursors are equal again, but the flag says full.
        assert!(ring.is_full());
        assert!(!ring.is_empty());
    }

    #[test]
    fn push_to_full_ring_returns_record() {
        let mut ring = RecordRing::new(2);
        ring.push(rec(1)).unwrap();
        ring.push(rec(2)).unwrap();
        let rejected = ring.push(rec(3)).unwrap_err();
        assert_eq!(rejected, rec(3));
    }

    #[test]
    fn pop_preserves_fifo_order_across_wraparound() {
        let mut ring = RecordRing::new(3);
        for n in 0..3 {
            ring.push(rec(n)).unwrap();
        }
        assert_eq!(ring.pop(), Some(rec(0)));
        ring.push(rec(3)).unwrap();
        assert_eq!(ring.pop(), Some(rec(1)));
        assert_eq!(ring.pop(), Some(rec(2)));
        assert_eq!(ring.pop(), Some(rec(3)));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn clear_resets_to_empty() {
        let mut ring = RecordRing::new(2);
        ring.push(rec(1)).unwrap();
        ring.push(rec(2)).unwrap();
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.pop(), None);
        ring.push(rec(9)).unwrap();
        assert_eq!(ring.pop(), Some(rec(9)));
    }
}
