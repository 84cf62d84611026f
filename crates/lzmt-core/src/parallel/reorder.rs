use crate::{Lzma2Error, Result};

/// Releases items pushed out of order in strictly increasing id order.
///
/// Only ids in `next_expected..next_expected + capacity` can be held, so
/// every id maps to its own slot at `id % capacity`.
#[derive(Debug)]
pub struct ReorderRing<T> {
    next_id: u64,
    slots: Vec<Option<(u64, T)>>,
    pending: usize,
}

impl<T> ReorderRing<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            next_id: 0,
            slots: (0..capacity.max(1)).map(|_| None).collect(),
            pending: 0,
        }
    }

    /// Stores `item` and returns every item that is now contiguous with the
    /// last one released, in id order.
    ///
    /// # Errors
    /// Returns [`Lzma2Error::IllegalState`] for an id that was already
    /// released, is already held, or lies beyond the ring's window.
    pub fn push(&mut self, id: u64, item: T) -> Result<Vec<T>> {
        if id < self.next_id {
            return Err(Lzma2Error::IllegalState("block id already released"));
        }
        if id - self.next_id >= self.slots.len() as u64 {
            return Err(Lzma2Error::IllegalState("block id outside reorder window"));
        }

        let index = self.index(id);
        if self.slots[index].is_some() {
            return Err(Lzma2Error::IllegalState("duplicate block id in reorder ring"));
        }
        self.slots[index] = Some((id, item));
        self.pending += 1;

        let mut ready = Vec::new();
        loop {
            let index = self.index(self.next_id);
            match self.slots[index].take() {
                Some((_, item)) => {
                    ready.push(item);
                    self.pending -= 1;
                    self.next_id += 1;
                }
                None => break,
            }
        }
        Ok(ready)
    }

    /// Removes every held item, leaving the expected id unchanged.
    pub fn drain(&mut self) -> Vec<T> {
        self.pending = 0;
        let mut held: Vec<(u64, T)> = self.slots.iter_mut().filter_map(Option::take).collect();
        held.sort_by_key(|(id, _)| *id);
        held.into_iter().map(|(_, item)| item).collect()
    }

    pub fn next_expected(&self) -> u64 {
        self.next_id
    }

    pub fn pending_len(&self) -> usize {
        self.pending
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn index(&self, id: u64) -> usize {
        (id % self.slots.len() as u64) as usize
    }
}
