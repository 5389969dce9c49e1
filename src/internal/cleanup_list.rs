//! Deferred cleanup queue.
//!
//! Entries live in a slot arena and are doubly linked through slot indices,
//! so queuing, unqueuing a resurrected entry and sweeping are all O(1) per
//! entry without any per-entry heap allocation once slots are recycled.

const NIL: u32 = u32::MAX;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Slot(u32);

impl Slot {
    pub const NONE: u32 = NIL;

    pub fn index(self) -> u32 {
        self.0
    }

    pub fn from_index(index: u32) -> Option<Self> {
        (index != NIL).then(|| Slot(index))
    }
}

struct Entry<T> {
    value: Option<T>,
    prev: u32,
    next: u32,
}

pub struct CleanupList<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    head: u32,
    tail: u32,
    len: usize,
}

impl<T: Copy> CleanupList<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append `value` and return the slot that identifies it.
    pub fn push(&mut self, value: T) -> Slot {
        let entry = Entry {
            value: Some(value),
            prev: self.tail,
            next: NIL,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.entries[index as usize] = entry;
                index
            }
            None => {
                self.entries.push(entry);
                (self.entries.len() - 1) as u32
            }
        };
        if self.tail == NIL {
            self.head = index;
        } else {
            self.entries[self.tail as usize].next = index;
        }
        self.tail = index;
        self.len += 1;
        Slot(index)
    }

    /// Unlink the entry at `slot`. Returns `None` if the slot is not occupied.
    pub fn remove(&mut self, slot: Slot) -> Option<T> {
        let index = slot.0 as usize;
        let entry = self.entries.get_mut(index)?;
        let value = entry.value.take()?;
        let (prev, next) = (entry.prev, entry.next);

        if prev == NIL {
            self.head = next;
        } else {
            self.entries[prev as usize].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.entries[next as usize].prev = prev;
        }
        self.free.push(slot.0);
        self.len -= 1;
        Some(value)
    }

    pub fn get(&self, slot: Slot) -> Option<T> {
        self.entries.get(slot.0 as usize)?.value
    }

    pub fn iter(&self) -> impl Iterator<Item = (Slot, T)> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            if cursor == NIL {
                return None;
            }
            let index = cursor;
            let entry = &self.entries[index as usize];
            cursor = entry.next;
            entry.value.map(|value| (Slot(index), value))
        })
    }

    /// Remove every entry, returning them in queue order.
    pub fn drain(&mut self) -> Vec<T> {
        let values: Vec<T> = self.iter().map(|(_, value)| value).collect();
        self.entries.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
        self.len = 0;
        values
    }
}

impl<T: Copy> Default for CleanupList<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contents(list: &CleanupList<u32>) -> Vec<u32> {
        list.iter().map(|(_, v)| v).collect()
    }

    #[test]
    fn push_and_remove_keep_order() {
        let mut list = CleanupList::new();
        let a = list.push(1);
        let b = list.push(2);
        let c = list.push(3);
        assert_eq!(contents(&list), vec![1, 2, 3]);

        assert_eq!(list.remove(b), Some(2));
        assert_eq!(contents(&list), vec![1, 3]);
        assert_eq!(list.remove(b), None);

        assert_eq!(list.remove(a), Some(1));
        assert_eq!(list.remove(c), Some(3));
        assert!(list.is_empty());
        assert_eq!(contents(&list), Vec::<u32>::new());
    }

    #[test]
    fn slots_are_recycled() {
        let mut list = CleanupList::new();
        let a = list.push(10);
        list.push(11);
        list.remove(a);
        let b = list.push(12);
        assert_eq!(a, b);
        assert_eq!(list.get(b), Some(12));
        assert_eq!(contents(&list), vec![11, 12]);
    }

    #[test]
    fn drain_empties_the_list() {
        let mut list = CleanupList::new();
        for v in 0..5 {
            list.push(v);
        }
        let removed = list.push(99);
        list.remove(removed);
        assert_eq!(list.drain(), vec![0, 1, 2, 3, 4]);
        assert!(list.is_empty());
        assert_eq!(list.push(7), Slot(0));
    }

    #[test]
    fn slot_none_round_trips() {
        assert_eq!(Slot::from_index(Slot::NONE), None);
        assert_eq!(Slot::from_index(3).map(Slot::index), Some(3));
    }
}
