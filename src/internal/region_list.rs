use std::ptr::{null_mut, NonNull};

use crate::region::HeapRegion;

/// Intrusive singly linked list of regions, newest first.
pub struct RegionList {
    head: *mut HeapRegion,
    len: usize,
}

// SAFETY: the list is only reachable through the owning heap's lock.
unsafe impl Send for RegionList {}

impl RegionList {
    pub fn new() -> Self {
        Self {
            head: null_mut(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub fn push(&mut self, region: NonNull<HeapRegion>) {
        unsafe {
            (*region.as_ptr()).next = self.head;
        }
        self.head = region.as_ptr();
        self.len += 1;
    }

    pub fn for_each(&self, mut visitor: impl FnMut(&HeapRegion)) {
        unsafe {
            let mut head = self.head;
            while !head.is_null() {
                visitor(&*head);
                head = (*head).next;
            }
        }
    }

    /// Visit regions in list order until `visitor` returns `Some`.
    pub fn find_map<R>(&mut self, mut visitor: impl FnMut(&mut HeapRegion) -> Option<R>) -> Option<R> {
        unsafe {
            let mut head = self.head;
            while !head.is_null() {
                if let Some(result) = visitor(&mut *head) {
                    return Some(result);
                }
                head = (*head).next;
            }
        }
        None
    }
}

impl Default for RegionList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        globals::CHUNK_SIZE,
        mmap::{MmapPageProvider, PageProvider},
    };

    #[test]
    fn push_prepends() {
        let provider = MmapPageProvider::new();
        let spans: Vec<_> = (1..=3).map(|n| provider.request_pages(n).unwrap()).collect();
        let mut list = RegionList::new();
        assert!(list.is_empty());
        for span in &spans {
            list.push(unsafe { HeapRegion::init(span.start(), span.size(), CHUNK_SIZE).unwrap() });
        }
        assert_eq!(list.len(), 3);

        let mut sizes = Vec::new();
        list.for_each(|region| sizes.push(region.size()));
        assert_eq!(sizes, vec![3 * 4096, 2 * 4096, 4096]);

        let found = list.find_map(|region| (region.size() == 2 * 4096).then(|| region.base()));
        assert_eq!(found, Some(spans[1].start().as_ptr() as usize));
    }
}
