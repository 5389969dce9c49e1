//! Page-level memory source for heap regions.
//!
//! The heap never talks to the operating system directly. It asks a
//! [`PageProvider`] for a number of pages and receives a [`PageSpan`] that
//! stays mapped for as long as the span is alive. Spans handed out by a
//! provider are zeroed and page aligned.

use std::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use memmap2::MmapMut;

use crate::globals::PAGE_SIZE;

/// Source of raw pages for heap expansion.
pub trait PageProvider: Send + Sync {
    /// Request `count` contiguous zeroed pages. `None` when the request cannot be served.
    fn request_pages(&self, count: usize) -> Option<PageSpan>;
}

/// Owned, contiguous, zeroed and page aligned memory.
pub struct PageSpan {
    start: NonNull<u8>,
    size: usize,
    _map: MmapMut,
}

// SAFETY: the span exclusively owns its mapping, the pointer is only a cached view of it.
unsafe impl Send for PageSpan {}

impl PageSpan {
    fn map(size: usize) -> Option<Self> {
        let mut map = match MmapMut::map_anon(size) {
            Ok(map) => map,
            Err(err) => {
                log::warn!("anonymous map of {} bytes failed: {}", size, err);
                return None;
            }
        };
        let start = NonNull::new(map.as_mut_ptr())?;
        debug_assert!(start.as_ptr() as usize % PAGE_SIZE == 0);
        Some(Self {
            start,
            size,
            _map: map,
        })
    }

    pub fn start(&self) -> NonNull<u8> {
        self.start
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    pub fn pages(&self) -> usize {
        self.size / PAGE_SIZE
    }
}

impl std::fmt::Debug for PageSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PageSpan({:p}, {} bytes)", self.start, self.size)
    }
}

/// Page provider backed by anonymous memory maps.
///
/// An optional page budget caps how many pages the provider hands out over
/// its lifetime, which is how a machine with little physical memory is modelled.
#[derive(Debug, Default)]
pub struct MmapPageProvider {
    page_budget: Option<usize>,
    handed_out: AtomicUsize,
}

impl MmapPageProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_budget(pages: usize) -> Self {
        Self {
            page_budget: Some(pages),
            handed_out: AtomicUsize::new(0),
        }
    }

    pub fn pages_handed_out(&self) -> usize {
        self.handed_out.load(Ordering::Relaxed)
    }
}

impl PageProvider for MmapPageProvider {
    fn request_pages(&self, count: usize) -> Option<PageSpan> {
        if count == 0 {
            return None;
        }
        let size = count.checked_mul(PAGE_SIZE)?;
        let mut old = self.handed_out.load(Ordering::Relaxed);
        loop {
            let new = old.checked_add(count)?;
            if let Some(budget) = self.page_budget {
                if new > budget {
                    log::debug!(
                        "page budget exhausted: {} requested, {} of {} used",
                        count,
                        old,
                        budget
                    );
                    return None;
                }
            }
            match self.handed_out.compare_exchange_weak(
                old,
                new,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => old = x,
            }
        }

        let span = PageSpan::map(size);
        if span.is_none() {
            self.handed_out.fetch_sub(count, Ordering::AcqRel);
        }
        span
    }
}
