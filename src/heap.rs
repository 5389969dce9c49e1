//! Bitmap block heap.
//!
//! A [`Heap`] owns a list of [`HeapRegion`]s and hands out runs of chunks
//! from them. Allocation never fails loudly: when no region can satisfy a
//! request the heap grows by exactly one region and retries once, and if that
//! does not help the caller gets `None`.

use std::{
    ptr::NonNull,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::{
    align_usize,
    globals::PAGE_SIZE,
    internal::region_list::RegionList,
    mmap::{PageProvider, PageSpan},
    region::{FreeError, HeapRegion, RegionError},
    Config,
};

struct HeapInner {
    regions: RegionList,
    spans: Vec<PageSpan>,
}

pub struct Heap {
    inner: Mutex<HeapInner>,
    expanding: AtomicBool,
    prevent_allocation: AtomicBool,
    expansions: AtomicUsize,
    provider: Arc<dyn PageProvider>,
    config: Config,
}

impl Heap {
    /// Create an empty heap. The first allocation grows it.
    pub fn new(config: Config, provider: Arc<dyn PageProvider>) -> Self {
        Self {
            inner: Mutex::new(HeapInner {
                regions: RegionList::new(),
                spans: Vec::new(),
            }),
            expanding: AtomicBool::new(false),
            prevent_allocation: AtomicBool::new(false),
            expansions: AtomicUsize::new(0),
            provider,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Make every allocation fail immediately while set.
    pub fn set_prevent_allocation(&self, prevent: bool) {
        self.prevent_allocation.store(prevent, Ordering::Relaxed);
    }

    pub fn is_allocation_prevented(&self) -> bool {
        self.prevent_allocation.load(Ordering::Relaxed)
    }

    pub fn is_expanding(&self) -> bool {
        self.expanding.load(Ordering::Acquire)
    }

    /// Turn `span` into a region and add it to the heap.
    ///
    /// Refused while the expansion path is adding a region of its own.
    pub fn add_region(&self, span: PageSpan) -> Result<(), RegionError> {
        if self.is_expanding() {
            return Err(RegionError::ExpansionInProgress);
        }
        let mut inner = self.inner.lock();
        self.install(&mut inner, span)
    }

    fn install(&self, inner: &mut HeapInner, span: PageSpan) -> Result<(), RegionError> {
        let region = unsafe { HeapRegion::init(span.start(), span.size(), self.config.chunk_size)? };
        inner.regions.push(region);
        inner.spans.push(span);
        Ok(())
    }

    /// Allocate `size` bytes whose address is a multiple of `boundary`.
    ///
    /// `boundary <= 1` means no alignment beyond the chunk size.
    pub fn alloc(&self, size: usize, boundary: usize) -> Option<NonNull<u8>> {
        if self.is_allocation_prevented() {
            log::warn!("allocation of {} bytes refused: allocation prevented", size);
            return None;
        }
        let chunk_size = self.config.chunk_size;
        let needed = size.max(1).checked_add(chunk_size - 1)? / chunk_size;

        let mut inner = self.inner.lock();
        if let Some(ptr) = Self::alloc_in_regions(&mut inner.regions, needed, boundary) {
            return Some(ptr);
        }
        if !self.expand_locked(&mut inner, needed * chunk_size + boundary) {
            log::warn!("out of memory: {} bytes (boundary {})", size, boundary);
            return None;
        }
        let ptr = Self::alloc_in_regions(&mut inner.regions, needed, boundary);
        if ptr.is_none() {
            log::warn!(
                "out of memory after expansion: {} bytes (boundary {})",
                size,
                boundary
            );
        }
        ptr
    }

    /// [`Heap::alloc`] followed by zero-filling the allocation.
    pub fn alloc_zeroed(&self, size: usize, boundary: usize) -> Option<NonNull<u8>> {
        let ptr = self.alloc(size, boundary)?;
        unsafe {
            ptr.as_ptr().write_bytes(0, size);
        }
        Some(ptr)
    }

    fn alloc_in_regions(
        regions: &mut RegionList,
        needed: usize,
        boundary: usize,
    ) -> Option<NonNull<u8>> {
        regions.find_map(|region| {
            if region.free_bytes() < needed * region.chunk_size() {
                return None;
            }
            let start = region.find_run(needed, boundary)?;
            let id = region.stamp(start, needed);
            log::trace!(
                "alloc {} chunks at {} of {:?} id={}",
                needed,
                start,
                region.base() as *const u8,
                id
            );
            NonNull::new(region.chunk_address(start) as *mut u8)
        })
    }

    /// Grow the heap by one region large enough for `min_bytes`.
    fn expand_locked(&self, inner: &mut HeapInner, min_bytes: usize) -> bool {
        if self.expanding.swap(true, Ordering::AcqRel) {
            log::warn!("recursive heap expansion refused");
            return false;
        }
        let result = self.expand(inner, min_bytes);
        self.expanding.store(false, Ordering::Release);
        result
    }

    fn expand(&self, inner: &mut HeapInner, min_bytes: usize) -> bool {
        let chunk_size = self.config.chunk_size;
        let default = if self.expansions.load(Ordering::Relaxed) == 0 {
            self.config.initial_expansion
        } else {
            self.config.expansion_size
        };
        // room for the bookkeeping of a region that must fit `min_bytes` of chunks
        let overhead = HeapRegion::HEADER_SIZE + min_bytes / chunk_size + 2 * chunk_size;
        let wanted = match min_bytes.checked_add(overhead) {
            Some(wanted) => wanted.max(default),
            None => return false,
        };
        let size = align_usize(wanted, PAGE_SIZE);

        if let Some(max) = self.config.max_heap_size {
            let current = inner.spans.iter().map(PageSpan::size).sum::<usize>();
            if current + size > max {
                log::warn!(
                    "heap expansion by {} bytes would exceed limit of {} bytes",
                    size,
                    max
                );
                return false;
            }
        }

        let span = match self.provider.request_pages(size / PAGE_SIZE) {
            Some(span) => span,
            None => {
                log::warn!("page provider refused {} pages", size / PAGE_SIZE);
                return false;
            }
        };
        let start = span.start();
        match self.install(inner, span) {
            Ok(()) => {
                let count = self.expansions.fetch_add(1, Ordering::Relaxed) + 1;
                logln_if!(
                    self.config.verbose,
                    "heap expanded by {} bytes at {:p} ({} regions, expansion #{})",
                    size,
                    start,
                    inner.regions.len(),
                    count
                );
                true
            }
            Err(err) => {
                log::warn!("unable to initialize region: {}", err);
                false
            }
        }
    }

    /// Grow the heap by one default-sized region without allocating from it.
    pub fn expand_heap(&self) -> bool {
        let mut inner = self.inner.lock();
        self.expand_locked(&mut inner, 0)
    }

    /// Release the allocation starting at `ptr`. Returns the number of bytes released.
    pub fn free(&self, ptr: NonNull<u8>) -> Result<usize, FreeError> {
        let addr = ptr.as_ptr() as usize;
        let mut inner = self.inner.lock();
        let result = inner
            .regions
            .find_map(|region| {
                region.contains(addr).then(|| {
                    region
                        .clear(addr)
                        .map(|chunks| chunks * region.chunk_size())
                })
            })
            .unwrap_or(Err(FreeError::NotInHeap));
        if let Err(err) = result {
            log::warn!("free of {:p} rejected: {}", ptr, err);
        }
        result
    }

    pub fn contains(&self, addr: usize) -> bool {
        let mut found = false;
        self.inner
            .lock()
            .regions
            .for_each(|region| found |= region.contains(addr));
        found
    }

    /// Whether `addr` lies inside a live allocation of this heap.
    pub fn is_allocated(&self, addr: usize) -> bool {
        let mut found = false;
        self.inner
            .lock()
            .regions
            .for_each(|region| found |= region.is_allocated(addr));
        found
    }

    /// Size in bytes of the allocation starting at `ptr`, if there is one.
    pub fn allocation_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        let addr = ptr.as_ptr() as usize;
        self.inner.lock().regions.find_map(|region| {
            if !region.is_allocated(addr) || addr != region.chunk_address(region.chunk_index(addr)) {
                return None;
            }
            let index = region.chunk_index(addr);
            let bitmap = region.bitmap();
            if bitmap[index - 1] == bitmap[index] {
                return None;
            }
            Some(region.run_length(index) * region.chunk_size())
        })
    }

    /// Visit every region under the heap lock.
    pub fn for_each_region(&self, visitor: impl FnMut(&HeapRegion)) {
        self.inner.lock().regions.for_each(visitor);
    }

    pub fn region_count(&self) -> usize {
        self.inner.lock().regions.len()
    }

    pub fn total_memory(&self) -> usize {
        let mut total = 0;
        self.for_each_region(|region| total += region.total_bytes());
        total
    }

    pub fn used_memory(&self) -> usize {
        let mut used = 0;
        self.for_each_region(|region| used += region.used_bytes());
        used
    }

    pub fn free_memory(&self) -> usize {
        let mut free = 0;
        self.for_each_region(|region| free += region.free_bytes());
        free
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("regions", &self.region_count())
            .field("total", &self.total_memory())
            .field("used", &self.used_memory())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;

    use super::*;
    use crate::{globals::CHUNK_SIZE, mmap::MmapPageProvider};

    /// Provider that calls back into its heap while serving an expansion.
    #[derive(Default)]
    struct ReentrantProvider {
        heap: Mutex<Weak<Heap>>,
        pages: MmapPageProvider,
        observed: Mutex<Option<(bool, Result<(), RegionError>)>>,
    }

    impl PageProvider for ReentrantProvider {
        fn request_pages(&self, count: usize) -> Option<PageSpan> {
            let heap = self.heap.lock().upgrade();
            if let Some(heap) = heap {
                let extra = self.pages.request_pages(1)?;
                *self.observed.lock() = Some((heap.is_expanding(), heap.add_region(extra)));
            }
            self.pages.request_pages(count)
        }
    }

    fn heap() -> Heap {
        Heap::new(Config::default(), Arc::new(MmapPageProvider::new()))
    }

    #[test]
    fn first_allocation_expands_by_initial_size() {
        let heap = heap();
        assert_eq!(heap.region_count(), 0);
        let ptr = heap.alloc(100, 1).unwrap();
        assert_eq!(heap.region_count(), 1);
        assert_eq!(heap.total_memory(), 40 * 1024);
        assert_eq!(heap.allocation_size(ptr), Some(4 * CHUNK_SIZE));
    }

    #[test]
    fn second_expansion_uses_default_growth() {
        let heap = heap();
        assert!(heap.expand_heap());
        assert!(heap.expand_heap());
        assert_eq!(heap.total_memory(), 40 * 1024 + 1024 * 1024);
    }

    #[test]
    fn oversized_request_grows_enough() {
        let heap = heap();
        let size = 3 * 1024 * 1024;
        let ptr = heap.alloc(size, 1).unwrap();
        assert!(heap.allocation_size(ptr).unwrap() >= size);
    }

    #[test]
    fn free_then_alloc_reuses_chunks() {
        let heap = heap();
        let a = heap.alloc(64, 1).unwrap();
        let _b = heap.alloc(64, 1).unwrap();
        let before = heap.free_memory();
        assert_eq!(heap.free(a), Ok(64));
        assert_eq!(heap.free_memory(), before + 64);
        let c = heap.alloc(32, 1).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn free_rejects_foreign_and_interior_pointers() {
        let heap = heap();
        let a = heap.alloc(96, 1).unwrap();
        let local = 0u64;
        let foreign = NonNull::from(&local).cast::<u8>();
        assert_eq!(heap.free(foreign), Err(FreeError::NotInHeap));
        let interior = unsafe { NonNull::new_unchecked(a.as_ptr().add(CHUNK_SIZE)) };
        assert_eq!(heap.free(interior), Err(FreeError::NotAllocationStart));
        assert_eq!(heap.free(a), Ok(96));
        assert_eq!(heap.free(a), Err(FreeError::AlreadyFree));
    }

    #[test]
    fn alloc_zeroed_clears_reused_memory() {
        let heap = heap();
        let a = heap.alloc(64, 1).unwrap();
        unsafe { a.as_ptr().write_bytes(0xAB, 64) };
        heap.free(a).unwrap();
        let b = heap.alloc_zeroed(64, 1).unwrap();
        assert_eq!(a, b);
        let bytes = unsafe { std::slice::from_raw_parts(b.as_ptr(), 64) };
        assert!(bytes.iter().all(|&x| x == 0));
    }

    #[test]
    fn prevent_allocation_fails_fast() {
        let heap = heap();
        heap.set_prevent_allocation(true);
        assert!(heap.alloc(8, 1).is_none());
        assert_eq!(heap.region_count(), 0);
        heap.set_prevent_allocation(false);
        assert!(heap.alloc(8, 1).is_some());
    }

    #[test]
    fn exhausted_provider_returns_none() {
        let heap = Heap::new(Config::default(), Arc::new(MmapPageProvider::with_budget(10)));
        assert!(heap.alloc(32, 1).is_some());
        assert_eq!(heap.region_count(), 1);
        // the second region would need 256 pages
        assert!(heap.alloc(40 * 1024, 1).is_none());
        assert_eq!(heap.region_count(), 1);
    }

    #[test]
    fn max_heap_size_caps_expansion() {
        let config = Config {
            max_heap_size: Some(64 * 1024),
            ..Config::default()
        };
        let heap = Heap::new(config, Arc::new(MmapPageProvider::new()));
        assert!(heap.alloc(1024, 1).is_some());
        assert!(heap.alloc(64 * 1024, 1).is_none());
        assert_eq!(heap.total_memory(), 40 * 1024);
    }

    #[test]
    fn add_region_makes_memory_available() {
        let heap = heap();
        let span = MmapPageProvider::new().request_pages(1).unwrap();
        heap.add_region(span).unwrap();
        assert_eq!(heap.region_count(), 1);
        assert_eq!(heap.total_memory(), 4096);
        assert!(heap.alloc(1024, 1).is_some());
        assert_eq!(heap.region_count(), 1);
    }

    #[test]
    fn aligned_allocation_is_aligned_and_freeable() {
        let heap = heap();
        heap.alloc(32, 1).unwrap();
        for boundary in [64usize, 128, 512, 4096] {
            let ptr = heap.alloc(40, boundary).unwrap();
            assert_eq!(ptr.as_ptr() as usize % boundary, 0);
            assert_eq!(heap.free(ptr), Ok(2 * CHUNK_SIZE));
        }
    }

    #[test]
    fn add_region_during_expansion_is_refused() {
        let provider = Arc::new(ReentrantProvider::default());
        let heap = Arc::new(Heap::new(Config::default(), provider.clone()));
        *provider.heap.lock() = Arc::downgrade(&heap);

        assert!(!heap.is_expanding());
        assert!(heap.alloc(64, 1).is_some());
        assert_eq!(
            *provider.observed.lock(),
            Some((true, Err(RegionError::ExpansionInProgress)))
        );
        assert!(!heap.is_expanding());
        assert_eq!(heap.region_count(), 1);
        assert_eq!(heap.total_memory(), 40 * 1024);

        let span = MmapPageProvider::new().request_pages(1).unwrap();
        assert_eq!(heap.add_region(span), Ok(()));
        assert_eq!(heap.region_count(), 2);
    }
}
