//! Self-describing heap region.
//!
//! A region is one contiguous extent obtained from the page provider. Its
//! layout is:
//!
//! +----------------+--------------------------+---------------------------+
//! | HeapRegion     | bitmap (1 byte per chunk) | chunks handed to callers  |
//! +----------------+--------------------------+---------------------------+
//!
//! Chunk indices cover the whole region, including the header and bitmap.
//! The chunks those two occupy carry [`RESERVED_CHUNK_ID`] and are never
//! handed out. Every other chunk holds `0` when free, or the id of the
//! allocation occupying it. All chunks of one allocation share one id and two
//! adjacent allocations never share an id, so the extent of a run can be
//! recovered from the bitmap alone.

use std::{fmt, mem::size_of, ptr::NonNull};

use crate::globals::{FREE_CHUNK_ID, RESERVED_CHUNK_ID};

#[repr(C)]
pub struct HeapRegion {
    pub(crate) next: *mut HeapRegion,
    size: usize,
    chunk_size: u32,
    chunk_count: u32,
    used_chunks: u32,
    last_free_hint: u32,
    bitmap_start: [u8; 0],
}

const _ASSERT_HEADER: () = assert!(HeapRegion::HEADER_SIZE == 32);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegionError {
    /// Chunk size is not a power of two of at least 16 bytes.
    BadChunkSize(usize),
    /// Header and bitmap would consume every chunk.
    TooSmall(usize),
    /// More chunks than the bitmap bookkeeping can count.
    TooLarge(usize),
    /// Another region is being added by the expansion path right now.
    ExpansionInProgress,
}

impl fmt::Display for RegionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadChunkSize(size) => write!(f, "invalid chunk size {}", size),
            Self::TooSmall(size) => write!(f, "region of {} bytes has no usable chunks", size),
            Self::TooLarge(size) => write!(f, "region of {} bytes has too many chunks", size),
            Self::ExpansionInProgress => write!(f, "heap expansion in progress"),
        }
    }
}

impl std::error::Error for RegionError {}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FreeError {
    /// No region of the heap contains the address.
    NotInHeap,
    /// The address is inside an allocation but not at its first chunk.
    NotAllocationStart,
    /// The chunk is not allocated.
    AlreadyFree,
    /// The chunk belongs to the region's own header or bitmap.
    Reserved,
}

impl fmt::Display for FreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInHeap => write!(f, "pointer is not inside the heap"),
            Self::NotAllocationStart => write!(f, "pointer is not the start of an allocation"),
            Self::AlreadyFree => write!(f, "memory is already free"),
            Self::Reserved => write!(f, "memory belongs to region bookkeeping"),
        }
    }
}

impl std::error::Error for FreeError {}

/// Choose the id for a run whose neighbours carry `left` and `right`.
///
/// The id is the smallest byte above `left` that differs from `right`,
/// skipping the free marker and the reserved sentinel.
pub fn next_id(left: u8, right: u8) -> u8 {
    let mut id = left.wrapping_add(1);
    while id == FREE_CHUNK_ID || id == RESERVED_CHUNK_ID || id == left || id == right {
        id = id.wrapping_add(1);
    }
    id
}

impl HeapRegion {
    pub const HEADER_SIZE: usize = size_of::<Self>();

    /// Number of chunks the header and a bitmap for `chunk_count` chunks occupy.
    pub const fn reserved_chunks(chunk_count: usize, chunk_size: usize) -> usize {
        (Self::HEADER_SIZE + chunk_count + chunk_size - 1) / chunk_size
    }

    /// Initialize a region in place at `at`.
    ///
    /// # Safety
    /// `at` must point to `total_size` writable bytes, aligned to `chunk_size`,
    /// that outlive the returned region and are not used for anything else.
    pub unsafe fn init(
        at: NonNull<u8>,
        total_size: usize,
        chunk_size: usize,
    ) -> Result<NonNull<HeapRegion>, RegionError> {
        if chunk_size < 16 || !chunk_size.is_power_of_two() || chunk_size > u32::MAX as usize {
            return Err(RegionError::BadChunkSize(chunk_size));
        }
        debug_assert!(at.as_ptr() as usize % chunk_size == 0);
        let chunk_count = total_size / chunk_size;
        if chunk_count >= u32::MAX as usize {
            return Err(RegionError::TooLarge(total_size));
        }
        let reserved = Self::reserved_chunks(chunk_count, chunk_size);
        if reserved >= chunk_count {
            return Err(RegionError::TooSmall(total_size));
        }

        let ptr = at.as_ptr().cast::<Self>();
        ptr.write(Self {
            next: std::ptr::null_mut(),
            size: total_size,
            chunk_size: chunk_size as u32,
            chunk_count: chunk_count as u32,
            used_chunks: reserved as u32,
            last_free_hint: reserved as u32 - 1,
            bitmap_start: [],
        });
        let region = &mut *ptr;
        let bitmap = region.bitmap_mut();
        bitmap.fill(FREE_CHUNK_ID);
        bitmap[..reserved].fill(RESERVED_CHUNK_ID);
        Ok(NonNull::new_unchecked(ptr))
    }

    pub fn base(&self) -> usize {
        self as *const Self as usize
    }

    /// End of the chunk-addressable part of the region.
    pub fn limit(&self) -> usize {
        self.base() + self.chunk_count as usize * self.chunk_size as usize
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size as usize
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count as usize
    }

    pub fn used_chunks(&self) -> usize {
        self.used_chunks as usize
    }

    pub fn last_free_hint(&self) -> usize {
        self.last_free_hint as usize
    }

    pub fn total_bytes(&self) -> usize {
        self.chunk_count() * self.chunk_size()
    }

    pub fn used_bytes(&self) -> usize {
        self.used_chunks() * self.chunk_size()
    }

    pub fn free_bytes(&self) -> usize {
        self.total_bytes() - self.used_bytes()
    }

    pub fn bitmap(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.bitmap_start.as_ptr(), self.chunk_count()) }
    }

    fn bitmap_mut(&mut self) -> &mut [u8] {
        let len = self.chunk_count();
        unsafe { std::slice::from_raw_parts_mut(self.bitmap_start.as_mut_ptr(), len) }
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        self.base() <= addr && addr < self.limit()
    }

    #[inline]
    pub fn chunk_index(&self, addr: usize) -> usize {
        debug_assert!(self.contains(addr));
        (addr - self.base()) / self.chunk_size()
    }

    #[inline]
    pub fn chunk_address(&self, index: usize) -> usize {
        self.base() + index * self.chunk_size()
    }

    /// Whether `addr` lies in a chunk that belongs to a live allocation.
    pub fn is_allocated(&self, addr: usize) -> bool {
        if !self.contains(addr) {
            return false;
        }
        let id = self.bitmap()[self.chunk_index(addr)];
        id != FREE_CHUNK_ID && id != RESERVED_CHUNK_ID
    }

    /// Length in chunks of the allocation starting at chunk `start`.
    pub fn run_length(&self, start: usize) -> usize {
        let bitmap = self.bitmap();
        let id = bitmap[start];
        if id == FREE_CHUNK_ID {
            return 0;
        }
        bitmap[start..].iter().take_while(|&&b| b == id).count()
    }

    fn is_aligned_start(&self, index: usize, boundary: usize) -> bool {
        boundary <= 1 || self.chunk_address(index) % boundary == 0
    }

    /// Find `needed` consecutive free chunks whose first chunk address is a
    /// multiple of `boundary`.
    ///
    /// The scan starts just after the hint and wraps around once. A run never
    /// wraps past the end of the region.
    pub fn find_run(&self, needed: usize, boundary: usize) -> Option<usize> {
        let count = self.chunk_count();
        if needed == 0 || needed > count {
            return None;
        }
        let start = (self.last_free_hint() + 1) % count;
        self.scan(start, count, needed, boundary)
            .or_else(|| self.scan(0, (start + needed).min(count), needed, boundary))
    }

    fn scan(&self, from: usize, to: usize, needed: usize, boundary: usize) -> Option<usize> {
        let bitmap = self.bitmap();
        let mut run_start = 0;
        let mut run_len = 0;
        for (index, &id) in bitmap.iter().enumerate().take(to).skip(from) {
            if id != FREE_CHUNK_ID {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                if !self.is_aligned_start(index, boundary) {
                    continue;
                }
                run_start = index;
            }
            run_len += 1;
            if run_len == needed {
                return Some(run_start);
            }
        }
        None
    }

    /// The id a run of `len` chunks at `start` would be stamped with.
    pub fn id_for_run(&self, start: usize, len: usize) -> u8 {
        let bitmap = self.bitmap();
        let left = if start == 0 {
            FREE_CHUNK_ID
        } else {
            bitmap[start - 1]
        };
        let right = bitmap.get(start + len).copied().unwrap_or(FREE_CHUNK_ID);
        next_id(left, right)
    }

    /// Mark the free run `start..start + len` as one allocation.
    pub fn stamp(&mut self, start: usize, len: usize) -> u8 {
        let id = self.id_for_run(start, len);
        let bitmap = self.bitmap_mut();
        debug_assert!(bitmap[start..start + len]
            .iter()
            .all(|&b| b == FREE_CHUNK_ID));
        bitmap[start..start + len].fill(id);
        self.used_chunks += len as u32;
        self.last_free_hint = (start + len - 1) as u32;
        id
    }

    /// Release the allocation whose first chunk is at `addr`. Returns its length in chunks.
    pub fn clear(&mut self, addr: usize) -> Result<usize, FreeError> {
        if !self.contains(addr) {
            return Err(FreeError::NotInHeap);
        }
        let index = self.chunk_index(addr);
        let bitmap = self.bitmap();
        let id = bitmap[index];
        if id == FREE_CHUNK_ID {
            return Err(FreeError::AlreadyFree);
        }
        if id == RESERVED_CHUNK_ID {
            return Err(FreeError::Reserved);
        }
        if addr != self.chunk_address(index) || bitmap[index - 1] == id {
            return Err(FreeError::NotAllocationStart);
        }

        let len = self.run_length(index);
        self.bitmap_mut()[index..index + len].fill(FREE_CHUNK_ID);
        self.used_chunks -= len as u32;
        self.last_free_hint = (index - 1) as u32;
        Ok(len)
    }
}

impl fmt::Debug for HeapRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapRegion")
            .field("base", &(self.base() as *const u8))
            .field("size", &self.size)
            .field("chunk_size", &self.chunk_size)
            .field("used_chunks", &self.used_chunks)
            .field("chunk_count", &self.chunk_count)
            .finish()
    }
}
