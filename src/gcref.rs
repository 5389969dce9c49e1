use std::{fmt, ptr::NonNull};

use crate::header::GcHeader;

/// Handle to a managed allocation.
///
/// The handle is the payload address; the header sits immediately before it.
/// A handle says nothing about liveness. Every collector operation validates
/// the header before touching it, so a stale or foreign handle is ignored.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct GcRef {
    pub(crate) header: NonNull<GcHeader>,
}

impl GcRef {
    pub(crate) fn from_header(header: NonNull<GcHeader>) -> Self {
        Self { header }
    }

    /// Handle for the payload address `ptr`.
    ///
    /// `None` for null, and for addresses too low to have a header in front of
    /// them; the latter is logged.
    pub fn from_payload(ptr: *mut u8) -> Option<Self> {
        let addr = ptr as usize;
        if addr == 0 {
            return None;
        }
        if addr < GcHeader::SIZE {
            log::warn!("ref count operation on low address {:#x} ignored", addr);
            return None;
        }
        NonNull::new((addr - GcHeader::SIZE) as *mut GcHeader).map(Self::from_header)
    }

    /// Decode a reference stored in a field or array slot.
    pub(crate) fn from_slot(value: usize) -> Option<Self> {
        Self::from_payload(value as *mut u8)
    }

    #[inline]
    pub fn payload(self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.header.as_ptr().cast::<u8>().add(GcHeader::SIZE)) }
    }

    #[inline]
    pub fn header_ptr(self) -> NonNull<GcHeader> {
        self.header
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.payload().as_ptr() as usize
    }

    #[inline]
    pub(crate) fn header_addr(self) -> usize {
        self.header.as_ptr() as usize
    }

    /// # Safety
    /// The header must have been validated against its heap.
    #[inline]
    pub(crate) unsafe fn header_mut<'a>(self) -> &'a mut GcHeader {
        &mut *self.header.as_ptr()
    }
}

impl fmt::Debug for GcRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GcRef({:p})", self.payload())
    }
}

impl fmt::Pointer for GcRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.payload())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_and_low_addresses_are_not_handles() {
        assert!(GcRef::from_payload(std::ptr::null_mut()).is_none());
        assert!(GcRef::from_payload(16 as *mut u8).is_none());
        assert!(GcRef::from_payload(GcHeader::SIZE as *mut u8).is_none());
    }

    #[test]
    fn payload_and_header_are_one_header_apart() {
        let gc = GcRef::from_payload(0x1040 as *mut u8).unwrap();
        assert_eq!(gc.addr(), 0x1040);
        assert_eq!(gc.header_addr(), 0x1040 - GcHeader::SIZE);
        assert_eq!(GcRef::from_slot(gc.addr()), Some(gc));
    }
}
