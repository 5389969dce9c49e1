use crate::type_table::TypeId;
use modular_bitfield::prelude::*;
use std::{fmt, mem::size_of};

// GcHeader is prepended to every managed allocation.
//
// +-----------------+------+------------------------------------------+
// | name            | bits |                                          |
// +-----------------+------+------------------------------------------+
// | signature a     |   32 | SIGNATURE                                |
// | signature b     |   32 | SIGNATURE                                |
// | checksum        |   32 | CHECKSUM                                 |
// | ref count       |   32 | signed, may dip below zero               |
// | type id         |   32 | object type, or element type for arrays  |
// +-----------------+------+------------------------------------------+
// | on cleanup list |    1 |                                          |
// | cleaned up      |    1 | set by every sweep that visits it        |
// | kind            |    2 | ObjectKind                               |
// | unused          |   12 |                                          |
// | padding         |   16 |                                          |
// +-----------------+------+------------------------------------------+
// | cleanup slot    |   32 | Slot::NONE when not queued               |
// | size            |   32 | header + payload, in bytes               |
// +-----------------+------+------------------------------------------+
//
// Arrays and strings keep their length in the first word of the payload.
#[repr(C)]
pub struct GcHeader {
    signature_a: u32,
    signature_b: u32,
    checksum: u32,
    ref_count: i32,
    type_id: u32,
    flags: HeaderFlags,
    _padding: u16,
    cleanup_slot: u32,
    size: u32,
}

const _ASSERT_SIZE: () = assert!(GcHeader::SIZE == 32);

pub const SIGNATURE: u32 = 0x5C0E_ADE2;
pub const CHECKSUM: u32 = SIGNATURE.wrapping_add(SIGNATURE);

#[bitfield(bits = 16)]
#[derive(Clone, Copy)]
pub struct HeaderFlags {
    on_cleanup_list: bool,
    cleaned_up: bool,
    kind: B2,
    #[skip]
    __: B12,
}

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ObjectKind {
    Object = 0,
    Array = 1,
    String = 2,
}

impl ObjectKind {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Object),
            1 => Some(Self::Array),
            2 => Some(Self::String),
            _ => None,
        }
    }
}

impl GcHeader {
    pub const SIZE: usize = size_of::<Self>();

    pub(crate) fn new(kind: ObjectKind, type_id: TypeId, ref_count: i32, size: u32) -> Self {
        Self {
            signature_a: SIGNATURE,
            signature_b: SIGNATURE,
            checksum: CHECKSUM,
            ref_count,
            type_id: type_id.index(),
            flags: HeaderFlags::new().with_kind(kind as u8),
            _padding: 0,
            cleanup_slot: u32::MAX,
            size,
        }
    }

    #[inline(always)]
    pub fn payload(&self) -> *mut u8 {
        (self as *const Self as usize + size_of::<Self>()) as _
    }

    /// Whether this memory carries a live managed header.
    #[inline]
    pub fn check_signature(&self) -> bool {
        self.signature_a == SIGNATURE && self.signature_b == SIGNATURE && self.checksum == CHECKSUM
    }

    pub(crate) fn wipe_signature(&mut self) {
        self.signature_a = 0;
        self.signature_b = 0;
        self.checksum = 0;
    }

    #[inline]
    pub fn ref_count(&self) -> i32 {
        self.ref_count
    }

    #[inline]
    pub(crate) fn increment(&mut self) -> i32 {
        self.ref_count = self.ref_count.wrapping_add(1);
        self.ref_count
    }

    #[inline]
    pub(crate) fn decrement(&mut self) -> i32 {
        self.ref_count = self.ref_count.wrapping_sub(1);
        self.ref_count
    }

    pub fn kind(&self) -> Option<ObjectKind> {
        ObjectKind::from_bits(self.flags.kind())
    }

    pub fn type_id(&self) -> TypeId {
        TypeId::from_index(self.type_id)
    }

    /// Allocation size in bytes, header included.
    pub fn size(&self) -> usize {
        self.size as usize
    }

    pub fn is_on_cleanup_list(&self) -> bool {
        self.flags.on_cleanup_list()
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.flags.cleaned_up()
    }

    pub(crate) fn cleanup_slot(&self) -> u32 {
        self.cleanup_slot
    }

    pub(crate) fn set_queued(&mut self, slot: u32) {
        self.cleanup_slot = slot;
        self.flags.set_on_cleanup_list(true);
    }

    pub(crate) fn set_unqueued(&mut self) {
        self.cleanup_slot = u32::MAX;
        self.flags.set_on_cleanup_list(false);
    }

    pub(crate) fn set_cleaned_up(&mut self) {
        self.flags.set_cleaned_up(true);
    }
}

impl fmt::Debug for GcHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcHeader")
            .field("valid", &self.check_signature())
            .field("kind", &self.kind())
            .field("type_id", &self.type_id)
            .field("ref_count", &self.ref_count)
            .field("on_cleanup_list", &self.is_on_cleanup_list())
            .field("cleaned_up", &self.is_cleaned_up())
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_header_is_valid() {
        let header = GcHeader::new(ObjectKind::Array, TypeId::from_index(7), 1, 96);
        assert!(header.check_signature());
        assert_eq!(header.kind(), Some(ObjectKind::Array));
        assert_eq!(header.type_id(), TypeId::from_index(7));
        assert_eq!(header.ref_count(), 1);
        assert_eq!(header.size(), 96);
        assert!(!header.is_on_cleanup_list());
        assert!(!header.is_cleaned_up());
    }

    #[test]
    fn wiped_header_is_rejected() {
        let mut header = GcHeader::new(ObjectKind::Object, TypeId::from_index(1), 1, 64);
        header.wipe_signature();
        assert!(!header.check_signature());
    }

    #[test]
    fn flags_are_independent() {
        let mut header = GcHeader::new(ObjectKind::String, TypeId::from_index(0), 0, 48);
        header.set_queued(3);
        assert!(header.is_on_cleanup_list());
        assert_eq!(header.cleanup_slot(), 3);
        header.set_cleaned_up();
        header.set_unqueued();
        assert!(!header.is_on_cleanup_list());
        assert!(header.is_cleaned_up());
        assert_eq!(header.kind(), Some(ObjectKind::String));
    }

    #[test]
    fn counts_move_both_ways() {
        let mut header = GcHeader::new(ObjectKind::Object, TypeId::from_index(1), 1, 64);
        assert_eq!(header.increment(), 2);
        assert_eq!(header.decrement(), 1);
        assert_eq!(header.decrement(), 0);
        assert_eq!(header.decrement(), -1);
    }
}
