//! Reference-counting collector.
//!
//! Objects are born with a count of one (strings with zero, see
//! [`AllocatorContext::new_string`]). When a count drops to exactly zero the
//! collector eagerly walks the object's references and decrements each
//! target, repeating for every target that reaches zero in turn. Objects that
//! reach zero are queued on the cleanup list, and their memory goes back to
//! the heap only when [`AllocatorContext::cleanup`] sweeps the list. An object
//! whose count rises above zero again before the sweep leaves the list.
//!
//! Cycles are never collected: members of a cycle keep each other above zero.

use std::{
    fmt,
    mem::size_of,
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;

use crate::{
    context::AllocatorContext,
    gcref::GcRef,
    globals::REFERENCE_SIZE,
    header::{GcHeader, ObjectKind},
    internal::cleanup_list::{CleanupList, Slot},
    type_table::{FieldKind, TypeId},
};

/// Arrays and strings store their length in the first payload word.
pub const LENGTH_PREFIX: usize = size_of::<usize>();
/// Bytes per string character.
pub const CHAR_SIZE: usize = 2;

pub struct GcState {
    enabled: AtomicBool,
    pub(crate) inner: Mutex<GcInner>,
}

pub(crate) struct GcInner {
    pub(crate) cleanup: CleanupList<GcRef>,
    pub(crate) live_objects: usize,
    pub(crate) live_strings: usize,
}

// SAFETY: the queued handles point into the owning context's heap, and are
// only dereferenced while the context is borrowed.
unsafe impl Send for GcInner {}

impl GcState {
    /// A disabled collector with an empty cleanup list.
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            inner: Mutex::new(GcInner {
                cleanup: CleanupList::new(),
                live_objects: 0,
                live_strings: 0,
            }),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Live objects and arrays.
    pub fn live_objects(&self) -> usize {
        self.inner.lock().live_objects
    }

    pub fn live_strings(&self) -> usize {
        self.inner.lock().live_strings
    }

    pub fn pending_cleanup(&self) -> usize {
        self.inner.lock().cleanup.len()
    }
}

impl Default for GcState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AllocError {
    /// The collector of this context is disabled.
    Disabled,
    /// The heap refuses every allocation.
    Prevented,
    /// No memory even after growing the heap; carries the byte size requested.
    OutOfMemory(usize),
    NegativeLength(isize),
    SizeOverflow,
    UnknownType(TypeId),
    /// Value types cannot be allocated as standalone objects.
    NotAnObjectType(TypeId),
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "garbage collector is disabled"),
            Self::Prevented => write!(f, "allocation is prevented"),
            Self::OutOfMemory(size) => write!(f, "out of memory allocating {} bytes", size),
            Self::NegativeLength(len) => write!(f, "negative length {}", len),
            Self::SizeOverflow => write!(f, "allocation size overflow"),
            Self::UnknownType(id) => write!(f, "unknown type {}", id.index()),
            Self::NotAnObjectType(id) => write!(f, "type {} is a value type", id.index()),
        }
    }
}

impl std::error::Error for AllocError {}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AccessError {
    /// The handle does not name a live managed allocation.
    NotManaged,
    WrongKind,
    NotAReferenceField(usize),
    IndexOutOfBounds { index: usize, len: usize },
    /// The array holds value elements, not references.
    ValueElements,
}

impl fmt::Display for AccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotManaged => write!(f, "not a managed allocation"),
            Self::WrongKind => write!(f, "wrong allocation kind"),
            Self::NotAReferenceField(offset) => {
                write!(f, "no reference field at offset {}", offset)
            }
            Self::IndexOutOfBounds { index, len } => {
                write!(f, "index {} out of bounds for length {}", index, len)
            }
            Self::ValueElements => write!(f, "array elements are values"),
        }
    }
}

impl std::error::Error for AccessError {}

/// Result of [`AllocatorContext::decrement_ref_count`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DecrementOutcome {
    /// Disabled collector, or not a managed allocation.
    Ignored,
    /// Count still positive.
    Alive(i32),
    /// Count reached zero; the object and `cascaded` descendants are queued.
    Queued { cascaded: usize },
    /// Count went below zero. Nothing else happens.
    Underflow(i32),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct SweepStats {
    pub freed_objects: usize,
    pub freed_strings: usize,
    pub freed_bytes: usize,
    /// Entries dropped from the list because their count rose again.
    ///
    /// Incrementing already unqueues an object, so this only counts entries
    /// whose header count was raised without going through the collector.
    pub resurrected: usize,
}

pub(crate) enum Cascade {
    Ignored,
    Alive(i32),
    Underflow(i32),
    /// Every object whose count reached zero, root first.
    Zeroed(Vec<GcRef>),
}

impl AllocatorContext {
    fn check_enabled(&self) -> Result<(), AllocError> {
        if self.gc.is_enabled() {
            Ok(())
        } else {
            Err(AllocError::Disabled)
        }
    }

    fn allocate_managed(
        &self,
        payload: usize,
        kind: ObjectKind,
        type_id: TypeId,
        ref_count: i32,
    ) -> Result<GcRef, AllocError> {
        if self.heap.is_allocation_prevented() {
            return Err(AllocError::Prevented);
        }
        let size = payload
            .checked_add(GcHeader::SIZE)
            .ok_or(AllocError::SizeOverflow)?;
        let encoded = u32::try_from(size).map_err(|_| AllocError::SizeOverflow)?;
        let ptr = self
            .heap
            .alloc_zeroed(size, 1)
            .ok_or(AllocError::OutOfMemory(size))?;
        let header = ptr.cast::<GcHeader>();
        unsafe {
            header
                .as_ptr()
                .write(GcHeader::new(kind, type_id, ref_count, encoded));
        }
        Ok(GcRef::from_header(header))
    }

    /// Allocate a zeroed instance of `ty` with a count of one.
    pub fn new_object(&self, ty: TypeId) -> Result<GcRef, AllocError> {
        self.check_enabled()?;
        let desc = self.types.get(ty).ok_or(AllocError::UnknownType(ty))?;
        if desc.is_value_type {
            return Err(AllocError::NotAnObjectType(ty));
        }
        let obj = self.allocate_managed(desc.size, ObjectKind::Object, ty, 1)?;
        self.gc.inner.lock().live_objects += 1;
        Ok(obj)
    }

    /// Allocate a zeroed array of `length` elements of type `element` with a count of one.
    pub fn new_array(&self, length: isize, element: TypeId) -> Result<GcRef, AllocError> {
        self.check_enabled()?;
        let len = usize::try_from(length).map_err(|_| AllocError::NegativeLength(length))?;
        let stride = self
            .types
            .element_stride(element)
            .ok_or(AllocError::UnknownType(element))?;
        let payload = len
            .checked_mul(stride)
            .and_then(|bytes| bytes.checked_add(LENGTH_PREFIX))
            .ok_or(AllocError::SizeOverflow)?;
        let arr = self.allocate_managed(payload, ObjectKind::Array, element, 1)?;
        unsafe {
            arr.payload().as_ptr().cast::<usize>().write(len);
        }
        self.gc.inner.lock().live_objects += 1;
        Ok(arr)
    }

    /// Allocate a string of `length` two-byte characters.
    ///
    /// The string starts with a count of zero and already queued for cleanup:
    /// the caller must bind it (increment the count) before the next sweep, or
    /// the sweep frees it.
    pub fn new_string(&self, length: isize) -> Result<GcRef, AllocError> {
        self.check_enabled()?;
        let len = usize::try_from(length).map_err(|_| AllocError::NegativeLength(length))?;
        let payload = len
            .checked_mul(CHAR_SIZE)
            .and_then(|bytes| bytes.checked_add(LENGTH_PREFIX))
            .ok_or(AllocError::SizeOverflow)?;
        let string = self.allocate_managed(payload, ObjectKind::String, TypeId::NONE, 0)?;
        unsafe {
            string.payload().as_ptr().cast::<usize>().write(len);
        }
        let mut gc = self.gc.inner.lock();
        gc.live_strings += 1;
        self.enqueue(&mut gc, string);
        Ok(string)
    }

    /// [`new_string`](Self::new_string) filled with the UTF-16 encoding of `text`.
    pub fn new_string_from(&self, text: &str) -> Result<GcRef, AllocError> {
        let units: Vec<u16> = text.encode_utf16().collect();
        let length = isize::try_from(units.len()).map_err(|_| AllocError::SizeOverflow)?;
        let string = self.new_string(length)?;
        unsafe {
            let chars = string.payload().as_ptr().add(LENGTH_PREFIX).cast::<u16>();
            chars.copy_from_nonoverlapping(units.as_ptr(), units.len());
        }
        Ok(string)
    }

    /// Validated header of `obj`.
    ///
    /// The header must start a live allocation of this context's heap and carry
    /// the signature; anything else is not managed memory and is left alone.
    fn header_of<'a>(&'a self, obj: GcRef) -> Option<&'a mut GcHeader> {
        if !self.heap.is_allocated(obj.header_addr()) {
            return None;
        }
        let header = unsafe { obj.header_mut() };
        header.check_signature().then(|| header)
    }

    pub fn is_managed(&self, obj: GcRef) -> bool {
        self.header_of(obj).is_some()
    }

    pub fn ref_count(&self, obj: GcRef) -> Option<i32> {
        self.header_of(obj).map(|header| header.ref_count())
    }

    pub fn kind(&self, obj: GcRef) -> Option<ObjectKind> {
        self.header_of(obj).and_then(|header| header.kind())
    }

    pub fn type_of(&self, obj: GcRef) -> Option<TypeId> {
        self.header_of(obj).map(|header| header.type_id())
    }

    pub fn is_queued(&self, obj: GcRef) -> bool {
        self.header_of(obj)
            .map_or(false, |header| header.is_on_cleanup_list())
    }

    /// Element count of an array or character count of a string.
    pub fn length(&self, obj: GcRef) -> Option<usize> {
        let header = self.header_of(obj)?;
        match header.kind()? {
            ObjectKind::Array | ObjectKind::String => {
                Some(unsafe { obj.payload().as_ptr().cast::<usize>().read() })
            }
            ObjectKind::Object => None,
        }
    }

    pub fn read_string(&self, obj: GcRef) -> Option<String> {
        if self.kind(obj)? != ObjectKind::String {
            return None;
        }
        let len = self.length(obj)?;
        let units = unsafe {
            std::slice::from_raw_parts(
                obj.payload().as_ptr().add(LENGTH_PREFIX).cast::<u16>(),
                len,
            )
        };
        Some(String::from_utf16_lossy(units))
    }

    /// Add one count to `obj`, pulling it back off the cleanup list if it was queued.
    ///
    /// Returns the new count, or `None` when nothing was done.
    pub fn increment_ref_count(&self, obj: GcRef) -> Option<i32> {
        if !self.gc.is_enabled() {
            return None;
        }
        let mut gc = self.gc.inner.lock();
        let header = self.header_of(obj)?;
        let count = header.increment();
        if header.is_on_cleanup_list() && count > 0 {
            if let Some(slot) = Slot::from_index(header.cleanup_slot()) {
                gc.cleanup.remove(slot);
            }
            header.set_unqueued();
            log::trace!("{:?} resurrected with count {}", obj, count);
        }
        Some(count)
    }

    /// [`increment_ref_count`](Self::increment_ref_count) on a raw payload address.
    pub fn increment_ref_count_raw(&self, ptr: *mut u8) -> Option<i32> {
        GcRef::from_payload(ptr).and_then(|obj| self.increment_ref_count(obj))
    }

    /// Remove one count from `obj`. At zero, cascade into its references and queue
    /// everything that reached zero.
    pub fn decrement_ref_count(&self, obj: GcRef) -> DecrementOutcome {
        if !self.gc.is_enabled() {
            return DecrementOutcome::Ignored;
        }
        let mut gc = self.gc.inner.lock();
        match self.cascade_decrement(obj) {
            Cascade::Ignored => DecrementOutcome::Ignored,
            Cascade::Alive(count) => DecrementOutcome::Alive(count),
            Cascade::Underflow(count) => DecrementOutcome::Underflow(count),
            Cascade::Zeroed(zeroed) => {
                for &dead in &zeroed {
                    self.enqueue(&mut gc, dead);
                }
                DecrementOutcome::Queued {
                    cascaded: zeroed.len() - 1,
                }
            }
        }
    }

    /// [`decrement_ref_count`](Self::decrement_ref_count) on a raw payload address.
    pub fn decrement_ref_count_raw(&self, ptr: *mut u8) -> DecrementOutcome {
        GcRef::from_payload(ptr).map_or(DecrementOutcome::Ignored, |obj| {
            self.decrement_ref_count(obj)
        })
    }

    /// Decrement `root` and, if it reached zero, everything it transitively
    /// owns that reaches zero as a consequence; the caller holds the GC lock.
    pub(crate) fn cascade_decrement(&self, root: GcRef) -> Cascade {
        let Some(header) = self.header_of(root) else {
            return Cascade::Ignored;
        };
        let count = header.decrement();
        if count > 0 {
            return Cascade::Alive(count);
        }
        if count < 0 {
            log::warn!("{:?} ref count underflow to {}", root, count);
            return Cascade::Underflow(count);
        }

        let mut work = vec![root];
        let mut zeroed = Vec::new();
        while let Some(obj) = work.pop() {
            zeroed.push(obj);
            for child in self.references_of(obj) {
                let Some(header) = self.header_of(child) else {
                    continue;
                };
                match header.decrement() {
                    0 => work.push(child),
                    count if count < 0 => {
                        log::warn!("{:?} ref count underflow to {}", child, count)
                    }
                    _ => (),
                }
            }
        }
        Cascade::Zeroed(zeroed)
    }

    /// Managed references held by the fields or elements of `obj`.
    fn references_of(&self, obj: GcRef) -> Vec<GcRef> {
        let Some(header) = self.header_of(obj) else {
            return Vec::new();
        };
        let payload = obj.payload().as_ptr();
        let ty = header.type_id();
        match header.kind() {
            Some(ObjectKind::Object) => self
                .types
                .reference_offsets(ty)
                .into_iter()
                .filter_map(|offset| unsafe {
                    GcRef::from_slot(payload.add(offset).cast::<usize>().read())
                })
                .collect(),
            Some(ObjectKind::Array) if self.types.is_value_type(ty) == Some(false) => unsafe {
                let len = payload.cast::<usize>().read();
                let slots = payload.add(LENGTH_PREFIX).cast::<usize>();
                (0..len)
                    .filter_map(|index| GcRef::from_slot(slots.add(index).read()))
                    .collect()
            },
            _ => Vec::new(),
        }
    }

    fn enqueue(&self, gc: &mut GcInner, obj: GcRef) {
        if let Some(header) = self.header_of(obj) {
            if !header.is_on_cleanup_list() {
                let slot = gc.cleanup.push(obj);
                header.set_queued(slot.index());
            }
        }
    }

    /// Sweep the cleanup list once, freeing every queued object whose count is
    /// still at or below zero. Every entry leaves the list.
    pub fn cleanup(&self) -> SweepStats {
        let mut gc = self.gc.inner.lock();
        let queued = gc.cleanup.drain();
        let mut stats = SweepStats::default();

        for obj in queued {
            let Some(header) = self.header_of(obj) else {
                continue;
            };
            header.set_cleaned_up();
            header.set_unqueued();
            if header.ref_count() > 0 {
                stats.resurrected += 1;
                continue;
            }
            let kind = header.kind();
            header.wipe_signature();
            match self.heap.free(obj.header_ptr().cast()) {
                Ok(bytes) => {
                    stats.freed_bytes += bytes;
                    if kind == Some(ObjectKind::String) {
                        gc.live_strings = gc.live_strings.saturating_sub(1);
                        stats.freed_strings += 1;
                    } else {
                        gc.live_objects = gc.live_objects.saturating_sub(1);
                        stats.freed_objects += 1;
                    }
                }
                Err(err) => log::warn!("sweep could not free {:?}: {}", obj, err),
            }
        }

        logln_if!(
            self.heap.config().verbose,
            "cleanup freed {} objects and {} strings ({} bytes), {} resurrected",
            stats.freed_objects,
            stats.freed_strings,
            stats.freed_bytes,
            stats.resurrected
        );
        stats
    }

    fn reference_field(&self, obj: GcRef, offset: usize) -> Result<NonNull<usize>, AccessError> {
        let header = self.header_of(obj).ok_or(AccessError::NotManaged)?;
        if header.kind() != Some(ObjectKind::Object) {
            return Err(AccessError::WrongKind);
        }
        match self.types.field_at(header.type_id(), offset) {
            Some(field) if field.kind == FieldKind::Reference => unsafe {
                Ok(NonNull::new_unchecked(
                    obj.payload().as_ptr().add(offset).cast::<usize>(),
                ))
            },
            _ => Err(AccessError::NotAReferenceField(offset)),
        }
    }

    fn element_slot(&self, arr: GcRef, index: usize) -> Result<NonNull<usize>, AccessError> {
        let header = self.header_of(arr).ok_or(AccessError::NotManaged)?;
        if header.kind() != Some(ObjectKind::Array) {
            return Err(AccessError::WrongKind);
        }
        if self.types.is_value_type(header.type_id()) != Some(false) {
            return Err(AccessError::ValueElements);
        }
        let payload = arr.payload().as_ptr();
        let len = unsafe { payload.cast::<usize>().read() };
        if index >= len {
            return Err(AccessError::IndexOutOfBounds { index, len });
        }
        unsafe {
            Ok(NonNull::new_unchecked(
                payload
                    .add(LENGTH_PREFIX + index * REFERENCE_SIZE)
                    .cast::<usize>(),
            ))
        }
    }

    /// Store `value` into the slot, taking a count on the new target and giving
    /// up the count on the old one.
    fn bind(&self, slot: NonNull<usize>, value: Option<GcRef>) {
        if let Some(value) = value {
            self.increment_ref_count(value);
        }
        let old = unsafe { slot.as_ptr().replace(value.map_or(0, GcRef::addr)) };
        if let Some(old) = GcRef::from_slot(old) {
            self.decrement_ref_count(old);
        }
    }

    /// Bind the reference field at payload `offset` of `obj` to `value`.
    pub fn write_field(
        &self,
        obj: GcRef,
        offset: usize,
        value: Option<GcRef>,
    ) -> Result<(), AccessError> {
        let slot = self.reference_field(obj, offset)?;
        self.bind(slot, value);
        Ok(())
    }

    pub fn read_field(&self, obj: GcRef, offset: usize) -> Result<Option<GcRef>, AccessError> {
        let slot = self.reference_field(obj, offset)?;
        Ok(GcRef::from_slot(unsafe { slot.as_ptr().read() }))
    }

    /// Bind element `index` of a reference array to `value`.
    pub fn write_element(
        &self,
        arr: GcRef,
        index: usize,
        value: Option<GcRef>,
    ) -> Result<(), AccessError> {
        let slot = self.element_slot(arr, index)?;
        self.bind(slot, value);
        Ok(())
    }

    pub fn read_element(&self, arr: GcRef, index: usize) -> Result<Option<GcRef>, AccessError> {
        let slot = self.element_slot(arr, index)?;
        Ok(GcRef::from_slot(unsafe { slot.as_ptr().read() }))
    }
}
