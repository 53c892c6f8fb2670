//! Value witness table reader.
//!
//! The witness table holds the per-type operations the foreign runtime uses
//! to copy, move, and destroy values of types whose layout is otherwise
//! opaque, followed by the type's size, stride, flags, and extra-inhabitant
//! count. The eight operation slots are pointer-sized on every platform;
//! size and stride follow the platform pointer width.

use std::ffi::c_void;

use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::metadata::Metatype;

/// `initializeWithCopy`/`initializeWithTake` shape: `(dest, src, metatype)
/// -> dest`.
pub type InitFn = unsafe extern "C" fn(*mut u8, *const u8, *const c_void) -> *mut u8;

/// `destroy` shape: `(object, metatype)`.
pub type DestroyFn = unsafe extern "C" fn(*mut u8, *const c_void);

/// Parsed value witness table. Read once per type and cached for the
/// process lifetime by the metadata reader.
#[derive(Debug, Clone)]
pub struct ValueWitnessTable {
    init_buffer_with_copy_of_buffer: *const c_void,
    destroy: *const c_void,
    init_with_copy: *const c_void,
    assign_with_copy: *const c_void,
    init_with_take: *const c_void,
    assign_with_take: *const c_void,
    get_enum_tag_single_payload: *const c_void,
    store_enum_tag_single_payload: *const c_void,
    size: usize,
    stride: usize,
    flags: u32,
    extra_inhabitant_count: u32,
}

// Witness tables address immutable process-lifetime metadata.
unsafe impl Send for ValueWitnessTable {}
unsafe impl Sync for ValueWitnessTable {}

impl ValueWitnessTable {
    /// Locate and parse the witness table for a type. The witness pointer
    /// sits one machine word behind the type's metatype handle, a
    /// documented convention of the foreign ABI.
    pub fn from_type(metatype: Metatype) -> Result<Self> {
        if !metatype.is_valid() {
            return Err(Error::Validation(
                "cannot read witness table behind an invalid metatype".into(),
            ));
        }
        let word = std::mem::size_of::<usize>();
        let back = (metatype.handle() as usize - word) as *const c_void;
        // Safety: one word behind a valid metatype handle holds the witness
        // table pointer per the ABI convention above.
        let witness = unsafe { (back as *const *const c_void).read_unaligned() };
        Self::from_memory(witness)
    }

    /// Parse a witness table at a known address.
    pub fn from_memory(address: *const c_void) -> Result<Self> {
        let mut cur = Cursor::new(address)?;
        Ok(ValueWitnessTable {
            init_buffer_with_copy_of_buffer: cur.read_pointer(),
            destroy: cur.read_pointer(),
            init_with_copy: cur.read_pointer(),
            assign_with_copy: cur.read_pointer(),
            init_with_take: cur.read_pointer(),
            assign_with_take: cur.read_pointer(),
            get_enum_tag_single_payload: cur.read_pointer(),
            store_enum_tag_single_payload: cur.read_pointer(),
            size: cur.read_word(),
            stride: cur.read_word(),
            flags: cur.read_u32(),
            extra_inhabitant_count: cur.read_u32(),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn extra_inhabitant_count(&self) -> u32 {
        self.extra_inhabitant_count
    }

    pub fn align_mask(&self) -> usize {
        (self.flags & 0xff) as usize
    }

    pub fn alignment(&self) -> usize {
        self.align_mask() + 1
    }

    /// The `initializeWithCopy` slot as a callable.
    pub fn init_with_copy_fn(&self) -> Result<InitFn> {
        self.slot_fn::<InitFn>(self.init_with_copy, "initializeWithCopy")
    }

    /// The `initializeWithTake` slot as a callable.
    pub fn init_with_take_fn(&self) -> Result<InitFn> {
        self.slot_fn::<InitFn>(self.init_with_take, "initializeWithTake")
    }

    /// The `destroy` slot as a callable.
    pub fn destroy_fn(&self) -> Result<DestroyFn> {
        self.slot_fn::<DestroyFn>(self.destroy, "destroy")
    }

    fn slot_fn<F: Copy>(&self, slot: *const c_void, name: &str) -> Result<F> {
        if slot.is_null() {
            return Err(Error::Validation(format!(
                "witness table {name} slot is null"
            )));
        }
        // Safety: the slot holds a function pointer of the declared witness
        // shape; F is one of the typed aliases above.
        Ok(unsafe { std::mem::transmute_copy::<*const c_void, F>(&slot) })
    }

    #[allow(dead_code)]
    pub(crate) fn assign_with_copy_slot(&self) -> *const c_void {
        self.assign_with_copy
    }

    #[allow(dead_code)]
    pub(crate) fn assign_with_take_slot(&self) -> *const c_void {
        self.assign_with_take
    }

    #[allow(dead_code)]
    pub(crate) fn init_buffer_slot(&self) -> *const c_void {
        self.init_buffer_with_copy_of_buffer
    }

    #[allow(dead_code)]
    pub(crate) fn enum_tag_slots(&self) -> (*const c_void, *const c_void) {
        (
            self.get_enum_tag_single_payload,
            self.store_enum_tag_single_payload,
        )
    }
}
