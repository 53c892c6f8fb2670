//! Binary cursor over raw metadata records.
//!
//! Every descriptor parser in this crate reads process memory through this
//! cursor rather than doing its own pointer arithmetic. Two relative-pointer
//! conventions recur throughout the foreign metadata format and are
//! implemented exactly once here:
//!
//! - **relative pointer**: a signed 4-byte offset resolved against the
//!   field's own address; 0 means "no target".
//! - **relative indirect pointer**: same, but a set low bit means the
//!   resolved address holds a pointer to the actual target.
//!
//! `read_word` is the single place where the platform pointer width matters;
//! size/stride fields in the witness table are pointer-sized and everything
//! else is explicit about its width.

use std::ffi::{c_void, CStr};

use crate::error::{Error, Result};

/// Sequential reader positioned inside a metadata record.
#[derive(Debug, Clone, Copy)]
pub struct Cursor {
    addr: *const u8,
}

impl Cursor {
    /// Position a cursor at `base`. Fails on a null handle so that no
    /// descriptor field is ever read through an invalid pointer.
    pub fn new(base: *const c_void) -> Result<Self> {
        if base.is_null() {
            return Err(Error::Validation("null metadata handle".into()));
        }
        Ok(Cursor { addr: base as *const u8 })
    }

    /// Current address of the cursor.
    pub fn address(&self) -> *const c_void {
        self.addr as *const c_void
    }

    /// A new cursor advanced by `bytes` from this one.
    pub fn offset(&self, bytes: usize) -> Cursor {
        Cursor {
            addr: unsafe { self.addr.add(bytes) },
        }
    }

    /// Skip `bytes` in place.
    pub fn skip(&mut self, bytes: usize) {
        self.addr = unsafe { self.addr.add(bytes) };
    }

    fn take<T: Copy>(&mut self) -> T {
        // Safety: the caller of Cursor::new vouched that the handle
        // addresses a readable metadata record; records are only ever read
        // within their declared layout.
        unsafe {
            let value = (self.addr as *const T).read_unaligned();
            self.addr = self.addr.add(std::mem::size_of::<T>());
            value
        }
    }

    pub fn read_u8(&mut self) -> u8 {
        self.take()
    }

    pub fn read_u16(&mut self) -> u16 {
        self.take()
    }

    pub fn read_i32(&mut self) -> i32 {
        self.take()
    }

    pub fn read_u32(&mut self) -> u32 {
        self.take()
    }

    /// Read a pointer-sized unsigned integer. This is the one point where
    /// the 32/64-bit layout difference lives.
    pub fn read_word(&mut self) -> usize {
        self.take()
    }

    pub fn read_pointer(&mut self) -> *const c_void {
        self.take()
    }

    /// Resolve a relative pointer stored at the cursor. Returns null for a
    /// zero offset. Advances past the 4-byte field.
    pub fn read_relative_pointer(&mut self) -> *const c_void {
        let field = self.addr;
        let offset = self.read_i32();
        if offset == 0 {
            return std::ptr::null();
        }
        unsafe { field.offset(offset as isize) as *const c_void }
    }

    /// Resolve a relative indirect pointer stored at the cursor: the low
    /// bit of the offset selects one extra level of indirection and is
    /// masked off before resolving. Advances past the 4-byte field.
    pub fn read_relative_indirect_pointer(&mut self) -> *const c_void {
        let field = self.addr;
        let raw = self.read_i32();
        if raw == 0 {
            return std::ptr::null();
        }
        let indirect = (raw & 1) != 0;
        let target = unsafe { field.offset((raw & !1) as isize) };
        if indirect {
            // Safety: an indirect relative pointer addresses a stored
            // pointer to the actual target.
            unsafe { (target as *const *const c_void).read_unaligned() }
        } else {
            target as *const c_void
        }
    }

    /// Follow a relative pointer to a NUL-terminated UTF-8 string.
    pub fn read_relative_string(&mut self) -> Result<String> {
        let target = self.read_relative_pointer();
        if target.is_null() {
            return Err(Error::Validation("null relative string pointer".into()));
        }
        // Safety: the target addresses a NUL-terminated name emitted by the
        // foreign compiler.
        let bytes = unsafe { CStr::from_ptr(target as *const libc::c_char) };
        Ok(String::from_utf8_lossy(bytes.to_bytes()).into_owned())
    }
}

/// Round `value` up to the next multiple of `align`.
pub(crate) fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}
