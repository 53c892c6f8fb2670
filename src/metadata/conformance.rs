//! Protocol conformance descriptor reader.
//!
//! Record layout, in 4-byte words from the descriptor handle:
//!
//! ```text
//! 0  protocol descriptor        relative indirect pointer
//! 1  implementing type          relative pointer, indirection per flags
//! 2  witness table              relative pointer
//! 3  flags
//! ```
//!
//! Trailing sections follow word 3, each present and sized according to the
//! flags word: a retroactive context word, conditional requirements
//! (3 words each), resilient witnesses (count word + 2-word entries), and a
//! generic witness table that is parsed past but never consumed.

use std::ffi::{c_void, CStr};

use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::metadata::NominalTypeDescriptor;

const WORD: usize = 4;
const TRAILING_OFFSET: usize = 4 * WORD;
const CONDITIONAL_REQUIREMENT_SIZE: usize = 3 * WORD;

/// How the implementing-type reference in word 1 is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeReferenceKind {
    DirectTypeDescriptor,
    IndirectTypeDescriptor,
    DirectObjCClassName,
    IndirectObjCClass,
}

/// Decoded flags word of a conformance descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConformanceFlags(u32);

impl ConformanceFlags {
    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn type_reference_kind(self) -> TypeReferenceKind {
        match (self.0 >> 3) & 0x3 {
            0 => TypeReferenceKind::DirectTypeDescriptor,
            1 => TypeReferenceKind::IndirectTypeDescriptor,
            2 => TypeReferenceKind::DirectObjCClassName,
            _ => TypeReferenceKind::IndirectObjCClass,
        }
    }

    pub fn is_retroactive(self) -> bool {
        self.0 & (1 << 6) != 0
    }

    pub fn is_synthesized_non_unique(self) -> bool {
        self.0 & (1 << 7) != 0
    }

    pub fn conditional_requirement_count(self) -> usize {
        ((self.0 >> 8) & 0xff) as usize
    }

    pub fn has_resilient_witnesses(self) -> bool {
        self.0 & (1 << 16) != 0
    }

    pub fn has_generic_witness_table(self) -> bool {
        self.0 & (1 << 17) != 0
    }
}

/// One entry of the resilient-witness section: the requirement it
/// implements (indirectability bit already stripped) and the mangled name
/// of the associated requirement symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct ResilientWitness {
    pub requirement: *const c_void,
    pub mangled_name: String,
}

/// A protocol conformance descriptor record, linking a (type, protocol)
/// pair to a witness table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolConformanceDescriptor {
    handle: *const c_void,
}

unsafe impl Send for ProtocolConformanceDescriptor {}
unsafe impl Sync for ProtocolConformanceDescriptor {}

impl ProtocolConformanceDescriptor {
    /// Wrap a conformance descriptor handle, rejecting null.
    pub fn new(handle: *const c_void) -> Result<Self> {
        if handle.is_null() {
            return Err(Error::Validation("null conformance descriptor".into()));
        }
        Ok(ProtocolConformanceDescriptor { handle })
    }

    pub fn handle(&self) -> *const c_void {
        self.handle
    }

    /// The protocol this conformance is for.
    pub fn protocol_descriptor(&self) -> Result<NominalTypeDescriptor> {
        let mut cur = Cursor::new(self.handle)?;
        NominalTypeDescriptor::new(cur.read_relative_indirect_pointer())
    }

    /// The conforming type's descriptor. Indirection follows the flag
    /// word's type-reference kind.
    pub fn implementing_type_descriptor(&self) -> Result<NominalTypeDescriptor> {
        let mut cur = Cursor::new(self.handle)?.offset(WORD);
        let target = match self.flags()?.type_reference_kind() {
            TypeReferenceKind::DirectTypeDescriptor => cur.read_relative_pointer(),
            TypeReferenceKind::IndirectTypeDescriptor => cur.read_relative_indirect_pointer(),
            kind => {
                return Err(Error::Validation(format!(
                    "conformance references its type as {kind:?}, not a type descriptor"
                )))
            }
        };
        NominalTypeDescriptor::new(target)
    }

    /// The conformance's witness table pattern.
    pub fn witness_table(&self) -> Result<*const c_void> {
        let mut cur = Cursor::new(self.handle)?.offset(2 * WORD);
        Ok(cur.read_relative_pointer())
    }

    pub fn flags(&self) -> Result<ConformanceFlags> {
        let mut cur = Cursor::new(self.handle)?.offset(3 * WORD);
        Ok(ConformanceFlags(cur.read_u32()))
    }

    /// Walk the resilient-witness section in memory order. Empty when the
    /// flags word does not announce one.
    pub fn resilient_witnesses(&self) -> Result<Vec<ResilientWitness>> {
        let flags = self.flags()?;
        if !flags.has_resilient_witnesses() {
            return Ok(Vec::new());
        }

        let mut cur = Cursor::new(self.handle)?.offset(TRAILING_OFFSET);
        if flags.is_retroactive() {
            cur.skip(WORD);
        }
        cur.skip(flags.conditional_requirement_count() * CONDITIONAL_REQUIREMENT_SIZE);

        let count = cur.read_u32() as usize;
        let mut witnesses = Vec::with_capacity(count);
        for _ in 0..count {
            let requirement = cur.read_relative_indirect_pointer();
            let name_ptr = read_masked_relative_pointer(&mut cur);
            if name_ptr.is_null() {
                return Err(Error::Validation(
                    "resilient witness entry has a null requirement name".into(),
                ));
            }
            // Safety: the masked relative pointer addresses a
            // NUL-terminated mangled name emitted by the foreign compiler.
            let mangled_name = unsafe {
                String::from_utf8_lossy(CStr::from_ptr(name_ptr as *const libc::c_char).to_bytes())
                    .into_owned()
            };
            witnesses.push(ResilientWitness {
                requirement,
                mangled_name,
            });
        }
        // A generic witness table section may follow; it is parsed past but
        // never consumed.
        Ok(witnesses)
    }
}

/// Resolve a relative pointer whose low bit is a flag to be masked off
/// before resolving, not an indirection request.
fn read_masked_relative_pointer(cur: &mut Cursor) -> *const c_void {
    let field = cur.address() as *const u8;
    let raw = cur.read_i32();
    if raw == 0 {
        return std::ptr::null();
    }
    unsafe { field.offset((raw & !1) as isize) as *const c_void }
}
