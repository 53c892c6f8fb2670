//! Foreign metadata introspection.
//!
//! The foreign compiler emits binary metadata records for every type:
//! metatypes, value witness tables, nominal type descriptors, and protocol
//! conformance descriptors. This module parses those records directly from
//! process memory, relative pointers and all, so the bridge can learn a
//! type's layout and operations without the foreign compiler's help.

mod conformance;
mod nominal;
pub mod reader;
mod witness;


pub use conformance::{ConformanceFlags, ProtocolConformanceDescriptor, ResilientWitness, TypeReferenceKind};
pub use nominal::{AssociatedTypeDescriptor, NominalTypeDescriptor, NominalTypeKind, ProtocolRequirementKind};
pub use reader::MetadataReader;
pub use witness::{DestroyFn, InitFn, ValueWitnessTable};

use std::ffi::c_void;

use crate::cursor::Cursor;
use crate::error::{Error, Result};

/// Kind values stored in a metatype's discriminator word. Predefined kinds
/// never exceed 0x7ff; any larger value is an isa pointer, i.e. a class.
const MAX_DISCRIMINATOR: usize = 0x7ff;

/// Kind of a foreign metatype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetatypeKind {
    Class,
    Struct,
    Enum,
    Optional,
    ForeignClass,
    Opaque,
    Tuple,
    Function,
    Existential,
    Metatype,
    ObjCClassWrapper,
    ExistentialMetatype,
    HeapLocalVariable,
    HeapGenericLocalVariable,
    ErrorObject,
}

/// Opaque address identifying a foreign type.
///
/// Equality is by identity. The handle is never owned: it is a weak
/// reference into process memory that stays valid for the program's
/// lifetime.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Metatype {
    handle: *const c_void,
}

// Metatype handles address immutable process-lifetime metadata.
unsafe impl Send for Metatype {}
unsafe impl Sync for Metatype {}

impl Metatype {
    /// Wrap a metatype handle, rejecting null.
    pub fn new(handle: *const c_void) -> Result<Self> {
        if handle.is_null() {
            return Err(Error::Validation("null metatype handle".into()));
        }
        Ok(Metatype { handle })
    }

    /// Wrap a handle that is already known to be valid.
    pub(crate) fn from_raw(handle: *const c_void) -> Self {
        Metatype { handle }
    }

    pub fn handle(&self) -> *const c_void {
        self.handle
    }

    pub fn is_valid(&self) -> bool {
        !self.handle.is_null()
    }

    /// Read the discriminator word and classify this metatype.
    pub fn kind(&self) -> Result<MetatypeKind> {
        let mut cur = Cursor::new(self.handle)?;
        let discriminator = cur.read_word();
        if discriminator > MAX_DISCRIMINATOR {
            return Ok(MetatypeKind::Class);
        }
        // Composed from the foreign ABI's flag bits: 0x100 runtime-private,
        // 0x200 non-heap, 0x400 non-type.
        match discriminator {
            0x200 => Ok(MetatypeKind::Struct),
            0x201 => Ok(MetatypeKind::Enum),
            0x202 => Ok(MetatypeKind::Optional),
            0x203 => Ok(MetatypeKind::ForeignClass),
            0x300 => Ok(MetatypeKind::Opaque),
            0x301 => Ok(MetatypeKind::Tuple),
            0x302 => Ok(MetatypeKind::Function),
            0x303 => Ok(MetatypeKind::Existential),
            0x304 => Ok(MetatypeKind::Metatype),
            0x305 => Ok(MetatypeKind::ObjCClassWrapper),
            0x306 => Ok(MetatypeKind::ExistentialMetatype),
            0x400 => Ok(MetatypeKind::HeapLocalVariable),
            0x500 => Ok(MetatypeKind::HeapGenericLocalVariable),
            0x501 => Ok(MetatypeKind::ErrorObject),
            other => Err(Error::Validation(format!(
                "unrecognized metatype discriminator {other:#x}"
            ))),
        }
    }

    /// The nominal type descriptor behind this metatype. Struct and enum
    /// metadata store it one word in; class metadata stores it in the
    /// descriptor slot of the full class record.
    pub fn nominal_descriptor(&self) -> Result<NominalTypeDescriptor> {
        let word = std::mem::size_of::<usize>();
        match self.kind()? {
            MetatypeKind::Struct | MetatypeKind::Enum | MetatypeKind::Optional => {
                let mut cur = Cursor::new(self.handle)?.offset(word);
                NominalTypeDescriptor::new(cur.read_pointer())
            }
            MetatypeKind::Class => {
                let slot = if word == 8 { 8 } else { 11 };
                let mut cur = Cursor::new(self.handle)?.offset(slot * word);
                NominalTypeDescriptor::new(cur.read_pointer())
            }
            kind => Err(Error::Validation(format!(
                "metatype of kind {kind:?} has no nominal type descriptor"
            ))),
        }
    }

    /// A readable name for diagnostics: the descriptor's dotted full name
    /// when one exists, otherwise the kind.
    pub fn describe(&self) -> String {
        if let Ok(desc) = self.nominal_descriptor() {
            if let Ok(name) = desc.full_name() {
                return name;
            }
        }
        match self.kind() {
            Ok(kind) => format!("metatype of kind {kind:?}"),
            Err(_) => format!("metatype at {:p}", self.handle),
        }
    }
}
