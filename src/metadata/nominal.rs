//! Nominal type descriptor reader.
//!
//! Record layout, in 4-byte words from the descriptor handle:
//!
//! ```text
//! 0  flags            kind in bits 0-4, unique 0x40, generic 0x80, version in byte 1
//! 1  parent           relative pointer, 0 = no parent
//! 2  name             relative pointer to NUL-terminated UTF-8
//! 3  access function  relative pointer
//! 4  field descriptor relative pointer
//! -- struct/enum --            -- class --              -- protocol --
//! 5  num fields                super class              num requirements in signature (word 3)
//! 6  field offset vector       metadata bounds          requirements base descriptor (word 4)
//! 7+                           ...                      generic requirements, assoc. type descriptors
//! ```
//!
//! Names and parents are decoded lazily by following the relative pointers;
//! nothing is read until asked for.

use std::ffi::c_void;

use crate::cursor::Cursor;
use crate::error::{Error, Result};

const WORD: usize = 4;

const FLAGS_OFFSET: usize = 0;
const PARENT_OFFSET: usize = WORD;
const NAME_OFFSET: usize = 2 * WORD;
const NUM_VALUE_FIELDS_OFFSET: usize = 5 * WORD;
const NUM_CLASS_FIELDS_OFFSET: usize = 9 * WORD;

// Protocol descriptor trailer.
const NUM_REQUIREMENTS_IN_SIGNATURE_OFFSET: usize = 3 * WORD;
const REQUIREMENTS_BASE_OFFSET: usize = 4 * WORD;
const GENERIC_REQUIREMENTS_OFFSET: usize = 6 * WORD;
const GENERIC_REQUIREMENT_SIZE: usize = 3 * WORD;
const ASSOCIATED_TYPE_DESCRIPTOR_SIZE: usize = 2 * WORD;

/// Kind bits of a descriptor's flags word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NominalTypeKind {
    Module,
    Extension,
    Anonymous,
    Protocol,
    Class,
    Struct,
    Enum,
}

/// Kind of a protocol requirement slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolRequirementKind {
    BaseProtocol,
    Method,
    Init,
    Getter,
    Setter,
    ReadCoroutine,
    ModifyCoroutine,
    AssociatedTypeAccessFunction,
    AssociatedConformanceAccessFunction,
}

/// A nominal type descriptor record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NominalTypeDescriptor {
    handle: *const c_void,
}

unsafe impl Send for NominalTypeDescriptor {}
unsafe impl Sync for NominalTypeDescriptor {}

impl NominalTypeDescriptor {
    /// Wrap a descriptor handle, rejecting null.
    pub fn new(handle: *const c_void) -> Result<Self> {
        if handle.is_null() {
            return Err(Error::Validation("null nominal type descriptor".into()));
        }
        Ok(NominalTypeDescriptor { handle })
    }

    pub fn handle(&self) -> *const c_void {
        self.handle
    }

    fn flags(&self) -> Result<u32> {
        let mut cur = Cursor::new(self.handle)?.offset(FLAGS_OFFSET);
        Ok(cur.read_u32())
    }

    /// Kind from the low 5 bits of the flags word.
    pub fn kind(&self) -> Result<NominalTypeKind> {
        match self.flags()? & 0x1f {
            0 => Ok(NominalTypeKind::Module),
            1 => Ok(NominalTypeKind::Extension),
            2 => Ok(NominalTypeKind::Anonymous),
            3 => Ok(NominalTypeKind::Protocol),
            16 => Ok(NominalTypeKind::Class),
            17 => Ok(NominalTypeKind::Struct),
            18 => Ok(NominalTypeKind::Enum),
            other => Err(Error::Validation(format!(
                "unrecognized nominal descriptor kind {other}"
            ))),
        }
    }

    pub fn is_generic(&self) -> Result<bool> {
        Ok(self.flags()? & 0x80 != 0)
    }

    pub fn is_unique(&self) -> Result<bool> {
        Ok(self.flags()? & 0x40 != 0)
    }

    /// Version byte of the flags word.
    pub fn version(&self) -> Result<u8> {
        Ok((self.flags()? >> 8) as u8)
    }

    /// The type's own name, without parent context.
    pub fn name(&self) -> Result<String> {
        let mut cur = Cursor::new(self.handle)?.offset(NAME_OFFSET);
        cur.read_relative_string()
    }

    /// Dotted name with every enclosing context, outermost first. Parents
    /// of module kind contribute no segment, so a top-level type's full
    /// name equals its own name.
    pub fn full_name(&self) -> Result<String> {
        let mut segments = vec![self.name()?];
        let mut parent = self.parent()?;
        while let Some(desc) = parent {
            if desc.kind()? != NominalTypeKind::Module {
                segments.push(desc.name()?);
            }
            parent = desc.parent()?;
        }
        segments.reverse();
        Ok(segments.join("."))
    }

    /// The enclosing context descriptor, or `None` for a zero parent link.
    pub fn parent(&self) -> Result<Option<NominalTypeDescriptor>> {
        let mut cur = Cursor::new(self.handle)?.offset(PARENT_OFFSET);
        let target = cur.read_relative_pointer();
        if target.is_null() {
            Ok(None)
        } else {
            Ok(Some(NominalTypeDescriptor { handle: target }))
        }
    }

    /// Stored field count. Structs and classes only.
    pub fn field_count(&self) -> Result<u32> {
        let offset = match self.kind()? {
            NominalTypeKind::Struct => NUM_VALUE_FIELDS_OFFSET,
            NominalTypeKind::Class => NUM_CLASS_FIELDS_OFFSET,
            kind => {
                return Err(Error::Validation(format!(
                    "descriptor of kind {kind:?} has no field count"
                )))
            }
        };
        let mut cur = Cursor::new(self.handle)?.offset(offset);
        Ok(cur.read_u32())
    }

    fn require_protocol(&self) -> Result<()> {
        if self.kind()? != NominalTypeKind::Protocol {
            return Err(Error::Validation(
                "associated-type queries require a protocol descriptor".into(),
            ));
        }
        Ok(())
    }

    /// Address of the protocol's requirements base descriptor, used as the
    /// anchor of associated-type metadata requests.
    pub fn requirements_base_descriptor(&self) -> Result<*const c_void> {
        self.require_protocol()?;
        Ok(Cursor::new(self.handle)?
            .offset(REQUIREMENTS_BASE_OFFSET)
            .address())
    }

    /// Number of requirement slots in this protocol's base descriptor.
    pub fn requirement_count(&self) -> Result<u32> {
        self.require_protocol()?;
        let mut cur = Cursor::new(self.handle)?.offset(REQUIREMENTS_BASE_OFFSET);
        Ok(cur.read_u32())
    }

    /// The protocol's requirement slots start after the generic
    /// requirements of its signature.
    pub fn requirement_descriptor(&self, index: u32) -> Result<AssociatedTypeDescriptor> {
        self.require_protocol()?;
        if index >= self.requirement_count()? {
            return Err(Error::Validation(format!(
                "requirement index {index} out of range"
            )));
        }
        let mut cur = Cursor::new(self.handle)?.offset(NUM_REQUIREMENTS_IN_SIGNATURE_OFFSET);
        let signature_count = cur.read_u32() as usize;
        let base = GENERIC_REQUIREMENTS_OFFSET
            + signature_count * GENERIC_REQUIREMENT_SIZE
            + index as usize * ASSOCIATED_TYPE_DESCRIPTOR_SIZE;
        AssociatedTypeDescriptor::new(Cursor::new(self.handle)?.offset(base).address())
    }
}

/// One requirement slot of a protocol descriptor. Associated-type queries
/// care only about slots of kind
/// [`ProtocolRequirementKind::AssociatedTypeAccessFunction`].
#[derive(Debug, Clone, Copy)]
pub struct AssociatedTypeDescriptor {
    handle: *const c_void,
}

unsafe impl Send for AssociatedTypeDescriptor {}
unsafe impl Sync for AssociatedTypeDescriptor {}

impl AssociatedTypeDescriptor {
    pub fn new(handle: *const c_void) -> Result<Self> {
        if handle.is_null() {
            return Err(Error::Validation("null associated type descriptor".into()));
        }
        Ok(AssociatedTypeDescriptor { handle })
    }

    pub fn handle(&self) -> *const c_void {
        self.handle
    }

    pub fn kind(&self) -> Result<ProtocolRequirementKind> {
        let mut cur = Cursor::new(self.handle)?;
        match cur.read_u32() & 0xf {
            0 => Ok(ProtocolRequirementKind::BaseProtocol),
            1 => Ok(ProtocolRequirementKind::Method),
            2 => Ok(ProtocolRequirementKind::Init),
            3 => Ok(ProtocolRequirementKind::Getter),
            4 => Ok(ProtocolRequirementKind::Setter),
            5 => Ok(ProtocolRequirementKind::ReadCoroutine),
            6 => Ok(ProtocolRequirementKind::ModifyCoroutine),
            7 => Ok(ProtocolRequirementKind::AssociatedTypeAccessFunction),
            8 => Ok(ProtocolRequirementKind::AssociatedConformanceAccessFunction),
            other => Err(Error::Validation(format!(
                "unrecognized protocol requirement kind {other}"
            ))),
        }
    }

    pub fn is_instance(&self) -> Result<bool> {
        let mut cur = Cursor::new(self.handle)?;
        Ok(cur.read_u32() & 0x10 != 0)
    }

    /// Relative pointer to the default implementation, null when absent.
    pub fn default_implementation(&self) -> Result<*const c_void> {
        let mut cur = Cursor::new(self.handle)?.offset(WORD);
        Ok(cur.read_relative_pointer())
    }
}
