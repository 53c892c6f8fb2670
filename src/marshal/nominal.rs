//! Nominal value lifetime management.
//!
//! A nominal (struct/enum) value's layout is only known through its witness
//! table, so every copy and destroy goes through the table's function
//! slots. [`NominalValue`] owns one independent foreign-ABI copy of such a
//! value and destroys it exactly once when dropped.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::metadata::{Metatype, ValueWitnessTable};

/// Managed owner of a byte buffer holding an independent foreign-ABI copy
/// of a nominal value.
pub struct NominalValue {
    type_name: String,
    metatype: Metatype,
    witness: Arc<ValueWitnessTable>,
    bytes: Vec<u8>,
}

impl NominalValue {
    pub(crate) fn from_parts(
        type_name: String,
        metatype: Metatype,
        witness: Arc<ValueWitnessTable>,
        bytes: Vec<u8>,
    ) -> Self {
        debug_assert!(bytes.len() >= witness.stride());
        NominalValue {
            type_name,
            metatype,
            witness,
            bytes,
        }
    }

    /// The registered type identifier this value belongs to.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn metatype(&self) -> Metatype {
        self.metatype
    }

    pub fn witness(&self) -> &Arc<ValueWitnessTable> {
        &self.witness
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.bytes.as_ptr()
    }
}

impl Drop for NominalValue {
    fn drop(&mut self) {
        match self.witness.destroy_fn() {
            // Safety: the buffer holds a live value of the witness table's
            // type and is destroyed exactly once, here.
            Ok(destroy) => unsafe { destroy(self.bytes.as_mut_ptr(), self.metatype.handle()) },
            Err(e) => log::warn!("leaking {}: {e}", self.type_name),
        }
    }
}

impl Clone for NominalValue {
    fn clone(&self) -> Self {
        let mut bytes = vec![0u8; self.bytes.len()];
        match self.witness.init_with_copy_fn() {
            // Safety: source holds a live value; dest has at least stride
            // bytes.
            Ok(copy) => unsafe {
                copy(bytes.as_mut_ptr(), self.bytes.as_ptr(), self.metatype.handle());
            },
            Err(e) => {
                log::warn!("bitwise-cloning {}: {e}", self.type_name);
                bytes.copy_from_slice(&self.bytes);
            }
        }
        NominalValue {
            type_name: self.type_name.clone(),
            metatype: self.metatype,
            witness: Arc::clone(&self.witness),
            bytes,
        }
    }
}

impl PartialEq for NominalValue {
    fn eq(&self, other: &Self) -> bool {
        self.type_name == other.type_name && self.bytes == other.bytes
    }
}

impl std::fmt::Debug for NominalValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NominalValue({}, {} bytes)", self.type_name, self.bytes.len())
    }
}

/// Copy-in / retain-in-place / destroy for witness-table-managed buffers.
///
/// All three enforce buffer-length checks explicitly: an undersized buffer
/// is an error, never undefined behavior.
#[derive(Debug, Default)]
pub struct NominalLifetimeManager;

impl NominalLifetimeManager {
    pub fn new() -> Self {
        NominalLifetimeManager
    }

    fn check_len(witness: &ValueWitnessTable, len: usize, op: &str) -> Result<()> {
        if len < witness.stride() {
            return Err(Error::Validation(format!(
                "{op} buffer of {len} bytes is smaller than the value stride {}",
                witness.stride()
            )));
        }
        Ok(())
    }

    /// Produce an independent foreign-owned copy of the value at `source`.
    /// The source buffer is never aliased afterward.
    pub fn copy_in(
        &self,
        type_name: &str,
        metatype: Metatype,
        witness: &Arc<ValueWitnessTable>,
        source: *const u8,
        source_len: usize,
    ) -> Result<NominalValue> {
        Self::check_len(witness, source_len, "copy-in source")?;
        if source.is_null() {
            return Err(Error::Validation("copy-in from a null buffer".into()));
        }
        let mut bytes = vec![0u8; witness.stride()];
        let copy = witness.init_with_copy_fn()?;
        // Safety: source holds a live value of this type with at least
        // stride readable bytes; dest is freshly allocated at stride.
        unsafe { copy(bytes.as_mut_ptr(), source, metatype.handle()) };
        Ok(NominalValue::from_parts(
            type_name.to_string(),
            metatype,
            Arc::clone(witness),
            bytes,
        ))
    }

    /// Bump the foreign reference counts held inside `buffer` without
    /// relocating the value: copy into scratch through the witness table,
    /// then write the scratch bytes back over the original.
    pub fn retain_in_place(
        &self,
        metatype: Metatype,
        witness: &ValueWitnessTable,
        buffer: *mut u8,
        len: usize,
    ) -> Result<()> {
        Self::check_len(witness, len, "retain-in-place")?;
        if buffer.is_null() {
            return Err(Error::Validation("retain-in-place on a null buffer".into()));
        }
        let mut scratch = vec![0u8; witness.stride()];
        let copy = witness.init_with_copy_fn()?;
        // Safety: buffer holds a live value with at least stride bytes;
        // scratch is freshly allocated at stride.
        unsafe {
            copy(scratch.as_mut_ptr(), buffer as *const u8, metatype.handle());
            std::ptr::copy_nonoverlapping(scratch.as_ptr(), buffer, witness.stride());
        }
        Ok(())
    }

    /// Invoke the witness table's destroy slot on `buffer`.
    pub fn destroy(
        &self,
        metatype: Metatype,
        witness: &ValueWitnessTable,
        buffer: *mut u8,
        len: usize,
    ) -> Result<()> {
        Self::check_len(witness, len, "destroy")?;
        if buffer.is_null() {
            return Err(Error::Validation("destroy of a null buffer".into()));
        }
        let destroy = witness.destroy_fn()?;
        // Safety: buffer holds a live value of this type; the caller hands
        // over ownership and must not reuse the value afterward.
        unsafe { destroy(buffer, metatype.handle()) };
        Ok(())
    }
}
