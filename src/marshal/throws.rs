//! The exception-record protocol for fallible foreign calls.
//!
//! A fallible foreign call returns a fixed 3-slot record: the result (or
//! undefined), an aligned error-handle slot (or undefined), and a trailing
//! has-error flag byte. Exactly one of result and error is valid, and the
//! flag byte says which; reading the wrong slot yields garbage, so the
//! flag is always checked first. Offsets derive from the result type's own
//! size and alignment.

use std::ffi::c_void;

use crate::error::{Error, Result};
use crate::value::{ForeignError, ManagedType, Value};

use super::tuple::{TupleMap, TypeLayout};
use super::ValueMarshaler;

/// Layout of one fallible-call return record.
#[derive(Debug, Clone)]
pub struct ExceptionRecord {
    result_type: ManagedType,
    result_offset: usize,
    error_offset: usize,
    flag_offset: usize,
    stride: usize,
}

impl ExceptionRecord {
    pub fn result_type(&self) -> &ManagedType {
        &self.result_type
    }

    pub fn result_offset(&self) -> usize {
        self.result_offset
    }

    pub fn error_offset(&self) -> usize {
        self.error_offset
    }

    pub fn flag_offset(&self) -> usize {
        self.flag_offset
    }

    /// Total byte stride of the record; callers size the return buffer
    /// with this.
    pub fn stride(&self) -> usize {
        self.stride
    }
}

impl ValueMarshaler {
    /// Compute the record layout for a call returning `result`: result
    /// slot first, then the error-handle word at its alignment, then the
    /// flag byte at the next boundary.
    pub fn exception_record(&self, result: &ManagedType) -> Result<ExceptionRecord> {
        let word = std::mem::size_of::<usize>();
        let layout = self.layout_of(result)?;
        let map = TupleMap::from_layouts(
            vec![result.clone(), ManagedType::UInt, ManagedType::UInt8],
            &[layout, TypeLayout::new(word, word), TypeLayout::new(1, 1)],
        );
        Ok(ExceptionRecord {
            result_type: result.clone(),
            result_offset: map.offsets()[0],
            error_offset: map.offsets()[1],
            flag_offset: map.offsets()[2],
            stride: map.stride(),
        })
    }

    /// Whether the record's flag marks the error slot as the valid one.
    pub fn contains_error(&self, record: &ExceptionRecord, base: *const u8) -> bool {
        if base.is_null() {
            return false;
        }
        // Safety: base addresses a record of this layout.
        unsafe { base.add(record.flag_offset).read() != 0 }
    }

    /// Read the record after a foreign call: a clear flag yields the
    /// result slot (retaining a class result not already owned); a set
    /// flag raises the foreign error with its description captured.
    pub fn extract_result(&self, record: &ExceptionRecord, base: *const u8) -> Result<Value> {
        if base.is_null() {
            return Err(Error::Validation("null exception record".into()));
        }
        if self.contains_error(record, base) {
            // Safety: the flag says the error slot is the valid one.
            let handle = unsafe {
                (base.add(record.error_offset) as *const *mut c_void).read_unaligned()
            };
            let description = self.runtime().error_description(handle);
            return Err(Error::ForeignException {
                handle: handle as usize,
                description,
            });
        }
        self.to_managed(
            // Safety: the flag says the result slot is the valid one.
            unsafe { base.add(record.result_offset) },
            &record.result_type,
            false,
        )
    }

    /// Mark the record as failed with the given error. Used when a managed
    /// callable wrapped as a foreign closure raises.
    pub fn set_error(&self, record: &ExceptionRecord, base: *mut u8, error: &ForeignError) {
        if base.is_null() {
            return;
        }
        // Safety: base addresses a writable record of this layout.
        unsafe {
            (base.add(record.error_offset) as *mut usize).write_unaligned(error.handle());
            base.add(record.flag_offset).write(1);
        }
    }

    /// Mark the record as succeeded, writing the result slot when a value
    /// is given.
    pub fn set_success(
        &self,
        record: &ExceptionRecord,
        base: *mut u8,
        value: Option<&Value>,
    ) -> Result<()> {
        if base.is_null() {
            return Err(Error::Validation("null exception record".into()));
        }
        if let Some(value) = value {
            // Safety: result slot offset per the record layout.
            self.to_foreign(&record.result_type, value, unsafe {
                base.add(record.result_offset)
            })?;
        }
        // Safety: flag byte offset per the record layout.
        unsafe { base.add(record.flag_offset).write(0) };
        Ok(())
    }
}
