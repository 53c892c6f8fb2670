//! In-process stand-ins for the foreign runtime, shared by the unit tests.
//!
//! The stub entry-point table implements retain/release over a local
//! refcount map, fabricates metatype handles from leaked allocations, and
//! answers the glue contracts with fixed behavior. Tests that need a
//! specific entry override the field before building the runtime, or
//! install stub glue symbols by name.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::metadata::{Metatype, ValueWitnessTable};
use crate::runtime::{ForeignRuntime, RuntimeEntryPoints};

static REFCOUNTS: Lazy<Mutex<HashMap<usize, isize>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Allocate a fake foreign object with refcount 1.
pub(crate) fn new_object() -> *mut c_void {
    let handle = Box::into_raw(Box::new(0u64)) as *mut c_void;
    REFCOUNTS.lock().insert(handle as usize, 1);
    handle
}

pub(crate) fn refcount(handle: *mut c_void) -> isize {
    REFCOUNTS.lock().get(&(handle as usize)).copied().unwrap_or(0)
}

/// A fake metatype handle: a leaked word block whose discriminator marks a
/// struct.
pub(crate) fn fake_metatype() -> Metatype {
    let block: &'static mut [usize; 4] = Box::leak(Box::new([0x200, 0, 0, 0]));
    Metatype::new(block.as_ptr() as *const c_void).unwrap()
}

unsafe extern "C" fn stub_retain(handle: *mut c_void) -> *mut c_void {
    if !handle.is_null() {
        *REFCOUNTS.lock().entry(handle as usize).or_insert(0) += 1;
    }
    handle
}

unsafe extern "C" fn stub_release(handle: *mut c_void) {
    if !handle.is_null() {
        *REFCOUNTS.lock().entry(handle as usize).or_insert(0) -= 1;
    }
}

unsafe extern "C" fn stub_retain_count(handle: *mut c_void) -> isize {
    refcount(handle)
}

unsafe extern "C" fn stub_tuple_metatype(_count: usize, _elements: *const Metatype) -> *const c_void {
    fake_metatype().handle()
}

unsafe extern "C" fn stub_function_metatype(
    _count: usize,
    _params: *const Metatype,
    _flags: *const u32,
    _result: Metatype,
    _throws: bool,
) -> *const c_void {
    fake_metatype().handle()
}

unsafe extern "C" fn stub_any_protocol_metatype() -> *const c_void {
    static FIXED: Lazy<usize> = Lazy::new(|| fake_metatype().handle() as usize);
    *FIXED as *const c_void
}

unsafe extern "C" fn stub_error_metatype() -> *const c_void {
    static FIXED: Lazy<usize> = Lazy::new(|| fake_metatype().handle() as usize);
    *FIXED as *const c_void
}

unsafe extern "C" fn stub_no_conformance(_metatype: Metatype, _protocol: *const c_void) -> *const c_void {
    std::ptr::null()
}

unsafe extern "C" fn stub_no_associated_type(
    _conforming: Metatype,
    _witness: *const c_void,
    _base: *const c_void,
    _requirement: *const c_void,
) -> *const c_void {
    std::ptr::null()
}

unsafe extern "C" fn stub_error_description(
    _handle: *mut c_void,
    buf: *mut u8,
    cap: usize,
) -> usize {
    let text = b"stub error";
    let n = text.len().min(cap);
    std::ptr::copy_nonoverlapping(text.as_ptr(), buf, n);
    text.len()
}

/// Treats the container's first data word as the inline payload.
unsafe extern "C" fn stub_existential_payload(container: *const u8, dest: *mut u8, _mt: Metatype) {
    std::ptr::copy_nonoverlapping(container, dest, std::mem::size_of::<usize>());
}

/// The default stub table. Override fields before building for
/// test-specific behavior.
pub(crate) fn stub_entry_points() -> RuntimeEntryPoints {
    RuntimeEntryPoints {
        retain: stub_retain,
        release: stub_release,
        retain_count: stub_retain_count,
        tuple_metatype: stub_tuple_metatype,
        function_metatype: stub_function_metatype,
        any_protocol_metatype: stub_any_protocol_metatype,
        error_metatype: stub_error_metatype,
        conforms_to_protocol: stub_no_conformance,
        associated_type_metadata: stub_no_associated_type,
        error_description: stub_error_description,
        existential_payload: stub_existential_payload,
    }
}

pub(crate) fn stub_runtime() -> Arc<ForeignRuntime> {
    ForeignRuntime::from_entry_points(stub_entry_points())
}

// A synthetic witness table for a 16-byte nominal value whose first word is
// a refcounted test-object handle. Copy bumps that handle's count, destroy
// drops it.

pub(crate) const STUB_NOMINAL_STRIDE: usize = 16;

unsafe extern "C" fn stub_init_with_copy(
    dest: *mut u8,
    src: *const u8,
    _metatype: *const c_void,
) -> *mut u8 {
    std::ptr::copy_nonoverlapping(src, dest, STUB_NOMINAL_STRIDE);
    let handle = (src as *const usize).read_unaligned() as *mut c_void;
    stub_retain(handle);
    dest
}

unsafe extern "C" fn stub_init_with_take(
    dest: *mut u8,
    src: *const u8,
    _metatype: *const c_void,
) -> *mut u8 {
    std::ptr::copy_nonoverlapping(src, dest, STUB_NOMINAL_STRIDE);
    dest
}

unsafe extern "C" fn stub_destroy(buffer: *mut u8, _metatype: *const c_void) {
    let handle = (buffer as *const usize).read_unaligned() as *mut c_void;
    stub_release(handle);
}

/// Build the synthetic witness table block and parse it. The block is
/// leaked: witness tables are process-lifetime records.
pub(crate) fn stub_witness_table() -> Arc<ValueWitnessTable> {
    let word = std::mem::size_of::<usize>();
    let mut block = Vec::with_capacity(word * 10 + 8);
    let slots: [usize; 8] = [
        stub_init_with_copy as usize, // initializeBufferWithCopyOfBuffer
        stub_destroy as usize,
        stub_init_with_copy as usize,
        stub_init_with_copy as usize, // assignWithCopy
        stub_init_with_take as usize,
        stub_init_with_take as usize, // assignWithTake
        0,
        0,
    ];
    for slot in slots {
        block.extend_from_slice(&slot.to_ne_bytes());
    }
    block.extend_from_slice(&STUB_NOMINAL_STRIDE.to_ne_bytes()); // size
    block.extend_from_slice(&STUB_NOMINAL_STRIDE.to_ne_bytes()); // stride
    block.extend_from_slice(&7u32.to_ne_bytes()); // flags: align mask 7
    block.extend_from_slice(&0u32.to_ne_bytes()); // extra inhabitants
    let leaked: &'static [u8] = Box::leak(block.into_boxed_slice());
    Arc::new(ValueWitnessTable::from_memory(leaked.as_ptr() as *const c_void).unwrap())
}
