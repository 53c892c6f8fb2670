//! Foreign runtime entry points.
//!
//! The crate links nothing at build time: every foreign function it calls
//! (retain/release, the metatype constructors, conformance and
//! associated-type metadata requests, the closure thunks) is resolved at
//! run time from the foreign core library plus a shipped glue library and
//! held here as a typed function pointer.
//!
//! Hosts that statically link the glue can instead supply the table through
//! [`ForeignRuntime::from_entry_points`] and
//! [`ForeignRuntime::install_glue_symbol`]; the unit tests drive the whole
//! marshaling stack through that path with in-process stubs.

use std::collections::HashMap;
use std::ffi::c_void;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::dylib::{Library, OpenMode};
use crate::error::{Error, Result};
use crate::metadata::Metatype;

/// `swift_retain` shape: returns its argument.
pub type RetainFn = unsafe extern "C" fn(*mut c_void) -> *mut c_void;
/// `swift_release` shape.
pub type ReleaseFn = unsafe extern "C" fn(*mut c_void);
/// `swift_retainCount` shape.
pub type RetainCountFn = unsafe extern "C" fn(*mut c_void) -> isize;
/// Tuple metatype constructor: `(count, elements) -> metatype`.
pub type TupleMetatypeFn = unsafe extern "C" fn(usize, *const Metatype) -> *const c_void;
/// Function metatype constructor:
/// `(count, params, param_flags, result, throws) -> metatype`.
pub type FunctionMetatypeFn =
    unsafe extern "C" fn(usize, *const Metatype, *const u32, Metatype, bool) -> *const c_void;
/// Zero-argument metatype accessor (any-protocol existential, error type,
/// registered class accessors).
pub type MetatypeAccessorFn = unsafe extern "C" fn() -> *const c_void;
/// Conformance query: `(metatype, protocol descriptor) -> witness table or
/// null`.
pub type ConformsFn = unsafe extern "C" fn(Metatype, *const c_void) -> *const c_void;
/// Associated-type metadata request:
/// `(conforming metatype, witness table, requirements base, requirement
/// slot) -> metatype`.
pub type AssociatedTypeFn =
    unsafe extern "C" fn(Metatype, *const c_void, *const c_void, *const c_void) -> *const c_void;
/// Error description copy-out: `(error handle, buffer, capacity) -> length`.
pub type ErrorDescriptionFn = unsafe extern "C" fn(*mut c_void, *mut u8, usize) -> usize;
/// Existential payload projection: `(container, dest, payload metatype)`.
pub type ExistentialPayloadFn = unsafe extern "C" fn(*const u8, *mut u8, Metatype);

/// The resolved entry-point table handed to
/// [`ForeignRuntime::from_entry_points`].
pub struct RuntimeEntryPoints {
    pub retain: RetainFn,
    pub release: ReleaseFn,
    pub retain_count: RetainCountFn,
    pub tuple_metatype: TupleMetatypeFn,
    pub function_metatype: FunctionMetatypeFn,
    pub any_protocol_metatype: MetatypeAccessorFn,
    pub error_metatype: MetatypeAccessorFn,
    pub conforms_to_protocol: ConformsFn,
    pub associated_type_metadata: AssociatedTypeFn,
    pub error_description: ErrorDescriptionFn,
    pub existential_payload: ExistentialPayloadFn,
}

const CORE_RETAIN: &str = "swift_retain";
const CORE_RELEASE: &str = "swift_release";
const CORE_RETAIN_COUNT: &str = "swift_retainCount";

const GLUE_TUPLE_METATYPE: &str = "swiftabi_tupleTypeMetadata";
const GLUE_FUNCTION_METATYPE: &str = "swiftabi_functionTypeMetadata";
const GLUE_ANY_PROTOCOL: &str = "swiftabi_anyProtocolMetatype";
const GLUE_ERROR_METATYPE: &str = "swiftabi_errorMetatype";
const GLUE_CONFORMS: &str = "swiftabi_conformsToProtocol";
const GLUE_ASSOCIATED_TYPE: &str = "swiftabi_associatedTypeMetadataRequest";
const GLUE_ERROR_DESCRIPTION: &str = "swiftabi_errorDescription";
const GLUE_EXISTENTIAL_PAYLOAD: &str = "swiftabi_projectExistentialPayload";

/// The foreign runtime, ready to call.
pub struct ForeignRuntime {
    entries: RuntimeEntryPoints,
    /// Pre-resolved glue symbols, consulted before the glue library. The
    /// closure bridge's arity-specialized entry points go through here.
    glue_symbols: Mutex<HashMap<String, usize>>,
    glue: Option<Arc<Library>>,
    /// The foreign core library; also keeps its exported metadata alive.
    core: Option<Arc<Library>>,
}

impl ForeignRuntime {
    /// Resolve the entry-point table from the foreign core library and the
    /// shipped glue library.
    pub fn load(core_path: &Path, glue_path: &Path) -> Result<Arc<ForeignRuntime>> {
        let core = Arc::new(Library::open(core_path, OpenMode::NOW)?);
        let glue = Arc::new(Library::open(glue_path, OpenMode::NOW)?);

        // Safety: each symbol is an export of the declared shape; the glue
        // library ships with this crate and the core symbols are the
        // foreign runtime's stable ABI surface.
        let entries = unsafe {
            RuntimeEntryPoints {
                retain: std::mem::transmute::<*const c_void, RetainFn>(
                    core.find_symbol(CORE_RETAIN)?,
                ),
                release: std::mem::transmute::<*const c_void, ReleaseFn>(
                    core.find_symbol(CORE_RELEASE)?,
                ),
                retain_count: std::mem::transmute::<*const c_void, RetainCountFn>(
                    core.find_symbol(CORE_RETAIN_COUNT)?,
                ),
                tuple_metatype: std::mem::transmute::<*const c_void, TupleMetatypeFn>(
                    glue.find_symbol(GLUE_TUPLE_METATYPE)?,
                ),
                function_metatype: std::mem::transmute::<*const c_void, FunctionMetatypeFn>(
                    glue.find_symbol(GLUE_FUNCTION_METATYPE)?,
                ),
                any_protocol_metatype: std::mem::transmute::<*const c_void, MetatypeAccessorFn>(
                    glue.find_symbol(GLUE_ANY_PROTOCOL)?,
                ),
                error_metatype: std::mem::transmute::<*const c_void, MetatypeAccessorFn>(
                    glue.find_symbol(GLUE_ERROR_METATYPE)?,
                ),
                conforms_to_protocol: std::mem::transmute::<*const c_void, ConformsFn>(
                    glue.find_symbol(GLUE_CONFORMS)?,
                ),
                associated_type_metadata: std::mem::transmute::<*const c_void, AssociatedTypeFn>(
                    glue.find_symbol(GLUE_ASSOCIATED_TYPE)?,
                ),
                error_description: std::mem::transmute::<*const c_void, ErrorDescriptionFn>(
                    glue.find_symbol(GLUE_ERROR_DESCRIPTION)?,
                ),
                existential_payload: std::mem::transmute::<*const c_void, ExistentialPayloadFn>(
                    glue.find_symbol(GLUE_EXISTENTIAL_PAYLOAD)?,
                ),
            }
        };

        log::debug!(
            "foreign runtime loaded: core={} glue={}",
            core.file_name().display(),
            glue.file_name().display()
        );

        Ok(Arc::new(ForeignRuntime {
            entries,
            glue_symbols: Mutex::new(HashMap::new()),
            glue: Some(glue),
            core: Some(core),
        }))
    }

    /// Build a runtime from a pre-resolved entry-point table. Used by hosts
    /// that link the glue statically, and by the test suite.
    pub fn from_entry_points(entries: RuntimeEntryPoints) -> Arc<ForeignRuntime> {
        Arc::new(ForeignRuntime {
            entries,
            glue_symbols: Mutex::new(HashMap::new()),
            glue: None,
            core: None,
        })
    }

    /// The loaded foreign core library, when the runtime was resolved from
    /// disk. Standard-library metatype symbols live here.
    pub fn core_library(&self) -> Option<&Arc<Library>> {
        self.core.as_ref()
    }

    /// Install a pre-resolved glue entry point under its symbol name.
    pub fn install_glue_symbol(&self, name: &str, address: *const c_void) {
        self.glue_symbols
            .lock()
            .insert(name.to_string(), address as usize);
    }

    /// Resolve a glue entry point by name: pre-installed symbols first,
    /// then the glue library.
    pub fn glue_symbol(&self, name: &str) -> Result<*const c_void> {
        if let Some(&addr) = self.glue_symbols.lock().get(name) {
            return Ok(addr as *const c_void);
        }
        let glue = self.glue.as_ref().ok_or_else(|| Error::SymbolNotFound {
            symbol: name.to_string(),
            library: "<no glue library loaded>".to_string(),
            detail: "runtime was built from entry points without a glue library".to_string(),
        })?;
        let addr = glue.find_symbol(name)?;
        self.glue_symbols.lock().insert(name.to_string(), addr as usize);
        Ok(addr)
    }

    /// Increment the foreign strong reference count. Returns the handle.
    pub fn retain(&self, handle: *mut c_void) -> *mut c_void {
        if handle.is_null() {
            return handle;
        }
        // Safety: retain on a live foreign object is the runtime's own
        // atomic operation.
        unsafe { (self.entries.retain)(handle) }
    }

    /// Decrement the foreign strong reference count.
    pub fn release(&self, handle: *mut c_void) {
        if handle.is_null() {
            return;
        }
        // Safety: releases a reference previously obtained via retain or
        // handed over with ownership.
        unsafe { (self.entries.release)(handle) }
    }

    /// Current strong reference count, for diagnostics and tests.
    pub fn retain_count(&self, handle: *mut c_void) -> isize {
        if handle.is_null() {
            return 0;
        }
        unsafe { (self.entries.retain_count)(handle) }
    }

    /// Ask the foreign runtime for the canonical tuple metatype of the
    /// given element list.
    pub fn tuple_metatype(&self, elements: &[Metatype]) -> Result<Metatype> {
        // Safety: elements is a live contiguous array of valid metatypes.
        let handle = unsafe { (self.entries.tuple_metatype)(elements.len(), elements.as_ptr()) };
        Metatype::new(handle)
    }

    /// Ask the foreign runtime for a function-type metatype.
    pub fn function_metatype(
        &self,
        params: &[Metatype],
        param_flags: &[u32],
        result: Metatype,
        throws: bool,
    ) -> Result<Metatype> {
        debug_assert_eq!(params.len(), param_flags.len());
        // Safety: both slices are live and of equal length per the glue
        // contract.
        let handle = unsafe {
            (self.entries.function_metatype)(
                params.len(),
                params.as_ptr(),
                param_flags.as_ptr(),
                result,
                throws,
            )
        };
        Metatype::new(handle)
    }

    /// The fixed metatype of the any-protocol existential.
    pub fn any_protocol_metatype(&self) -> Result<Metatype> {
        Metatype::new(unsafe { (self.entries.any_protocol_metatype)() })
    }

    /// The fixed metatype of the foreign error type.
    pub fn error_metatype(&self) -> Result<Metatype> {
        Metatype::new(unsafe { (self.entries.error_metatype)() })
    }

    /// Does `metatype` conform to the protocol behind `descriptor`?
    /// Returns the conformance witness table, or null for no conformance.
    pub fn conforms_to_protocol(
        &self,
        metatype: Metatype,
        protocol_descriptor: *const c_void,
    ) -> *const c_void {
        unsafe { (self.entries.conforms_to_protocol)(metatype, protocol_descriptor) }
    }

    /// Issue one associated-type metadata request against a conformance.
    pub fn associated_type_metadata(
        &self,
        conforming: Metatype,
        witness_table: *const c_void,
        requirements_base: *const c_void,
        requirement: *const c_void,
    ) -> Result<Metatype> {
        let handle = unsafe {
            (self.entries.associated_type_metadata)(
                conforming,
                witness_table,
                requirements_base,
                requirement,
            )
        };
        Metatype::new(handle)
    }

    /// Fetch the foreign error's description text.
    pub fn error_description(&self, handle: *mut c_void) -> String {
        if handle.is_null() {
            return String::new();
        }
        let mut buf = vec![0u8; 512];
        // Safety: the glue copies at most `cap` bytes of UTF-8 into the
        // buffer and returns the full length, which may exceed cap.
        let mut len =
            unsafe { (self.entries.error_description)(handle, buf.as_mut_ptr(), buf.len()) };
        if len > buf.len() {
            buf = vec![0u8; len];
            len = unsafe { (self.entries.error_description)(handle, buf.as_mut_ptr(), buf.len()) };
        }
        buf.truncate(len.min(buf.len()));
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Project an existential container's payload into `dest`, which must
    /// hold at least the payload type's stride.
    pub fn existential_payload(&self, container: *const u8, dest: *mut u8, payload: Metatype) {
        unsafe { (self.entries.existential_payload)(container, dest, payload) }
    }
}

impl std::fmt::Debug for ForeignRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForeignRuntime")
            .field(
                "glue",
                &self.glue.as_ref().map(|g| g.file_name().to_path_buf()),
            )
            .finish()
    }
}
