//! Swiftabi - Swift ABI marshaling and metadata introspection
//!
//! Bridges a managed dynamic value model to the Swift runtime's compiled
//! ABI without the Swift compiler: binary metadata records emitted by the
//! foreign compiler are parsed in place to learn each type's layout and
//! operations, and values are converted across the boundary under the
//! foreign runtime's reference-counting and ownership rules.
//!
//! # Architecture
//!
//! ```text
//! ManagedType / Value          closed type + value model
//!       │
//!       ▼
//! ValueMarshaler               two-way conversion, retain/release and
//!       │                      error-propagation protocol
//!       ├── ClosureBridge      cross-boundary callables (0..=16 arity)
//!       ├── NominalLifetime    witness-table copy-in/retain/destroy
//!       ▼
//! MetadataReader               metatype resolution, conformance and
//!       │                      associated-type queries
//!       ▼
//! DescriptorParsers            value witness table, nominal type
//!       │                      descriptor, conformance descriptor
//!       ▼
//! DynamicLibraryResolver       dlopen/dlsym over libloading
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use swiftabi::{
//!     ForeignRuntime, ManagedType, MetadataReader, TypeRegistry, TypeTable, Value,
//!     ValueMarshaler,
//! };
//!
//! # fn main() -> swiftabi::Result<()> {
//! let runtime = ForeignRuntime::load(
//!     Path::new("/usr/lib/swift/libswiftCore.dylib"),
//!     Path::new("libSwiftabiGlue.dylib"),
//! )?;
//! let reader = Arc::new(MetadataReader::new(
//!     runtime,
//!     Arc::new(TypeTable::new()),
//!     Arc::new(TypeRegistry::new()),
//! ));
//! let marshaler = ValueMarshaler::new(reader);
//!
//! let ty = ManagedType::Tuple(vec![ManagedType::Int32, ManagedType::Int64]);
//! let mut buffer = vec![0u8; marshaler.stride_of(&ty)?];
//! marshaler.to_foreign(
//!     &ty,
//!     &Value::Tuple(vec![Value::Int32(7), Value::Int64(-1)]),
//!     buffer.as_mut_ptr(),
//! )?;
//! let back = marshaler.to_managed(buffer.as_ptr(), &ty, true)?;
//! # let _ = back;
//! # Ok(())
//! # }
//! ```

pub mod cursor;
pub mod dylib;
pub mod error;
pub mod marshal;
pub mod metadata;
pub mod registry;
pub mod runtime;
pub mod value;

#[cfg(test)]
pub(crate) mod testutil;

pub use dylib::{Library, OpenMode};
pub use error::{Error, Result};
pub use marshal::{
    BlindClosureRepresentation, ClosureBridge, ExceptionRecord, ManagedCallable,
    NominalLifetimeManager, NominalValue, TupleMap, TypeLayout, ValueMarshaler,
    MAX_CLOSURE_ARITY,
};
pub use metadata::{
    AssociatedTypeDescriptor, ConformanceFlags, MetadataReader, Metatype, MetatypeKind,
    NominalTypeDescriptor, NominalTypeKind, ProtocolConformanceDescriptor,
    ProtocolRequirementKind, ResilientWitness, TypeReferenceKind, ValueWitnessTable,
};
pub use registry::{ObjectRef, ObjectRegistry, TypeRegistration, TypeRegistry, TypeTable};
pub use runtime::{ForeignRuntime, RuntimeEntryPoints};
pub use value::{
    ClosureParam, ClosureShape, ExistentialContainer, ForeignError, ManagedType, MarshalKind,
    ParamOwnership, Value,
};
