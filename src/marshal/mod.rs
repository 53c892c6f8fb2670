//! Two-way value marshaling.
//!
//! [`ValueMarshaler`] converts managed values to their foreign-ABI
//! representation and back, preserving the foreign runtime's
//! reference-counting and ownership rules. Dispatch runs on the closed
//! [`MarshalKind`] tag computed once per type; every arm is exhaustive,
//! there are no predicate chains.
//!
//! Ownership contract:
//! - outbound class/object references are retained before the call, so the
//!   caller's own reference is untouched;
//! - inbound class/object pointers become registry-deduplicated proxies,
//!   retaining once more when the call did not hand over ownership;
//! - [`ValueMarshaler::release_foreign_value`] is the single cleanup path,
//!   called exactly once per successfully marshaled-out value.

pub mod closure;
pub mod nominal;
mod throws;
mod tuple;

pub use closure::{BlindClosureRepresentation, ClosureBridge, ManagedCallable, MAX_CLOSURE_ARITY};
pub use nominal::{NominalLifetimeManager, NominalValue};
pub use throws::ExceptionRecord;
pub use tuple::{TupleMap, TypeLayout};

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::metadata::{MetadataReader, Metatype};
use crate::registry::{ObjectRef, ObjectRegistry};
use crate::runtime::ForeignRuntime;
use crate::value::{ExistentialContainer, ForeignError, ManagedType, MarshalKind, Value};

/// The two-way value converter.
pub struct ValueMarshaler {
    runtime: Arc<ForeignRuntime>,
    reader: Arc<MetadataReader>,
    objects: ObjectRegistry,
    bridge: ClosureBridge,
    nominal: NominalLifetimeManager,
    tuple_maps: Mutex<HashMap<Vec<ManagedType>, Arc<TupleMap>>>,
}

impl ValueMarshaler {
    /// Build a marshaler over a metadata reader. The closure bridge holds a
    /// weak back-reference, hence the `Arc` return.
    pub fn new(reader: Arc<MetadataReader>) -> Arc<ValueMarshaler> {
        let runtime = Arc::clone(reader.runtime());
        Arc::new_cyclic(|weak| ValueMarshaler {
            runtime,
            reader,
            objects: ObjectRegistry::new(),
            bridge: ClosureBridge::new(weak.clone()),
            nominal: NominalLifetimeManager::new(),
            tuple_maps: Mutex::new(HashMap::new()),
        })
    }

    pub fn reader(&self) -> &Arc<MetadataReader> {
        &self.reader
    }

    pub fn runtime(&self) -> &Arc<ForeignRuntime> {
        &self.runtime
    }

    pub fn bridge(&self) -> &ClosureBridge {
        &self.bridge
    }

    /// Write `value` at `dest` in the foreign representation of `ty`.
    pub fn to_foreign(&self, ty: &ManagedType, value: &Value, dest: *mut u8) -> Result<()> {
        if dest.is_null() {
            return Err(Error::Validation("null marshal destination".into()));
        }
        match ty.marshal_kind() {
            MarshalKind::Scalar => write_scalar(ty, value, dest),
            MarshalKind::Machine => write_machine(ty, value, dest),
            MarshalKind::TrivialEnum => match value {
                // Safety: dest has at least a machine word per the layout.
                Value::EnumCase(tag) => {
                    unsafe { (dest as *mut isize).write_unaligned(*tag) };
                    Ok(())
                }
                other => Err(mismatch(ty, other)),
            },
            MarshalKind::Tuple => {
                let (ManagedType::Tuple(elements), Value::Tuple(values)) = (ty, value) else {
                    return Err(mismatch(ty, value));
                };
                if elements.len() != values.len() {
                    return Err(Error::Validation(format!(
                        "tuple {ty} expects {} elements, value has {}",
                        elements.len(),
                        values.len()
                    )));
                }
                let map = self.tuple_map(elements)?;
                for ((element, item), &offset) in
                    elements.iter().zip(values).zip(map.offsets())
                {
                    // Safety: offsets stay inside the tuple's stride.
                    self.to_foreign(element, item, unsafe { dest.add(offset) })?;
                }
                Ok(())
            }
            MarshalKind::Nominal => {
                let (ManagedType::Nominal(name), Value::Nominal(nominal)) = (ty, value) else {
                    return Err(mismatch(ty, value));
                };
                if nominal.type_name() != name {
                    return Err(Error::Validation(format!(
                        "value of type {} marshaled as {name}",
                        nominal.type_name()
                    )));
                }
                let copy = nominal.witness().init_with_copy_fn()?;
                // Safety: dest has at least stride bytes; the copy yields
                // an independent foreign-owned value, never an alias of the
                // source buffer.
                unsafe { copy(dest, nominal.as_ptr(), nominal.metatype().handle()) };
                Ok(())
            }
            MarshalKind::Object => match value {
                Value::Object(object) => {
                    // Retain before the caller relinquishes its own
                    // reference.
                    let retained = self.runtime.retain(object.handle());
                    // Safety: dest has at least a machine word.
                    unsafe { (dest as *mut *mut c_void).write_unaligned(retained) };
                    Ok(())
                }
                other => Err(mismatch(ty, other)),
            },
            MarshalKind::Existential => match value {
                Value::Existential(container) => {
                    write_existential(container, dest);
                    Ok(())
                }
                other => Err(mismatch(ty, other)),
            },
            MarshalKind::Error => match value {
                Value::Error(error) => {
                    let retained = self.runtime.retain(error.handle() as *mut c_void);
                    // Safety: dest has at least a machine word.
                    unsafe { (dest as *mut *mut c_void).write_unaligned(retained) };
                    Ok(())
                }
                other => Err(mismatch(ty, other)),
            },
            MarshalKind::Closure => {
                let (ManagedType::Closure(shape), Value::Closure(callable)) = (ty, value) else {
                    return Err(mismatch(ty, value));
                };
                let blind = self.bridge.build_foreign_closure(callable, shape)?;
                // Safety: dest has two machine words for the (code,
                // context) pair.
                unsafe {
                    (dest as *mut *const c_void).write_unaligned(blind.function);
                    (dest.add(std::mem::size_of::<usize>()) as *mut *mut c_void)
                        .write_unaligned(blind.context);
                }
                Ok(())
            }
        }
    }

    /// Read a managed value of type `ty` from the foreign representation
    /// at `src`. `takes_ownership` says whether the foreign side handed
    /// over its reference along with the bytes.
    pub fn to_managed(
        &self,
        src: *const u8,
        ty: &ManagedType,
        takes_ownership: bool,
    ) -> Result<Value> {
        if src.is_null() {
            return Err(Error::Validation("null marshal source".into()));
        }
        match ty.marshal_kind() {
            MarshalKind::Scalar => read_scalar(ty, src),
            MarshalKind::Machine => read_machine(ty, src),
            // Safety (reads below): src addresses a value laid out per ty.
            MarshalKind::TrivialEnum => {
                Ok(Value::EnumCase(unsafe { (src as *const isize).read_unaligned() }))
            }
            MarshalKind::Tuple => {
                let ManagedType::Tuple(elements) = ty else {
                    unreachable!("tuple marshal kind on non-tuple type")
                };
                let map = self.tuple_map(elements)?;
                let mut values = Vec::with_capacity(elements.len());
                for (element, &offset) in elements.iter().zip(map.offsets()) {
                    values.push(self.to_managed(
                        unsafe { src.add(offset) },
                        element,
                        takes_ownership,
                    )?);
                }
                Ok(Value::Tuple(values))
            }
            MarshalKind::Nominal => {
                let ManagedType::Nominal(name) = ty else {
                    unreachable!("nominal marshal kind on non-nominal type")
                };
                let metatype = self.reader.metatype_of(ty)?;
                let witness = self.reader.witness_table_of(ty)?;
                let stride = witness.stride();
                if takes_ownership {
                    // Adopt the value bitwise; the source's ownership moves
                    // into the wrapper.
                    let mut bytes = vec![0u8; stride];
                    unsafe {
                        std::ptr::copy_nonoverlapping(src, bytes.as_mut_ptr(), stride);
                    }
                    Ok(Value::Nominal(NominalValue::from_parts(
                        name.clone(),
                        metatype,
                        witness,
                        bytes,
                    )))
                } else {
                    Ok(Value::Nominal(self.nominal.copy_in(
                        name, metatype, &witness, src, stride,
                    )?))
                }
            }
            MarshalKind::Object => {
                let ManagedType::Object(class) = ty else {
                    unreachable!("object marshal kind on non-object type")
                };
                let handle = unsafe { (src as *const *mut c_void).read_unaligned() };
                if handle.is_null() {
                    return Err(Error::Validation(format!(
                        "null {class} object reference"
                    )));
                }
                Ok(Value::Object(self.objects.wrap(
                    handle,
                    class,
                    takes_ownership,
                    &self.runtime,
                )))
            }
            MarshalKind::Existential => {
                // A single-protocol existential carries one witness word.
                Ok(Value::Existential(read_existential(src, 1)?))
            }
            MarshalKind::Error => {
                let handle = unsafe { (src as *const *mut c_void).read_unaligned() };
                if handle.is_null() {
                    return Err(Error::Validation("null error reference".into()));
                }
                // The wrapper never owns the box; the release path does.
                Ok(Value::Error(ForeignError::new(handle as usize)))
            }
            MarshalKind::Closure => {
                let ManagedType::Closure(shape) = ty else {
                    unreachable!("closure marshal kind on non-closure type")
                };
                let rep = unsafe {
                    BlindClosureRepresentation {
                        function: (src as *const *const c_void).read_unaligned(),
                        context: (src.add(std::mem::size_of::<usize>()) as *const *mut c_void)
                            .read_unaligned(),
                    }
                };
                Ok(Value::Closure(self.bridge.unwrap_foreign_closure(rep, shape)?))
            }
        }
    }

    /// The single cleanup path for marshaled-out values: call exactly once
    /// per successful [`ValueMarshaler::to_foreign`] whose destination the
    /// foreign side did not consume.
    pub fn release_foreign_value(&self, ty: &ManagedType, addr: *mut u8) -> Result<()> {
        if addr.is_null() {
            return Ok(());
        }
        match ty.marshal_kind() {
            MarshalKind::Scalar | MarshalKind::Machine | MarshalKind::TrivialEnum => Ok(()),
            MarshalKind::Tuple => {
                let ManagedType::Tuple(elements) = ty else {
                    unreachable!("tuple marshal kind on non-tuple type")
                };
                let map = self.tuple_map(elements)?;
                for (element, &offset) in elements.iter().zip(map.offsets()) {
                    // Safety: offsets stay inside the tuple's stride.
                    self.release_foreign_value(element, unsafe { addr.add(offset) })?;
                }
                Ok(())
            }
            MarshalKind::Nominal => {
                let metatype = self.reader.metatype_of(ty)?;
                let witness = self.reader.witness_table_of(ty)?;
                let stride = witness.stride();
                self.nominal.destroy(metatype, &witness, addr, stride)
            }
            MarshalKind::Object | MarshalKind::Error => {
                // Safety: addr holds the pointer written by to_foreign.
                let handle = unsafe { (addr as *const *mut c_void).read_unaligned() };
                self.runtime.release(handle);
                Ok(())
            }
            // The container's words are borrowed views; nothing to do.
            MarshalKind::Existential => Ok(()),
            MarshalKind::Closure => Err(Error::UnsupportedMarshal(format!(
                "releasing closure values ({ty})"
            ))),
        }
    }

    /// The memoized layout map for a tuple member list.
    pub fn tuple_map(&self, types: &[ManagedType]) -> Result<Arc<TupleMap>> {
        if let Some(map) = self.tuple_maps.lock().get(types) {
            return Ok(Arc::clone(map));
        }
        let mut layouts = Vec::with_capacity(types.len());
        for ty in types {
            layouts.push(self.layout_of(ty)?);
        }
        let map = Arc::new(TupleMap::from_layouts(types.to_vec(), &layouts));
        self.tuple_maps
            .lock()
            .entry(types.to_vec())
            .or_insert_with(|| Arc::clone(&map));
        Ok(map)
    }

    /// Foreign size and alignment of a managed type.
    pub fn layout_of(&self, ty: &ManagedType) -> Result<TypeLayout> {
        let word = std::mem::size_of::<usize>();
        match ty.marshal_kind() {
            MarshalKind::Scalar => {
                let size = ty.scalar_size().expect("scalar kind has a scalar size");
                Ok(TypeLayout::new(size, size))
            }
            MarshalKind::Machine
            | MarshalKind::TrivialEnum
            | MarshalKind::Object
            | MarshalKind::Error => Ok(TypeLayout::new(word, word)),
            MarshalKind::Closure => Ok(TypeLayout::new(2 * word, word)),
            MarshalKind::Existential => Ok(TypeLayout::new(5 * word, word)),
            MarshalKind::Tuple => {
                let ManagedType::Tuple(elements) = ty else {
                    unreachable!("tuple marshal kind on non-tuple type")
                };
                let map = self.tuple_map(elements)?;
                Ok(TypeLayout::new(map.size(), map.alignment()))
            }
            MarshalKind::Nominal => {
                let witness = self.reader.witness_table_of(ty)?;
                Ok(TypeLayout::new(witness.size(), witness.alignment()))
            }
        }
    }

    pub fn size_of(&self, ty: &ManagedType) -> Result<usize> {
        Ok(self.layout_of(ty)?.size)
    }

    pub fn stride_of(&self, ty: &ManagedType) -> Result<usize> {
        match ty.marshal_kind() {
            MarshalKind::Tuple => {
                let ManagedType::Tuple(elements) = ty else {
                    unreachable!("tuple marshal kind on non-tuple type")
                };
                Ok(self.tuple_map(elements)?.stride())
            }
            MarshalKind::Nominal => Ok(self.reader.witness_table_of(ty)?.stride()),
            _ => Ok(self.layout_of(ty)?.stride()),
        }
    }

    pub fn alignment_of(&self, ty: &ManagedType) -> Result<usize> {
        Ok(self.layout_of(ty)?.alignment)
    }

    /// Produce an independent foreign-owned copy of the nominal value in
    /// `source`.
    pub fn copy_in(&self, ty: &ManagedType, source: &[u8]) -> Result<NominalValue> {
        let ManagedType::Nominal(name) = ty else {
            return Err(Error::Validation(format!("{ty} is not a nominal type")));
        };
        let metatype = self.reader.metatype_of(ty)?;
        let witness = self.reader.witness_table_of(ty)?;
        self.nominal
            .copy_in(name, metatype, &witness, source.as_ptr(), source.len())
    }

    /// Bump the foreign refcounts held in `buffer` without relocating the
    /// value.
    pub fn retain_in_place(&self, ty: &ManagedType, buffer: &mut [u8]) -> Result<()> {
        let metatype = self.reader.metatype_of(ty)?;
        let witness = self.reader.witness_table_of(ty)?;
        self.nominal
            .retain_in_place(metatype, &witness, buffer.as_mut_ptr(), buffer.len())
    }

    /// Destroy the nominal value held in `buffer` through its witness
    /// table.
    pub fn destroy_value(&self, ty: &ManagedType, buffer: &mut [u8]) -> Result<()> {
        let metatype = self.reader.metatype_of(ty)?;
        let witness = self.reader.witness_table_of(ty)?;
        self.nominal
            .destroy(metatype, &witness, buffer.as_mut_ptr(), buffer.len())
    }

    /// Retain a class instance on behalf of an outbound call, returning
    /// the handle to pass.
    pub fn retain_object(&self, object: &ObjectRef) -> *mut c_void {
        self.runtime.retain(object.handle())
    }

    /// Release one reference to a class instance.
    pub fn release_object(&self, object: &ObjectRef) {
        self.runtime.release(object.handle());
    }

    /// The instance's current foreign strong count, for diagnostics.
    pub fn object_retain_count(&self, object: &ObjectRef) -> isize {
        self.runtime.retain_count(object.handle())
    }

    /// Extract an existential container's payload as a managed value. The
    /// payload's metatype must be registered.
    pub fn existential_payload(&self, container: &ExistentialContainer) -> Result<Value> {
        let ty = self
            .reader
            .registry()
            .try_resolve(container.metatype)
            .ok_or_else(|| Error::UnknownForeignType(container.metatype.describe()))?;

        let mut raw = vec![0u8; container.byte_size()];
        write_existential(container, raw.as_mut_ptr());
        let mut payload = vec![0u8; self.stride_of(&ty)?.max(1)];
        self.runtime
            .existential_payload(raw.as_ptr(), payload.as_mut_ptr(), container.metatype);
        self.to_managed(payload.as_ptr(), &ty, true)
    }
}

fn mismatch(ty: &ManagedType, value: &Value) -> Error {
    Error::Validation(format!(
        "expected a {ty} value, got {}",
        value.kind_name()
    ))
}

fn write_scalar(ty: &ManagedType, value: &Value, dest: *mut u8) -> Result<()> {
    // Safety: dest has at least the scalar's width per the caller's
    // layout; unaligned writes are used throughout.
    unsafe {
        match (ty, value) {
            (ManagedType::Bool, Value::Bool(v)) => dest.write(*v as u8),
            (ManagedType::Int8, Value::Int8(v)) => (dest as *mut i8).write_unaligned(*v),
            (ManagedType::UInt8, Value::UInt8(v)) => dest.write(*v),
            (ManagedType::Int16, Value::Int16(v)) => (dest as *mut i16).write_unaligned(*v),
            (ManagedType::UInt16, Value::UInt16(v)) => (dest as *mut u16).write_unaligned(*v),
            (ManagedType::Int32, Value::Int32(v)) => (dest as *mut i32).write_unaligned(*v),
            (ManagedType::UInt32, Value::UInt32(v)) => (dest as *mut u32).write_unaligned(*v),
            (ManagedType::Int64, Value::Int64(v)) => (dest as *mut i64).write_unaligned(*v),
            (ManagedType::UInt64, Value::UInt64(v)) => (dest as *mut u64).write_unaligned(*v),
            (ManagedType::Float32, Value::Float32(v)) => (dest as *mut f32).write_unaligned(*v),
            (ManagedType::Float64, Value::Float64(v)) => (dest as *mut f64).write_unaligned(*v),
            (ty, value) => return Err(mismatch(ty, value)),
        }
    }
    Ok(())
}

fn read_scalar(ty: &ManagedType, src: *const u8) -> Result<Value> {
    // Safety: src has at least the scalar's width per the caller's layout.
    unsafe {
        Ok(match ty {
            ManagedType::Bool => Value::Bool(src.read() != 0),
            ManagedType::Int8 => Value::Int8((src as *const i8).read_unaligned()),
            ManagedType::UInt8 => Value::UInt8(src.read()),
            ManagedType::Int16 => Value::Int16((src as *const i16).read_unaligned()),
            ManagedType::UInt16 => Value::UInt16((src as *const u16).read_unaligned()),
            ManagedType::Int32 => Value::Int32((src as *const i32).read_unaligned()),
            ManagedType::UInt32 => Value::UInt32((src as *const u32).read_unaligned()),
            ManagedType::Int64 => Value::Int64((src as *const i64).read_unaligned()),
            ManagedType::UInt64 => Value::UInt64((src as *const u64).read_unaligned()),
            ManagedType::Float32 => Value::Float32((src as *const f32).read_unaligned()),
            ManagedType::Float64 => Value::Float64((src as *const f64).read_unaligned()),
            other => return Err(Error::UnsupportedMarshal(other.to_string())),
        })
    }
}

fn write_machine(ty: &ManagedType, value: &Value, dest: *mut u8) -> Result<()> {
    // Safety: dest has at least a machine word.
    unsafe {
        match (ty, value) {
            (ManagedType::Int, Value::Int(v)) => (dest as *mut isize).write_unaligned(*v),
            (ManagedType::UInt, Value::UInt(v)) => (dest as *mut usize).write_unaligned(*v),
            (ty, value) => return Err(mismatch(ty, value)),
        }
    }
    Ok(())
}

fn read_machine(ty: &ManagedType, src: *const u8) -> Result<Value> {
    // Safety: src has at least a machine word.
    unsafe {
        Ok(match ty {
            ManagedType::Int => Value::Int((src as *const isize).read_unaligned()),
            ManagedType::UInt => Value::UInt((src as *const usize).read_unaligned()),
            other => return Err(Error::UnsupportedMarshal(other.to_string())),
        })
    }
}

fn write_existential(container: &ExistentialContainer, dest: *mut u8) {
    let word = std::mem::size_of::<usize>();
    // Safety: dest has container.byte_size() bytes.
    unsafe {
        for (i, data) in container.data.iter().enumerate() {
            (dest.add(i * word) as *mut usize).write_unaligned(*data);
        }
        (dest.add(3 * word) as *mut usize).write_unaligned(container.metatype.handle() as usize);
        for (i, witness) in container.witnesses.iter().enumerate() {
            (dest.add((4 + i) * word) as *mut usize).write_unaligned(*witness);
        }
    }
}

fn read_existential(src: *const u8, witness_count: usize) -> Result<ExistentialContainer> {
    let word = std::mem::size_of::<usize>();
    // Safety: src addresses a container of (4 + witness_count) words.
    unsafe {
        let mut data = [0usize; 3];
        for (i, slot) in data.iter_mut().enumerate() {
            *slot = (src.add(i * word) as *const usize).read_unaligned();
        }
        let metatype =
            Metatype::new((src.add(3 * word) as *const *const c_void).read_unaligned())?;
        let mut witnesses = Vec::with_capacity(witness_count);
        for i in 0..witness_count {
            witnesses.push((src.add((4 + i) * word) as *const usize).read_unaligned());
        }
        Ok(ExistentialContainer {
            data,
            metatype,
            witnesses,
        })
    }
}

#[cfg(test)]
mod tests;
