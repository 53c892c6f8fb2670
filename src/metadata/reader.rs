//! Metatype resolution.
//!
//! The reader turns a [`ManagedType`] into the foreign runtime's metatype
//! handle for it, and answers protocol-conformance and associated-type
//! queries. Every resolution path lands in a per-instance, lock-guarded
//! cache: metatype handles are process-lifetime values, so a second lookup
//! never repeats symbol resolution or a runtime request.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::dylib::{Library, OpenMode};
use crate::error::{Error, Result};
use crate::metadata::{
    Metatype, NominalTypeDescriptor, ProtocolConformanceDescriptor, ProtocolRequirementKind,
    ValueWitnessTable,
};
use crate::registry::{TypeRegistration, TypeRegistry, TypeTable};
use crate::runtime::{ForeignRuntime, MetatypeAccessorFn};
use crate::value::{ManagedType, MarshalKind};

/// Resolves metatype handles and conformance queries for managed types.
pub struct MetadataReader {
    runtime: Arc<ForeignRuntime>,
    table: Arc<TypeTable>,
    registry: Arc<TypeRegistry>,
    libraries: Mutex<HashMap<PathBuf, Arc<Library>>>,
    standard: Mutex<HashMap<ManagedType, Metatype>>,
    nominal: Mutex<HashMap<String, Metatype>>,
    protocols: Mutex<HashMap<String, NominalTypeDescriptor>>,
    witnesses: Mutex<HashMap<ManagedType, Arc<ValueWitnessTable>>>,
}

impl MetadataReader {
    pub fn new(
        runtime: Arc<ForeignRuntime>,
        table: Arc<TypeTable>,
        registry: Arc<TypeRegistry>,
    ) -> Self {
        MetadataReader {
            runtime,
            table,
            registry,
            libraries: Mutex::new(HashMap::new()),
            standard: Mutex::new(HashMap::new()),
            nominal: Mutex::new(HashMap::new()),
            protocols: Mutex::new(HashMap::new()),
            witnesses: Mutex::new(HashMap::new()),
        }
    }

    pub fn runtime(&self) -> &Arc<ForeignRuntime> {
        &self.runtime
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Resolve the foreign metatype handle for a managed type.
    pub fn metatype_of(&self, ty: &ManagedType) -> Result<Metatype> {
        let metatype = match ty.marshal_kind() {
            MarshalKind::Scalar | MarshalKind::Machine => self.standard_metatype(ty)?,
            MarshalKind::Tuple => {
                let ManagedType::Tuple(elements) = ty else {
                    unreachable!("tuple marshal kind on non-tuple type")
                };
                let mut element_metatypes = Vec::with_capacity(elements.len());
                for element in elements {
                    element_metatypes.push(self.metatype_of(element)?);
                }
                self.runtime.tuple_metatype(&element_metatypes)?
            }
            MarshalKind::Nominal | MarshalKind::TrivialEnum => self.nominal_metatype(ty)?,
            MarshalKind::Object => self.accessor_metatype(ty)?,
            MarshalKind::Existential => self.runtime.any_protocol_metatype()?,
            MarshalKind::Closure => self.closure_metatype(ty)?,
            MarshalKind::Error => self.runtime.error_metatype()?,
        };
        // The any-protocol existential metatype is shared by every protocol
        // type; it never identifies one managed type.
        if ty.marshal_kind() != MarshalKind::Existential {
            self.registry.record(metatype, ty.clone());
        }
        Ok(metatype)
    }

    /// The witness table for a managed type. Registered witness symbols are
    /// preferred; otherwise the table is read from behind the metatype.
    pub fn witness_table_of(&self, ty: &ManagedType) -> Result<Arc<ValueWitnessTable>> {
        if let Some(witness) = self.witnesses.lock().get(ty) {
            return Ok(Arc::clone(witness));
        }

        let registered = match ty {
            ManagedType::Nominal(_) | ManagedType::TrivialEnum(_) => self
                .registration_of(ty)
                .and_then(|r| r.witness_table_symbol.clone().map(|s| (r.library, s))),
            _ => None,
        };
        let witness = match registered {
            Some((library_path, symbol)) => {
                let library = self.library(&library_path)?;
                ValueWitnessTable::from_memory(library.find_symbol(&symbol)?)?
            }
            None => ValueWitnessTable::from_type(self.metatype_of(ty)?)?,
        };

        let witness = Arc::new(witness);
        self.witnesses
            .lock()
            .entry(ty.clone())
            .or_insert_with(|| Arc::clone(&witness));
        Ok(witness)
    }

    /// Query "does `metatype` conform to `protocol`", returning the
    /// conformance descriptor behind the resulting witness table.
    pub fn protocol_conformance_of(
        &self,
        protocol: &ManagedType,
        metatype: Metatype,
    ) -> Result<ProtocolConformanceDescriptor> {
        let descriptor = self.protocol_descriptor(protocol)?;
        let witness = self.runtime.conforms_to_protocol(metatype, descriptor.handle());
        if witness.is_null() {
            return Err(Error::UnsupportedType(format!(
                "{} does not conform to {protocol}",
                metatype.describe()
            )));
        }
        // The first word of a conformance witness table is its conformance
        // descriptor.
        let mut cur = crate::cursor::Cursor::new(witness)?;
        ProtocolConformanceDescriptor::new(cur.read_pointer())
    }

    /// Resolve the managed types a conformance binds to a protocol's
    /// associated types, walking the protocol's requirement slots in order
    /// and skipping every slot that is not an associated-type accessor.
    pub fn associated_types(
        &self,
        implementing: Metatype,
        protocol: &ManagedType,
        expected_count: usize,
    ) -> Result<Vec<ManagedType>> {
        if expected_count == 0 {
            return Err(Error::Validation(
                "expected associated type count must be positive".into(),
            ));
        }
        let descriptor = self.protocol_descriptor(protocol)?;
        let witness = self
            .runtime
            .conforms_to_protocol(implementing, descriptor.handle());
        if witness.is_null() {
            return Err(Error::UnsupportedType(format!(
                "{} does not conform to {protocol}",
                implementing.describe()
            )));
        }
        let requirements_base = descriptor.requirements_base_descriptor()?;
        let total_slots = descriptor.requirement_count()?;

        let mut resolved = Vec::with_capacity(expected_count);
        let mut slot = 0u32;
        for index in 0..expected_count {
            let requirement = loop {
                if slot >= total_slots {
                    return Err(Error::Validation(format!(
                        "protocol {protocol} has no associated-type slot for index {index}"
                    )));
                }
                let candidate = descriptor.requirement_descriptor(slot)?;
                slot += 1;
                if candidate.kind()? == ProtocolRequirementKind::AssociatedTypeAccessFunction {
                    break candidate;
                }
            };
            let metatype = self.runtime.associated_type_metadata(
                implementing,
                witness,
                requirements_base,
                requirement.handle(),
            )?;
            let ty = self
                .registry
                .try_resolve(metatype)
                .ok_or_else(|| Error::UnknownForeignType(metatype.describe()))?;
            resolved.push(ty);
        }
        Ok(resolved)
    }

    fn registration_of(&self, ty: &ManagedType) -> Option<TypeRegistration> {
        match ty {
            ManagedType::Nominal(name)
            | ManagedType::TrivialEnum(name)
            | ManagedType::Object(name)
            | ManagedType::Protocol(name) => self.table.lookup(name),
            _ => None,
        }
    }

    fn require_registration(&self, ty: &ManagedType) -> Result<TypeRegistration> {
        self.registration_of(ty)
            .ok_or_else(|| Error::UnsupportedType(format!("{ty} (not registered)")))
    }

    /// Standard-library metatypes for primitives, resolved once from the
    /// foreign core library.
    fn standard_metatype(&self, ty: &ManagedType) -> Result<Metatype> {
        if let Some(&metatype) = self.standard.lock().get(ty) {
            return Ok(metatype);
        }
        let (symbol, offset) = standard_symbol(ty)
            .ok_or_else(|| Error::UnsupportedType(ty.to_string()))?;
        let metatype = self.core_symbol_metatype(symbol, offset)?;
        self.standard.lock().insert(ty.clone(), metatype);
        Ok(metatype)
    }

    /// The void metatype, used as the result type of actions.
    fn void_metatype(&self) -> Result<Metatype> {
        // The void symbol addresses full metadata; the address point is one
        // word in.
        self.core_symbol_metatype("$sytN", std::mem::size_of::<usize>())
    }

    fn core_symbol_metatype(&self, symbol: &str, offset: usize) -> Result<Metatype> {
        let core = self.runtime.core_library().ok_or_else(|| {
            Error::UnsupportedType(format!(
                "standard metatype {symbol} requires a loaded core library"
            ))
        })?;
        let address = core.find_symbol(symbol)?;
        Metatype::new((address as usize + offset) as *const std::ffi::c_void)
    }

    /// Metatype of a registered nominal type: the declared metadata symbol
    /// when present, otherwise the type's own accessor.
    fn nominal_metatype(&self, ty: &ManagedType) -> Result<Metatype> {
        let name = match ty {
            ManagedType::Nominal(name) | ManagedType::TrivialEnum(name) => name.clone(),
            _ => unreachable!("nominal metatype of non-nominal type"),
        };
        if let Some(&metatype) = self.nominal.lock().get(&name) {
            return Ok(metatype);
        }
        let registration = self.require_registration(ty)?;
        let metatype = if let Some(symbol) = registration.metadata_symbol.as_deref() {
            let library = self.library(&registration.library)?;
            Metatype::new(library.find_symbol(symbol)?)?
        } else {
            self.call_accessor(ty, &registration)?
        };
        self.nominal.lock().insert(name, metatype);
        Ok(metatype)
    }

    /// Class metatypes come from the type's native accessor export.
    fn accessor_metatype(&self, ty: &ManagedType) -> Result<Metatype> {
        let registration = self.require_registration(ty)?;
        self.call_accessor(ty, &registration)
    }

    fn call_accessor(&self, ty: &ManagedType, registration: &TypeRegistration) -> Result<Metatype> {
        let symbol = registration
            .metatype_accessor
            .as_deref()
            .ok_or_else(|| {
                Error::UnsupportedType(format!("{ty} (no metadata symbol or accessor registered)"))
            })?;
        let library = self.library(&registration.library)?;
        let address = library.find_symbol(symbol)?;
        // Safety: the registered accessor is a zero-argument metatype
        // export generated alongside the registration.
        let accessor =
            unsafe { std::mem::transmute::<*const std::ffi::c_void, MetatypeAccessorFn>(address) };
        Metatype::new(unsafe { accessor() })
    }

    /// A function-type metatype built from the closure's parameter and
    /// result metatypes plus the per-parameter ownership/variadic flags.
    fn closure_metatype(&self, ty: &ManagedType) -> Result<Metatype> {
        let ManagedType::Closure(shape) = ty else {
            unreachable!("closure metatype of non-closure type")
        };
        let mut params = Vec::with_capacity(shape.params.len());
        let mut flags = Vec::with_capacity(shape.params.len());
        for param in &shape.params {
            params.push(self.metatype_of(&param.ty)?);
            flags.push(param.flag_bits());
        }
        let result = match &shape.result {
            Some(result_ty) => self.metatype_of(result_ty)?,
            None => self.void_metatype()?,
        };
        self.runtime.function_metatype(&params, &flags, result, false)
    }

    /// Nominal descriptor address of a registered protocol.
    fn protocol_descriptor(&self, protocol: &ManagedType) -> Result<NominalTypeDescriptor> {
        let ManagedType::Protocol(name) = protocol else {
            return Err(Error::Validation(format!(
                "{protocol} is not a protocol type"
            )));
        };
        if let Some(&descriptor) = self.protocols.lock().get(name) {
            return Ok(descriptor);
        }
        let registration = self.require_registration(protocol)?;
        let symbol = registration.descriptor_symbol.as_deref().ok_or_else(|| {
            Error::UnsupportedType(format!("{protocol} (no protocol descriptor registered)"))
        })?;
        let library = self.library(&registration.library)?;
        let descriptor = NominalTypeDescriptor::new(library.find_symbol(symbol)?)?;
        self.protocols.lock().insert(name.clone(), descriptor);
        Ok(descriptor)
    }

    fn library(&self, path: &Path) -> Result<Arc<Library>> {
        if let Some(library) = self.libraries.lock().get(path) {
            return Ok(Arc::clone(library));
        }
        let library = Arc::new(Library::open(path, OpenMode::NOW)?);
        self.libraries
            .lock()
            .insert(path.to_path_buf(), Arc::clone(&library));
        Ok(library)
    }

    #[cfg(test)]
    pub(crate) fn seed_standard_metatype(&self, ty: ManagedType, metatype: Metatype) {
        self.registry.record(metatype, ty.clone());
        self.standard.lock().insert(ty, metatype);
    }

    #[cfg(test)]
    pub(crate) fn seed_nominal_metatype(&self, name: &str, ty: ManagedType, metatype: Metatype) {
        self.registry.record(metatype, ty);
        self.nominal.lock().insert(name.to_string(), metatype);
    }

    #[cfg(test)]
    pub(crate) fn seed_witness_table(&self, ty: ManagedType, witness: Arc<ValueWitnessTable>) {
        self.witnesses.lock().insert(ty, witness);
    }

    #[cfg(test)]
    pub(crate) fn seed_protocol_descriptor(&self, name: &str, descriptor: NominalTypeDescriptor) {
        self.protocols.lock().insert(name.to_string(), descriptor);
    }
}

/// Symbol and address-point offset for a standard-library metatype.
fn standard_symbol(ty: &ManagedType) -> Option<(&'static str, usize)> {
    let symbol = match ty {
        ManagedType::Bool => "$sSbN",
        ManagedType::Int8 => "$ss4Int8VN",
        ManagedType::UInt8 => "$ss5UInt8VN",
        ManagedType::Int16 => "$ss5Int16VN",
        ManagedType::UInt16 => "$ss6UInt16VN",
        ManagedType::Int32 => "$ss5Int32VN",
        ManagedType::UInt32 => "$ss6UInt32VN",
        ManagedType::Int64 => "$ss5Int64VN",
        ManagedType::UInt64 => "$ss6UInt64VN",
        ManagedType::Float32 => "$sSfN",
        ManagedType::Float64 => "$sSdN",
        ManagedType::Int => "$sSiN",
        ManagedType::UInt => "$sSuN",
        _ => return None,
    };
    Some((symbol, 0))
}
