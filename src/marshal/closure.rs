//! Cross-boundary callable values.
//!
//! Outbound, a managed callable is packaged behind an arity- and
//! shape-specialized glue wrapper into one opaque foreign closure value;
//! when foreign code invokes it, a fixed trampoline unpacks the
//! tuple-shaped argument buffer, calls the managed callable, and writes the
//! result to the caller-supplied slot. Inbound, a foreign closure value is
//! wrapped in a managed proxy that invokes the foreign code pointer through
//! the arity-matched glue invoker per call.
//!
//! The foreign ABI is not introspectable at finer granularity than one
//! entry point per arity and shape, so the 0..=16 parameter
//! specializations stay, generated mechanically from one template below
//! and routed through a single pack-call-unpack path.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::metadata::Metatype;
use crate::value::{ClosureShape, ManagedType, Value};

use super::ValueMarshaler;

/// Most parameters any closure entry point carries.
pub const MAX_CLOSURE_ARITY: usize = 16;

/// The opaque foreign closure value: a code pointer plus a context
/// pointer. The context follows foreign refcounting when it addresses a
/// heap box.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlindClosureRepresentation {
    pub function: *const c_void,
    pub context: *mut c_void,
}

/// A managed callback handed to the glue map entry points: the trampoline
/// plus the capsule context it unpacks.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ClosureRepresentation {
    pub function: *const c_void,
    pub context: *mut c_void,
}

/// A managed callable crossing the boundary. Cheap to clone; equality is
/// identity, which is what keeps round-tripped callables stable.
#[derive(Clone)]
pub struct ManagedCallable {
    func: Arc<dyn Fn(&[Value]) -> Result<Option<Value>> + Send + Sync>,
}

impl ManagedCallable {
    pub fn new(
        func: impl Fn(&[Value]) -> Result<Option<Value>> + Send + Sync + 'static,
    ) -> Self {
        ManagedCallable { func: Arc::new(func) }
    }

    pub fn invoke(&self, args: &[Value]) -> Result<Option<Value>> {
        (self.func)(args)
    }
}

impl PartialEq for ManagedCallable {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.func, &other.func)
    }
}

impl std::fmt::Debug for ManagedCallable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ManagedCallable({:p})", Arc::as_ptr(&self.func))
    }
}

/// Everything a trampoline needs to service one foreign invocation of a
/// managed callable. Parked in the closure registry for the lifetime of
/// the foreign closure value; its address is the closure's context.
pub(crate) struct ClosureCapsule {
    callable: ManagedCallable,
    params: Vec<ManagedType>,
    result: Option<ManagedType>,
    marshaler: Weak<ValueMarshaler>,
}

impl ClosureCapsule {
    fn invoke(&self, ret: *mut u8, args: *mut u8) -> Result<()> {
        let marshaler = self.marshaler.upgrade().ok_or_else(|| {
            Error::Validation("closure invoked after its marshaler was dropped".into())
        })?;

        let mut values = Vec::with_capacity(self.params.len());
        if !self.params.is_empty() {
            if args.is_null() {
                return Err(Error::Validation(
                    "closure callback received a null argument buffer".into(),
                ));
            }
            let map = marshaler.tuple_map(&self.params)?;
            for (ty, &offset) in self.params.iter().zip(map.offsets()) {
                // The argument buffer stays owned by the foreign caller.
                let source = unsafe { args.add(offset) } as *const u8;
                values.push(marshaler.to_managed(source, ty, false)?);
            }
        }

        let outcome = self.callable.invoke(&values)?;

        if let Some(result_ty) = &self.result {
            let value = outcome.ok_or_else(|| {
                Error::Validation(format!("callable returned no value of type {result_ty}"))
            })?;
            if ret.is_null() {
                return Err(Error::Validation(
                    "closure callback received a null result slot".into(),
                ));
            }
            marshaler.to_foreign(result_ty, &value, ret)?;
        }
        Ok(())
    }
}

/// Trampoline for function-shaped closures: unpack, call, write result.
unsafe extern "C" fn function_trampoline(ret: *mut u8, args: *mut u8, context: *mut c_void) {
    if context.is_null() {
        log::error!("closure callback invoked with a null context");
        return;
    }
    let capsule = &*(context as *const ClosureCapsule);
    if let Err(e) = capsule.invoke(ret, args) {
        log::error!("closure callback failed: {e}");
    }
}

/// Trampoline for action-shaped closures: unpack and call.
unsafe extern "C" fn action_trampoline(args: *mut u8, context: *mut c_void) {
    if context.is_null() {
        log::error!("closure callback invoked with a null context");
        return;
    }
    let capsule = &*(context as *const ClosureCapsule);
    if let Err(e) = capsule.invoke(std::ptr::null_mut(), args) {
        log::error!("closure callback failed: {e}");
    }
}

struct ClosureEntry {
    callable: ManagedCallable,
    /// Keeps an outbound capsule alive as long as the foreign closure can
    /// call back into it.
    _capsule: Option<Arc<ClosureCapsule>>,
}

/// Identity registry for callables tied to a closure context pointer.
#[derive(Default)]
pub(crate) struct ClosureRegistry {
    entries: Mutex<HashMap<usize, ClosureEntry>>,
}

impl ClosureRegistry {
    fn lookup(&self, context: usize) -> Option<ManagedCallable> {
        self.entries
            .lock()
            .get(&context)
            .map(|entry| entry.callable.clone())
    }

    fn register(
        &self,
        context: usize,
        callable: ManagedCallable,
        capsule: Option<Arc<ClosureCapsule>>,
    ) {
        self.entries.lock().insert(
            context,
            ClosureEntry {
                callable,
                _capsule: capsule,
            },
        );
    }
}

/// Builds and unwraps cross-boundary callable values.
pub struct ClosureBridge {
    marshaler: Weak<ValueMarshaler>,
    registry: ClosureRegistry,
}

impl ClosureBridge {
    pub(crate) fn new(marshaler: Weak<ValueMarshaler>) -> Self {
        ClosureBridge {
            marshaler,
            registry: ClosureRegistry::default(),
        }
    }

    fn marshaler(&self) -> Result<Arc<ValueMarshaler>> {
        self.marshaler
            .upgrade()
            .ok_or_else(|| Error::Validation("marshaler was dropped".into()))
    }

    /// Package a managed callable as a foreign closure value.
    pub fn build_foreign_closure(
        &self,
        callable: &ManagedCallable,
        shape: &ClosureShape,
    ) -> Result<BlindClosureRepresentation> {
        let arity = shape.params.len();
        if arity > MAX_CLOSURE_ARITY {
            return Err(Error::UnsupportedMarshal(format!(
                "closures with {arity} parameters (max {MAX_CLOSURE_ARITY})"
            )));
        }
        let marshaler = self.marshaler()?;
        let reader = marshaler.reader();
        let runtime = marshaler.runtime();

        let mut metatypes = Vec::with_capacity(arity);
        for param in &shape.params {
            metatypes.push(reader.metatype_of(&param.ty)?);
        }

        let capsule = Arc::new(ClosureCapsule {
            callable: callable.clone(),
            params: shape.params.iter().map(|p| p.ty.clone()).collect(),
            result: shape.result.as_deref().cloned(),
            marshaler: Arc::downgrade(&marshaler),
        });
        let context = Arc::as_ptr(&capsule) as *mut c_void;

        let blind = match &shape.result {
            Some(result_ty) => {
                let rep = ClosureRepresentation {
                    function: function_trampoline as *const c_void,
                    context,
                };
                let entry = runtime.glue_symbol(&format!("swiftabi_funcMap{arity}"))?;
                dispatch_func_map(entry, rep, &metatypes, reader.metatype_of(result_ty)?)?
            }
            None => {
                let rep = ClosureRepresentation {
                    function: action_trampoline as *const c_void,
                    context,
                };
                let entry = runtime.glue_symbol(&format!("swiftabi_actionMap{arity}"))?;
                dispatch_action_map(entry, rep, &metatypes)?
            }
        };

        self.registry
            .register(context as usize, callable.clone(), Some(Arc::clone(&capsule)));
        if blind.context as usize != context as usize {
            // The glue re-boxed the context; key the identity under the
            // pointer that will come back in round trips.
            self.registry
                .register(blind.context as usize, callable.clone(), Some(capsule));
        }
        Ok(blind)
    }

    /// Produce a managed callable for a foreign closure value. A context
    /// pointer seen before yields the same callable it did last time.
    pub fn unwrap_foreign_closure(
        &self,
        rep: BlindClosureRepresentation,
        shape: &ClosureShape,
    ) -> Result<ManagedCallable> {
        if let Some(existing) = self.registry.lookup(rep.context as usize) {
            return Ok(existing);
        }

        let arity = shape.params.len();
        if arity > MAX_CLOSURE_ARITY {
            return Err(Error::UnsupportedMarshal(format!(
                "closures with {arity} parameters (max {MAX_CLOSURE_ARITY})"
            )));
        }
        let marshaler = self.marshaler()?;
        let reader = marshaler.reader();
        let runtime = marshaler.runtime();

        let param_types: Vec<ManagedType> =
            shape.params.iter().map(|p| p.ty.clone()).collect();
        let mut metatypes = Vec::with_capacity(arity);
        for ty in &param_types {
            metatypes.push(reader.metatype_of(ty)?);
        }
        let result_ty = shape.result.as_deref().cloned();
        let (entry, result_metatype) = match &result_ty {
            Some(result_ty) => (
                runtime.glue_symbol(&format!("swiftabi_invokeFunction{arity}"))? as usize,
                Some(reader.metatype_of(result_ty)?),
            ),
            None => (
                runtime.glue_symbol(&format!("swiftabi_invokeAction{arity}"))? as usize,
                None,
            ),
        };

        let weak = Arc::downgrade(&marshaler);
        let code = rep.function as usize;
        let context = rep.context as usize;
        let proxy = ManagedCallable::new(move |args: &[Value]| {
            let marshaler = weak
                .upgrade()
                .ok_or_else(|| Error::Validation("marshaler was dropped".into()))?;
            if args.len() != param_types.len() {
                return Err(Error::Validation(format!(
                    "closure takes {} arguments, got {}",
                    param_types.len(),
                    args.len()
                )));
            }
            let rep = BlindClosureRepresentation {
                function: code as *const c_void,
                context: context as *mut c_void,
            };

            let map = marshaler.tuple_map(&param_types)?;
            let mut buffer = vec![0u8; map.stride()];
            for ((ty, value), &offset) in param_types.iter().zip(args).zip(map.offsets()) {
                // Safety: offset + element size stays inside the stride
                // sized buffer per the tuple map.
                marshaler.to_foreign(ty, value, unsafe { buffer.as_mut_ptr().add(offset) })?;
            }
            let args_ptr = if param_types.is_empty() {
                std::ptr::null_mut()
            } else {
                buffer.as_mut_ptr()
            };

            let outcome = match (&result_ty, result_metatype) {
                (Some(result_ty), Some(result_metatype)) => {
                    let stride = marshaler.stride_of(result_ty)?;
                    let mut ret = vec![0u8; stride.max(1)];
                    dispatch_invoke_function(
                        entry as *const c_void,
                        rep,
                        ret.as_mut_ptr(),
                        args_ptr,
                        &metatypes,
                        result_metatype,
                    )?;
                    Some(marshaler.to_managed(ret.as_ptr(), result_ty, true)?)
                }
                _ => {
                    dispatch_invoke_action(entry as *const c_void, rep, args_ptr, &metatypes)?;
                    None
                }
            };

            for (ty, &offset) in param_types.iter().zip(map.offsets()) {
                marshaler.release_foreign_value(ty, unsafe { buffer.as_mut_ptr().add(offset) })?;
            }
            Ok(outcome)
        });

        self.registry.register(context, proxy.clone(), None);
        Ok(proxy)
    }
}

macro_rules! metatype_param {
    ($name:ident) => { Metatype };
}

/// One template generates every fixed-arity entry-point dispatcher: the
/// two map shapes (managed callable → foreign closure) and the two invoke
/// shapes (foreign closure called from the managed side).
macro_rules! arity_entry_points {
    ($(($arity:tt) => ($($mt:ident),*)),+ $(,)?) => {
        pub(crate) fn dispatch_action_map(
            entry: *const c_void,
            rep: ClosureRepresentation,
            params: &[Metatype],
        ) -> Result<BlindClosureRepresentation> {
            match params.len() {
                $(
                    $arity => {
                        type Entry = unsafe extern "C" fn(
                            ClosureRepresentation
                            $(, metatype_param!($mt))*
                        ) -> BlindClosureRepresentation;
                        // Safety: the glue exports this arity under exactly
                        // this signature.
                        let entry = unsafe { std::mem::transmute::<*const c_void, Entry>(entry) };
                        #[allow(unused_mut, unused_variables)]
                        let mut slots = params.iter().copied();
                        $(let $mt = slots.next().unwrap();)*
                        Ok(unsafe { entry(rep $(, $mt)*) })
                    }
                )+
                n => Err(Error::UnsupportedMarshal(format!(
                    "closures with {n} parameters (max {MAX_CLOSURE_ARITY})"
                ))),
            }
        }

        pub(crate) fn dispatch_func_map(
            entry: *const c_void,
            rep: ClosureRepresentation,
            params: &[Metatype],
            result: Metatype,
        ) -> Result<BlindClosureRepresentation> {
            match params.len() {
                $(
                    $arity => {
                        type Entry = unsafe extern "C" fn(
                            ClosureRepresentation
                            $(, metatype_param!($mt))*,
                            Metatype
                        ) -> BlindClosureRepresentation;
                        // Safety: as above.
                        let entry = unsafe { std::mem::transmute::<*const c_void, Entry>(entry) };
                        #[allow(unused_mut, unused_variables)]
                        let mut slots = params.iter().copied();
                        $(let $mt = slots.next().unwrap();)*
                        Ok(unsafe { entry(rep $(, $mt)*, result) })
                    }
                )+
                n => Err(Error::UnsupportedMarshal(format!(
                    "closures with {n} parameters (max {MAX_CLOSURE_ARITY})"
                ))),
            }
        }

        pub(crate) fn dispatch_invoke_action(
            entry: *const c_void,
            rep: BlindClosureRepresentation,
            args: *mut u8,
            params: &[Metatype],
        ) -> Result<()> {
            match params.len() {
                $(
                    $arity => {
                        type Entry = unsafe extern "C" fn(
                            BlindClosureRepresentation,
                            *mut u8
                            $(, metatype_param!($mt))*
                        );
                        // Safety: as above; args addresses a packed tuple
                        // of the parameter metatypes.
                        let entry = unsafe { std::mem::transmute::<*const c_void, Entry>(entry) };
                        #[allow(unused_mut, unused_variables)]
                        let mut slots = params.iter().copied();
                        $(let $mt = slots.next().unwrap();)*
                        unsafe { entry(rep, args $(, $mt)*) };
                        Ok(())
                    }
                )+
                n => Err(Error::UnsupportedMarshal(format!(
                    "closures with {n} parameters (max {MAX_CLOSURE_ARITY})"
                ))),
            }
        }

        pub(crate) fn dispatch_invoke_function(
            entry: *const c_void,
            rep: BlindClosureRepresentation,
            ret: *mut u8,
            args: *mut u8,
            params: &[Metatype],
            result: Metatype,
        ) -> Result<()> {
            match params.len() {
                $(
                    $arity => {
                        type Entry = unsafe extern "C" fn(
                            BlindClosureRepresentation,
                            *mut u8,
                            *mut u8
                            $(, metatype_param!($mt))*,
                            Metatype
                        );
                        // Safety: as above; ret has at least the result
                        // type's stride.
                        let entry = unsafe { std::mem::transmute::<*const c_void, Entry>(entry) };
                        #[allow(unused_mut, unused_variables)]
                        let mut slots = params.iter().copied();
                        $(let $mt = slots.next().unwrap();)*
                        unsafe { entry(rep, ret, args $(, $mt)*, result) };
                        Ok(())
                    }
                )+
                n => Err(Error::UnsupportedMarshal(format!(
                    "closures with {n} parameters (max {MAX_CLOSURE_ARITY})"
                ))),
            }
        }
    };
}

arity_entry_points! {
    (0) => (),
    (1) => (m1),
    (2) => (m1, m2),
    (3) => (m1, m2, m3),
    (4) => (m1, m2, m3, m4),
    (5) => (m1, m2, m3, m4, m5),
    (6) => (m1, m2, m3, m4, m5, m6),
    (7) => (m1, m2, m3, m4, m5, m6, m7),
    (8) => (m1, m2, m3, m4, m5, m6, m7, m8),
    (9) => (m1, m2, m3, m4, m5, m6, m7, m8, m9),
    (10) => (m1, m2, m3, m4, m5, m6, m7, m8, m9, m10),
    (11) => (m1, m2, m3, m4, m5, m6, m7, m8, m9, m10, m11),
    (12) => (m1, m2, m3, m4, m5, m6, m7, m8, m9, m10, m11, m12),
    (13) => (m1, m2, m3, m4, m5, m6, m7, m8, m9, m10, m11, m12, m13),
    (14) => (m1, m2, m3, m4, m5, m6, m7, m8, m9, m10, m11, m12, m13, m14),
    (15) => (m1, m2, m3, m4, m5, m6, m7, m8, m9, m10, m11, m12, m13, m14, m15),
    (16) => (m1, m2, m3, m4, m5, m6, m7, m8, m9, m10, m11, m12, m13, m14, m15, m16),
}
